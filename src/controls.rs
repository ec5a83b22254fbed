//! V4L2 control ids and the encoder control sequence applied at startup.

const CID_BASE: u32 = 0x0098_0900;
const CID_CAMERA_CLASS_BASE: u32 = 0x009a_0900;
const CID_CODEC_BASE: u32 = 0x0099_0900;

/// `V4L2_CID_AUTOGAIN`.
pub const CID_AUTOGAIN: u32 = CID_BASE + 18;
/// `V4L2_CID_GAIN`.
pub const CID_GAIN: u32 = CID_BASE + 19;
/// `V4L2_CID_POWER_LINE_FREQUENCY`.
pub const CID_POWER_LINE_FREQUENCY: u32 = CID_BASE + 24;
/// `V4L2_CID_ROTATE`.
pub const CID_ROTATE: u32 = CID_BASE + 34;

/// `V4L2_CID_EXPOSURE_AUTO`.
pub const CID_EXPOSURE_AUTO: u32 = CID_CAMERA_CLASS_BASE + 1;
/// `V4L2_CID_EXPOSURE_ABSOLUTE`.
pub const CID_EXPOSURE_ABSOLUTE: u32 = CID_CAMERA_CLASS_BASE + 2;

/// `V4L2_CID_MPEG_VIDEO_BITRATE_MODE`.
pub const CID_BITRATE_MODE: u32 = CID_CODEC_BASE + 206;
/// `V4L2_CID_MPEG_VIDEO_BITRATE`.
pub const CID_BITRATE: u32 = CID_CODEC_BASE + 207;
/// `V4L2_CID_MPEG_VIDEO_REPEAT_SEQ_HEADER`.
pub const CID_REPEAT_SEQ_HEADER: u32 = CID_CODEC_BASE + 226;
/// `V4L2_CID_MPEG_VIDEO_FORCE_KEY_FRAME`.
pub const CID_FORCE_KEY_FRAME: u32 = CID_CODEC_BASE + 229;
/// `V4L2_CID_MPEG_VIDEO_H264_I_PERIOD`.
pub const CID_H264_I_PERIOD: u32 = CID_CODEC_BASE + 358;
/// `V4L2_CID_MPEG_VIDEO_H264_LEVEL`.
pub const CID_H264_LEVEL: u32 = CID_CODEC_BASE + 359;
/// `V4L2_CID_MPEG_VIDEO_H264_PROFILE`.
pub const CID_H264_PROFILE: u32 = CID_CODEC_BASE + 363;

const BITRATE_MODE_CBR: i64 = 1;
const H264_PROFILE_HIGH: i64 = 4;
const H264_LEVEL_4_2: i64 = 13;
const POWER_LINE_FREQUENCY_50HZ: i64 = 1;
const EXPOSURE_AUTO: i64 = 0;

/// One named control write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSetting {
    /// Name used in logs.
    pub name: &'static str,
    /// V4L2 control id.
    pub id: u32,
    /// Value to write.
    pub value: i64,
}

impl ControlSetting {
    const fn new(name: &'static str, id: u32, value: i64) -> Self {
        Self { name, id, value }
    }
}

/// Controls written, in order, when the camera itself encodes H.264.
pub const H264_ENCODE_CONTROLS: [ControlSetting; 12] = [
    ControlSetting::new("bitrate mode", CID_BITRATE_MODE, BITRATE_MODE_CBR),
    ControlSetting::new("h264 profile", CID_H264_PROFILE, H264_PROFILE_HIGH),
    ControlSetting::new("repeat sequence header", CID_REPEAT_SEQ_HEADER, 1),
    ControlSetting::new("h264 level", CID_H264_LEVEL, H264_LEVEL_4_2),
    ControlSetting::new("h264 i-frame period", CID_H264_I_PERIOD, 30),
    ControlSetting::new("force key frame", CID_FORCE_KEY_FRAME, 1),
    ControlSetting::new("bitrate", CID_BITRATE, 4_000_000),
    ControlSetting::new("power line frequency", CID_POWER_LINE_FREQUENCY, POWER_LINE_FREQUENCY_50HZ),
    ControlSetting::new("auto exposure", CID_EXPOSURE_AUTO, EXPOSURE_AUTO),
    ControlSetting::new("exposure", CID_EXPOSURE_ABSOLUTE, 1000),
    ControlSetting::new("gain", CID_GAIN, 0),
    ControlSetting::new("auto gain", CID_AUTOGAIN, 1),
];

/// Bitrate written after format and rate negotiation, whatever the format.
pub const BITRATE_OVERRIDE: ControlSetting =
    ControlSetting::new("bitrate override", CID_BITRATE, 40_000_000);
