//! v4l2-capturer binary: capture from a camera and report frame statistics.

use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use v4l2_capturer::{CapturerBuilder, CapturerConfig, FourCC, V4L2Enumerator};

/// Capture frames from a V4L2 camera.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Camera number, opened as /dev/video<N>
    #[arg(short, long, default_value = "0")]
    camera: u32,

    /// Frame width
    #[arg(long, default_value = "640")]
    width: u32,

    /// Frame height
    #[arg(long, default_value = "480")]
    height: u32,

    /// Frame rate
    #[arg(short = 'F', long, default_value = "30")]
    fps: u32,

    /// Rotation in degrees
    #[arg(short, long, default_value = "0", allow_hyphen_values = true)]
    rotation: i32,

    /// Pixel format as a FourCC code (YUYV, YU12, NV12, RGB3; MJPG and H264 need --hw-accel)
    #[arg(short, long, default_value = "YUYV")]
    format: FourCC,

    /// Decode compressed formats with the hardware decoder
    #[arg(long)]
    hw_accel: bool,

    /// Stop after this many seconds; runs until interrupted otherwise
    #[arg(short = 't', long)]
    duration: Option<u64>,
}

impl Cli {
    const fn config(&self) -> CapturerConfig {
        CapturerConfig {
            camera_id: self.camera,
            width: self.width,
            height: self.height,
            fps: self.fps,
            rotation: self.rotation,
            format: self.format,
            hw_accel: self.hw_accel,
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(&cli) {
        error!(%err, fatal = err.is_fatal(), "capture failed");
        process::exit(1);
    }
}

fn run(cli: &Cli) -> v4l2_capturer::Result<()> {
    let frame_counter = Arc::new(AtomicU64::new(0));
    let raw_counter = Arc::new(AtomicU64::new(0));

    let frame_count = Arc::clone(&frame_counter);
    let raw_count = Arc::clone(&raw_counter);
    let capturer = CapturerBuilder::new(cli.config())
        .on_frame(move |_| {
            frame_count.fetch_add(1, Ordering::Relaxed);
        })
        .on_raw(move |_| {
            raw_count.fetch_add(1, Ordering::Relaxed);
        })
        .open()?;

    match capturer.get_camera_index(&V4L2Enumerator::scan()) {
        Some(index) => info!(index, "camera enumerated"),
        None => warn!(camera = cli.camera, "camera not among enumerated devices"),
    }

    let started = Instant::now();
    let deadline = cli.duration.map(Duration::from_secs);
    loop {
        thread::sleep(Duration::from_secs(1));

        let frames = frame_counter.load(Ordering::Relaxed);
        let raw = raw_counter.load(Ordering::Relaxed);
        match capturer.get_i420_frame() {
            Ok(i420) => info!(
                frames,
                raw,
                width = i420.width(),
                height = i420.height(),
                keyframe = capturer.has_first_keyframe(),
                "status"
            ),
            Err(err) => info!(frames, raw, %err, "status"),
        }

        if deadline.is_some_and(|deadline| started.elapsed() >= deadline) {
            break;
        }
    }

    info!(elapsed = ?started.elapsed(), "done");
    Ok(())
}
