//! Frame validation utilities for test pattern verification.
//!
//! These checks run against I420 frames taken from a capturer and are used
//! with virtual cameras that emit known patterns.

use thiserror::Error;

use crate::frame::I420Buffer;

/// Expected RGB values for SMPTE color bars (8 bars).
///
/// Colors in order: White, Yellow, Cyan, Green, Magenta, Red, Blue, Black
const SMPTE_COLOR_BARS: [(u8, u8, u8); 8] = [
    (235, 235, 235), // White
    (235, 235, 11),  // Yellow
    (12, 236, 237),  // Cyan
    (13, 237, 13),   // Green
    (237, 13, 237),  // Magenta
    (238, 14, 13),   // Red
    (15, 15, 239),   // Blue
    (16, 16, 16),    // Black
];

/// Tolerance for RGB color matching (accounts for YUV->RGB conversion errors).
const COLOR_TOLERANCE: u32 = 15;

/// Smallest luminance rise across the frame that still counts as a gradient.
const MIN_GRADIENT_RISE: f32 = 50.0;

/// Why a frame or frame sequence failed validation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    /// A sample point lies outside the frame.
    #[error("pixel ({x}, {y}) is outside the frame")]
    OutOfBounds {
        /// Column.
        x: u32,
        /// Row.
        y: u32,
    },

    /// A color bar does not have the expected color.
    #[error("color bar {bar} at x={x}: expected RGB{expected:?}, got RGB{actual:?}")]
    ColorBar {
        /// Bar number from the left.
        bar: usize,
        /// Sampled column.
        x: u32,
        /// Expected color.
        expected: (u8, u8, u8),
        /// Sampled color.
        actual: (u8, u8, u8),
    },

    /// Luminance decreases along the sampled row.
    #[error("gradient not increasing at x={x}: luminance {luminance} < previous {previous}")]
    NotIncreasing {
        /// Column where the drop was found.
        x: u32,
        /// Luminance at `x`.
        luminance: f32,
        /// Luminance at the previous sample.
        previous: f32,
    },

    /// The row is too flat to be a gradient.
    #[error("luminance rises by {0} across the frame, expected at least 50")]
    FlatGradient(f32),

    /// No sequence numbers to check.
    #[error("empty frame sequence")]
    EmptySequence,

    /// A sequence number was skipped or repeated.
    #[error("frame sequence gap at index {index}: expected {expected}, got {actual}")]
    SequenceGap {
        /// Position in the checked slice.
        index: usize,
        /// Sequence number that should have been there.
        expected: u32,
        /// Sequence number found.
        actual: u32,
    },
}

/// Validates that a frame contains the SMPTE color bar pattern.
///
/// Each of the 8 vertical bars is sampled at its center on the middle row.
pub fn validate_color_bars(frame: &I420Buffer) -> Result<(), ValidationError> {
    let bar_width = frame.width() / 8;
    let center_y = frame.height() / 2;

    for (bar, expected) in SMPTE_COLOR_BARS.iter().enumerate() {
        #[allow(clippy::cast_possible_truncation)]
        let x = (bar as u32 * bar_width) + (bar_width / 2);

        let actual = frame
            .rgb_at(x, center_y)
            .ok_or(ValidationError::OutOfBounds { x, y: center_y })?;

        if !colors_match(actual, *expected, COLOR_TOLERANCE) {
            return Err(ValidationError::ColorBar {
                bar,
                x,
                expected: *expected,
                actual,
            });
        }
    }

    Ok(())
}

/// Validates that a frame contains a horizontal gradient.
///
/// Luminance along the middle row, sampled every 10 pixels, must not drop
/// and must rise by at least 50 overall.
pub fn validate_gradient(frame: &I420Buffer) -> Result<(), ValidationError> {
    let center_y = frame.height() / 2;
    let mut first: Option<f32> = None;
    let mut previous: Option<f32> = None;

    for x in (0..frame.width()).step_by(10) {
        let (r, g, b) = frame
            .rgb_at(x, center_y)
            .ok_or(ValidationError::OutOfBounds { x, y: center_y })?;

        // Rec. 601 luma
        let luminance = 0.114f32.mul_add(
            f32::from(b),
            0.587f32.mul_add(f32::from(g), 0.299 * f32::from(r)),
        );

        // Allow small decreases due to rounding
        if let Some(previous) = previous.filter(|previous| luminance < previous - 1.0) {
            return Err(ValidationError::NotIncreasing {
                x,
                luminance,
                previous,
            });
        }

        first.get_or_insert(luminance);
        previous = Some(luminance);
    }

    if let (Some(first), Some(last)) = (first, previous) {
        let rise = last - first;
        if rise < MIN_GRADIENT_RISE {
            return Err(ValidationError::FlatGradient(rise));
        }
    }

    Ok(())
}

/// Validates that frame sequence numbers increase by exactly one.
pub fn validate_frame_sequence(sequences: &[u32]) -> Result<(), ValidationError> {
    if sequences.is_empty() {
        return Err(ValidationError::EmptySequence);
    }

    for (offset, pair) in sequences.windows(2).enumerate() {
        let &[previous, actual] = pair else {
            continue;
        };
        let expected = previous.wrapping_add(1);
        if actual != expected {
            return Err(ValidationError::SequenceGap {
                index: offset + 1,
                expected,
                actual,
            });
        }
    }

    Ok(())
}

/// Whether every channel of `actual` is within `tolerance` of `expected`.
fn colors_match(actual: (u8, u8, u8), expected: (u8, u8, u8), tolerance: u32) -> bool {
    let (ar, ag, ab) = actual;
    let (er, eg, eb) = expected;

    u32::from(ar.abs_diff(er)) <= tolerance
        && u32::from(ag.abs_diff(eg)) <= tolerance
        && u32::from(ab.abs_diff(eb)) <= tolerance
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameBuffer;
    use crate::mock::{generate_test_frame, TestPattern};
    use crate::traits::{Format, FourCC, RawBuffer};
    use std::time::Duration;

    fn captured(format: &Format, pattern: TestPattern) -> I420Buffer {
        let data = generate_test_frame(format, pattern);
        let raw = RawBuffer {
            index: 0,
            data: &data,
            flags: 0,
            timestamp: Duration::ZERO,
            sequence: 0,
        };
        FrameBuffer::from_raw(format.width, format.height, &raw, format.fourcc)
            .expect("valid frame")
            .to_i420()
            .expect("convertible frame")
    }

    #[test]
    fn test_validate_color_bars_success() {
        let frame = captured(&Format::new(640, 480, FourCC::YUYV), TestPattern::ColorBars);
        let result = validate_color_bars(&frame);
        assert!(result.is_ok(), "Color bars validation should succeed: {result:?}");
    }

    #[test]
    fn test_validate_color_bars_planar_source() {
        let frame = captured(&Format::new(320, 240, FourCC::YU12), TestPattern::ColorBars);
        assert_eq!(validate_color_bars(&frame), Ok(()));
    }

    #[test]
    fn test_validate_color_bars_wrong_pattern() {
        let frame = captured(&Format::new(640, 480, FourCC::YUYV), TestPattern::Gradient);
        assert!(matches!(
            validate_color_bars(&frame),
            Err(ValidationError::ColorBar { .. })
        ));
    }

    #[test]
    fn test_validate_gradient_success() {
        let frame = captured(&Format::new(640, 480, FourCC::YUYV), TestPattern::Gradient);
        let result = validate_gradient(&frame);
        assert!(result.is_ok(), "Gradient validation should succeed: {result:?}");
    }

    #[test]
    fn test_validate_gradient_wrong_pattern() {
        let frame = captured(
            &Format::new(640, 480, FourCC::YUYV),
            TestPattern::Solid(128, 128, 128),
        );
        assert!(matches!(
            validate_gradient(&frame),
            Err(ValidationError::FlatGradient(_))
        ));
    }

    #[test]
    fn test_validate_frame_sequence() {
        assert_eq!(validate_frame_sequence(&[4, 5, 6, 7]), Ok(()));
        assert_eq!(validate_frame_sequence(&[9]), Ok(()));
        assert_eq!(
            validate_frame_sequence(&[]),
            Err(ValidationError::EmptySequence)
        );
        assert_eq!(
            validate_frame_sequence(&[0, 1, 3]),
            Err(ValidationError::SequenceGap {
                index: 2,
                expected: 2,
                actual: 3
            })
        );
    }

    #[test]
    fn test_colors_match() {
        assert!(colors_match((100, 150, 200), (100, 150, 200), 10));
        assert!(colors_match((100, 150, 200), (105, 155, 205), 10));
        assert!(!colors_match((100, 150, 200), (120, 150, 200), 10));
    }
}
