//! Captured frame type and the cheap quality checks run before inference.

use thiserror::Error;

/// Fraction of near-black pixels above which a frame is too dark to analyse.
pub const DARK_FRAME_THRESHOLD: f32 = 0.95;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("invalid frame length for {width}x{height}: expected {expected}, got {actual}")]
    InvalidLength {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
}

/// A captured grayscale frame.
#[derive(Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub sequence: u64,
    pub captured_at: std::time::Instant,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, sequence: u64) -> Result<Self, FrameError> {
        let expected = width as usize * height as usize;
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                width,
                height,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            sequence,
            captured_at: std::time::Instant::now(),
        })
    }

    /// Average pixel brightness (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&b| b as f32).sum::<f32>() / self.data.len() as f32
    }

    pub fn is_dark(&self) -> bool {
        is_dark_frame(&self.data, DARK_FRAME_THRESHOLD)
    }
}

/// Returns true if more than `threshold_pct` of pixels fall below 32.
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark_count = gray.iter().filter(|&&p| p < 32).count();
    (dark_count as f32 / gray.len() as f32) > threshold_pct
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_length_checked() {
        assert!(Frame::new(vec![0; 6], 3, 2, 0).is_ok());
        assert_eq!(
            Frame::new(vec![0; 5], 3, 2, 0).unwrap_err(),
            FrameError::InvalidLength { width: 3, height: 2, expected: 6, actual: 5 }
        );
    }

    #[test]
    fn test_avg_brightness() {
        let frame = Frame::new(vec![0, 100, 200, 100], 2, 2, 1).unwrap();
        assert!((frame.avg_brightness() - 100.0).abs() < 1e-6);
    }

    #[test]
    fn test_dark_frame_all_black() {
        assert!(is_dark_frame(&vec![0u8; 1000], DARK_FRAME_THRESHOLD));
    }

    #[test]
    fn test_dark_frame_empty() {
        assert!(is_dark_frame(&[], DARK_FRAME_THRESHOLD));
    }

    #[test]
    fn test_dark_frame_borderline() {
        // 96% dark → dark; 94% dark → usable
        let mut mostly = vec![10u8; 960];
        mostly.extend(vec![128u8; 40]);
        assert!(is_dark_frame(&mostly, DARK_FRAME_THRESHOLD));

        let mut usable = vec![10u8; 940];
        usable.extend(vec![128u8; 60]);
        assert!(!is_dark_frame(&usable, DARK_FRAME_THRESHOLD));
    }
}
