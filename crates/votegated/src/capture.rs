//! Frame acquisition from the camera collaborator's spool directory.
//!
//! The camera process owns the device and drops still images into a
//! directory; each capture tick picks up the newest one.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use votegate_core::Frame;

const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "pgm", "bmp"];

/// What one capture tick produced.
#[derive(Debug)]
pub enum Capture {
    Frame(Frame),
    /// No usable frame this tick; the message is shown to the voter.
    Unavailable(String),
}

pub struct SpoolCapture {
    dir: PathBuf,
    stale_after: Duration,
    sequence: u64,
}

impl SpoolCapture {
    pub fn new(dir: impl Into<PathBuf>, stale_after: Duration) -> Self {
        Self {
            dir: dir.into(),
            stale_after,
            sequence: 0,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Decode the newest spooled image to grayscale. Blocking.
    pub fn capture(&mut self) -> Capture {
        let (path, modified) = match newest_image(&self.dir) {
            Ok(Some(found)) => found,
            Ok(None) => return Capture::Unavailable("waiting for camera".into()),
            Err(e) => {
                tracing::warn!(dir = %self.dir.display(), error = %e, "camera spool unreadable");
                return Capture::Unavailable("camera unavailable".into());
            }
        };

        let age = SystemTime::now().duration_since(modified).unwrap_or_default();
        if age > self.stale_after {
            tracing::debug!(?age, path = %path.display(), "newest frame is stale");
            return Capture::Unavailable("camera stopped delivering frames".into());
        }

        let image = match image::open(&path) {
            Ok(image) => image.to_luma8(),
            Err(e) => {
                // Usually a frame caught mid-write; the next tick retries.
                tracing::debug!(path = %path.display(), error = %e, "failed to decode frame");
                return Capture::Unavailable("camera frame unreadable".into());
            }
        };

        self.sequence += 1;
        let (width, height) = image.dimensions();
        let frame = match Frame::new(image.into_raw(), width, height, self.sequence) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "decoded frame has unexpected size");
                return Capture::Unavailable("camera frame unreadable".into());
            }
        };

        if frame.is_dark() {
            tracing::debug!(seq = frame.sequence, brightness = frame.avg_brightness(), "dark frame");
            return Capture::Unavailable("camera too dark".into());
        }
        Capture::Frame(frame)
    }
}

fn newest_image(dir: &Path) -> std::io::Result<Option<(PathBuf, SystemTime)>> {
    let mut newest: Option<(PathBuf, SystemTime)> = None;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
        if !is_image {
            continue;
        }
        let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
            continue;
        };
        if newest.as_ref().map_or(true, |(_, t)| modified > *t) {
            newest = Some((path, modified));
        }
    }
    Ok(newest)
}
