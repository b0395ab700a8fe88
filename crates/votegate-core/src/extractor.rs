//! Contract for the face descriptor model.
//!
//! The model itself lives outside this crate. Implementations are expected
//! to be slow (hundreds of milliseconds) and are driven from a worker, never
//! while the gallery or ledger is locked.

use crate::frame::Frame;
use crate::types::{DescriptorError, FaceDescriptor};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractorError {
    #[error("extractor unavailable: {0}")]
    Unavailable(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("inference timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("extractor returned an invalid descriptor: {0}")]
    InvalidDescriptor(#[from] DescriptorError),
}

/// Turns a frame into a descriptor.
///
/// `Ok(None)` means no single face cleared the detection threshold.
pub trait DescriptorExtractor: Send {
    fn extract(&mut self, frame: &Frame) -> Result<Option<FaceDescriptor>, ExtractorError>;
}

impl<F> DescriptorExtractor for F
where
    F: FnMut(&Frame) -> Result<Option<FaceDescriptor>, ExtractorError> + Send,
{
    fn extract(&mut self, frame: &Frame) -> Result<Option<FaceDescriptor>, ExtractorError> {
        self(frame)
    }
}

/// Wraps an extractor and checks every descriptor it produces against the
/// configured dimension, so a misbehaving model cannot reach the matcher.
pub struct DimensionChecked<E> {
    inner: E,
    dim: usize,
}

impl<E: DescriptorExtractor> DimensionChecked<E> {
    pub fn new(inner: E, dim: usize) -> Self {
        Self { inner, dim }
    }
}

impl<E: DescriptorExtractor> DescriptorExtractor for DimensionChecked<E> {
    fn extract(&mut self, frame: &Frame) -> Result<Option<FaceDescriptor>, ExtractorError> {
        let descriptor = self.inner.extract(frame)?;
        if let Some(d) = &descriptor {
            d.ensure_dim(self.dim).map_err(DescriptorError::from)?;
        }
        Ok(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LengthMismatch;

    fn frame() -> Frame {
        Frame::new(vec![128; 4], 2, 2, 0).unwrap()
    }

    #[test]
    fn test_closure_extractor() {
        let mut calls = 0;
        let mut extractor = |_: &Frame| -> Result<Option<FaceDescriptor>, ExtractorError> {
            calls += 1;
            Ok(None)
        };
        assert!(extractor.extract(&frame()).unwrap().is_none());
        drop(extractor);
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_dimension_checked_rejects_wrong_length() {
        let inner = |_: &Frame| -> Result<Option<FaceDescriptor>, ExtractorError> {
            Ok(Some(FaceDescriptor::new(vec![0.0; 3]).unwrap()))
        };
        let mut checked = DimensionChecked::new(inner, 4);
        let err = checked.extract(&frame()).unwrap_err();
        assert!(matches!(
            err,
            ExtractorError::InvalidDescriptor(DescriptorError::LengthMismatch(LengthMismatch {
                expected: 4,
                actual: 3
            }))
        ));
    }

    #[test]
    fn test_dimension_checked_passes_none() {
        let inner = |_: &Frame| -> Result<Option<FaceDescriptor>, ExtractorError> { Ok(None) };
        let mut checked = DimensionChecked::new(inner, 4);
        assert!(checked.extract(&frame()).unwrap().is_none());
    }
}
