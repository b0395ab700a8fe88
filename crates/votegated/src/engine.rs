use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use votegate_core::{DescriptorExtractor, ExtractorError, FaceDescriptor, Frame};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Messages sent from the runtime to the engine thread.
enum EngineRequest {
    Extract {
        frame: Frame,
        reply: oneshot::Sender<Result<Option<FaceDescriptor>, ExtractorError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    timeout: Duration,
}

impl EngineHandle {
    /// Run the extractor on `frame`.
    ///
    /// Bounded by the handle's timeout. On timeout the request is abandoned
    /// here; the engine thread finishes it and drops the reply.
    pub async fn extract(&self, frame: Frame) -> Result<Option<FaceDescriptor>, ExtractorError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Extract {
                frame,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ExtractorError::Unavailable("engine thread exited".into()))?;

        match tokio::time::timeout(self.timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ExtractorError::Unavailable("engine thread exited".into())),
            Err(_) => Err(ExtractorError::Timeout(self.timeout)),
        }
    }
}

/// Spawn the extractor on a dedicated OS thread.
///
/// Inference is blocking and slow, so it never runs on the async runtime.
/// The channel holds a single request: the session never has more than one
/// probe in flight.
pub fn spawn_engine<E>(mut extractor: E, timeout: Duration) -> Result<EngineHandle, EngineError>
where
    E: DescriptorExtractor + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(1);

    std::thread::Builder::new()
        .name("votegate-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Extract { frame, reply } => {
                        let started = std::time::Instant::now();
                        let result = extractor.extract(&frame);
                        tracing::debug!(
                            seq = frame.sequence,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            face = matches!(result, Ok(Some(_))),
                            "extract: done"
                        );
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx, timeout })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> Frame {
        Frame::new(vec![128; 4], 2, 2, 7).unwrap()
    }

    #[tokio::test]
    async fn test_extract_round_trip() {
        let extractor = |f: &Frame| -> Result<Option<FaceDescriptor>, ExtractorError> {
            Ok(Some(FaceDescriptor::new(vec![f.sequence as f32, 0.0]).unwrap()))
        };
        let engine = spawn_engine(extractor, Duration::from_secs(5)).unwrap();
        let descriptor = engine.extract(frame()).await.unwrap().unwrap();
        assert_eq!(descriptor.values(), &[7.0, 0.0]);
    }

    #[tokio::test]
    async fn test_extract_timeout() {
        let extractor = |_: &Frame| -> Result<Option<FaceDescriptor>, ExtractorError> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(None)
        };
        let engine = spawn_engine(extractor, Duration::from_millis(50)).unwrap();
        assert!(matches!(engine.extract(frame()).await, Err(ExtractorError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_extractor_error_passed_through() {
        let extractor = |_: &Frame| -> Result<Option<FaceDescriptor>, ExtractorError> {
            Err(ExtractorError::InferenceFailed("model crashed".into()))
        };
        let engine = spawn_engine(extractor, Duration::from_secs(5)).unwrap();
        assert!(matches!(
            engine.extract(frame()).await,
            Err(ExtractorError::InferenceFailed(_))
        ));
    }
}
