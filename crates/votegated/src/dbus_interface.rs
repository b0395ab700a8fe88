use crate::runner::KioskRuntime;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use votegate_core::{BallotForm, SessionEvent, SubmitOutcome};
use zbus::interface;
use zbus::object_server::SignalEmitter;

pub const BUS_NAME: &str = "org.votegate.Kiosk1";
pub const OBJECT_PATH: &str = "/org/votegate/Kiosk1";

/// D-Bus interface for the votegate kiosk daemon.
///
/// Bus name: org.votegate.Kiosk1
/// Object path: /org/votegate/Kiosk1
///
/// Structured replies are JSON strings.
pub struct KioskService {
    runtime: Arc<KioskRuntime>,
}

impl KioskService {
    pub fn new(runtime: Arc<KioskRuntime>) -> Self {
        Self { runtime }
    }
}

/// Reply to `Submit`: the outcome plus text to show the voter.
#[derive(Serialize)]
struct SubmitReply {
    outcome: SubmitOutcome,
    message: String,
}

impl From<SubmitOutcome> for SubmitReply {
    fn from(outcome: SubmitOutcome) -> Self {
        let message = match &outcome {
            SubmitOutcome::Accepted(_) => "vote recorded".to_string(),
            SubmitOutcome::Blocked(reason) => reason.to_string(),
            SubmitOutcome::Rejected(reason) => reason.to_string(),
        };
        Self { outcome, message }
    }
}

fn to_json<T: Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

#[interface(name = "org.votegate.Kiosk1")]
impl KioskService {
    /// Start capturing and probing.
    async fn start_session(&self) -> zbus::fdo::Result<()> {
        tracing::info!("start_session requested");
        self.runtime.start_session();
        Ok(())
    }

    /// Stop capturing. Pending probe results are discarded.
    async fn stop_session(&self) -> zbus::fdo::Result<()> {
        tracing::info!("stop_session requested");
        self.runtime.stop_session();
        Ok(())
    }

    /// Submit a ballot. An empty `candidate_id` means none selected.
    /// Returns `{"outcome": ..., "message": ...}` as JSON.
    async fn submit(&self, name: &str, voter_id: &str, candidate_id: &str) -> zbus::fdo::Result<String> {
        tracing::info!(voter_id, candidate_id, "submit requested");
        let form = BallotForm {
            name: name.to_string(),
            voter_id: voter_id.to_string(),
            candidate: Some(candidate_id).filter(|c| !c.trim().is_empty()).map(str::to_string),
        };
        let outcome = self
            .runtime
            .submit(form)
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        to_json(&SubmitReply::from(outcome))
    }

    /// Return daemon and session status as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        to_json(&self.runtime.status())
    }

    /// List the ballot's candidates as JSON.
    async fn candidates(&self) -> zbus::fdo::Result<String> {
        to_json(&self.runtime.candidates())
    }

    /// Votes per candidate as JSON.
    async fn tally(&self) -> zbus::fdo::Result<String> {
        to_json(&self.runtime.tally())
    }

    #[zbus(signal)]
    async fn status_changed(emitter: &SignalEmitter<'_>, status: &str) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn face_changed(emitter: &SignalEmitter<'_>, detected: bool) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn vote_outcome(emitter: &SignalEmitter<'_>, outcome: &str) -> zbus::Result<()>;
}

/// Relay session events to D-Bus signals until the runtime goes away.
/// Descriptors stay in the daemon; only the detection flag is signalled.
pub async fn forward_events(
    emitter: SignalEmitter<'static>,
    mut events: broadcast::Receiver<SessionEvent>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "signal relay fell behind; events dropped");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };

        let sent = match &event {
            SessionEvent::Status(status) => match serde_json::to_string(status) {
                Ok(json) => KioskService::status_changed(&emitter, &json).await,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to encode status");
                    continue;
                }
            },
            SessionEvent::Face(face) => {
                KioskService::face_changed(&emitter, face.descriptor.is_some()).await
            }
            SessionEvent::Outcome(outcome) => match serde_json::to_string(outcome) {
                Ok(json) => KioskService::vote_outcome(&emitter, &json).await,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to encode outcome");
                    continue;
                }
            },
        };
        if let Err(e) = sent {
            tracing::warn!(error = %e, "failed to emit signal");
        }
    }
}
