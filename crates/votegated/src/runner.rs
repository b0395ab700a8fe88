//! Async driver around the synchronous [`VotingSession`].
//!
//! The session lock is a plain `std::sync::Mutex` and is never held across
//! an `.await`. Probes run on the engine thread; ledger writes run on the
//! blocking pool between the two halves of a submission.

use crate::capture::{Capture, SpoolCapture};
use crate::config::Candidate;
use crate::engine::EngineHandle;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use votegate_core::{
    BallotForm, ExtractorError, FaceDescriptor, FaceGallery, ProbeTicket, SessionError,
    SessionEvent, SessionSnapshot, SubmitOutcome, VoteError, VoterLedger, VotingSession,
};

const EVENT_CAPACITY: usize = 64;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error(transparent)]
    Session(#[from] SessionError),
}

#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStatus {
    pub version: &'static str,
    #[serde(flatten)]
    pub session: SessionSnapshot,
    pub voters: usize,
    pub enrolled: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TallyRow {
    pub id: String,
    pub name: String,
    pub votes: usize,
}

pub struct KioskRuntime {
    session: Mutex<VotingSession>,
    gallery: Arc<FaceGallery>,
    ledger: Arc<VoterLedger>,
    engine: EngineHandle,
    events: broadcast::Sender<SessionEvent>,
    candidates: Vec<Candidate>,
}

impl KioskRuntime {
    pub fn new(
        session: VotingSession,
        gallery: Arc<FaceGallery>,
        ledger: Arc<VoterLedger>,
        engine: EngineHandle,
        candidates: Vec<Candidate>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            session: Mutex::new(session),
            gallery,
            ledger,
            engine,
            events,
            candidates,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VotingSession> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Push queued session events to subscribers. No subscribers is fine.
    fn flush(&self, session: &mut VotingSession) {
        for event in session.take_events() {
            let _ = self.events.send(event);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    pub fn is_active(&self) -> bool {
        self.lock().status().active
    }

    pub fn start_session(&self) {
        let mut session = self.lock();
        session.start();
        self.flush(&mut session);
    }

    pub fn stop_session(&self) {
        let mut session = self.lock();
        session.stop();
        self.flush(&mut session);
    }

    pub fn status(&self) -> RuntimeStatus {
        RuntimeStatus {
            version: env!("CARGO_PKG_VERSION"),
            session: self.lock().snapshot(),
            voters: self.ledger.len(),
            enrolled: self.gallery.len(),
        }
    }

    /// Votes per configured candidate, in roster order. Votes for IDs no
    /// longer on the roster are listed after it.
    pub fn tally(&self) -> Vec<TallyRow> {
        let mut counts = self.ledger.tally();
        let mut rows: Vec<TallyRow> = self
            .candidates
            .iter()
            .map(|c| TallyRow {
                id: c.id.clone(),
                name: c.name.clone(),
                votes: counts.remove(c.id.as_str()).unwrap_or(0),
            })
            .collect();
        rows.extend(counts.into_iter().map(|(id, votes)| TallyRow {
            id: id.to_string(),
            name: id.to_string(),
            votes,
        }));
        rows
    }

    /// Feed one capture tick into the session, issuing a probe if it asks for one.
    pub fn on_capture(self: &Arc<Self>, capture: Capture) {
        let (frame, ticket) = {
            let mut session = self.lock();
            let issued = match capture {
                Capture::Frame(frame) => session.on_capture_tick(true, None).map(|t| (frame, t)),
                Capture::Unavailable(warning) => {
                    session.on_capture_tick(false, Some(warning));
                    None
                }
            };
            self.flush(&mut session);
            match issued {
                Some(issued) => issued,
                None => return,
            }
        };

        let runtime = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = runtime.engine.extract(frame).await;
            runtime.finish_probe(ticket, outcome);
        });
    }

    fn finish_probe(&self, ticket: ProbeTicket, outcome: Result<Option<FaceDescriptor>, ExtractorError>) {
        let mut session = self.lock();
        if let Err(e) = session.on_probe_complete(ticket, outcome, &self.gallery, &self.ledger) {
            tracing::error!(error = %e, "probe rejected");
        }
        self.flush(&mut session);
    }

    /// Submit the form. Blocked forms never reach the ledger.
    pub async fn submit(&self, form: BallotForm) -> Result<SubmitOutcome, RuntimeError> {
        let submission = {
            let mut session = self.lock();
            let prepared = session.prepare_submission(&form, &self.gallery);
            self.flush(&mut session);
            match prepared {
                Ok(submission) => submission,
                Err(reason) => return Ok(SubmitOutcome::Blocked(reason)),
            }
        };

        let ledger = Arc::clone(&self.ledger);
        let identity = submission.identity.clone();
        let candidate = submission.candidate.clone();
        let result = tokio::task::spawn_blocking(move || ledger.begin_vote(identity, candidate))
            .await
            .unwrap_or_else(|e| Err(VoteError::Integrity(format!("ledger task failed: {e}"))));

        let mut session = self.lock();
        let outcome = session.complete_submission(submission, result, &self.gallery);
        self.flush(&mut session);
        match outcome {
            // The ballot stands; the missing face shows up in `votegate audit`.
            Err(SessionError::Enrollment { receipt, .. }) => Ok(SubmitOutcome::Accepted(receipt)),
            other => Ok(other?),
        }
    }

    /// Capture on a fixed timer while the session is active.
    pub async fn run_capture_loop(self: Arc<Self>, mut capture: SpoolCapture, period: Duration) {
        tracing::info!(dir = %capture.dir().display(), period_ms = period.as_millis() as u64, "capture loop started");
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            if !self.is_active() {
                continue;
            }
            let captured = tokio::task::spawn_blocking(move || {
                let result = capture.capture();
                (capture, result)
            })
            .await;
            match captured {
                Ok((returned, result)) => {
                    capture = returned;
                    self.on_capture(result);
                }
                Err(e) => {
                    tracing::error!(error = %e, "capture task failed; capture loop exiting");
                    return;
                }
            }
        }
    }
}
