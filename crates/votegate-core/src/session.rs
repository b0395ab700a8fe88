//! Kiosk voting session controller.
//!
//! Drives one station through
//! `Idle → Capturing → Probing → Deciding → {Accepted, Rejected}`.
//! The controller owns no persistent data: gallery and ledger are passed in
//! for each call. It never runs the extractor itself; callers receive a
//! [`ProbeTicket`], run inference elsewhere, and report back with
//! [`VotingSession::on_probe_complete`]. This keeps the capture path free
//! while a probe is pending.

use crate::extractor::ExtractorError;
use crate::gallery::{FaceGallery, GalleryError};
use crate::ledger::{VoteError, VoterLedger};
use crate::matcher::{EuclideanMatcher, MatchError, Matcher, DEFAULT_MATCH_THRESHOLD};
use crate::types::{
    CandidateId, FaceDescriptor, LengthMismatch, MatchResult, VoteReceipt, VoterId, VoterIdentity,
};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

pub const FACE_NOT_DETECTED: &str = "face not detected";
pub const CAMERA_UNAVAILABLE: &str = "camera frame unavailable";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Idle,
    Capturing,
    Probing,
    Deciding,
    Accepted,
    Rejected,
}

/// Status pushed to the UI on every state change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebcamStatus {
    pub active: bool,
    pub face_detected: bool,
    pub warning: Option<String>,
}

/// Pushed to the UI on every completed probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceData {
    pub descriptor: Option<FaceDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SessionEvent {
    Status(WebcamStatus),
    Face(FaceData),
    Outcome(SubmitOutcome),
}

/// Handle for one issued probe. Results are only accepted for the most
/// recently issued ticket of the current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeTicket {
    epoch: u64,
    seq: u64,
}

/// Form fields as entered on the kiosk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BallotForm {
    pub name: String,
    pub voter_id: String,
    pub candidate: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FormField {
    Name,
    VoterId,
    Candidate,
}

/// Why submission is currently blocked. Only one reason is ever reported,
/// chosen in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DisabledReason {
    DuplicateVoter,
    FaceNotVisible,
    MissingField(FormField),
    UnknownCandidate(String),
    InFlight,
}

impl fmt::Display for DisabledReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisabledReason::DuplicateVoter => f.write_str("this face has already been used to vote"),
            DisabledReason::FaceNotVisible => f.write_str("look at the camera until your face is detected"),
            DisabledReason::MissingField(FormField::Name) => f.write_str("enter your name"),
            DisabledReason::MissingField(FormField::VoterId) => f.write_str("enter your voter ID"),
            DisabledReason::MissingField(FormField::Candidate) => f.write_str("select a candidate"),
            DisabledReason::UnknownCandidate(c) => write!(f, "unknown candidate {c:?}"),
            DisabledReason::InFlight => f.write_str("a vote is already being submitted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RejectReason {
    AlreadyVoted,
    Failed(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::AlreadyVoted => f.write_str("this voter ID has already voted"),
            RejectReason::Failed(_) => f.write_str("the vote could not be recorded, please try again"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SubmitOutcome {
    /// Refused locally; the ledger was not consulted.
    Blocked(DisabledReason),
    Accepted(VoteReceipt),
    Rejected(RejectReason),
}

#[derive(Error, Debug)]
pub enum SessionError {
    /// Probe and gallery disagree on descriptor shape.
    #[error("integrity violation: {0}")]
    Integrity(#[from] MatchError),
    /// The extractor produced a descriptor the gallery cannot hold.
    #[error("integrity violation: probe descriptor does not fit the gallery: {0}")]
    ProbeDimension(#[from] LengthMismatch),
    /// The vote is recorded but the face could not be bound to it.
    #[error("vote recorded for {voter_id} but face enrollment failed: {source}")]
    Enrollment {
        voter_id: VoterId,
        receipt: VoteReceipt,
        source: GalleryError,
    },
}

/// A validated submission, handed out by [`VotingSession::prepare_submission`].
/// Run [`VoterLedger::begin_vote`] with it outside any session lock.
#[derive(Debug, Clone)]
pub struct Submission {
    epoch: u64,
    pub identity: VoterIdentity,
    pub candidate: CandidateId,
    descriptor: FaceDescriptor,
}

/// Read-only view of the session for status queries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub status: WebcamStatus,
    pub duplicate_voter: bool,
    pub probe_in_flight: bool,
    pub submitting: bool,
}

pub struct VotingSession<M: Matcher = EuclideanMatcher> {
    matcher: M,
    threshold: f32,
    candidates: Vec<CandidateId>,
    state: SessionState,
    /// Bumped on every teardown; results tagged with an older epoch are dropped.
    epoch: u64,
    issued_seq: u64,
    in_flight: Option<u64>,
    face_detected: bool,
    warning: Option<String>,
    current: Option<FaceDescriptor>,
    duplicate_of: Option<VoterId>,
    submitting: bool,
    events: Vec<SessionEvent>,
}

impl VotingSession<EuclideanMatcher> {
    pub fn new(threshold: f32, candidates: Vec<CandidateId>) -> Self {
        Self::with_matcher(EuclideanMatcher, threshold, candidates)
    }
}

impl Default for VotingSession<EuclideanMatcher> {
    fn default() -> Self {
        Self::new(DEFAULT_MATCH_THRESHOLD, Vec::new())
    }
}

impl<M: Matcher> VotingSession<M> {
    /// An empty candidate list accepts any candidate ID.
    pub fn with_matcher(matcher: M, threshold: f32, candidates: Vec<CandidateId>) -> Self {
        Self {
            matcher,
            threshold,
            candidates,
            state: SessionState::Idle,
            epoch: 0,
            issued_seq: 0,
            in_flight: None,
            face_detected: false,
            warning: None,
            current: None,
            duplicate_of: None,
            submitting: false,
            events: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_duplicate(&self) -> bool {
        self.duplicate_of.is_some()
    }

    pub fn face_detected(&self) -> bool {
        self.face_detected
    }

    pub fn candidates(&self) -> &[CandidateId] {
        &self.candidates
    }

    pub fn status(&self) -> WebcamStatus {
        WebcamStatus {
            active: self.state != SessionState::Idle,
            face_detected: self.face_detected,
            warning: self.warning.clone(),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            status: self.status(),
            duplicate_voter: self.is_duplicate(),
            probe_in_flight: self.in_flight.is_some(),
            submitting: self.submitting,
        }
    }

    /// Drain events emitted since the last call, oldest first.
    pub fn take_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    fn publish_status(&mut self) {
        let status = self.status();
        self.events.push(SessionEvent::Status(status));
    }

    fn transition(&mut self, to: SessionState) {
        if self.state != to {
            tracing::debug!(from = ?self.state, to = ?to, "session transition");
        }
        self.state = to;
        self.publish_status();
    }

    /// Where the session rests between probes and submissions.
    fn resting_state(&self) -> SessionState {
        if self.in_flight.is_some() {
            SessionState::Probing
        } else {
            SessionState::Capturing
        }
    }

    /// Forget the face in front of the camera, including its duplicate flag.
    fn clear_face(&mut self) {
        self.face_detected = false;
        self.current = None;
        self.duplicate_of = None;
    }

    /// Camera started.
    pub fn start(&mut self) {
        if self.state != SessionState::Idle {
            return;
        }
        tracing::info!(epoch = self.epoch, "session started");
        self.warning = None;
        self.transition(SessionState::Capturing);
    }

    /// Camera stopped. Any probe or submission still pending is orphaned.
    pub fn stop(&mut self) {
        if self.state == SessionState::Idle {
            return;
        }
        self.epoch += 1;
        self.in_flight = None;
        self.submitting = false;
        self.warning = None;
        self.clear_face();
        tracing::info!(epoch = self.epoch, "session stopped");
        self.transition(SessionState::Idle);
    }

    /// Capture timer tick. Returns a ticket when a probe should be issued
    /// for the current frame; `None` when the tick is dropped.
    pub fn on_capture_tick(&mut self, frame_available: bool, warning: Option<String>) -> Option<ProbeTicket> {
        if self.state == SessionState::Idle {
            return None;
        }

        if !frame_available {
            self.clear_face();
            self.warning = Some(warning.unwrap_or_else(|| CAMERA_UNAVAILABLE.to_string()));
            self.publish_status();
            return None;
        }

        if warning.is_some() && warning != self.warning {
            self.warning = warning;
            self.publish_status();
        }

        if let Some(seq) = self.in_flight {
            tracing::debug!(seq, "probe still in flight; dropping tick");
            return None;
        }

        self.issued_seq += 1;
        self.in_flight = Some(self.issued_seq);
        self.transition(SessionState::Probing);
        Some(ProbeTicket {
            epoch: self.epoch,
            seq: self.issued_seq,
        })
    }

    /// Feed back the extractor's answer for `ticket`.
    ///
    /// Results from a torn-down session or superseded probe are discarded
    /// without any state change. Errors from the extractor are transient and
    /// surface as a warning.
    pub fn on_probe_complete(
        &mut self,
        ticket: ProbeTicket,
        outcome: Result<Option<FaceDescriptor>, ExtractorError>,
        gallery: &FaceGallery,
        ledger: &VoterLedger,
    ) -> Result<(), SessionError> {
        if self.state == SessionState::Idle || ticket.epoch != self.epoch {
            tracing::debug!(seq = ticket.seq, "discarding probe result from stopped session");
            return Ok(());
        }
        if ticket.seq != self.issued_seq {
            tracing::debug!(seq = ticket.seq, latest = self.issued_seq, "discarding stale probe result");
            return Ok(());
        }
        self.in_flight = None;

        let descriptor = match outcome {
            Ok(Some(descriptor)) => descriptor,
            Ok(None) => {
                self.clear_face();
                self.warning = Some(FACE_NOT_DETECTED.to_string());
                self.events.push(SessionEvent::Face(FaceData { descriptor: None }));
                self.transition(self.resting_state());
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(error = %e, "face extraction failed");
                self.clear_face();
                self.warning = Some(format!("face analysis unavailable: {e}"));
                self.events.push(SessionEvent::Face(FaceData { descriptor: None }));
                self.transition(self.resting_state());
                return Ok(());
            }
        };

        // Checked here so an empty gallery cannot let a bad shape reach the ledger.
        if let Err(mismatch) = descriptor.ensure_dim(gallery.dim()) {
            tracing::error!(error = %mismatch, "probe descriptor does not fit the gallery");
            self.clear_face();
            self.warning = Some("face analysis failed".to_string());
            self.events.push(SessionEvent::Face(FaceData { descriptor: None }));
            self.transition(self.resting_state());
            return Err(SessionError::ProbeDimension(mismatch));
        }

        self.events.push(SessionEvent::Face(FaceData {
            descriptor: Some(descriptor.clone()),
        }));
        self.face_detected = true;
        self.warning = None;
        self.transition(SessionState::Deciding);

        let view = gallery.view();
        let result = match self.matcher.compare(&descriptor, &view, self.threshold) {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(error = %e, "descriptor does not fit the gallery");
                self.clear_face();
                self.warning = Some("face analysis failed".to_string());
                self.transition(self.resting_state());
                return Err(SessionError::Integrity(e));
            }
        };

        self.duplicate_of = match result {
            MatchResult::Matched { identity, distance } if ledger.has_voted(&identity.voter_id) => {
                tracing::warn!(voter_id = %identity.voter_id, distance, "face matches a voter who already voted");
                Some(identity.voter_id)
            }
            MatchResult::Matched { identity, distance } => {
                tracing::debug!(voter_id = %identity.voter_id, distance, "face matches an enrolled voter who has not voted");
                None
            }
            MatchResult::NoMatch => None,
        };
        self.current = Some(descriptor);
        self.transition(self.resting_state());
        Ok(())
    }

    /// The single reason submission is blocked right now, if any.
    pub fn disabled_reason(&self, form: &BallotForm) -> Option<DisabledReason> {
        if self.duplicate_of.is_some() {
            return Some(DisabledReason::DuplicateVoter);
        }
        if self.state == SessionState::Idle || !self.face_detected || self.current.is_none() {
            return Some(DisabledReason::FaceNotVisible);
        }
        if form.name.trim().is_empty() {
            return Some(DisabledReason::MissingField(FormField::Name));
        }
        if form.voter_id.trim().is_empty() {
            return Some(DisabledReason::MissingField(FormField::VoterId));
        }
        let candidate = match form.candidate.as_deref().map(str::trim) {
            Some(c) if !c.is_empty() => c,
            _ => return Some(DisabledReason::MissingField(FormField::Candidate)),
        };
        if !self.candidates.is_empty() && !self.candidates.iter().any(|c| c.as_str() == candidate) {
            return Some(DisabledReason::UnknownCandidate(candidate.to_string()));
        }
        if self.submitting {
            return Some(DisabledReason::InFlight);
        }
        None
    }

    /// Validate the form and mark a submission in flight.
    ///
    /// `gallery` is the one the face will be enrolled into; a descriptor it
    /// cannot hold never reaches the ledger.
    pub fn prepare_submission(
        &mut self,
        form: &BallotForm,
        gallery: &FaceGallery,
    ) -> Result<Submission, DisabledReason> {
        let mismatch = self
            .current
            .as_ref()
            .and_then(|d| d.ensure_dim(gallery.dim()).err());
        if let Some(mismatch) = mismatch {
            tracing::error!(error = %mismatch, "captured descriptor does not fit the gallery");
            self.clear_face();
            self.warning = Some("face analysis failed".to_string());
            self.publish_status();
        }

        if let Some(reason) = self.disabled_reason(form) {
            tracing::debug!(%reason, "submission blocked");
            self.events.push(SessionEvent::Outcome(SubmitOutcome::Blocked(reason.clone())));
            return Err(reason);
        }

        // disabled_reason() has already checked every field.
        let (Ok(voter_id), Some(Ok(candidate)), Some(descriptor)) = (
            VoterId::new(&form.voter_id),
            form.candidate.as_deref().map(CandidateId::new),
            self.current.clone(),
        ) else {
            return Err(DisabledReason::FaceNotVisible);
        };

        self.submitting = true;
        Ok(Submission {
            epoch: self.epoch,
            identity: VoterIdentity::new(voter_id, form.name.trim()),
            candidate,
            descriptor,
        })
    }

    /// Apply the ledger's answer for `submission`.
    ///
    /// An accepted vote always binds the captured face to the voter, even if
    /// the session was stopped while the ledger call was running.
    pub fn complete_submission(
        &mut self,
        submission: Submission,
        result: Result<VoteReceipt, VoteError>,
        gallery: &FaceGallery,
    ) -> Result<SubmitOutcome, SessionError> {
        let live = submission.epoch == self.epoch && self.state != SessionState::Idle;
        if live {
            self.submitting = false;
        }

        let mut enrollment_failure = None;
        let outcome = match result {
            Ok(receipt) => {
                let voter_id = submission.identity.voter_id.clone();
                if let Err(source) = gallery.enroll(submission.identity, vec![submission.descriptor]) {
                    tracing::error!(voter_id = %voter_id, error = %source, "vote recorded but face enrollment failed");
                    enrollment_failure = Some(SessionError::Enrollment {
                        voter_id: voter_id.clone(),
                        receipt: receipt.clone(),
                        source,
                    });
                }
                if live {
                    // The face in front of the camera has now voted.
                    self.duplicate_of = Some(voter_id);
                }
                SubmitOutcome::Accepted(receipt)
            }
            Err(VoteError::AlreadyVoted(voter_id)) => {
                tracing::warn!(voter_id = %voter_id, "submission rejected: already voted");
                SubmitOutcome::Rejected(RejectReason::AlreadyVoted)
            }
            Err(e) => {
                tracing::error!(error = %e, "submission failed");
                SubmitOutcome::Rejected(RejectReason::Failed(e.to_string()))
            }
        };

        if live {
            let terminal = match outcome {
                SubmitOutcome::Accepted(_) => SessionState::Accepted,
                _ => SessionState::Rejected,
            };
            self.events.push(SessionEvent::Outcome(outcome.clone()));
            self.transition(terminal);
            self.transition(self.resting_state());
        }
        match enrollment_failure {
            Some(err) => Err(err),
            None => Ok(outcome),
        }
    }

    /// Validate, record and enroll in one call. Blocked submissions never
    /// reach the ledger.
    pub fn submit(
        &mut self,
        form: &BallotForm,
        ledger: &VoterLedger,
        gallery: &FaceGallery,
    ) -> Result<SubmitOutcome, SessionError> {
        let submission = match self.prepare_submission(form, gallery) {
            Ok(submission) => submission,
            Err(reason) => return Ok(SubmitOutcome::Blocked(reason)),
        };
        let result = ledger.begin_vote(submission.identity.clone(), submission.candidate.clone());
        self.complete_submission(submission, result, gallery)
    }
}
