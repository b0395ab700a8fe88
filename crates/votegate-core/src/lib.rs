//! votegate-core: face-identity matching and vote integrity for a voting kiosk.
//!
//! A captured face is reduced to a descriptor by an external model, matched
//! against the gallery of voters who already voted, and a vote is accepted
//! only through the ledger's atomic at-most-once entry point.

pub mod extractor;
pub mod frame;
pub mod gallery;
pub mod ledger;
pub mod matcher;
pub mod session;
pub mod store;
pub mod types;

pub use extractor::{DescriptorExtractor, DimensionChecked, ExtractorError};
pub use frame::Frame;
pub use gallery::{FaceGallery, GalleryEntry, GalleryError, GalleryJournal, GalleryView};
pub use ledger::{LedgerJournal, VoteError, VoterLedger};
pub use matcher::{EuclideanMatcher, MatchError, Matcher, DEFAULT_MATCH_THRESHOLD};
pub use session::{
    BallotForm, DisabledReason, FaceData, FormField, ProbeTicket, RejectReason, SessionError,
    SessionEvent, SessionSnapshot, SessionState, SubmitOutcome, Submission, VotingSession,
    WebcamStatus,
};
pub use store::{AuditReport, SqliteStore, StoreError};
pub use types::{
    CandidateId, FaceDescriptor, LedgerRecord, MatchResult, VoteReceipt, VoterId, VoterIdentity,
    DEFAULT_DESCRIPTOR_DIM,
};
