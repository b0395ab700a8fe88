use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Descriptor length of the 128-d face recognition models the kiosk ships with.
pub const DEFAULT_DESCRIPTOR_DIM: usize = 128;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("descriptor length mismatch: expected {expected}, got {actual}")]
pub struct LengthMismatch {
    pub expected: usize,
    pub actual: usize,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DescriptorError {
    #[error(transparent)]
    LengthMismatch(#[from] LengthMismatch),
    #[error("descriptor has no components")]
    Empty,
    #[error("descriptor component {index} is not a finite number")]
    NonFinite { index: usize },
}

/// Face descriptor: one point in the recognizer's embedding space.
///
/// Always non-empty and finite. The length is checked again on every
/// comparison, since two valid descriptors from different models can still
/// disagree on dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct FaceDescriptor {
    values: Vec<f32>,
}

impl FaceDescriptor {
    pub fn new(values: Vec<f32>) -> Result<Self, DescriptorError> {
        if values.is_empty() {
            return Err(DescriptorError::Empty);
        }
        if let Some(index) = values.iter().position(|v| !v.is_finite()) {
            return Err(DescriptorError::NonFinite { index });
        }
        Ok(Self { values })
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Fail unless this descriptor has exactly `dim` components.
    pub fn ensure_dim(&self, dim: usize) -> Result<(), LengthMismatch> {
        if self.values.len() != dim {
            return Err(LengthMismatch {
                expected: dim,
                actual: self.values.len(),
            });
        }
        Ok(())
    }

    /// Euclidean distance to `other`.
    ///
    /// Differing lengths are an error: `zip` would otherwise silently
    /// truncate and report a distance over the shared prefix only.
    pub fn euclidean_distance(&self, other: &FaceDescriptor) -> Result<f32, LengthMismatch> {
        other.ensure_dim(self.values.len())?;
        Ok(self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt())
    }
}

impl TryFrom<Vec<f32>> for FaceDescriptor {
    type Error = DescriptorError;

    fn try_from(values: Vec<f32>) -> Result<Self, Self::Error> {
        Self::new(values)
    }
}

impl From<FaceDescriptor> for Vec<f32> {
    fn from(descriptor: FaceDescriptor) -> Self {
        descriptor.values
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{field} must not be empty")]
pub struct EmptyIdError {
    pub field: &'static str,
}

/// Externally issued voter ID (e.g. the number on a voter card).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VoterId(String);

impl VoterId {
    /// Surrounding whitespace is stripped so "A123 " and "A123" are one voter.
    pub fn new(raw: &str) -> Result<Self, EmptyIdError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(EmptyIdError { field: "voter id" });
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VoterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for VoterId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Identifier of a candidate on the ballot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CandidateId(String);

impl CandidateId {
    pub fn new(raw: &str) -> Result<Self, EmptyIdError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(EmptyIdError { field: "candidate id" });
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CandidateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for CandidateId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// A voter as entered on the kiosk form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoterIdentity {
    pub voter_id: VoterId,
    pub name: String,
}

impl VoterIdentity {
    pub fn new(voter_id: VoterId, name: impl Into<String>) -> Self {
        Self {
            voter_id,
            name: name.into(),
        }
    }
}

/// The choice recorded when a voter's `voted` flag flips.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ballot {
    pub candidate: CandidateId,
    pub receipt_id: Uuid,
    pub cast_at: DateTime<Utc>,
}

/// Proof of an accepted vote, handed back to the kiosk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteReceipt {
    pub voter_id: VoterId,
    pub receipt_id: Uuid,
    pub cast_at: DateTime<Utc>,
}

/// One voter's entry in the ledger.
///
/// `voted` is derived from the presence of a ballot, and the ballot can
/// only be set once through [`LedgerRecord::mark_voted`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub identity: VoterIdentity,
    ballot: Option<Ballot>,
}

impl LedgerRecord {
    pub fn new(identity: VoterIdentity) -> Self {
        Self {
            identity,
            ballot: None,
        }
    }

    /// Rebuild a record that was already voted (e.g. from storage).
    pub fn voted_with(identity: VoterIdentity, ballot: Ballot) -> Self {
        Self {
            identity,
            ballot: Some(ballot),
        }
    }

    pub fn voted(&self) -> bool {
        self.ballot.is_some()
    }

    pub fn ballot(&self) -> Option<&Ballot> {
        self.ballot.as_ref()
    }

    pub fn candidate(&self) -> Option<&CandidateId> {
        self.ballot.as_ref().map(|b| &b.candidate)
    }

    /// Flip `voted` from false to true. Returns `None` and leaves the record
    /// untouched if it was already voted.
    pub fn mark_voted(&mut self, candidate: CandidateId, cast_at: DateTime<Utc>) -> Option<VoteReceipt> {
        if self.ballot.is_some() {
            return None;
        }
        let ballot = Ballot {
            candidate,
            receipt_id: Uuid::new_v4(),
            cast_at,
        };
        let receipt = VoteReceipt {
            voter_id: self.identity.voter_id.clone(),
            receipt_id: ballot.receipt_id,
            cast_at,
        };
        self.ballot = Some(ballot);
        Some(receipt)
    }
}

/// Result of matching a probe descriptor against the gallery.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchResult {
    Matched { identity: VoterIdentity, distance: f32 },
    NoMatch,
}

impl MatchResult {
    pub fn is_match(&self) -> bool {
        matches!(self, MatchResult::Matched { .. })
    }
}
