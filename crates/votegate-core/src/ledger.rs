//! Authoritative voter ledger.
//!
//! [`VoterLedger::begin_vote`] is the only mutating entry point. It runs
//! under one ledger-wide lock: check, journal write and in-memory transition
//! happen as one step, so concurrent submissions for the same voter produce
//! exactly one success.

use crate::store::StoreError;
use crate::types::{CandidateId, LedgerRecord, VoteReceipt, VoterId, VoterIdentity};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VoteError {
    #[error("voter {0} has already voted")]
    AlreadyVoted(VoterId),
    #[error("ledger storage failed: {0}")]
    Storage(StoreError),
    /// Restored or stored state contradicts the at-most-once rule.
    #[error("ledger integrity violation: {0}")]
    Integrity(String),
}

impl From<StoreError> for VoteError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(voter_id) => VoteError::AlreadyVoted(voter_id),
            other => VoteError::Storage(other),
        }
    }
}

/// Durable sink for votes. Called while the ledger lock is held and before
/// the in-memory record flips, so a failed write changes nothing.
pub trait LedgerJournal: Send + Sync {
    fn persist_vote(&self, record: &LedgerRecord) -> Result<(), StoreError>;
}

pub struct VoterLedger {
    records: Mutex<HashMap<VoterId, LedgerRecord>>,
    journal: Option<Arc<dyn LedgerJournal>>,
}

impl Default for VoterLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl VoterLedger {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            journal: None,
        }
    }

    pub fn with_journal(journal: Arc<dyn LedgerJournal>) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            journal: Some(journal),
        }
    }

    /// Rebuild the ledger from persisted records.
    pub fn restore(
        records: Vec<LedgerRecord>,
        journal: Option<Arc<dyn LedgerJournal>>,
    ) -> Result<Self, VoteError> {
        let mut map = HashMap::with_capacity(records.len());
        for record in records {
            let voter_id = record.identity.voter_id.clone();
            if map.insert(voter_id.clone(), record).is_some() {
                return Err(VoteError::Integrity(format!(
                    "voter {voter_id} appears more than once in stored ledger"
                )));
            }
        }
        tracing::info!(voters = map.len(), "ledger restored");
        Ok(Self {
            records: Mutex::new(map),
            journal,
        })
    }

    // A panic while holding the lock cannot leave a half-applied record: the
    // map is only touched by a single insert after all fallible work.
    fn lock(&self) -> MutexGuard<'_, HashMap<VoterId, LedgerRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, voter_id: &VoterId) -> Option<LedgerRecord> {
        self.lock().get(voter_id).cloned()
    }

    pub fn has_voted(&self, voter_id: &VoterId) -> bool {
        self.lock().get(voter_id).is_some_and(LedgerRecord::voted)
    }

    /// Record a vote for `identity`. Succeeds at most once per voter ID.
    ///
    /// On `AlreadyVoted` the stored record, including its candidate, is left
    /// exactly as it was.
    pub fn begin_vote(
        &self,
        identity: VoterIdentity,
        candidate: CandidateId,
    ) -> Result<VoteReceipt, VoteError> {
        let mut records = self.lock();
        let voter_id = identity.voter_id.clone();

        let mut record = match records.get(&voter_id) {
            Some(existing) if existing.voted() => {
                tracing::warn!(voter_id = %voter_id, "vote refused: already voted");
                return Err(VoteError::AlreadyVoted(voter_id));
            }
            Some(existing) => existing.clone(),
            None => LedgerRecord::new(identity),
        };

        let receipt = record
            .mark_voted(candidate, Utc::now())
            .ok_or_else(|| VoteError::AlreadyVoted(voter_id.clone()))?;

        if let Some(journal) = &self.journal {
            journal.persist_vote(&record).map_err(|e| {
                tracing::error!(voter_id = %voter_id, error = %e, "failed to journal vote");
                VoteError::from(e)
            })?;
        }

        records.insert(voter_id.clone(), record);
        tracing::info!(voter_id = %voter_id, receipt = %receipt.receipt_id, "vote recorded");
        Ok(receipt)
    }

    /// Voted records per candidate.
    pub fn tally(&self) -> BTreeMap<CandidateId, usize> {
        let mut tally = BTreeMap::new();
        for record in self.lock().values() {
            if let Some(candidate) = record.candidate() {
                *tally.entry(candidate.clone()).or_insert(0) += 1;
            }
        }
        tally
    }

    /// All records, ordered by voter ID.
    pub fn records(&self) -> Vec<LedgerRecord> {
        let mut records: Vec<_> = self.lock().values().cloned().collect();
        records.sort_by(|a, b| a.identity.voter_id.cmp(&b.identity.voter_id));
        records
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(id: &str) -> VoterIdentity {
        VoterIdentity::new(VoterId::new(id).unwrap(), format!("Voter {id}"))
    }

    fn candidate(id: &str) -> CandidateId {
        CandidateId::new(id).unwrap()
    }

    #[test]
    fn test_first_vote_succeeds() {
        let ledger = VoterLedger::new();
        let receipt = ledger.begin_vote(identity("A123"), candidate("C1")).unwrap();
        assert_eq!(receipt.voter_id.as_str(), "A123");

        let record = ledger.get(&VoterId::new("A123").unwrap()).unwrap();
        assert!(record.voted());
        assert_eq!(record.candidate(), Some(&candidate("C1")));
    }

    #[test]
    fn test_second_vote_refused_and_choice_unchanged() {
        let ledger = VoterLedger::new();
        ledger.begin_vote(identity("A123"), candidate("C1")).unwrap();

        let err = ledger.begin_vote(identity("A123"), candidate("C2")).unwrap_err();
        assert!(matches!(err, VoteError::AlreadyVoted(ref id) if id.as_str() == "A123"));

        let record = ledger.get(&VoterId::new("A123").unwrap()).unwrap();
        assert_eq!(record.candidate(), Some(&candidate("C1")));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_get_unknown_voter() {
        let ledger = VoterLedger::new();
        assert!(ledger.get(&VoterId::new("nobody").unwrap()).is_none());
        assert!(!ledger.has_voted(&VoterId::new("nobody").unwrap()));
    }

    #[test]
    fn test_tally() {
        let ledger = VoterLedger::new();
        ledger.begin_vote(identity("A1"), candidate("C1")).unwrap();
        ledger.begin_vote(identity("A2"), candidate("C2")).unwrap();
        ledger.begin_vote(identity("A3"), candidate("C1")).unwrap();
        let _ = ledger.begin_vote(identity("A3"), candidate("C2"));

        let tally = ledger.tally();
        assert_eq!(tally.get(&candidate("C1")), Some(&2));
        assert_eq!(tally.get(&candidate("C2")), Some(&1));
    }

    struct FailingJournal;

    impl LedgerJournal for FailingJournal {
        fn persist_vote(&self, _record: &LedgerRecord) -> Result<(), StoreError> {
            Err(StoreError::Corrupt {
                voter_id: "A1".into(),
                reason: "disk full".into(),
            })
        }
    }

    #[test]
    fn test_journal_failure_leaves_voter_unvoted() {
        let ledger = VoterLedger::with_journal(Arc::new(FailingJournal));
        let err = ledger.begin_vote(identity("A1"), candidate("C1")).unwrap_err();
        assert!(matches!(err, VoteError::Storage(_)));
        assert!(!ledger.has_voted(&VoterId::new("A1").unwrap()));
    }

    struct ConflictJournal;

    impl LedgerJournal for ConflictJournal {
        fn persist_vote(&self, record: &LedgerRecord) -> Result<(), StoreError> {
            Err(StoreError::Conflict(record.identity.voter_id.clone()))
        }
    }

    #[test]
    fn test_storage_conflict_reported_as_already_voted() {
        let ledger = VoterLedger::with_journal(Arc::new(ConflictJournal));
        let err = ledger.begin_vote(identity("A1"), candidate("C1")).unwrap_err();
        assert!(matches!(err, VoteError::AlreadyVoted(_)));
    }

    #[test]
    fn test_restore_rejects_duplicate_voter() {
        let mut first = LedgerRecord::new(identity("A1"));
        first.mark_voted(candidate("C1"), Utc::now());
        let second = first.clone();
        let err = VoterLedger::restore(vec![first, second], None).err().unwrap();
        assert!(matches!(err, VoteError::Integrity(_)));
    }
}
