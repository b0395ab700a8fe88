//! SQLite persistence for the ledger and the gallery.
//!
//! The `voters.voter_id` primary key repeats the at-most-once rule at the
//! storage layer: a second insert for one voter fails with
//! [`StoreError::Conflict`] even if two processes share the database file.

use crate::gallery::{GalleryEntry, GalleryJournal};
use crate::ledger::LedgerJournal;
use crate::types::{Ballot, CandidateId, FaceDescriptor, LedgerRecord, VoterId, VoterIdentity};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("voter {0} already has a stored record")]
    Conflict(VoterId),
    #[error("corrupt row for voter {voter_id}: {reason}")]
    Corrupt { voter_id: String, reason: String },
    #[error("failed to create store directory {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

/// Findings of an offline consistency check over the stored data.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    pub voters: usize,
    pub enrolled: usize,
    /// Voted records with no enrolled face: these voters could vote again.
    pub voters_without_face: Vec<String>,
    /// Enrolled faces with no voted record.
    pub faces_without_vote: Vec<String>,
    /// Voters whose stored descriptors have the wrong length.
    pub bad_descriptor_dim: Vec<String>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.voters_without_face.is_empty()
            && self.faces_without_vote.is_empty()
            && self.bad_descriptor_dim.is_empty()
    }
}

pub struct SqliteStore {
    db: Mutex<Connection>,
}

impl SqliteStore {
    const SCHEMA: &'static str = r"
        CREATE TABLE IF NOT EXISTS voters (
            voter_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            candidate_id TEXT NOT NULL,
            voted INTEGER NOT NULL CHECK (voted IN (0, 1)),
            receipt_id TEXT NOT NULL UNIQUE,
            voted_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS face_descriptors (
            id INTEGER PRIMARY KEY,
            voter_id TEXT NOT NULL,
            name TEXT NOT NULL,
            descriptor TEXT NOT NULL,
            enrolled_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_face_descriptors_voter
        ON face_descriptors(voter_id);
    ";

    /// Open or create the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let db = Connection::open(path)?;
        tracing::info!(path = %path.display(), "opened ledger store");
        Self::initialize(db)
    }

    /// In-memory store, for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(db: Connection) -> Result<Self, StoreError> {
        db.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")?;
        db.execute_batch(Self::SCHEMA)?;
        Ok(Self { db: Mutex::new(db) })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load every voted record.
    pub fn load_ledger(&self) -> Result<Vec<LedgerRecord>, StoreError> {
        let db = self.conn();
        let mut stmt = db.prepare(
            "SELECT voter_id, name, candidate_id, voted, receipt_id, voted_at
             FROM voters ORDER BY voter_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (voter_id, name, candidate_id, voted, receipt_id, voted_at) = row?;
            if voted != 1 {
                return Err(corrupt(&voter_id, "stored voter is not marked voted"));
            }
            let identity = VoterIdentity::new(parse_voter_id(&voter_id)?, name);
            let ballot = Ballot {
                candidate: CandidateId::new(&candidate_id)
                    .map_err(|e| corrupt(&voter_id, e.to_string()))?,
                receipt_id: Uuid::parse_str(&receipt_id)
                    .map_err(|e| corrupt(&voter_id, format!("receipt id: {e}")))?,
                cast_at: parse_time(&voter_id, &voted_at)?,
            };
            records.push(LedgerRecord::voted_with(identity, ballot));
        }
        Ok(records)
    }

    /// Load every gallery entry, descriptors in enrollment order.
    pub fn load_gallery(&self) -> Result<Vec<GalleryEntry>, StoreError> {
        let mut grouped: BTreeMap<String, (String, String, Vec<FaceDescriptor>)> = BTreeMap::new();
        {
            let db = self.conn();
            let mut stmt = db.prepare(
                "SELECT voter_id, name, descriptor, enrolled_at
                 FROM face_descriptors ORDER BY id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?;
            for row in rows {
                let (voter_id, name, descriptor, enrolled_at) = row?;
                let descriptor: FaceDescriptor = serde_json::from_str(&descriptor)
                    .map_err(|e| corrupt(&voter_id, format!("descriptor: {e}")))?;
                grouped
                    .entry(voter_id)
                    .or_insert_with(|| (name, enrolled_at, Vec::new()))
                    .2
                    .push(descriptor);
            }
        }

        grouped
            .into_iter()
            .map(|(voter_id, (name, enrolled_at, descriptors))| {
                let identity = VoterIdentity::new(parse_voter_id(&voter_id)?, name);
                let enrolled_at = parse_time(&voter_id, &enrolled_at)?;
                GalleryEntry::new(identity, descriptors, enrolled_at)
                    .map_err(|e| corrupt(&voter_id, e.to_string()))
            })
            .collect()
    }

    /// Cross-check ledger and gallery tables.
    pub fn audit(&self, dim: usize) -> Result<AuditReport, StoreError> {
        let ledger = self.load_ledger()?;
        let gallery = self.load_gallery()?;

        let voted: std::collections::BTreeSet<&str> =
            ledger.iter().map(|r| r.identity.voter_id.as_str()).collect();
        let enrolled: std::collections::BTreeSet<&str> =
            gallery.iter().map(|e| e.identity.voter_id.as_str()).collect();

        Ok(AuditReport {
            voters: ledger.len(),
            enrolled: gallery.len(),
            voters_without_face: voted.difference(&enrolled).map(|s| s.to_string()).collect(),
            faces_without_vote: enrolled.difference(&voted).map(|s| s.to_string()).collect(),
            bad_descriptor_dim: gallery
                .iter()
                .filter(|e| e.descriptors().iter().any(|d| d.ensure_dim(dim).is_err()))
                .map(|e| e.identity.voter_id.to_string())
                .collect(),
        })
    }
}

impl LedgerJournal for SqliteStore {
    fn persist_vote(&self, record: &LedgerRecord) -> Result<(), StoreError> {
        let voter_id = &record.identity.voter_id;
        let ballot = record
            .ballot()
            .ok_or_else(|| corrupt(voter_id.as_str(), "refusing to store an unvoted record"))?;

        let db = self.conn();
        let result = db.execute(
            "INSERT INTO voters (voter_id, name, candidate_id, voted, receipt_id, voted_at)
             VALUES (?1, ?2, ?3, 1, ?4, ?5)",
            params![
                voter_id.as_str(),
                &record.identity.name,
                ballot.candidate.as_str(),
                ballot.receipt_id.to_string(),
                ballot.cast_at.to_rfc3339(),
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(StoreError::Conflict(voter_id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl GalleryJournal for SqliteStore {
    fn persist_enrollment(&self, entry: &GalleryEntry) -> Result<(), StoreError> {
        let voter_id = entry.identity.voter_id.as_str();
        let mut db = self.conn();
        let tx = db.transaction()?;

        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM face_descriptors WHERE voter_id = ?1 LIMIT 1",
                params![voter_id],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Err(StoreError::Conflict(entry.identity.voter_id.clone()));
        }

        let enrolled_at = entry.enrolled_at.to_rfc3339();
        for descriptor in entry.descriptors() {
            let json = serde_json::to_string(descriptor)
                .map_err(|e| corrupt(voter_id, format!("descriptor: {e}")))?;
            tx.execute(
                "INSERT INTO face_descriptors (voter_id, name, descriptor, enrolled_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![voter_id, &entry.identity.name, json, &enrolled_at],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}

fn corrupt(voter_id: &str, reason: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        voter_id: voter_id.to_string(),
        reason: reason.into(),
    }
}

fn parse_voter_id(raw: &str) -> Result<VoterId, StoreError> {
    VoterId::new(raw).map_err(|e| corrupt(raw, e.to_string()))
}

fn parse_time(voter_id: &str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| corrupt(voter_id, format!("timestamp {raw:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(id: &str) -> VoterIdentity {
        VoterIdentity::new(VoterId::new(id).unwrap(), format!("Voter {id}"))
    }

    fn voted(id: &str, candidate: &str) -> LedgerRecord {
        let mut record = LedgerRecord::new(identity(id));
        record.mark_voted(CandidateId::new(candidate).unwrap(), Utc::now());
        record
    }

    fn entry(id: &str, values: &[f32]) -> GalleryEntry {
        GalleryEntry::new(
            identity(id),
            vec![FaceDescriptor::new(values.to_vec()).unwrap()],
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn test_vote_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let record = voted("A1", "C1");
        store.persist_vote(&record).unwrap();

        let loaded = store.load_ledger().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].identity, record.identity);
        assert_eq!(loaded[0].candidate(), record.candidate());
        assert_eq!(
            loaded[0].ballot().unwrap().receipt_id,
            record.ballot().unwrap().receipt_id
        );
    }

    #[test]
    fn test_second_vote_conflicts() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.persist_vote(&voted("A1", "C1")).unwrap();
        let err = store.persist_vote(&voted("A1", "C2")).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(ref id) if id.as_str() == "A1"));
        assert_eq!(store.load_ledger().unwrap()[0].candidate().unwrap().as_str(), "C1");
    }

    #[test]
    fn test_unvoted_record_refused() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store.persist_vote(&LedgerRecord::new(identity("A1"))).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[test]
    fn test_enrollment_round_trip_and_conflict() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.persist_enrollment(&entry("A1", &[0.25, 0.5])).unwrap();
        assert!(matches!(
            store.persist_enrollment(&entry("A1", &[0.1, 0.1])),
            Err(StoreError::Conflict(_))
        ));

        let gallery = store.load_gallery().unwrap();
        assert_eq!(gallery.len(), 1);
        assert_eq!(gallery[0].descriptors()[0].values(), &[0.25, 0.5]);
    }

    #[test]
    fn test_audit_flags_inconsistencies() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.persist_vote(&voted("A1", "C1")).unwrap();
        store.persist_enrollment(&entry("A1", &[0.1, 0.2])).unwrap();
        store.persist_vote(&voted("A2", "C1")).unwrap();
        store.persist_enrollment(&entry("B9", &[0.1, 0.2, 0.3])).unwrap();

        let report = store.audit(2).unwrap();
        assert!(!report.is_clean());
        assert_eq!(report.voters, 2);
        assert_eq!(report.enrolled, 2);
        assert_eq!(report.voters_without_face, vec!["A2".to_string()]);
        assert_eq!(report.faces_without_vote, vec!["B9".to_string()]);
        assert_eq!(report.bad_descriptor_dim, vec!["B9".to_string()]);
    }

    #[test]
    fn test_reopen_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ledger.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.persist_vote(&voted("A1", "C1")).unwrap();
            store.persist_enrollment(&entry("A1", &[0.1, 0.2])).unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.load_ledger().unwrap().len(), 1);
        assert_eq!(store.load_gallery().unwrap().len(), 1);
        assert!(store.audit(2).unwrap().is_clean());
    }
}
