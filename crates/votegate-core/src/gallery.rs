//! Enrolled-voter face gallery.
//!
//! Readers take a [`GalleryView`] snapshot and match against it without
//! holding any lock. Enrollment builds a new entry list and publishes it in a
//! single pointer swap, so a matcher never sees a partially written entry.

use crate::store::StoreError;
use crate::types::{FaceDescriptor, LengthMismatch, VoterId, VoterIdentity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("voter {0} is already enrolled")]
    AlreadyEnrolled(VoterId),
    #[error("enrollment for voter {0} has no descriptors")]
    NoDescriptors(VoterId),
    #[error("descriptor for voter {voter_id} does not fit the gallery: {source}")]
    Dimension {
        voter_id: VoterId,
        source: LengthMismatch,
    },
    #[error("failed to persist enrollment: {0}")]
    Storage(#[from] StoreError),
}

/// One enrolled voter and the descriptors captured when they voted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub identity: VoterIdentity,
    descriptors: Vec<FaceDescriptor>,
    pub enrolled_at: DateTime<Utc>,
}

impl GalleryEntry {
    /// All descriptors must share one length.
    pub fn new(
        identity: VoterIdentity,
        descriptors: Vec<FaceDescriptor>,
        enrolled_at: DateTime<Utc>,
    ) -> Result<Self, GalleryError> {
        let Some(first) = descriptors.first() else {
            return Err(GalleryError::NoDescriptors(identity.voter_id));
        };
        let dim = first.dim();
        if let Some(source) = descriptors.iter().find_map(|d| d.ensure_dim(dim).err()) {
            return Err(GalleryError::Dimension {
                voter_id: identity.voter_id,
                source,
            });
        }
        Ok(Self {
            identity,
            descriptors,
            enrolled_at,
        })
    }

    pub fn descriptors(&self) -> &[FaceDescriptor] {
        &self.descriptors
    }

    pub fn dim(&self) -> usize {
        self.descriptors[0].dim()
    }

    /// Smallest distance from `probe` to any of this voter's descriptors.
    pub fn min_distance(&self, probe: &FaceDescriptor) -> Result<f32, LengthMismatch> {
        let mut best = f32::INFINITY;
        for descriptor in &self.descriptors {
            best = best.min(probe.euclidean_distance(descriptor)?);
        }
        Ok(best)
    }
}

/// Durable sink for enrollments. Called before the entry becomes visible.
pub trait GalleryJournal: Send + Sync {
    fn persist_enrollment(&self, entry: &GalleryEntry) -> Result<(), StoreError>;
}

/// Immutable snapshot of the gallery at one point in time.
#[derive(Debug, Clone)]
pub struct GalleryView(Arc<Vec<GalleryEntry>>);

impl std::ops::Deref for GalleryView {
    type Target = [GalleryEntry];

    fn deref(&self) -> &[GalleryEntry] {
        &self.0
    }
}

/// Process-wide gallery of enrolled voters.
pub struct FaceGallery {
    dim: usize,
    entries: RwLock<Arc<Vec<GalleryEntry>>>,
    /// Serializes writers; readers never take it.
    enroll_lock: Mutex<()>,
    journal: Option<Arc<dyn GalleryJournal>>,
}

impl std::fmt::Debug for FaceGallery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaceGallery")
            .field("dim", &self.dim)
            .field("enrolled", &self.len())
            .field("journaled", &self.journal.is_some())
            .finish()
    }
}

impl FaceGallery {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            entries: RwLock::new(Arc::new(Vec::new())),
            enroll_lock: Mutex::new(()),
            journal: None,
        }
    }

    pub fn with_journal(dim: usize, journal: Arc<dyn GalleryJournal>) -> Self {
        Self {
            journal: Some(journal),
            ..Self::new(dim)
        }
    }

    /// Rebuild a gallery from previously persisted entries.
    pub fn restore(
        dim: usize,
        entries: Vec<GalleryEntry>,
        journal: Option<Arc<dyn GalleryJournal>>,
    ) -> Result<Self, GalleryError> {
        let mut seen = std::collections::HashSet::new();
        for entry in &entries {
            if !seen.insert(entry.identity.voter_id.clone()) {
                return Err(GalleryError::AlreadyEnrolled(entry.identity.voter_id.clone()));
            }
            entry
                .descriptors
                .iter()
                .try_for_each(|d| d.ensure_dim(dim))
                .map_err(|source| GalleryError::Dimension {
                    voter_id: entry.identity.voter_id.clone(),
                    source,
                })?;
        }
        tracing::info!(enrolled = entries.len(), dim, "gallery restored");
        Ok(Self {
            dim,
            entries: RwLock::new(Arc::new(entries)),
            enroll_lock: Mutex::new(()),
            journal,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Snapshot for matching. Later enrollments do not affect it.
    pub fn view(&self) -> GalleryView {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        GalleryView(Arc::clone(&entries))
    }

    pub fn len(&self) -> usize {
        self.view().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, voter_id: &VoterId) -> bool {
        self.view().iter().any(|e| &e.identity.voter_id == voter_id)
    }

    /// Enroll a voter's descriptors. Each identity is enrolled at most once;
    /// entries are never modified afterwards.
    pub fn enroll(
        &self,
        identity: VoterIdentity,
        descriptors: Vec<FaceDescriptor>,
    ) -> Result<GalleryEntry, GalleryError> {
        let entry = GalleryEntry::new(identity, descriptors, Utc::now())?;
        if let Err(source) = entry.descriptors[0].ensure_dim(self.dim) {
            return Err(GalleryError::Dimension {
                voter_id: entry.identity.voter_id,
                source,
            });
        }

        let _writer = self.enroll_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.view();
        if current.iter().any(|e| e.identity.voter_id == entry.identity.voter_id) {
            return Err(GalleryError::AlreadyEnrolled(entry.identity.voter_id));
        }

        if let Some(journal) = &self.journal {
            journal.persist_enrollment(&entry)?;
        }

        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        next.push(entry.clone());
        *self.entries.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);

        tracing::info!(
            voter_id = %entry.identity.voter_id,
            descriptors = entry.descriptors.len(),
            "voter face enrolled"
        );
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(values: &[f32]) -> FaceDescriptor {
        FaceDescriptor::new(values.to_vec()).unwrap()
    }

    fn identity(id: &str) -> VoterIdentity {
        VoterIdentity::new(VoterId::new(id).unwrap(), format!("Voter {id}"))
    }

    #[test]
    fn test_enroll_and_view() {
        let gallery = FaceGallery::new(2);
        assert!(gallery.is_empty());
        gallery.enroll(identity("A1"), vec![d(&[0.1, 0.2])]).unwrap();
        assert_eq!(gallery.len(), 1);
        assert!(gallery.contains(&VoterId::new("A1").unwrap()));
    }

    #[test]
    fn test_enroll_twice_rejected() {
        let gallery = FaceGallery::new(2);
        gallery.enroll(identity("A1"), vec![d(&[0.1, 0.2])]).unwrap();
        let err = gallery.enroll(identity("A1"), vec![d(&[0.3, 0.2])]).unwrap_err();
        assert!(matches!(err, GalleryError::AlreadyEnrolled(_)));
        assert_eq!(gallery.len(), 1);
    }

    #[test]
    fn test_enroll_wrong_dimension_rejected() {
        let gallery = FaceGallery::new(3);
        let err = gallery.enroll(identity("A1"), vec![d(&[0.1, 0.2])]).unwrap_err();
        assert!(matches!(
            err,
            GalleryError::Dimension { source: LengthMismatch { expected: 3, actual: 2 }, .. }
        ));
        assert!(gallery.is_empty());
    }

    #[test]
    fn test_entry_requires_descriptors_of_one_length() {
        assert!(matches!(
            GalleryEntry::new(identity("A1"), vec![], Utc::now()),
            Err(GalleryError::NoDescriptors(_))
        ));
        assert!(matches!(
            GalleryEntry::new(identity("A1"), vec![d(&[0.1]), d(&[0.1, 0.2])], Utc::now()),
            Err(GalleryError::Dimension { .. })
        ));
    }

    #[test]
    fn test_snapshot_unaffected_by_later_enrollment() {
        let gallery = FaceGallery::new(2);
        let before = gallery.view();
        gallery.enroll(identity("A1"), vec![d(&[0.1, 0.2])]).unwrap();
        assert!(before.is_empty());
        assert_eq!(gallery.view().len(), 1);
    }

    #[test]
    fn test_restore_rejects_duplicates() {
        let entry = GalleryEntry::new(identity("A1"), vec![d(&[0.1, 0.2])], Utc::now()).unwrap();
        let err = FaceGallery::restore(2, vec![entry.clone(), entry], None).unwrap_err();
        assert!(matches!(err, GalleryError::AlreadyEnrolled(_)));
    }

    #[test]
    fn test_debug_omits_descriptors() {
        let gallery = FaceGallery::new(2);
        gallery.enroll(identity("A1"), vec![d(&[0.1, 0.2])]).unwrap();
        let shown = format!("{gallery:?}");
        assert!(shown.contains("enrolled: 1"));
        assert!(!shown.contains("0.1"));
    }

    struct FailingJournal;

    impl GalleryJournal for FailingJournal {
        fn persist_enrollment(&self, entry: &GalleryEntry) -> Result<(), StoreError> {
            Err(StoreError::Conflict(entry.identity.voter_id.clone()))
        }
    }

    #[test]
    fn test_failed_journal_leaves_gallery_unchanged() {
        let gallery = FaceGallery::with_journal(2, Arc::new(FailingJournal));
        let err = gallery.enroll(identity("A1"), vec![d(&[0.1, 0.2])]).unwrap_err();
        assert!(matches!(err, GalleryError::Storage(_)));
        assert!(gallery.is_empty());
    }
}
