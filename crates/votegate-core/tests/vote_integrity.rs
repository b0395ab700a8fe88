use std::sync::{Arc, Barrier};
use std::thread;

use votegate_core::{CandidateId, SqliteStore, VoteError, VoterId, VoterIdentity, VoterLedger};

const CONTENDERS: usize = 16;

fn identity(id: &str) -> VoterIdentity {
    VoterIdentity::new(VoterId::new(id).unwrap(), format!("Voter {id}"))
}

/// Fire `CONTENDERS` simultaneous votes for one voter; return (successes, already-voted).
fn race_same_voter(ledger: Arc<VoterLedger>) -> (usize, usize) {
    let barrier = Arc::new(Barrier::new(CONTENDERS));
    let handles: Vec<_> = (0..CONTENDERS)
        .map(|i| {
            let ledger = Arc::clone(&ledger);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let candidate = CandidateId::new(&format!("C{}", i % 3)).unwrap();
                barrier.wait();
                ledger.begin_vote(identity("A123"), candidate)
            })
        })
        .collect();

    let mut ok = 0;
    let mut already = 0;
    for handle in handles {
        match handle.join().unwrap() {
            Ok(_) => ok += 1,
            Err(VoteError::AlreadyVoted(_)) => already += 1,
            Err(e) => panic!("unexpected vote error: {e}"),
        }
    }
    (ok, already)
}

#[test]
fn test_concurrent_votes_for_one_voter_succeed_once() {
    let ledger = Arc::new(VoterLedger::new());
    let (ok, already) = race_same_voter(Arc::clone(&ledger));
    assert_eq!(ok, 1);
    assert_eq!(already, CONTENDERS - 1);
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger.tally().values().sum::<usize>(), 1);
}

#[test]
fn test_concurrent_votes_with_sqlite_journal_succeed_once() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::open(dir.path().join("ledger.db")).unwrap());
    let ledger = Arc::new(VoterLedger::with_journal(store.clone()));

    let (ok, already) = race_same_voter(Arc::clone(&ledger));
    assert_eq!(ok, 1);
    assert_eq!(already, CONTENDERS - 1);

    let stored = store.load_ledger().unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(
        stored[0].candidate(),
        ledger.get(&VoterId::new("A123").unwrap()).unwrap().candidate()
    );
}

#[test]
fn test_concurrent_votes_for_different_voters_all_succeed() {
    let ledger = Arc::new(VoterLedger::new());
    let barrier = Arc::new(Barrier::new(CONTENDERS));
    let handles: Vec<_> = (0..CONTENDERS)
        .map(|i| {
            let ledger = Arc::clone(&ledger);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                ledger.begin_vote(identity(&format!("V{i}")), CandidateId::new("C1").unwrap())
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap().unwrap();
    }
    assert_eq!(ledger.len(), CONTENDERS);
    assert!(ledger.records().iter().all(|r| r.voted()));
}

#[test]
fn test_vote_survives_restart_and_stays_single() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.db");
    {
        let store = Arc::new(SqliteStore::open(&path).unwrap());
        let ledger = VoterLedger::with_journal(store);
        ledger.begin_vote(identity("A123"), CandidateId::new("C1").unwrap()).unwrap();
    }

    let store = Arc::new(SqliteStore::open(&path).unwrap());
    let ledger = VoterLedger::restore(store.load_ledger().unwrap(), Some(store.clone())).unwrap();
    assert!(ledger.has_voted(&VoterId::new("A123").unwrap()));

    let err = ledger
        .begin_vote(identity("A123"), CandidateId::new("C2").unwrap())
        .unwrap_err();
    assert!(matches!(err, VoteError::AlreadyVoted(_)));
}
