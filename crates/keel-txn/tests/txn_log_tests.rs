//! End-to-end transaction logging, rollback, and recovery tests.
//!
//! The scripted participant below asserts the exact order of redo/undo
//! dispatches: each expected range is consumed one value at a time, upward
//! for redo and downward for undo.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tempfile::TempDir;
use uuid::Uuid;

use keel_common::types::{LogicalActionType, ParticipantClassId, SavepointId, TxnId};
use keel_txn::{
    CheckpointKind, CheckpointMemento, LogInputStream, Participant, ParticipantFactory,
    RecoveryLog, Transaction, TransactionLog, TxnLogConfig, TxnLogResult,
};

const ACTION_SET: LogicalActionType = LogicalActionType::new(1);
const SCRIPT_CLASS: ParticipantClassId = ParticipantClassId::new(0x83f6_b9ed_fe16_8b93);
const SCRIPT_DESCRIPTION: u32 = 42;

/// One expected run of values: `next` steps toward `last` one call at a
/// time, downward for undo and upward for redo.
#[derive(Debug, Clone, Copy)]
struct Expected {
    next: i64,
    last: i64,
}

#[derive(Default)]
struct ScriptParticipant {
    expected: Mutex<Vec<Expected>>,
    loads: AtomicU64,
}

impl ScriptParticipant {
    fn expect_undo(&self, from: i64, downto: i64) {
        self.expected.lock().push(Expected {
            next: from,
            last: downto,
        });
    }

    fn expect_redo(&self, from: i64, upto: i64) {
        self.expected.lock().push(Expected {
            next: from,
            last: upto,
        });
    }

    fn assert_drained(&self) {
        assert!(
            self.expected.lock().is_empty(),
            "not every expected replay call arrived"
        );
    }

    fn loads(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }
}

fn read_u32(log: &mut dyn LogInputStream) -> u32 {
    let mut bytes = [0u8; 4];
    log.read_exact(&mut bytes).unwrap();
    u32::from_le_bytes(bytes)
}

impl Participant for ScriptParticipant {
    fn participant_class_id(&self) -> ParticipantClassId {
        SCRIPT_CLASS
    }

    fn describe_participant(&self, out: &mut dyn Write) -> TxnLogResult<()> {
        out.write_all(&SCRIPT_DESCRIPTION.to_le_bytes())?;
        Ok(())
    }

    fn redo_logical_action(
        &self,
        action_type: LogicalActionType,
        log: &mut dyn LogInputStream,
    ) -> TxnLogResult<()> {
        assert_eq!(action_type, ACTION_SET);
        let value = read_u32(log) as i64;
        let mut expected = self.expected.lock();
        let range = expected.first_mut().expect("unexpected redo call");
        assert_eq!(value, range.next, "redo out of order");
        range.next += 1;
        if range.next > range.last {
            expected.remove(0);
        }
        Ok(())
    }

    fn undo_logical_action(
        &self,
        action_type: LogicalActionType,
        log: &mut dyn LogInputStream,
    ) -> TxnLogResult<()> {
        assert_eq!(action_type, ACTION_SET);
        let value = read_u32(log) as i64;
        let mut expected = self.expected.lock();
        let range = expected.first_mut().expect("unexpected undo call");
        assert_eq!(value, range.next, "undo out of order");
        range.next -= 1;
        if range.next < range.last {
            expected.remove(0);
        }
        Ok(())
    }
}

struct ScriptFactory {
    participant: Arc<ScriptParticipant>,
}

impl ParticipantFactory for ScriptFactory {
    fn load_participant(
        &self,
        class_id: ParticipantClassId,
        log: &mut dyn LogInputStream,
    ) -> TxnLogResult<Arc<dyn Participant>> {
        assert_eq!(class_id, SCRIPT_CLASS);
        assert_eq!(read_u32(log), SCRIPT_DESCRIPTION);
        self.participant.loads.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::clone(&self.participant) as Arc<dyn Participant>)
    }
}

struct Harness {
    _tmp: TempDir,
    config: TxnLogConfig,
    uuid: Uuid,
    log: Arc<TransactionLog>,
    script: Arc<ScriptParticipant>,
    participant: Arc<dyn Participant>,
    first_checkpoint: CheckpointMemento,
}

impl Harness {
    fn new(spill_threshold: usize) -> Self {
        let tmp = TempDir::new().unwrap();
        let uuid = Uuid::new_v4();
        let config = TxnLogConfig::new(tmp.path())
            .with_page_size(256)
            .with_spill_threshold(spill_threshold)
            .with_group_commit_interval(Duration::ZERO);
        let log = TransactionLog::new(config.clone(), uuid).unwrap();
        let first_checkpoint = checkpoint_and_reclaim(&log);
        let script = Arc::new(ScriptParticipant::default());
        let participant = Arc::clone(&script) as Arc<dyn Participant>;
        Self {
            _tmp: tmp,
            config,
            uuid,
            log,
            script,
            participant,
            first_checkpoint,
        }
    }

    /// Starts a transaction with the scripted participant joined.
    fn begin(&self) -> Transaction {
        let txn = self.log.new_logical_txn();
        txn.add_participant(&self.participant).unwrap();
        txn
    }

    fn log_action(&self, txn: &Transaction, value: i64) {
        let mut action = txn.begin_logical_action(&self.participant, ACTION_SET).unwrap();
        action.write_all(&(value as u32).to_le_bytes()).unwrap();
        action.end();
    }

    fn log_actions(&self, txn: &Transaction, first: i64, count: i64) {
        for value in first..first + count {
            self.log_action(txn, value);
        }
    }

    fn recovery(&self) -> RecoveryLog {
        RecoveryLog::new(
            Arc::new(ScriptFactory {
                participant: Arc::clone(&self.script),
            }),
            self.config.clone(),
            self.uuid,
        )
    }

    fn recover(&self, memento: &CheckpointMemento) {
        self.recovery().recover(memento).unwrap();
        self.script.assert_drained();
    }
}

fn checkpoint_and_reclaim(log: &Arc<TransactionLog>) -> CheckpointMemento {
    let memento = log.checkpoint(CheckpointKind::FlushAll).unwrap();
    log.deallocate_checkpointed_log(&memento, CheckpointKind::FlushAll)
        .unwrap();
    memento
}

// ---------------------------------------------------------------------------
// rollback
// ---------------------------------------------------------------------------

#[test]
fn test_rollback_empty() {
    let h = Harness::new(64 * 1024);
    let txn = h.begin();
    txn.rollback().unwrap();
    h.script.assert_drained();
}

#[test]
fn test_rollback_short_reverses_actions() {
    let h = Harness::new(64 * 1024);
    let txn = h.begin();
    h.log_actions(&txn, 0, 10);

    h.script.expect_undo(9, 0);
    txn.rollback().unwrap();
    h.script.assert_drained();
}

#[test]
fn test_rollback_long_spills_and_reverses() {
    let h = Harness::new(512);
    let txn = h.begin();
    let long_log = h.config.long_log_path(txn.txn_id());
    h.log_actions(&txn, 0, 200);
    assert!(long_log.exists(), "private log should have spilled");

    h.script.expect_undo(199, 0);
    txn.rollback().unwrap();
    h.script.assert_drained();
    assert!(!long_log.exists(), "discarded spill segment should be gone");
}

#[test]
fn test_rollback_to_savepoint() {
    let h = Harness::new(64 * 1024);
    let txn = h.begin();
    h.log_actions(&txn, 0, 51);
    let svpt = txn.create_savepoint();
    h.log_actions(&txn, 51, 49);

    // bounded undo back to the savepoint, newest first
    h.script.expect_undo(99, 51);
    txn.rollback_to_savepoint(svpt).unwrap();
    h.script.assert_drained();

    // then everything before the savepoint
    h.script.expect_undo(50, 0);
    txn.rollback().unwrap();
    h.script.assert_drained();
}

#[test]
fn test_rollback_to_savepoint_with_gap() {
    let h = Harness::new(64 * 1024);
    let txn = h.begin();
    h.log_actions(&txn, 0, 51);
    let svpt = txn.create_savepoint();
    h.log_actions(&txn, 51, 49);

    h.script.expect_undo(99, 51);
    txn.rollback_to_savepoint(svpt).unwrap();
    h.script.assert_drained();

    // new work after the partial rollback
    h.log_actions(&txn, 200, 40);

    // full rollback skips the already-undone range entirely
    h.script.expect_undo(239, 200);
    h.script.expect_undo(50, 0);
    txn.rollback().unwrap();
    h.script.assert_drained();
}

#[test]
fn test_commit_savepoint_releases_rollback_info() {
    let h = Harness::new(64 * 1024);
    let txn = h.begin();
    h.log_actions(&txn, 0, 5);
    let svpt = txn.create_savepoint();
    h.log_actions(&txn, 5, 5);

    txn.commit_savepoint(svpt);

    // the released savepoint is gone; rolling back to it is a caller bug,
    // but the transaction itself is still fully undoable
    h.script.expect_undo(9, 0);
    txn.rollback().unwrap();
    h.script.assert_drained();
}

#[test]
#[should_panic(expected = "unknown savepoint")]
fn test_rollback_to_released_savepoint_panics() {
    let h = Harness::new(64 * 1024);
    let txn = h.begin();
    h.log_actions(&txn, 0, 3);
    let svpt = txn.create_savepoint();
    txn.commit_savepoint(svpt);
    let _ = txn.rollback_to_savepoint(SavepointId::new(0));
}

// ---------------------------------------------------------------------------
// commit and recovery
// ---------------------------------------------------------------------------

#[test]
fn test_commit_describe_only() {
    let h = Harness::new(64 * 1024);
    let txn = h.begin();
    txn.commit().unwrap();

    // recovery reconstructs the participant but replays no actions
    h.recover(&h.first_checkpoint.clone());
    assert!(h.script.loads() >= 1);
}

#[test]
fn test_commit_short_redoes_forward() {
    let h = Harness::new(64 * 1024);
    let txn = h.begin();
    h.log_actions(&txn, 0, 10);
    txn.commit().unwrap();

    h.script.expect_redo(0, 9);
    h.recover(&h.first_checkpoint.clone());
}

#[test]
fn test_commit_single_action_scenario() {
    let h = Harness::new(64 * 1024);
    let txn = h.begin();
    h.log_action(&txn, 1);
    txn.commit().unwrap();

    // exactly one redo, zero undos
    h.script.expect_redo(1, 1);
    h.recover(&h.first_checkpoint.clone());
}

#[test]
fn test_commit_long_redoes_from_segment() {
    let h = Harness::new(512);
    let txn = h.begin();
    let long_log = h.config.long_log_path(txn.txn_id());
    h.log_actions(&txn, 0, 200);
    txn.commit().unwrap();
    assert!(long_log.exists(), "committed segment is retained");

    h.script.expect_redo(0, 199);
    h.recover(&h.first_checkpoint.clone());

    // reclamation after the next checkpoint removes the retained segment
    checkpoint_and_reclaim(&h.log);
    assert!(!long_log.exists());
}

#[test]
fn test_checkpoint_commit_short() {
    let h = Harness::new(64 * 1024);
    let txn = h.begin();
    h.log_actions(&txn, 0, 6);
    let intermediate = checkpoint_and_reclaim(&h.log);
    h.log_actions(&txn, 6, 4);
    txn.commit().unwrap();

    // only the post-checkpoint suffix is redone
    h.script.expect_redo(6, 9);
    h.recover(&intermediate);
}

#[test]
fn test_checkpoint_commit_long() {
    let h = Harness::new(512);
    let txn = h.begin();
    h.log_actions(&txn, 0, 51);
    let intermediate = checkpoint_and_reclaim(&h.log);
    h.log_actions(&txn, 51, 49);
    txn.commit().unwrap();

    h.script.expect_redo(51, 99);
    h.recover(&intermediate);
}

#[test]
fn test_checkpoint_commit_empty() {
    let h = Harness::new(64 * 1024);
    let txn = h.begin();
    let intermediate = checkpoint_and_reclaim(&h.log);
    txn.commit().unwrap();

    h.recover(&intermediate);
    assert!(h.script.loads() >= 1);
}

#[test]
fn test_checkpoint_rollback_short() {
    let h = Harness::new(64 * 1024);
    let txn = h.begin();
    h.log_actions(&txn, 0, 6);
    let intermediate = checkpoint_and_reclaim(&h.log);
    h.log_actions(&txn, 6, 4);

    // recovery finds the transaction dangling and undoes its checkpointed
    // prefix, newest action first
    h.script.expect_undo(5, 0);
    h.recover(&intermediate);

    // the live transaction is still intact and fully undoable
    h.script.expect_undo(9, 0);
    txn.rollback().unwrap();
    h.script.assert_drained();
}

#[test]
fn test_checkpoint_rollback_long() {
    let h = Harness::new(512);
    let txn = h.begin();
    let long_log = h.config.long_log_path(txn.txn_id());
    h.log_actions(&txn, 0, 101);
    let intermediate = checkpoint_and_reclaim(&h.log);
    h.log_actions(&txn, 101, 99);

    h.script.expect_undo(100, 0);
    h.recover(&intermediate);

    h.script.expect_undo(199, 0);
    txn.rollback().unwrap();
    h.script.assert_drained();

    // the rolled-back transaction was checkpointed, so its segment is
    // retained for recovery until the next reclamation
    assert!(long_log.exists());
    checkpoint_and_reclaim(&h.log);
    assert!(!long_log.exists());
}

#[test]
fn test_rollback_event_resolves_dangling_txn() {
    let h = Harness::new(64 * 1024);
    let txn = h.begin();
    h.log_actions(&txn, 0, 6);
    let intermediate = checkpoint_and_reclaim(&h.log);

    // roll back online; the rollback event after the checkpoint tells
    // recovery the transaction's fate in a single pass
    h.script.expect_undo(5, 0);
    txn.rollback().unwrap();
    h.script.assert_drained();

    // a further checkpoint forces the rollback record out to storage
    h.log.checkpoint(CheckpointKind::FlushAll).unwrap();

    // recovery re-runs the same undo from the checkpointed state
    h.script.expect_undo(5, 0);
    h.recover(&intermediate);
}

#[test]
fn test_checkpoint_commit_savepoint_interleave() {
    let h = Harness::new(64 * 1024);
    let txn = h.begin();

    // actions 0..=99 with a savepoint after 50 and a checkpoint after 75
    h.log_actions(&txn, 0, 51);
    let svpt = txn.create_savepoint();
    h.log_actions(&txn, 51, 25);
    let intermediate = checkpoint_and_reclaim(&h.log);
    h.log_actions(&txn, 76, 24);

    h.script.expect_undo(99, 51);
    txn.rollback_to_savepoint(svpt).unwrap();
    h.script.assert_drained();

    h.log_actions(&txn, 200, 40);
    txn.commit().unwrap();

    // recovery replays: the post-checkpoint suffix forward, the logged
    // partial rollback backward, then the new work forward
    h.script.expect_redo(76, 99);
    h.script.expect_undo(99, 51);
    h.script.expect_redo(200, 239);
    h.recover(&intermediate);
}

// ---------------------------------------------------------------------------
// ordering and concurrency
// ---------------------------------------------------------------------------

#[test]
fn test_txn_id_reflects_start_order() {
    let h = Harness::new(64 * 1024);
    let t1 = h.begin();
    h.log_action(&t1, 0);

    let t2 = h.log.new_logical_txn();
    let id1 = t1.txn_id();
    let id2 = t2.txn_id();

    // t2 commits first; ids still reflect start order
    t2.commit().unwrap();
    h.script.expect_undo(0, 0);
    t1.rollback().unwrap();
    h.script.assert_drained();
    assert!(id2 > id1);
}

#[test]
fn test_group_commit_batches_concurrent_commits() {
    let tmp = TempDir::new().unwrap();
    let uuid = Uuid::new_v4();
    let config = TxnLogConfig::new(tmp.path())
        .with_page_size(4096)
        .with_group_commit_interval(Duration::from_millis(150));
    let log = TransactionLog::new(config, uuid).unwrap();

    const N_THREADS: u64 = 4;
    let mut handles = Vec::new();
    for thread in 0..N_THREADS {
        let log = Arc::clone(&log);
        handles.push(std::thread::spawn(move || {
            let participant: Arc<dyn Participant> = Arc::new(ScriptParticipant::default());
            let txn = log.new_logical_txn();
            txn.add_participant(&participant).unwrap();
            let mut action = txn.begin_logical_action(&participant, ACTION_SET).unwrap();
            action.write_all(&(thread as u32).to_le_bytes()).unwrap();
            action.end();
            txn.commit().unwrap();
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let stats = log.stats();
    assert_eq!(stats.commits.load(Ordering::Relaxed), N_THREADS);
    let flushes = stats.log_flushes.load(Ordering::Relaxed);
    assert!(
        (1..=N_THREADS).contains(&flushes),
        "expected batched flushes, got {}",
        flushes
    );
    assert_eq!(log.oldest_active_txn_id(), TxnId::new(N_THREADS + 1));
}

#[test]
fn test_discard_checkpoint_forgets_bookkeeping() {
    let h = Harness::new(64 * 1024);
    let txn = h.begin();
    h.log_actions(&txn, 0, 3);

    h.log.checkpoint(CheckpointKind::Discard).unwrap();
    assert_eq!(h.log.oldest_active_txn_id(), txn.txn_id().next());

    // the abandoned transaction can still clean itself up locally
    h.script.expect_undo(2, 0);
    txn.rollback().unwrap();
    h.script.assert_drained();
}
