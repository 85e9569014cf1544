use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

/// A transaction identifier: wall-clock seconds since the epoch with
/// sub-second precision, drawn once per client session.
///
/// Identifiers are compared with the strict/non-strict inequalities of the
/// timestamp-ordering rules; `TxnId::ZERO` doubles as the "never written"
/// watermark on fresh accounts.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct TxnId(f64);

impl TxnId {
    /// The watermark of an account no transaction has committed to.
    pub const ZERO: TxnId = TxnId(0.0);

    pub fn new(seconds: f64) -> Self {
        TxnId(seconds)
    }

    /// Stamps a new session from the local clock.
    pub fn now() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        TxnId(since_epoch.as_secs_f64())
    }

    /// The larger of the two identifiers; used to advance watermarks
    /// monotonically.
    pub fn max(self, other: TxnId) -> TxnId {
        if other.0 > self.0 {
            other
        } else {
            self
        }
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}", self.0)
    }
}

/// One uncommitted write staged on an account by a specific transaction.
///
/// Membership in the account's write list means "pending": committing merges
/// the entry into the committed balance and removes it, aborting discards it.
/// An account holds at most one entry per transaction id; a re-write by the
/// same transaction updates `new_balance` in place.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TentativeWrite {
    pub txn_id: TxnId,
    /// The full post-write balance, computed from the value visible to the
    /// writer at staging time.
    pub new_balance: i64,
}

/// The latest version of an account visible to one transaction, per the
/// timestamp-ordering read rule.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Visible {
    /// The transaction's own tentative write.
    Own(i64),
    /// The committed balance is the newest version at or below the reader.
    Committed(i64),
    /// No transaction has committed to this account and no tentative write
    /// at or below the reader exists; the balance reads as zero.
    Fresh,
    /// The newest visible version is another transaction's pending write;
    /// the operation must wait for it to commit or abort, then rescan.
    Blocked(TxnId),
}

/// Mutable timestamp-ordering state of a single account. Guarded by the
/// per-account mutex in [`Account`]; never accessed without it.
#[derive(Debug)]
pub(crate) struct AccountState {
    pub committed_balance: i64,
    /// Largest id that has read the committed value.
    pub read_ts: TxnId,
    /// Id of the transaction whose write the committed balance reflects.
    pub write_ts: TxnId,
    pub writes: Vec<TentativeWrite>,
    /// Set when an abort deletes the record from the store; waiters that
    /// held on to the account observe it and report the account gone.
    pub dead: bool,
}

impl AccountState {
    fn new() -> Self {
        Self {
            committed_balance: 0,
            read_ts: TxnId::ZERO,
            write_ts: TxnId::ZERO,
            writes: Vec::new(),
            dead: false,
        }
    }

    /// Selects the newest version visible to `txn`: the committed value or a
    /// tentative write with an id at or below `txn`, whichever is later.
    pub(crate) fn latest_visible(&self, txn: TxnId) -> Visible {
        let mut newest: Option<&TentativeWrite> = None;
        for w in &self.writes {
            if w.txn_id <= txn && newest.map_or(true, |n| w.txn_id > n.txn_id) {
                newest = Some(w);
            }
        }
        match newest {
            Some(w) if w.txn_id == txn => Visible::Own(w.new_balance),
            // A pending write below the committed watermark lost the commit
            // race; the committed value supersedes it.
            Some(w) if w.txn_id > self.write_ts => Visible::Blocked(w.txn_id),
            _ if self.write_ts > TxnId::ZERO => Visible::Committed(self.committed_balance),
            _ => Visible::Fresh,
        }
    }

    /// Stages or restates `txn`'s write; at most one entry per id.
    pub(crate) fn upsert_write(&mut self, txn: TxnId, new_balance: i64) {
        if let Some(w) = self.writes.iter_mut().find(|w| w.txn_id == txn) {
            w.new_balance = new_balance;
        } else {
            self.writes.push(TentativeWrite {
                txn_id: txn,
                new_balance,
            });
        }
    }
}

/// One account row: its timestamp-ordering state plus the wake-up used by
/// operations waiting on a predecessor's pending write.
#[derive(Debug)]
pub(crate) struct Account {
    pub state: Mutex<AccountState>,
    /// Signalled whenever a tentative write on this account commits or
    /// aborts, releasing visibility scans to re-evaluate.
    pub resolved: Notify,
}

impl Account {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(AccountState::new()),
            resolved: Notify::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn txn_id_ordering_and_max() {
        let a = TxnId::new(1.5);
        let b = TxnId::new(2.0);
        assert!(a < b);
        assert!(a > TxnId::ZERO);
        assert_eq!(a.max(b), b);
        assert_eq!(b.max(a), b);
    }

    #[test]
    fn fresh_account_has_no_visible_version() {
        let state = AccountState::new();
        assert!(matches!(state.latest_visible(TxnId::new(5.0)), Visible::Fresh));
    }

    #[test]
    fn own_write_shadows_committed_value() {
        let mut state = AccountState::new();
        state.committed_balance = 10;
        state.write_ts = TxnId::new(1.0);
        state.upsert_write(TxnId::new(2.0), 30);
        match state.latest_visible(TxnId::new(2.0)) {
            Visible::Own(v) => assert_eq!(v, 30),
            other => panic!("unexpected visibility: {other:?}"),
        }
    }

    #[test]
    fn foreign_pending_write_blocks_later_reader() {
        let mut state = AccountState::new();
        state.upsert_write(TxnId::new(2.0), 30);
        assert!(matches!(
            state.latest_visible(TxnId::new(3.0)),
            Visible::Blocked(id) if id == TxnId::new(2.0)
        ));
        // A reader below the pending write sees nothing at all.
        assert!(matches!(state.latest_visible(TxnId::new(1.0)), Visible::Fresh));
    }

    #[test]
    fn superseded_pending_write_does_not_block() {
        let mut state = AccountState::new();
        state.committed_balance = 70;
        state.write_ts = TxnId::new(7.0);
        state.upsert_write(TxnId::new(5.0), 50);
        match state.latest_visible(TxnId::new(9.0)) {
            Visible::Committed(v) => assert_eq!(v, 70),
            other => panic!("unexpected visibility: {other:?}"),
        }
    }

    #[test]
    fn upsert_replaces_existing_entry() {
        let mut state = AccountState::new();
        let txn = TxnId::new(4.0);
        state.upsert_write(txn, 10);
        state.upsert_write(txn, 25);
        assert_eq!(state.writes.len(), 1);
        assert_eq!(state.writes[0].new_balance, 25);
    }
}
