use std::pin::pin;
use std::sync::Arc;

use ahash::AHashMap as HashMap;
use log::debug;
use parking_lot::RwLock;

use crate::errors::{Result, TellerError};
use crate::ledger::account::{Account, TxnId, Visible};
use crate::twopc::Vote;

/// The branch's account table under timestamp-ordering concurrency control.
///
/// Each account row carries a committed balance, read/write watermarks, and
/// the list of tentative writes staged by in-flight transactions. Operations
/// serialize through the per-account mutex; an operation whose newest visible
/// version is another transaction's pending write parks on the account's
/// notifier until a commit or abort resolves it, then rescans from the
/// current list state.
///
/// `prepare`, `commit`, and `abort` are the participant half of the
/// two-phase commit protocol and are invoked both by the local coordinator
/// and for requests arriving over peer links.
pub struct LedgerStore {
    accounts: RwLock<HashMap<String, Arc<Account>>>,
}

impl Default for LedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LedgerStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
        }
    }

    fn lookup(&self, key: &str) -> Option<Arc<Account>> {
        self.accounts.read().get(key).cloned()
    }

    /// Fetches the account, creating a fresh zero-balance record if no
    /// transaction has commenced it yet. The table's write lock serializes
    /// racing creators; exactly one record wins.
    fn lookup_or_create(&self, key: &str) -> Arc<Account> {
        if let Some(account) = self.lookup(key) {
            return account;
        }
        let mut accounts = self.accounts.write();
        accounts
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Account::new()))
            .clone()
    }

    fn snapshot(&self) -> Vec<(String, Arc<Account>)> {
        self.accounts
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Reads the balance visible to `txn`.
    ///
    /// Fails with [`TellerError::AccountNotFound`] when no DEPOSIT has
    /// commenced the account, and [`TellerError::TransactionAborted`] when
    /// `txn` is at or below the account's committed write watermark. When the
    /// newest visible version is another transaction's pending write, the
    /// read waits for that transaction to resolve.
    ///
    /// A successful read of a committed (or fresh) value advances the
    /// account's read watermark. The value may be negative if the
    /// transaction's own staged withdrawal makes it so; the floor is enforced
    /// at prepare time, not here.
    pub async fn balance(&self, key: &str, txn: TxnId) -> Result<i64> {
        let account = self.lookup(key).ok_or(TellerError::AccountNotFound)?;
        loop {
            let mut resolved = pin!(account.resolved.notified());
            {
                let mut state = account.state.lock();
                if state.dead {
                    return Err(TellerError::AccountNotFound);
                }
                if txn <= state.write_ts {
                    return Err(TellerError::TransactionAborted);
                }
                match state.latest_visible(txn) {
                    Visible::Own(value) => return Ok(value),
                    Visible::Committed(value) => {
                        state.read_ts = state.read_ts.max(txn);
                        return Ok(value);
                    }
                    Visible::Fresh => {
                        state.read_ts = state.read_ts.max(txn);
                        return Ok(0);
                    }
                    Visible::Blocked(holder) => {
                        debug!("balance {key} by {txn} waits on pending write by {holder}");
                        // Arm the waiter while still holding the lock so a
                        // commit or abort between unlock and await cannot be
                        // missed.
                        resolved.as_mut().enable();
                    }
                }
            }
            resolved.await;
        }
    }

    /// Stages a DEPOSIT of `amount` for `txn`, creating the account record
    /// if this is the first deposit to touch it.
    pub async fn deposit(&self, key: &str, amount: i64, txn: TxnId) -> Result<()> {
        loop {
            let account = self.lookup_or_create(key);
            match self.stage_write(&account, key, amount, txn).await {
                // The record was deleted by an abort while this deposit
                // waited; a deposit on a nonexistent account re-creates it.
                Err(TellerError::AccountNotFound) => continue,
                outcome => return outcome,
            }
        }
    }

    /// Stages a WITHDRAW of `amount` for `txn`. Unlike a deposit, a withdraw
    /// on a nonexistent account fails without creating anything.
    pub async fn withdraw(&self, key: &str, amount: i64, txn: TxnId) -> Result<()> {
        let account = self.lookup(key).ok_or(TellerError::AccountNotFound)?;
        self.stage_write(&account, key, -amount, txn).await
    }

    /// The shared write path: resolves the pre-write value visible to `txn`
    /// (waiting on pending predecessors like a read, but without advancing
    /// the read watermark), applies the timestamp-ordering write check, and
    /// stages the post-write balance.
    async fn stage_write(
        &self,
        account: &Account,
        key: &str,
        delta: i64,
        txn: TxnId,
    ) -> Result<()> {
        loop {
            let mut resolved = pin!(account.resolved.notified());
            {
                let mut state = account.state.lock();
                if state.dead {
                    return Err(TellerError::AccountNotFound);
                }
                if txn <= state.write_ts {
                    return Err(TellerError::TransactionAborted);
                }
                match state.latest_visible(txn) {
                    Visible::Blocked(holder) => {
                        debug!("write on {key} by {txn} waits on pending write by {holder}");
                        resolved.as_mut().enable();
                    }
                    visible => {
                        let current = match visible {
                            Visible::Own(value) | Visible::Committed(value) => value,
                            Visible::Fresh => 0,
                            Visible::Blocked(_) => unreachable!(),
                        };
                        if txn >= state.read_ts && txn > state.write_ts {
                            state.upsert_write(txn, current + delta);
                            return Ok(());
                        }
                        return Err(TellerError::TransactionAborted);
                    }
                }
            }
            resolved.await;
        }
    }

    /// The participant vote of the prepare phase: scans every tentative
    /// write staged by `txn` on this branch and votes to abort if any would
    /// leave a negative balance. Pure validation; no state changes.
    pub fn prepare(&self, txn: TxnId) -> Vote {
        for (key, account) in self.snapshot() {
            let state = account.state.lock();
            for w in &state.writes {
                if w.txn_id == txn && w.new_balance < 0 {
                    debug!("prepare {txn}: {key} would drop to {}", w.new_balance);
                    return Vote::Aborted;
                }
            }
        }
        Vote::Ok
    }

    /// Applies `txn`'s tentative writes on this branch: each staged balance
    /// becomes the committed balance and the write watermark advances to
    /// `txn`. A write whose id is below an already-committed newer write is
    /// discarded rather than applied, keeping watermarks monotonic and
    /// committed values in transaction-id order.
    pub fn commit(&self, txn: TxnId) {
        for (key, account) in self.snapshot() {
            let mut state = account.state.lock();
            if let Some(pos) = state.writes.iter().position(|w| w.txn_id == txn) {
                let write = state.writes.remove(pos);
                if txn > state.write_ts {
                    state.committed_balance = write.new_balance;
                    state.write_ts = txn;
                    debug!("commit {txn}: {key} = {}", write.new_balance);
                }
                account.resolved.notify_waiters();
            }
        }
    }

    /// Discards every tentative write staged by `txn` on this branch. An
    /// account whose only history was created by the aborted transaction
    /// (no committed write ever, nothing else pending) is deleted again, so
    /// existence keeps meaning "some deposit commenced it".
    pub fn abort(&self, txn: TxnId) {
        for (key, account) in self.snapshot() {
            let touched = {
                let state = account.state.lock();
                state.writes.iter().any(|w| w.txn_id == txn)
            };
            if !touched {
                continue;
            }
            // Removal and deletion must be one atomic step under both the
            // table and the row lock: a waiter woken in between would read
            // the record as empty-but-alive. Lock order is table, then row.
            let mut accounts = self.accounts.write();
            let mut state = account.state.lock();
            let before = state.writes.len();
            state.writes.retain(|w| w.txn_id != txn);
            if state.writes.len() == before {
                continue;
            }
            if state.write_ts == TxnId::ZERO && state.writes.is_empty() {
                state.dead = true;
                if let Some(current) = accounts.get(&key) {
                    if Arc::ptr_eq(current, &account) {
                        accounts.remove(&key);
                    }
                }
                debug!("abort {txn}: deleted {key}, no committed history remains");
            } else {
                debug!("abort {txn}: dropped tentative write on {key}");
            }
            drop(state);
            drop(accounts);
            account.resolved.notify_waiters();
        }
    }

    /// The committed balance of `key`, if the account exists. Inspection
    /// helper for tests and logging; bypasses the timestamp checks.
    pub fn committed_balance(&self, key: &str) -> Option<i64> {
        let account = self.lookup(key)?;
        let state = account.state.lock();
        Some(state.committed_balance)
    }
}
