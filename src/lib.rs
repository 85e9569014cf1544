//! A sharded, multi-branch account store with atomic cross-branch
//! transactions.
//!
//! Accounts are partitioned across a fixed roster of branch servers by
//! branch letter. A client opens a session with any one branch (that
//! session's coordinator), issues reads and writes against accounts on any
//! branch, and finishes with COMMIT or ABORT. Concurrency control is
//! timestamp ordering per account, with each session acting under a single
//! wall-clock transaction id. Commits run two-phase across every branch,
//! which is also where the "no negative balance" rule is enforced.
//!
//! The library is the whole server and client logic; the `server` and
//! `client` binaries only parse arguments around [`node::run_branch`] and
//! the session wire protocol in [`wire`].

pub mod config;
pub mod errors;
pub mod ledger;
pub mod net;
pub mod node;
pub mod twopc;
pub mod wire;

pub use errors::{Result, TellerError};
pub use ledger::{LedgerStore, TentativeWrite, TxnId};
pub use node::{run_branch, Node};
pub use twopc::{Coordinator, Vote};
