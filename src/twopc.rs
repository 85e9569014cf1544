//! The coordinator half of two-phase commit.
//!
//! Any branch becomes the coordinator for a session the moment that
//! session's client sends COMMIT or ABORT. The coordinator fans PREPARE out
//! to every branch in the mesh (voting locally for its own shard), gathers
//! votes, and broadcasts the outcome. Every broadcast waits for all
//! acknowledgements before the client hears the verdict.

use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use log::debug;

use crate::errors::Result;
use crate::ledger::{LedgerStore, TxnId};
use crate::net::mesh::Mesh;
use crate::wire::{reply, Operation};

/// A participant's answer to PREPARE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vote {
    /// Every tentative write of the transaction on this branch keeps its
    /// account non-negative.
    Ok,
    /// Some staged balance would go negative; the transaction must abort.
    Aborted,
}

/// Drives two-phase commit for sessions coordinated by this branch.
///
/// The coordinator is also a participant: its own shard votes and applies
/// outcomes through the same [`LedgerStore`] entry points the peer branches
/// reach over the wire.
#[derive(Clone)]
pub struct Coordinator {
    store: Arc<LedgerStore>,
    mesh: Arc<Mesh>,
}

impl Coordinator {
    pub fn new(store: Arc<LedgerStore>, mesh: Arc<Mesh>) -> Self {
        Self { store, mesh }
    }

    /// Runs the full protocol for `txn` and returns the terminal reply for
    /// the client: `COMMIT OK` when every branch voted yes, `ABORTED`
    /// otherwise.
    ///
    /// The gather loop stops at the first `ABORTED` vote; there is no
    /// timeout, so a silent peer stalls the commit indefinitely (peer loss
    /// is fatal at the link layer before that becomes observable here).
    pub async fn commit(&self, txn: TxnId) -> Result<String> {
        debug!("coordinating commit of {txn} across {} branches", self.mesh.len() + 1);
        let mut votes: FuturesUnordered<_> = self
            .mesh
            .links()
            .map(|link| link.call(Operation::prepare(txn)))
            .collect();

        let mut outcome = self.store.prepare(txn);
        if outcome == Vote::Ok {
            while let Some(voted) = votes.next().await {
                if voted? == reply::ABORTED {
                    outcome = Vote::Aborted;
                    break;
                }
            }
        }
        drop(votes);

        match outcome {
            Vote::Ok => {
                self.store.commit(txn);
                self.broadcast(Operation::commit(txn)).await?;
                debug!("commit of {txn} acknowledged by all branches");
                Ok(reply::COMMIT_OK.to_owned())
            }
            Vote::Aborted => self.abort(txn).await,
        }
    }

    /// Aborts `txn` everywhere: locally, then on every peer, waiting for
    /// each acknowledgement before the client is told `ABORTED`. Also used
    /// to release a session's staged writes when it ends without reaching
    /// the commit point.
    pub async fn abort(&self, txn: TxnId) -> Result<String> {
        self.store.abort(txn);
        self.broadcast(Operation::abort(txn)).await?;
        debug!("abort of {txn} acknowledged by all branches");
        Ok(reply::ABORTED.to_owned())
    }

    /// Sends `op` to every peer branch and waits for every reply.
    async fn broadcast(&self, op: Operation) -> Result<()> {
        let acks = futures::future::join_all(
            self.mesh.links().map(|link| link.call(op.clone())),
        )
        .await;
        for ack in acks {
            ack?;
        }
        Ok(())
    }
}

impl Vote {
    /// The vote as it appears in a PREPARE reply frame.
    pub fn as_reply(self) -> &'static str {
        match self {
            Vote::Ok => reply::OK,
            Vote::Aborted => reply::ABORTED,
        }
    }
}
