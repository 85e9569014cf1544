//! Client sessions and local operation dispatch.
//!
//! One task per session reads framed operations, routes each to the owning
//! branch (locally or over a peer link), and writes the reply back. The
//! session is strictly sequential: the client never pipelines, so one
//! in-flight transaction id is all a session carries.

use std::sync::Arc;

use log::{debug, error};
use tokio::net::TcpStream;

use crate::errors::TellerError;
use crate::ledger::{LedgerStore, TxnId};
use crate::node::Node;
use crate::wire::{self, reply, OpKind, Operation};

/// Executes an operation against this branch's shard and renders the reply
/// string. Shared by client sessions whose operation targets this branch
/// and by requests forwarded from peer coordinators.
pub(crate) async fn execute_local(store: &LedgerStore, op: Operation) -> String {
    let key = op.key();
    match op.kind {
        OpKind::Deposit => write_outcome(store.deposit(&key, op.amount, op.txn_id).await),
        OpKind::Withdraw => write_outcome(store.withdraw(&key, op.amount, op.txn_id).await),
        OpKind::Balance => match store.balance(&key, op.txn_id).await {
            Ok(value) => format!("{key} = {value}"),
            Err(e) => abort_reply(e),
        },
        OpKind::Prepare => store.prepare(op.txn_id).as_reply().to_owned(),
        OpKind::Commit => {
            store.commit(op.txn_id);
            reply::COMMIT_OK.to_owned()
        }
        OpKind::Abort => {
            store.abort(op.txn_id);
            reply::ABORTED.to_owned()
        }
    }
}

fn write_outcome(result: crate::errors::Result<()>) -> String {
    match result {
        Ok(()) => reply::OK.to_owned(),
        Err(e) => abort_reply(e),
    }
}

fn abort_reply(e: TellerError) -> String {
    match e {
        TellerError::AccountNotFound => reply::NOT_FOUND_ABORTED.to_owned(),
        _ => reply::ABORTED.to_owned(),
    }
}

/// Drives one client session until the stream closes.
///
/// COMMIT and ABORT activate the coordinator; everything else routes to the
/// owning branch. A reply that ends the transaction at operation level (a
/// timestamp-ordering rejection or a missing account) triggers a mesh-wide
/// abort broadcast before the client hears it, so writes the session staged
/// elsewhere do not linger. The same cleanup runs if the client disconnects
/// mid-transaction.
pub(crate) async fn run(node: Arc<Node>, stream: TcpStream) {
    let client = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "?".into());
    debug!("client session open from {client}");
    let (mut reader, mut writer) = stream.into_split();
    let mut open_txn: Option<TxnId> = None;

    loop {
        let op: Operation = match wire::read_frame(&mut reader).await {
            Ok(op) => op,
            Err(e) => {
                debug!("session {client} closed: {e}");
                break;
            }
        };
        let kind = op.kind;
        let txn = op.txn_id;

        let routed = match kind {
            OpKind::Commit => {
                open_txn = None;
                node.coordinator().commit(txn).await
            }
            OpKind::Abort => {
                open_txn = None;
                node.coordinator().abort(txn).await
            }
            _ => {
                open_txn = Some(txn);
                node.route(op).await
            }
        };
        let reply_text = match routed {
            Ok(text) => text,
            Err(e) => {
                error!("session {client}: {e}");
                break;
            }
        };

        if !matches!(kind, OpKind::Commit | OpKind::Abort) && reply::is_terminal(&reply_text) {
            if let Err(e) = node.coordinator().abort(txn).await {
                error!("session {client}: releasing {txn} failed: {e}");
                break;
            }
            open_txn = None;
        }

        if let Err(e) = wire::write_frame(&mut writer, &reply_text).await {
            debug!("session {client} write failed: {e}");
            break;
        }
    }

    if let Some(txn) = open_txn {
        if let Err(e) = node.coordinator().abort(txn).await {
            error!("cleanup abort of {txn} after disconnect failed: {e}");
        }
    }
}
