//! Long-lived peer links.
//!
//! Each branch dials every other branch once; that stream becomes the
//! branch's outbound [`PeerLink`], carrying forwarded operations and
//! commit-protocol messages. The symmetric stream accepted from the peer is
//! served by [`serve_inbound`]. Both directions keep a single writer and a
//! single reader task; callers never touch the stream.
//!
//! Replies are correlated by sequence number rather than by order: a
//! forwarded operation can park on a predecessor transaction inside the
//! engine, and the COMMIT that releases it may cross the very same link.
//! FIFO pairing would deadlock there; the envelope's `seq` keeps every
//! round trip independent.

use std::process;
use std::sync::Arc;

use ahash::AHashMap as HashMap;
use log::{debug, error};
use parking_lot::Mutex;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

use crate::errors::{Result, TellerError};
use crate::ledger::LedgerStore;
use crate::net::session;
use crate::wire::{self, PeerReply, PeerRequest, Operation};

/// Depth of each link's outbound queue.
const LINK_QUEUE_DEPTH: usize = 64;

type PendingReplies = Arc<Mutex<HashMap<u64, oneshot::Sender<String>>>>;

struct LinkCommand {
    op: Operation,
    reply_tx: oneshot::Sender<String>,
}

/// The outbound half of the connection to one peer branch. Cheap to share;
/// any number of sessions and coordinators may have calls in flight at once.
pub struct PeerLink {
    name: String,
    commands: mpsc::Sender<LinkCommand>,
}

impl PeerLink {
    /// Takes ownership of a freshly dialed peer stream and starts its writer
    /// and reader tasks.
    pub(crate) fn spawn(name: String, stream: TcpStream) -> Self {
        let (commands, queue) = mpsc::channel(LINK_QUEUE_DEPTH);
        let (read_half, write_half) = stream.into_split();
        let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));
        tokio::spawn(write_loop(name.clone(), queue, write_half, pending.clone()));
        tokio::spawn(read_loop(name.clone(), read_half, pending));
        Self { name, commands }
    }

    /// Sends `op` to the peer and waits for its reply string. Blocks as long
    /// as the remote operation does; there is no timeout by design.
    pub async fn call(&self, op: Operation) -> Result<String> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(LinkCommand { op, reply_tx })
            .await
            .map_err(|_| TellerError::PeerUnavailable(self.name.clone()))?;
        reply_rx
            .await
            .map_err(|_| TellerError::PeerUnavailable(self.name.clone()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

async fn write_loop(
    peer: String,
    mut queue: mpsc::Receiver<LinkCommand>,
    mut writer: OwnedWriteHalf,
    pending: PendingReplies,
) {
    let mut seq = 0u64;
    while let Some(command) = queue.recv().await {
        seq += 1;
        pending.lock().insert(seq, command.reply_tx);
        let frame = PeerRequest { seq, op: command.op };
        if let Err(e) = wire::write_frame(&mut writer, &frame).await {
            fatal_peer_loss(&peer, &e);
        }
    }
}

async fn read_loop(peer: String, mut reader: OwnedReadHalf, pending: PendingReplies) {
    loop {
        match wire::read_frame::<_, PeerReply>(&mut reader).await {
            Ok(reply) => {
                let waiter = pending.lock().remove(&reply.seq);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(reply.reply);
                    }
                    // A prepare gather that short-circuited on an earlier
                    // abort vote drops its remaining waiters.
                    None => debug!("discarding reply {} from {peer}: no waiter", reply.seq),
                }
            }
            Err(e) => fatal_peer_loss(&peer, &e),
        }
    }
}

/// Serves the stream a peer branch dialed into us: reads forwarded
/// operations, executes each in its own task, and funnels replies back
/// through a single writer.
pub(crate) fn serve_inbound(peer: String, stream: TcpStream, store: Arc<LedgerStore>) {
    let (read_half, write_half) = stream.into_split();
    let (replies, reply_queue) = mpsc::channel(LINK_QUEUE_DEPTH);
    tokio::spawn(inbound_write_loop(peer.clone(), reply_queue, write_half));
    tokio::spawn(inbound_read_loop(peer, read_half, store, replies));
}

async fn inbound_write_loop(
    peer: String,
    mut queue: mpsc::Receiver<PeerReply>,
    mut writer: OwnedWriteHalf,
) {
    while let Some(reply) = queue.recv().await {
        if let Err(e) = wire::write_frame(&mut writer, &reply).await {
            fatal_peer_loss(&peer, &e);
        }
    }
}

async fn inbound_read_loop(
    peer: String,
    mut reader: OwnedReadHalf,
    store: Arc<LedgerStore>,
    replies: mpsc::Sender<PeerReply>,
) {
    loop {
        let request = match wire::read_frame::<_, PeerRequest>(&mut reader).await {
            Ok(request) => request,
            Err(e) => fatal_peer_loss(&peer, &e),
        };
        // One task per request: an operation parked on a predecessor's
        // tentative write must not hold up the commit or abort behind it.
        let store = store.clone();
        let replies = replies.clone();
        tokio::spawn(async move {
            let reply = session::execute_local(&store, request.op).await;
            let _ = replies.send(PeerReply { seq: request.seq, reply }).await;
        });
    }
}

/// A broken peer stream after bootstrap leaves the mesh permanently
/// degraded; the branch exits rather than serve with partial reach.
fn fatal_peer_loss(peer: &str, cause: &TellerError) -> ! {
    error!("link to peer branch {peer} failed: {cause}; exiting");
    process::exit(1);
}
