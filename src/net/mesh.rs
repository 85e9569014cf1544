//! Mesh bootstrap.
//!
//! At startup every branch simultaneously dials all of its peers (retrying
//! until each listener is up) and accepts one dial from each of them.
//! Bootstrap completes only when both sides have succeeded for every peer;
//! there is no timeout. Afterwards the same listener serves client
//! sessions. Clients that dial in while the mesh is still forming are held
//! until bootstrap completes.

use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap as HashMap;
use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};

use crate::config::Branch;
use crate::errors::Result;
use crate::ledger::LedgerStore;
use crate::net::peer::{self, PeerLink};
use crate::wire::{self, Hello};

const DIAL_BACKOFF_FLOOR: Duration = Duration::from_millis(100);
const DIAL_BACKOFF_CEILING: Duration = Duration::from_secs(1);

/// The branch's view of every other branch: one outbound [`PeerLink`] per
/// peer, keyed by branch name. Read-only after bootstrap.
pub struct Mesh {
    links: HashMap<String, PeerLink>,
}

impl Mesh {
    pub fn link(&self, branch: &str) -> Option<&PeerLink> {
        self.links.get(branch)
    }

    pub fn links(&self) -> impl Iterator<Item = &PeerLink> {
        self.links.values()
    }

    /// Number of peer branches (the roster minus this branch).
    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

/// Binds the branch's listener and completes the full mesh: dials every
/// peer with retry while accepting every peer's dial.
///
/// Returns the mesh, the listener (now dedicated to client sessions), and
/// any client streams that connected before the mesh was complete.
pub async fn bootstrap(
    local: &Branch,
    roster: &[Branch],
    store: Arc<LedgerStore>,
) -> Result<(Mesh, TcpListener, Vec<TcpStream>)> {
    let listener = TcpListener::bind(("0.0.0.0", local.port)).await?;
    let peers: Vec<&Branch> = roster.iter().filter(|b| b.name != local.name).collect();
    info!(
        "branch {} listening on port {}, forming mesh with {} peers",
        local.name,
        local.port,
        peers.len()
    );

    let accept_side = accept_peers(&listener, peers.len(), &store);
    let dial_side = dial_peers(&local.name, &peers);
    let (early_clients, links) = tokio::try_join!(accept_side, dial_side)?;

    Ok((Mesh { links }, listener, early_clients))
}

/// Accepts inbound connections until every peer's dial has arrived.
/// Client hellos received meanwhile are set aside for the session layer.
async fn accept_peers(
    listener: &TcpListener,
    expected: usize,
    store: &Arc<LedgerStore>,
) -> Result<Vec<TcpStream>> {
    let mut connected = 0usize;
    let mut early_clients = Vec::new();
    while connected < expected {
        let (mut stream, addr) = listener.accept().await?;
        match wire::read_frame::<_, Hello>(&mut stream).await {
            Ok(Hello::Peer(name)) => {
                debug!("accepted mesh dial from branch {name}");
                peer::serve_inbound(name, stream, store.clone());
                connected += 1;
            }
            Ok(Hello::Client) => {
                debug!("client from {addr} arrived before mesh completion; holding");
                early_clients.push(stream);
            }
            Err(e) => warn!("handshake from {addr} failed during bootstrap: {e}"),
        }
    }
    Ok(early_clients)
}

/// Dials every peer concurrently, each with indefinite retry.
async fn dial_peers(local_name: &str, peers: &[&Branch]) -> Result<HashMap<String, PeerLink>> {
    let dials = peers.iter().map(|peer| async move {
        let stream = dial_with_retry(local_name, peer).await;
        debug!("mesh link to branch {} established", peer.name);
        Ok::<_, crate::errors::TellerError>((
            peer.name.clone(),
            PeerLink::spawn(peer.name.clone(), stream),
        ))
    });
    let links = futures::future::try_join_all(dials).await?;
    Ok(links.into_iter().collect())
}

/// Connects to one peer, backing off between attempts until its listener is
/// up, and identifies this branch on the fresh stream.
async fn dial_with_retry(local_name: &str, peer: &Branch) -> TcpStream {
    let mut backoff = DIAL_BACKOFF_FLOOR;
    loop {
        match TcpStream::connect(peer.addr()).await {
            Ok(mut stream) => {
                match wire::write_frame(&mut stream, &Hello::Peer(local_name.to_owned())).await {
                    Ok(()) => return stream,
                    Err(e) => debug!("handshake to {} failed: {e}; redialing", peer.name),
                }
            }
            Err(e) => debug!("dial {} ({}) failed: {e}", peer.name, peer.addr()),
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(DIAL_BACKOFF_CEILING);
    }
}
