//! The branch server: shard engine, mesh, and coordinator tied together.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::config::Branch;
use crate::errors::Result;
use crate::ledger::LedgerStore;
use crate::net::mesh::{self, Mesh};
use crate::net::session;
use crate::twopc::Coordinator;
use crate::wire::{self, reply, Hello, Operation};

/// One running branch: its shard of the account space, its links to every
/// peer, and the coordinator it becomes when a session commits or aborts.
pub struct Node {
    name: String,
    store: Arc<LedgerStore>,
    mesh: Arc<Mesh>,
    coordinator: Coordinator,
}

impl Node {
    pub fn new(name: String, store: Arc<LedgerStore>, mesh: Arc<Mesh>) -> Self {
        let coordinator = Coordinator::new(store.clone(), mesh.clone());
        Self {
            name,
            store,
            mesh,
            coordinator,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Routes a per-account operation to its owning branch: executed on the
    /// local shard when the account's branch letter is ours, forwarded over
    /// the matching peer link otherwise.
    pub(crate) async fn route(&self, op: Operation) -> Result<String> {
        if op.branch == self.name {
            return Ok(session::execute_local(&self.store, op).await);
        }
        match self.mesh.link(&op.branch) {
            Some(link) => link.call(op).await,
            None => {
                warn!("operation names unknown branch {:?}", op.branch);
                Ok(reply::ABORTED.to_owned())
            }
        }
    }
}

/// Runs one branch to completion: bootstraps the mesh, then accepts and
/// serves client sessions forever. This is the whole server; the binary
/// only parses arguments around it.
pub async fn run_branch(local: Branch, roster: Vec<Branch>) -> Result<()> {
    let store = Arc::new(LedgerStore::new());
    let (mesh, listener, early_sessions) = mesh::bootstrap(&local, &roster, store.clone()).await?;
    info!("branch {}: mesh complete, accepting clients", local.name);

    let node = Arc::new(Node::new(local.name, store, Arc::new(mesh)));
    for stream in early_sessions {
        tokio::spawn(session::run(node.clone(), stream));
    }

    loop {
        let (mut stream, addr) = listener.accept().await?;
        let node = node.clone();
        tokio::spawn(async move {
            match wire::read_frame::<_, Hello>(&mut stream).await {
                Ok(Hello::Client) => session::run(node, stream).await,
                Ok(Hello::Peer(name)) => {
                    warn!("unexpected mesh dial from {name} after bootstrap; closing")
                }
                Err(e) => debug!("handshake from {addr} failed: {e}"),
            }
        });
    }
}
