#![allow(dead_code)]
//! Shared harness for mesh-level integration tests: spawns a roster of
//! branch servers inside the test runtime and drives scripted client
//! sessions over real TCP.

use std::time::Duration;

use tokio::net::TcpStream;

use teller::config::Branch;
use teller::wire::{self, Hello, OpKind, Operation};
use teller::TxnId;

/// Builds a localhost roster and starts one branch task per entry. Returns
/// the roster; servers keep running until the test runtime shuts down.
pub async fn spawn_cluster(names: &[&str], base_port: u16) -> Vec<Branch> {
    let roster: Vec<Branch> = names
        .iter()
        .enumerate()
        .map(|(i, name)| Branch {
            name: name.to_string(),
            host: "127.0.0.1".to_string(),
            port: base_port + i as u16,
        })
        .collect();
    for branch in &roster {
        let branch = branch.clone();
        let roster = roster.clone();
        tokio::spawn(async move {
            if let Err(e) = teller::run_branch(branch, roster).await {
                panic!("branch server failed: {e}");
            }
        });
    }
    roster
}

/// A scripted client session speaking the real wire protocol.
pub struct Session {
    stream: TcpStream,
    txn_id: TxnId,
}

impl Session {
    /// Opens a session against `coordinator` with a fresh wall-clock id.
    pub async fn begin(coordinator: &Branch) -> Session {
        Self::begin_with_id(coordinator, TxnId::now()).await
    }

    /// Opens a session with a caller-chosen id, for tests that need a
    /// specific timestamp order between sessions.
    pub async fn begin_with_id(coordinator: &Branch, txn_id: TxnId) -> Session {
        let mut stream = connect_with_retry(coordinator).await;
        wire::write_frame(&mut stream, &Hello::Client)
            .await
            .expect("handshake");
        Session { stream, txn_id }
    }

    pub async fn deposit(&mut self, target: &str, amount: i64) -> String {
        let op = account_op(OpKind::Deposit, target, amount, self.txn_id);
        self.request(op).await
    }

    pub async fn withdraw(&mut self, target: &str, amount: i64) -> String {
        let op = account_op(OpKind::Withdraw, target, amount, self.txn_id);
        self.request(op).await
    }

    pub async fn balance(&mut self, target: &str) -> String {
        let op = account_op(OpKind::Balance, target, 0, self.txn_id);
        self.request(op).await
    }

    pub async fn commit(&mut self) -> String {
        let op = Operation::commit(self.txn_id);
        self.request(op).await
    }

    pub async fn abort(&mut self) -> String {
        let op = Operation::abort(self.txn_id);
        self.request(op).await
    }

    async fn request(&mut self, op: Operation) -> String {
        wire::write_frame(&mut self.stream, &op).await.expect("send");
        wire::read_frame(&mut self.stream).await.expect("reply")
    }
}

fn account_op(kind: OpKind, target: &str, amount: i64, txn_id: TxnId) -> Operation {
    let (branch, account) = target.split_once('.').expect("target must be branch.account");
    Operation {
        kind,
        branch: branch.to_string(),
        account: account.to_string(),
        amount,
        txn_id,
    }
}

async fn connect_with_retry(branch: &Branch) -> TcpStream {
    for _ in 0..200 {
        if let Ok(stream) = TcpStream::connect(branch.addr()).await {
            return stream;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("branch {} never started listening", branch.name);
}
