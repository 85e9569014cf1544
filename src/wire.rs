//! Wire records and framing shared by the server mesh and the clients.
//!
//! Every message is one length-prefixed frame:
//!
//! ```text
//! +------------------+------------------+
//! | Length (4B BE)   | Payload (bincode)|
//! +------------------+------------------+
//! ```
//!
//! Client sessions exchange bare [`Operation`] records and reply strings.
//! Peer links wrap the same records in sequence-numbered envelopes
//! ([`PeerRequest`] / [`PeerReply`]) so replies can be correlated while a
//! blocked operation is still outstanding on the same stream.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::{Result, TellerError};
use crate::ledger::TxnId;

/// Upper bound on a single frame payload. Operations are tiny; anything
/// larger is a corrupt or hostile stream.
pub const MAX_FRAME_LEN: u32 = 64 * 1024;

/// The reply strings a client can observe, exactly as they appear on the
/// wire.
pub mod reply {
    /// Successful DEPOSIT or WITHDRAW (and a participant's PREPARE yes-vote).
    pub const OK: &str = "OK";
    /// The transaction is over; nothing it staged survives.
    pub const ABORTED: &str = "ABORTED";
    /// BALANCE or WITHDRAW on an account no DEPOSIT has created.
    pub const NOT_FOUND_ABORTED: &str = "NOT FOUND, ABORTED";
    /// Two-phase commit concluded with every branch applying the writes.
    pub const COMMIT_OK: &str = "COMMIT OK";

    /// Replies that end a client session.
    pub fn is_terminal(text: &str) -> bool {
        text == ABORTED || text == NOT_FOUND_ABORTED || text == COMMIT_OK
    }
}

/// Discriminant of an [`Operation`]. `Prepare` travels only between
/// branches; clients never send it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    Deposit,
    Withdraw,
    Balance,
    Commit,
    Abort,
    Prepare,
}

/// One transaction record as it crosses the wire: a per-account operation or
/// a commit-protocol message, stamped with the session's transaction id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OpKind,
    /// Owning branch letter for per-account operations; empty for
    /// COMMIT/ABORT/PREPARE.
    pub branch: String,
    pub account: String,
    pub amount: i64,
    pub txn_id: TxnId,
}

impl Operation {
    /// A commit-protocol message carrying no account target.
    fn protocol(kind: OpKind, txn_id: TxnId) -> Self {
        Self {
            kind,
            branch: String::new(),
            account: String::new(),
            amount: 0,
            txn_id,
        }
    }

    pub fn prepare(txn_id: TxnId) -> Self {
        Self::protocol(OpKind::Prepare, txn_id)
    }

    pub fn commit(txn_id: TxnId) -> Self {
        Self::protocol(OpKind::Commit, txn_id)
    }

    pub fn abort(txn_id: TxnId) -> Self {
        Self::protocol(OpKind::Abort, txn_id)
    }

    /// The full account key, `branch.account`, as the ledger stores it.
    pub fn key(&self) -> String {
        format!("{}.{}", self.branch, self.account)
    }
}

/// First frame on every accepted connection, identifying the dialer. The
/// listener serves peer links during mesh bootstrap and client sessions
/// afterwards; the handshake is what tells them apart when start order is
/// arbitrary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Hello {
    /// A fellow branch establishing its outbound mesh link; carries its
    /// branch name.
    Peer(String),
    /// A client opening a session.
    Client,
}

/// A forwarded operation on a peer link. `seq` is unique per link and echoed
/// back in the matching [`PeerReply`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRequest {
    pub seq: u64,
    pub op: Operation,
}

/// The reply to a [`PeerRequest`] with the same `seq`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerReply {
    pub seq: u64,
    pub reply: String,
}

/// Writes one length-prefixed bincode frame.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload =
        bincode::serialize(value).map_err(|e| TellerError::Serialization(e.to_string()))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| TellerError::Protocol("frame too large to encode".into()))?;
    if len > MAX_FRAME_LEN {
        return Err(TellerError::Protocol(format!("frame of {len} bytes exceeds limit")));
    }
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one length-prefixed bincode frame.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(TellerError::Protocol(format!("frame of {len} bytes exceeds limit")));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    bincode::deserialize(&payload).map_err(|e| TellerError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn operation_round_trips_through_a_frame() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let op = Operation {
            kind: OpKind::Deposit,
            branch: "A".into(),
            account: "alice".into(),
            amount: 100,
            txn_id: TxnId::new(1700000000.25),
        };
        write_frame(&mut a, &op).await.unwrap();
        let decoded: Operation = read_frame(&mut b).await.unwrap();
        assert_eq!(decoded.kind, OpKind::Deposit);
        assert_eq!(decoded.key(), "A.alice");
        assert_eq!(decoded.amount, 100);
        assert_eq!(decoded.txn_id, op.txn_id);
    }

    #[tokio::test]
    async fn hello_and_reply_frames_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, &Hello::Peer("B".into())).await.unwrap();
        write_frame(&mut a, &PeerReply { seq: 7, reply: reply::OK.into() })
            .await
            .unwrap();
        match read_frame::<_, Hello>(&mut b).await.unwrap() {
            Hello::Peer(name) => assert_eq!(name, "B"),
            other => panic!("unexpected hello: {other:?}"),
        }
        let echoed: PeerReply = read_frame(&mut b).await.unwrap();
        assert_eq!(echoed.seq, 7);
        assert_eq!(echoed.reply, "OK");
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let bogus = (MAX_FRAME_LEN + 1).to_be_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut a, &bogus).await.unwrap();
        let err = read_frame::<_, Operation>(&mut b).await.unwrap_err();
        assert!(matches!(err, TellerError::Protocol(_)));
    }

    #[test]
    fn terminal_replies() {
        assert!(reply::is_terminal(reply::ABORTED));
        assert!(reply::is_terminal(reply::NOT_FOUND_ABORTED));
        assert!(reply::is_terminal(reply::COMMIT_OK));
        assert!(!reply::is_terminal(reply::OK));
        assert!(!reply::is_terminal("A.alice = 10"));
    }
}
