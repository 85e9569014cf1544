use thiserror::Error;

/// Represents the possible errors that can occur within the teller system.
///
/// This enum provides a centralized way to handle and categorize errors,
/// covering transactional aborts surfaced by the timestamp-ordering engine,
/// transport failures on client or peer streams, and startup validation
/// problems.
#[derive(Error, Debug)]
pub enum TellerError {
    /// The timestamp-ordering check rejected the operation, or a participant
    /// voted to abort during the prepare phase. The owning session is over;
    /// the client must open a new session to retry.
    #[error("transaction aborted")]
    TransactionAborted,

    /// BALANCE or WITHDRAW named an account that no committed or in-flight
    /// DEPOSIT has created.
    #[error("account not found")]
    AccountNotFound,

    /// The configuration file is missing, unreadable, or names no usable
    /// branch roster.
    #[error("config error: {0}")]
    Config(String),

    /// A framed record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The remote side sent something outside the wire contract.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A read or write on a stream failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The long-lived link to a peer branch is gone. Peer loss after mesh
    /// bootstrap is fatal to the branch process.
    #[error("peer branch {0} is unavailable")]
    PeerUnavailable(String),
}

/// A convenient type alias for the standard `Result` with `TellerError` as
/// the error type.
pub type Result<T> = std::result::Result<T, TellerError>;
