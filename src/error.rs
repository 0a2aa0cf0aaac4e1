//! Error taxonomy for the TMI client.
//!
//! Every failure surfaced by the library is a variant of [`Error`], so
//! consumers can keep a single catch site and still match on the cases they
//! care about (`Timeout` vs `CommandFailed` vs `NotConnected`, ...).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The TCP/TLS connection could not be established or was lost mid-login.
    #[error("connection failed: {0}")]
    Connection(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Twitch rejected the PASS/NICK credentials.
    #[error("login authentication failed")]
    Authentication,

    /// A command was issued while the connection was not OPEN.
    #[error("not connected to server")]
    NotConnected,

    /// A restricted command was issued with a `justinfan` identity.
    #[error("cannot send anonymous messages")]
    Anonymous,

    /// No correlated NOTICE arrived within the command timeout.
    #[error("command '{command}' timed out")]
    Timeout { command: String },

    /// Twitch answered the command with a failure `msg-id`.
    #[error("command '{command}' failed on {channel}: {reason}")]
    CommandFailed {
        command: String,
        channel: String,
        /// The raw NOTICE msg-id, e.g. `bad_ban_self` or `no_permission`.
        reason: String,
    },

    /// The outbound queue was stopped before the item was sent.
    #[error("send cancelled: connection is closing")]
    Cancelled,

    #[error("{0}")]
    BadArgument(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
