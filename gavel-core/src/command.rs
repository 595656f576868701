//! The replicated command vocabulary.
//!
//! Every log record carries exactly one command. The payload is opaque to
//! the consensus layer; only the back end interprets it.

use std::fmt;

use bytes::Bytes;

/// The kinds of command the cluster replicates.
///
/// The set is closed: the wire codec rejects unknown tags before a command
/// can reach the log, so the applier never sees a kind outside this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// Register a new user account.
    NewUser,
    /// Open a new auction.
    NewAuction,
    /// Close an open auction.
    CloseAuction,
    /// Place a bid on an open auction.
    NewBid,
}

impl CommandKind {
    /// Wire tag for this kind.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::NewUser => 0,
            Self::NewAuction => 1,
            Self::CloseAuction => 2,
            Self::NewBid => 3,
        }
    }

    /// Decodes a wire tag, returning `None` for unknown tags.
    #[must_use]
    pub const fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::NewUser),
            1 => Some(Self::NewAuction),
            2 => Some(Self::CloseAuction),
            3 => Some(Self::NewBid),
            _ => None,
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NewUser => "new-user",
            Self::NewAuction => "new-auction",
            Self::CloseAuction => "close-auction",
            Self::NewBid => "new-bid",
        };
        write!(f, "{name}")
    }
}

/// A command submitted by a client and replicated through the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// What operation to perform.
    pub kind: CommandKind,
    /// Opaque payload interpreted by the back end.
    pub payload: Bytes,
}

impl Command {
    /// Creates a new command.
    #[must_use]
    pub const fn new(kind: CommandKind, payload: Bytes) -> Self {
        Self { kind, payload }
    }
}
