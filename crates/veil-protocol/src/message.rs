//! Message types for the Veil bridge protocol
//!
//! One JSON object per message, discriminated by the `type` field.
//!
//! # Message Flow
//!
//! Typical sequence for a bridge session:
//!
//! 1. Client sends `connect` with a username and a password and/or private key
//! 2. Bridge responds with `connected` (or `error`)
//! 3. Terminal I/O: `data` messages flow bidirectionally
//! 4. Window resize: `resize` from the client
//! 5. Session end: `disconnect` from the client, or transport close
//!
//! The `host` and `port` fields a client may include on `connect` are
//! accepted but never honored: the bridge always dials its configured
//! local SSH server, so it cannot be used as an open relay.

use serde::{Deserialize, Serialize};

/// Terminal dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    /// Number of rows
    pub rows: u16,
    /// Number of columns
    pub cols: u16,
}

impl TerminalSize {
    /// Create a new terminal size
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }

    /// Default terminal size (24x80)
    pub fn default_size() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self::default_size()
    }
}

/// Bridge protocol messages
///
/// Client-originated kinds: `connect`, `data`, `resize`, `disconnect`.
/// Bridge-originated kinds: `connected`, `data`, `error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BridgeMessage {
    /// Open an SSH session against the bridge's configured local server
    Connect {
        /// Ignored; the bridge never dials a client-supplied host
        #[serde(default, skip_serializing_if = "Option::is_none")]
        host: Option<String>,
        /// Ignored; the bridge never dials a client-supplied port
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
        /// Username to authenticate as
        username: String,
        /// Password credential (optional)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
        /// PEM-encoded private key credential (optional)
        #[serde(
            rename = "privateKey",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        private_key: Option<String>,
    },

    /// A chunk of terminal bytes, in either direction
    Data {
        /// Terminal data
        data: String,
    },

    /// Terminal resize event
    Resize {
        /// Number of rows
        rows: u16,
        /// Number of columns
        cols: u16,
    },

    /// Close the SSH session and release bridge resources
    Disconnect,

    /// SSH session established
    Connected {
        /// Human-readable status
        message: String,
    },

    /// Something went wrong; the transport connection stays open
    Error {
        /// Human-readable error
        message: String,
    },
}

impl BridgeMessage {
    /// Shorthand for an error reply
    pub fn error(message: impl Into<String>) -> Self {
        BridgeMessage::Error {
            message: message.into(),
        }
    }

    /// Shorthand for an outbound data chunk
    pub fn data(bytes: &[u8]) -> Self {
        BridgeMessage::Data {
            data: String::from_utf8_lossy(bytes).into_owned(),
        }
    }
}
