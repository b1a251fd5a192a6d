//! Handshake and RPC wire contract
//!
//! The reference codec is newline-delimited JSON frames over TCP. The host
//! opens the connection and sends a [`Frame::Handshake`]; the plugin answers
//! with [`Frame::HandshakeAck`] advertising its capabilities, or
//! [`Frame::HandshakeReject`]. A fixed (protocol version, cookie key, cookie
//! value) tuple must match exactly — there is no negotiation and no partial
//! compatibility. After the ack, traffic is correlation-id matched
//! request/response frames; streaming results arrive as chunk frames
//! terminated by a done frame.

pub mod client;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::plugin::capability::Capability;

pub use self::client::{RpcClient, RpcPluginHandle};

/// Protocol compatibility material, constructed once and passed to every
/// runtime — never read from process-wide state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeConfig {
    /// Protocol version both sides must speak
    pub protocol_version: u32,
    /// Name of the cookie variable (also the env var spawned plugins read)
    pub cookie_key: String,
    /// Expected cookie value
    pub cookie_value: String,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            protocol_version: 1,
            cookie_key: "PYLON_PLUGIN_COOKIE".to_string(),
            cookie_value: "d6a0e8f2-pylon-plugin".to_string(),
        }
    }
}

impl HandshakeConfig {
    /// Whether an incoming handshake matches this configuration exactly
    #[must_use]
    pub fn accepts(&self, protocol_version: u32, cookie_key: &str, cookie_value: &str) -> bool {
        protocol_version == self.protocol_version
            && cookie_key == self.cookie_key
            && cookie_value == self.cookie_value
    }
}

/// A single wire frame
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Host → plugin: compatibility gate, first frame on the connection
    Handshake {
        /// Protocol version the host speaks
        protocol_version: u32,
        /// Cookie variable name
        cookie_key: String,
        /// Cookie value
        cookie_value: String,
    },
    /// Plugin → host: handshake accepted
    HandshakeAck {
        /// Protocol version the plugin speaks; must equal the host's
        protocol_version: u32,
        /// Capabilities the plugin provides beyond the base surface
        #[serde(default)]
        capabilities: Vec<Capability>,
        /// Optional plugin-reported server name, for logs
        #[serde(default)]
        server: Option<String>,
    },
    /// Plugin → host: handshake refused; the connection closes after this
    HandshakeReject {
        /// Human-readable rejection reason
        reason: String,
    },
    /// Host → plugin: invoke a method
    Request {
        /// Correlation id echoed in every reply frame
        id: String,
        /// Method name (e.g. "health_check", "llm.generate")
        method: String,
        /// Method parameters
        #[serde(default)]
        params: Value,
    },
    /// Plugin → host: final reply to a request
    Response {
        /// Correlation id of the request
        id: String,
        /// Successful result
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        /// Error message; mutually exclusive with `result`
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Plugin → host: one element of a streaming reply
    Chunk {
        /// Correlation id of the request
        id: String,
        /// Chunk payload
        payload: Value,
    },
    /// Plugin → host: end of a streaming reply
    Done {
        /// Correlation id of the request
        id: String,
    },
}

impl Frame {
    /// Serialize the frame as one wire line (no trailing newline)
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Serialization`] if encoding fails
    pub fn encode(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse one wire line into a frame
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Serialization`] for malformed frames
    pub fn decode(line: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(line)?)
    }
}
