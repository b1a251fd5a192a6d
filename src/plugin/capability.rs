//! Capability surfaces a plugin may expose beyond the base lifecycle
//!
//! Every plugin implements the base surface (initialize, shutdown, health,
//! metrics, info). Additional surfaces are advertised in the handshake ack
//! and probed for with the `as_*` accessors on
//! [`PluginHandle`](super::handle::PluginHandle) rather than assumed.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::Result;

/// A named capability a plugin can provide
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// The mandatory lifecycle surface
    Base,
    /// Speech recognition and synthesis
    Audio,
    /// Text generation
    Llm,
    /// Device command and state
    Device,
    /// Generic tool invocation
    Utility,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Base => write!(f, "base"),
            Self::Audio => write!(f, "audio"),
            Self::Llm => write!(f, "llm"),
            Self::Device => write!(f, "device"),
            Self::Utility => write!(f, "utility"),
        }
    }
}

/// The set of capabilities a connected plugin advertised
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    caps: HashSet<Capability>,
}

impl CapabilitySet {
    /// Build a set from advertised capabilities; `Base` is always present
    #[must_use]
    pub fn new(advertised: impl IntoIterator<Item = Capability>) -> Self {
        let mut caps: HashSet<Capability> = advertised.into_iter().collect();
        caps.insert(Capability::Base);
        Self { caps }
    }

    /// Whether the plugin advertised the given capability
    #[must_use]
    pub fn contains(&self, cap: Capability) -> bool {
        self.caps.contains(&cap)
    }

    /// All advertised capabilities, sorted for stable output
    #[must_use]
    pub fn to_vec(&self) -> Vec<Capability> {
        let mut caps: Vec<Capability> = self.caps.iter().copied().collect();
        caps.sort_by_key(|c| c.to_string());
        caps
    }
}

/// A tool a utility plugin exposes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    /// Tool name (scoped by plugin id at dispatch time)
    pub name: String,
    /// Human-readable description
    pub description: String,
    /// JSON Schema for tool input
    pub input_schema: Value,
}

/// Text generation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    /// Prompt text
    pub prompt: String,
    /// Optional system prompt
    #[serde(default)]
    pub system: Option<String>,
    /// Maximum tokens to generate
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Sampling temperature
    #[serde(default)]
    pub temperature: Option<f64>,
}

/// Completed text generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateResponse {
    /// Generated text
    pub text: String,
    /// Model identifier reported by the plugin
    #[serde(default)]
    pub model: Option<String>,
    /// Tokens consumed, if the plugin reports usage
    #[serde(default)]
    pub tokens_used: Option<u32>,
}

/// Encoded audio crossing the plugin boundary
///
/// Samples travel base64-encoded inside JSON frames; the codec identifier
/// is opaque to the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioPayload {
    /// Codec/container identifier (e.g. "wav", "opus")
    pub format: String,
    /// Base64-encoded audio bytes
    pub data: String,
    /// Sample rate in Hz, when known
    #[serde(default)]
    pub sample_rate: Option<u32>,
}

impl AudioPayload {
    /// Encode raw bytes for transport
    #[must_use]
    pub fn from_bytes(format: impl Into<String>, bytes: &[u8]) -> Self {
        use base64::Engine as _;
        Self {
            format: format.into(),
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
            sample_rate: None,
        }
    }

    /// Decode the transported bytes
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Communication`] if the payload is not valid
    /// base64
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        use base64::Engine as _;
        base64::engine::general_purpose::STANDARD
            .decode(&self.data)
            .map_err(|e| crate::Error::Communication(format!("invalid audio payload: {e}")))
    }
}

/// Speech-to-text result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcription {
    /// Recognized text
    pub text: String,
    /// Detected language tag, when known
    #[serde(default)]
    pub language: Option<String>,
}

/// Text-to-speech request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisRequest {
    /// Text to speak
    pub text: String,
    /// Voice identifier understood by the plugin
    #[serde(default)]
    pub voice: Option<String>,
}

/// Generic tool invocation surface
#[async_trait]
pub trait UtilityCapability: Send + Sync {
    /// List the tools this plugin exposes
    async fn list_tools(&self) -> Result<Vec<ToolDef>>;

    /// Invoke a named tool
    async fn call_tool(&self, name: &str, args: Value) -> Result<Value>;

    /// Execute a free-form request (plugins without a tool schema)
    async fn execute(&self, request: Value) -> Result<Value>;
}

/// Text generation surface
#[async_trait]
pub trait LlmCapability: Send + Sync {
    /// Generate a completion
    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse>;

    /// Generate a completion as a stream of text chunks
    ///
    /// The receiver yields chunks in order and closes after the final one;
    /// a mid-stream failure is delivered as an `Err` item.
    async fn generate_stream(
        &self,
        request: GenerateRequest,
    ) -> Result<mpsc::Receiver<Result<String>>>;
}

/// Speech recognition and synthesis surface
#[async_trait]
pub trait AudioCapability: Send + Sync {
    /// Transcribe audio to text
    async fn transcribe(&self, audio: AudioPayload) -> Result<Transcription>;

    /// Synthesize speech from text
    async fn synthesize(&self, request: SynthesisRequest) -> Result<AudioPayload>;
}

/// Device command surface
#[async_trait]
pub trait DeviceCapability: Send + Sync {
    /// Invoke a device command
    async fn invoke(&self, command: &str, params: Value) -> Result<Value>;

    /// Read the device's current state
    async fn state(&self) -> Result<Value>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_is_always_present() {
        let set = CapabilitySet::new([]);
        assert!(set.contains(Capability::Base));
        assert!(!set.contains(Capability::Llm));

        let set = CapabilitySet::new([Capability::Llm, Capability::Utility]);
        assert!(set.contains(Capability::Base));
        assert!(set.contains(Capability::Llm));
        assert!(set.contains(Capability::Utility));
        assert!(!set.contains(Capability::Device));
    }

    #[test]
    fn capability_serde_uses_lowercase_names() {
        let json = serde_json::to_string(&Capability::Llm).unwrap();
        assert_eq!(json, "\"llm\"");

        let cap: Capability = serde_json::from_str("\"audio\"").unwrap();
        assert_eq!(cap, Capability::Audio);
    }

    #[test]
    fn audio_payload_round_trips_bytes() {
        let payload = AudioPayload::from_bytes("wav", b"RIFF0000");
        assert_eq!(payload.to_bytes().unwrap(), b"RIFF0000");
    }

    #[test]
    fn audio_payload_rejects_garbage() {
        let payload = AudioPayload {
            format: "wav".to_string(),
            data: "not base64!!!".to_string(),
            sample_rate: None,
        };
        assert!(payload.to_bytes().is_err());
    }
}
