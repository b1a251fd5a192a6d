//! TCP JSON-lines RPC client for plugin connections
//!
//! One background task reads reply frames and resolves them against a
//! pending-call map keyed by correlation id; callers await a oneshot (unary
//! calls) or an mpsc receiver (streaming calls). Every call carries its own
//! timeout — a hung plugin fails the call, never the client.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::{Frame, HandshakeConfig};
use crate::plugin::capability::{
    AudioCapability, AudioPayload, Capability, CapabilitySet, DeviceCapability, GenerateRequest,
    GenerateResponse, LlmCapability, SynthesisRequest, ToolDef, Transcription, UtilityCapability,
};
use crate::plugin::handle::PluginHandle;
use crate::plugin::metrics::MetricsReport;
use crate::plugin::{HealthStatus, PluginInfo};
use crate::{Error, Result};

/// Buffered chunks per in-flight streaming call
const STREAM_BUFFER: usize = 32;

enum Pending {
    Unary(oneshot::Sender<Result<Value>>),
    Stream(mpsc::Sender<Result<Value>>),
}

type PendingMap = Arc<Mutex<HashMap<String, Pending>>>;

/// A connected, handshaken RPC channel to one plugin
pub struct RpcClient {
    peer: String,
    call_timeout: Duration,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: PendingMap,
    alive: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcClient")
            .field("peer", &self.peer)
            .field("alive", &self.alive.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl RpcClient {
    /// Connect to a plugin and perform the compatibility handshake
    ///
    /// Returns the client together with the capability set the plugin
    /// advertised in its ack.
    ///
    /// # Errors
    ///
    /// [`Error::Communication`] if the connection cannot be established,
    /// [`Error::Handshake`] if the plugin rejects the handshake or answers
    /// with a mismatched protocol version.
    pub async fn connect(
        addr: &str,
        handshake: &HandshakeConfig,
        connect_timeout: Duration,
        call_timeout: Duration,
    ) -> Result<(Self, CapabilitySet)> {
        let stream = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Communication(format!("connect to {addr} timed out")))?
            .map_err(|e| Error::Communication(format!("connect to {addr} failed: {e}")))?;

        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        let hello = Frame::Handshake {
            protocol_version: handshake.protocol_version,
            cookie_key: handshake.cookie_key.clone(),
            cookie_value: handshake.cookie_value.clone(),
        };
        write_line(&mut write_half, &hello).await?;

        let ack_line = timeout(connect_timeout, lines.next_line())
            .await
            .map_err(|_| Error::Handshake(format!("{addr} did not answer the handshake in time")))?
            .map_err(|e| Error::Communication(format!("handshake read from {addr} failed: {e}")))?
            .ok_or_else(|| {
                Error::Handshake(format!("{addr} closed the connection during the handshake"))
            })?;

        let capabilities = match Frame::decode(&ack_line) {
            Ok(Frame::HandshakeAck {
                protocol_version,
                capabilities,
                server,
            }) => {
                if protocol_version != handshake.protocol_version {
                    return Err(Error::Handshake(format!(
                        "protocol version mismatch: host speaks {}, plugin {addr} speaks {protocol_version}",
                        handshake.protocol_version
                    )));
                }
                tracing::debug!(
                    peer = %addr,
                    server = server.as_deref().unwrap_or("(unnamed)"),
                    capabilities = ?capabilities,
                    "handshake accepted"
                );
                CapabilitySet::new(capabilities)
            }
            Ok(Frame::HandshakeReject { reason }) => {
                return Err(Error::Handshake(format!(
                    "{addr} rejected the handshake: {reason}"
                )));
            }
            Ok(other) => {
                return Err(Error::Handshake(format!(
                    "{addr} answered the handshake with an unexpected frame: {other:?}"
                )));
            }
            Err(e) => {
                return Err(Error::Handshake(format!(
                    "{addr} sent a malformed handshake ack: {e}"
                )));
            }
        };

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        let reader = tokio::spawn(read_loop(lines, Arc::clone(&pending), Arc::clone(&alive)));

        Ok((
            Self {
                peer: addr.to_string(),
                call_timeout,
                writer: tokio::sync::Mutex::new(write_half),
                pending,
                alive,
                reader: Mutex::new(Some(reader)),
            },
            capabilities,
        ))
    }

    /// Whether the underlying connection is still usable
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// The peer address this client is connected to
    #[must_use]
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Invoke a unary method and await its reply
    ///
    /// # Errors
    ///
    /// [`Error::Communication`] if the connection is closed, the call times
    /// out, or the plugin answers with an error
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        if !self.is_alive() {
            return Err(Error::Communication(format!(
                "'{method}': connection to {} is closed",
                self.peer
            )));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.insert_pending(&id, Pending::Unary(tx));

        let request = Frame::Request {
            id: id.clone(),
            method: method.to_string(),
            params,
        };
        if let Err(e) = self.send(&request).await {
            self.remove_pending(&id);
            return Err(e);
        }

        match timeout(self.call_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(Error::Communication(format!(
                "connection to {} closed during '{method}'",
                self.peer
            ))),
            Err(_) => {
                self.remove_pending(&id);
                Err(Error::Communication(format!(
                    "'{method}' to {} timed out after {:?}",
                    self.peer, self.call_timeout
                )))
            }
        }
    }

    /// Invoke a streaming method
    ///
    /// The receiver yields chunk payloads in order and closes after the done
    /// frame; a plugin-side error or a dropped connection is delivered as a
    /// final `Err` item.
    ///
    /// # Errors
    ///
    /// [`Error::Communication`] if the connection is closed or the request
    /// cannot be written
    pub async fn call_streaming(
        &self,
        method: &str,
        params: Value,
    ) -> Result<mpsc::Receiver<Result<Value>>> {
        if !self.is_alive() {
            return Err(Error::Communication(format!(
                "'{method}': connection to {} is closed",
                self.peer
            )));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        self.insert_pending(&id, Pending::Stream(tx));

        let request = Frame::Request {
            id: id.clone(),
            method: method.to_string(),
            params,
        };
        if let Err(e) = self.send(&request).await {
            self.remove_pending(&id);
            return Err(e);
        }

        Ok(rx)
    }

    /// Tear down the connection, failing all in-flight calls
    pub async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);

        let reader = self.reader.lock().map_or(None, |mut guard| guard.take());
        if let Some(handle) = reader {
            handle.abort();
        }

        let _ = self.writer.lock().await.shutdown().await;

        fail_all_pending(&self.pending, &format!("connection to {} closed", self.peer));
    }

    async fn send(&self, frame: &Frame) -> Result<()> {
        let mut writer = self.writer.lock().await;
        if let Err(e) = write_line(&mut writer, frame).await {
            self.alive.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    fn insert_pending(&self, id: &str, slot: Pending) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(id.to_string(), slot);
        }
    }

    fn remove_pending(&self, id: &str) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(id);
        }
    }
}

async fn write_line(writer: &mut OwnedWriteHalf, frame: &Frame) -> Result<()> {
    let mut line = frame.encode()?;
    line.push('\n');
    writer
        .write_all(line.as_bytes())
        .await
        .map_err(|e| Error::Communication(format!("write failed: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| Error::Communication(format!("flush failed: {e}")))
}

async fn read_loop(
    mut lines: tokio::io::Lines<BufReader<OwnedReadHalf>>,
    pending: PendingMap,
    alive: Arc<AtomicBool>,
) {
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match Frame::decode(&line) {
                    Ok(frame) => dispatch(&pending, frame).await,
                    Err(e) => tracing::warn!(error = %e, "dropping malformed frame"),
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "plugin connection read error");
                break;
            }
        }
    }

    alive.store(false, Ordering::SeqCst);
    fail_all_pending(&pending, "plugin connection closed");
}

async fn dispatch(pending: &PendingMap, frame: Frame) {
    match frame {
        Frame::Response { id, result, error } => {
            let slot = pending.lock().ok().and_then(|mut map| map.remove(&id));
            match slot {
                Some(Pending::Unary(tx)) => {
                    let reply = match error {
                        Some(message) => Err(Error::Communication(message)),
                        None => Ok(result.unwrap_or(Value::Null)),
                    };
                    let _ = tx.send(reply);
                }
                Some(Pending::Stream(tx)) => {
                    // A response frame on a stream only carries an error;
                    // success ends with a done frame instead.
                    if let Some(message) = error {
                        let _ = tx.send(Err(Error::Communication(message))).await;
                    }
                }
                None => tracing::trace!(id = %id, "stray response frame"),
            }
        }
        Frame::Chunk { id, payload } => {
            let tx = pending.lock().ok().and_then(|map| match map.get(&id) {
                Some(Pending::Stream(tx)) => Some(tx.clone()),
                _ => None,
            });
            if let Some(tx) = tx {
                if tx.send(Ok(payload)).await.is_err() {
                    // Consumer dropped the receiver; stop tracking the stream
                    if let Ok(mut map) = pending.lock() {
                        map.remove(&id);
                    }
                }
            } else {
                tracing::trace!(id = %id, "stray chunk frame");
            }
        }
        Frame::Done { id } => {
            if let Ok(mut map) = pending.lock() {
                map.remove(&id);
            }
        }
        other => tracing::trace!(frame = ?other, "unexpected frame from plugin"),
    }
}

fn fail_all_pending(pending: &PendingMap, message: &str) {
    let Ok(mut map) = pending.lock() else {
        return;
    };
    for (_, slot) in map.drain() {
        match slot {
            Pending::Unary(tx) => {
                let _ = tx.send(Err(Error::Communication(message.to_string())));
            }
            Pending::Stream(tx) => {
                let _ = tx.try_send(Err(Error::Communication(message.to_string())));
            }
        }
    }
}

/// Shape of a plugin's `health_check` reply
#[derive(Debug, Deserialize)]
struct HealthCheckReply {
    healthy: bool,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    details: HashMap<String, String>,
}

/// A plugin reached over the RPC channel
///
/// Implements [`PluginHandle`] plus every capability surface; the `as_*`
/// probes answer `Some` only for capabilities the plugin advertised.
pub struct RpcPluginHandle {
    client: RpcClient,
    capabilities: CapabilitySet,
}

impl fmt::Debug for RpcPluginHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcPluginHandle")
            .field("peer", &self.client.peer)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

impl RpcPluginHandle {
    /// Connect, handshake, and wrap the channel as a plugin handle
    ///
    /// # Errors
    ///
    /// Propagates [`RpcClient::connect`] failures
    pub async fn connect(
        addr: &str,
        handshake: &HandshakeConfig,
        connect_timeout: Duration,
        call_timeout: Duration,
    ) -> Result<Self> {
        let (client, capabilities) =
            RpcClient::connect(addr, handshake, connect_timeout, call_timeout).await?;
        Ok(Self {
            client,
            capabilities,
        })
    }

    fn decode<T: serde::de::DeserializeOwned>(method: &str, value: Value) -> Result<T> {
        serde_json::from_value(value).map_err(|e| {
            Error::Communication(format!("'{method}' returned a malformed result: {e}"))
        })
    }
}

#[async_trait]
impl PluginHandle for RpcPluginHandle {
    async fn initialize(&self, config: Value) -> Result<()> {
        self.client.call("initialize", config).await.map(|_| ())
    }

    async fn shutdown(&self) -> Result<()> {
        self.client.call("shutdown", Value::Null).await.map(|_| ())
    }

    async fn health_check(&self) -> Result<HealthStatus> {
        let value = self.client.call("health_check", Value::Null).await?;
        let reply: HealthCheckReply = Self::decode("health_check", value)?;

        let mut status = if reply.healthy {
            HealthStatus::healthy(reply.status.unwrap_or_else(|| "healthy".to_string()))
        } else {
            HealthStatus::unhealthy(reply.status.unwrap_or_else(|| "unhealthy".to_string()))
        };
        status.details = reply.details;
        Ok(status)
    }

    async fn get_metrics(&self) -> Result<MetricsReport> {
        let value = self.client.call("get_metrics", Value::Null).await?;
        Self::decode("get_metrics", value)
    }

    async fn get_info(&self) -> Result<PluginInfo> {
        let value = self.client.call("get_info", Value::Null).await?;
        Self::decode("get_info", value)
    }

    async fn ping(&self) -> Result<()> {
        self.client.call("ping", Value::Null).await.map(|_| ())
    }

    fn capabilities(&self) -> CapabilitySet {
        self.capabilities.clone()
    }

    async fn close(&self) {
        self.client.close().await;
    }

    fn as_utility(&self) -> Option<&dyn UtilityCapability> {
        self.capabilities
            .contains(Capability::Utility)
            .then_some(self as &dyn UtilityCapability)
    }

    fn as_llm(&self) -> Option<&dyn LlmCapability> {
        self.capabilities
            .contains(Capability::Llm)
            .then_some(self as &dyn LlmCapability)
    }

    fn as_audio(&self) -> Option<&dyn AudioCapability> {
        self.capabilities
            .contains(Capability::Audio)
            .then_some(self as &dyn AudioCapability)
    }

    fn as_device(&self) -> Option<&dyn DeviceCapability> {
        self.capabilities
            .contains(Capability::Device)
            .then_some(self as &dyn DeviceCapability)
    }
}

#[async_trait]
impl UtilityCapability for RpcPluginHandle {
    async fn list_tools(&self) -> Result<Vec<ToolDef>> {
        let value = self.client.call("utility.list_tools", Value::Null).await?;
        Self::decode("utility.list_tools", value)
    }

    async fn call_tool(&self, name: &str, args: Value) -> Result<Value> {
        self.client
            .call(
                "utility.call_tool",
                serde_json::json!({ "name": name, "args": args }),
            )
            .await
    }

    async fn execute(&self, request: Value) -> Result<Value> {
        self.client.call("utility.execute", request).await
    }
}

#[async_trait]
impl LlmCapability for RpcPluginHandle {
    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse> {
        let params = serde_json::to_value(&request)?;
        let value = self.client.call("llm.generate", params).await?;
        Self::decode("llm.generate", value)
    }

    async fn generate_stream(
        &self,
        request: GenerateRequest,
    ) -> Result<mpsc::Receiver<Result<String>>> {
        let params = serde_json::to_value(&request)?;
        let mut chunks = self.client.call_streaming("llm.generate_stream", params).await?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            while let Some(chunk) = chunks.recv().await {
                let item = chunk.map(|payload| {
                    payload
                        .get("text")
                        .and_then(Value::as_str)
                        .map_or_else(
                            || payload.as_str().unwrap_or_default().to_string(),
                            ToString::to_string,
                        )
                });
                if tx.send(item).await.is_err() {
                    break;
                }
            }
        });

        Ok(rx)
    }
}

#[async_trait]
impl AudioCapability for RpcPluginHandle {
    async fn transcribe(&self, audio: AudioPayload) -> Result<Transcription> {
        let params = serde_json::to_value(&audio)?;
        let value = self.client.call("audio.transcribe", params).await?;
        Self::decode("audio.transcribe", value)
    }

    async fn synthesize(&self, request: SynthesisRequest) -> Result<AudioPayload> {
        let params = serde_json::to_value(&request)?;
        let value = self.client.call("audio.synthesize", params).await?;
        Self::decode("audio.synthesize", value)
    }
}

#[async_trait]
impl DeviceCapability for RpcPluginHandle {
    async fn invoke(&self, command: &str, params: Value) -> Result<Value> {
        self.client
            .call(
                "device.invoke",
                serde_json::json!({ "command": command, "params": params }),
            )
            .await
    }

    async fn state(&self) -> Result<Value> {
        self.client.call("device.state", Value::Null).await
    }
}
