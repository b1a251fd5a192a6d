//! Shared test plugin: a real TCP server speaking the Pylon wire protocol
//!
//! Used by the lifecycle tests as a stand-in for an out-of-process plugin.
//! `kill()` aborts the listener and every open connection, which is what an
//! externally killed plugin process looks like from the host's side.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use pylon_host::{Capability, Frame, HandshakeConfig};

pub struct TestPlugin {
    pub addr: String,
    init_count: Arc<AtomicU32>,
    connection_count: Arc<AtomicU32>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl TestPlugin {
    /// Start a plugin server accepting any number of connections
    pub async fn spawn(handshake: HandshakeConfig, capabilities: Vec<Capability>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let init_count = Arc::new(AtomicU32::new(0));
        let connection_count = Arc::new(AtomicU32::new(0));
        let tasks: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));

        let acceptor_tasks = Arc::clone(&tasks);
        let acceptor_init = Arc::clone(&init_count);
        let acceptor_conns = Arc::clone(&connection_count);
        let acceptor = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                acceptor_conns.fetch_add(1, Ordering::SeqCst);

                let handler = tokio::spawn(serve_connection(
                    stream,
                    handshake.clone(),
                    capabilities.clone(),
                    Arc::clone(&acceptor_init),
                ));
                acceptor_tasks.lock().unwrap().push(handler);
            }
        });
        tasks.lock().unwrap().push(acceptor);

        Self {
            addr,
            init_count,
            connection_count,
            tasks,
        }
    }

    /// How many times any connection received `initialize`
    pub fn init_count(&self) -> u32 {
        self.init_count.load(Ordering::SeqCst)
    }

    /// How many connections the host opened
    pub fn connection_count(&self) -> u32 {
        self.connection_count.load(Ordering::SeqCst)
    }

    /// Simulate the plugin process being killed externally: the listener
    /// and every open connection die immediately
    pub fn kill(&self) {
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            task.abort();
        }
    }
}

impl Drop for TestPlugin {
    fn drop(&mut self) {
        self.kill();
    }
}

async fn serve_connection(
    stream: TcpStream,
    handshake: HandshakeConfig,
    capabilities: Vec<Capability>,
    init_count: Arc<AtomicU32>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let Ok(Some(hello)) = lines.next_line().await else {
        return;
    };
    let accepted = matches!(
        Frame::decode(&hello),
        Ok(Frame::Handshake {
            protocol_version,
            ref cookie_key,
            ref cookie_value,
        }) if handshake.accepts(protocol_version, cookie_key, cookie_value)
    );

    let reply = if accepted {
        Frame::HandshakeAck {
            protocol_version: handshake.protocol_version,
            capabilities,
            server: Some("test-plugin".to_string()),
        }
    } else {
        Frame::HandshakeReject {
            reason: "cookie or protocol mismatch".to_string(),
        }
    };
    if write_frame(&mut write_half, &reply).await.is_err() || !accepted {
        return;
    }

    while let Ok(Some(line)) = lines.next_line().await {
        let Ok(Frame::Request { id, method, params }) = Frame::decode(&line) else {
            continue;
        };

        let response = match method.as_str() {
            "ping" => ok(id, serde_json::json!("pong")),
            "initialize" => {
                init_count.fetch_add(1, Ordering::SeqCst);
                ok(id, serde_json::json!({}))
            }
            "shutdown" => ok(id, serde_json::json!({})),
            "health_check" => ok(id, serde_json::json!({ "healthy": true, "status": "ok" })),
            "get_info" => ok(
                id,
                serde_json::json!({
                    "id": "omni.echo-util",
                    "name": "Echo Utility",
                    "version": "1.0.0",
                    "kind": "remote",
                    "tags": ["testing"],
                    "capabilities": ["utility"],
                }),
            ),
            "get_metrics" => ok(
                id,
                serde_json::json!({
                    "counters": { "requests_total": 3 },
                    "gauges": { "queue_depth": 0.0 },
                    "histograms": {},
                }),
            ),
            "utility.list_tools" => ok(
                id,
                serde_json::json!([{
                    "name": "echo",
                    "description": "Echo the arguments back",
                    "input_schema": { "type": "object" },
                }]),
            ),
            "utility.call_tool" => ok(id, params["args"].clone()),
            "llm.generate" => ok(id, serde_json::json!({ "text": "hello from the model" })),
            other => Frame::Response {
                id,
                result: None,
                error: Some(format!("unknown method '{other}'")),
            },
        };

        if write_frame(&mut write_half, &response).await.is_err() {
            break;
        }
    }
}

fn ok(id: String, result: serde_json::Value) -> Frame {
    Frame::Response {
        id,
        result: Some(result),
        error: None,
    }
}

async fn write_frame(
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
    frame: &Frame,
) -> std::io::Result<()> {
    let mut line = frame.encode().expect("frame encodes");
    line.push('\n');
    writer.write_all(line.as_bytes()).await
}
