//! In-process mock agent: a real WebSocket server speaking ACP.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_async};

use quorum::AcpClientConfig;
use quorum_protocol::codes;

type Sink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Request counters, inspected by tests.
#[derive(Default)]
pub struct Counters {
    pub connections: AtomicUsize,
    /// Data frames received (batch counts as one).
    pub frames: AtomicUsize,
    pub batch_frames: AtomicUsize,
    /// Individual envelopes received.
    pub requests: AtomicUsize,
    pub session_creates: AtomicUsize,
    pub chat_sends: AtomicUsize,
    pub batch_sizes: std::sync::Mutex<Vec<usize>>,
}

/// Togglable server behavior.
#[derive(Default)]
pub struct Behavior {
    /// Answer chat.send with success:false.
    pub fail_chat: AtomicBool,
    /// Never answer chat.send.
    pub ignore_chat: AtomicBool,
    /// Buffer two responses, then send them in reverse order.
    pub respond_reverse: AtomicBool,
    /// Send every response twice.
    pub duplicate_responses: AtomicBool,
    /// Close the connection after this many data frames (0 = never).
    pub close_after_frames: AtomicUsize,
    /// Fixed chat reply; default echoes the request content.
    pub chat_reply: std::sync::Mutex<Option<String>>,
}

pub struct MockAgent {
    pub addr: SocketAddr,
    pub counters: Arc<Counters>,
    pub behavior: Arc<Behavior>,
}

impl MockAgent {
    pub async fn start() -> Self {
        Self::with_behavior(Behavior::default()).await
    }

    pub async fn with_behavior(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let counters = Arc::new(Counters::default());
        let behavior = Arc::new(behavior);

        {
            let counters = counters.clone();
            let behavior = behavior.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        break;
                    };
                    tokio::spawn(handle_connection(
                        stream,
                        counters.clone(),
                        behavior.clone(),
                    ));
                }
            });
        }

        Self {
            addr,
            counters,
            behavior,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Client config pointed at this mock with test-friendly timeouts.
    pub fn client_config(&self) -> AcpClientConfig {
        AcpClientConfig {
            endpoint: self.url(),
            connect_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(2),
            max_reconnect_attempts: 3,
            reconnect_base_delay: Duration::from_millis(20),
            ..Default::default()
        }
    }
}

async fn handle_connection(stream: TcpStream, counters: Arc<Counters>, behavior: Arc<Behavior>) {
    let Ok(ws) = accept_async(stream).await else {
        return;
    };
    counters.connections.fetch_add(1, Ordering::SeqCst);
    let (mut sink, mut stream) = ws.split();
    let mut frames_seen = 0usize;
    let mut reverse_buffer: Vec<Value> = Vec::new();

    while let Some(Ok(message)) = stream.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        frames_seen += 1;
        counters.frames.fetch_add(1, Ordering::SeqCst);

        let Ok(frame) = serde_json::from_str::<Value>(&text) else {
            continue;
        };

        let envelopes: Vec<Value> = if frame["type"] == "batch" {
            counters.batch_frames.fetch_add(1, Ordering::SeqCst);
            let messages = frame["data"]["messages"]
                .as_array()
                .cloned()
                .unwrap_or_default();
            counters.batch_sizes.lock().unwrap().push(messages.len());
            messages
        } else {
            vec![frame]
        };

        let mut responses = Vec::new();
        for envelope in envelopes {
            counters.requests.fetch_add(1, Ordering::SeqCst);
            if let Some(response) = respond_to(&envelope, &counters, &behavior) {
                responses.push(response);
            }
        }

        if behavior.respond_reverse.load(Ordering::SeqCst) {
            reverse_buffer.extend(responses);
            if reverse_buffer.len() >= 2 {
                let buffered: Vec<Value> = reverse_buffer.drain(..).collect();
                for response in buffered.into_iter().rev() {
                    send_json(&mut sink, &response).await;
                }
            }
        } else {
            for response in responses {
                send_json(&mut sink, &response).await;
                if behavior.duplicate_responses.load(Ordering::SeqCst) {
                    send_json(&mut sink, &response).await;
                }
            }
        }

        let close_after = behavior.close_after_frames.load(Ordering::SeqCst);
        if close_after > 0 && frames_seen >= close_after {
            let _ = sink.close().await;
            return;
        }
    }
}

fn respond_to(envelope: &Value, counters: &Counters, behavior: &Behavior) -> Option<Value> {
    let id = envelope["id"].as_str()?.to_string();
    let kind = envelope["type"].as_str()?;
    let payload = &envelope["payload"];

    match kind {
        "session.create" => {
            counters.session_creates.fetch_add(1, Ordering::SeqCst);
            let user = payload["userId"].as_str().unwrap_or("anon");
            Some(ok(&id, json!({ "sessionId": format!("sess-{user}") })))
        }
        "chat.send" => {
            counters.chat_sends.fetch_add(1, Ordering::SeqCst);
            if behavior.ignore_chat.load(Ordering::SeqCst) {
                return None;
            }
            if behavior.fail_chat.load(Ordering::SeqCst) {
                return Some(fail(&id, codes::OPERATION_FAILED, "agent unavailable"));
            }
            let content = behavior.chat_reply.lock().unwrap().clone().unwrap_or_else(|| {
                format!("echo: {}", payload["content"].as_str().unwrap_or(""))
            });
            Some(ok(&id, json!({ "content": content })))
        }
        "session.destroy" => Some(ok(&id, json!({}))),
        "session.getStats" => Some(ok(
            &id,
            json!({
                "lastActivity": quorum_protocol::now_ms(),
                "tokenUsage": { "inputTokens": 10, "outputTokens": 20, "totalTokens": 30 }
            }),
        )),
        "session.updateTokens" => Some(ok(&id, json!({}))),
        "health.check" => Some(ok(&id, json!({ "status": "ok" }))),
        _ => Some(fail(&id, codes::VALIDATION_ERROR, "unknown request type")),
    }
}

fn ok(id: &str, data: Value) -> Value {
    json!({
        "id": id,
        "success": true,
        "data": data,
        "timestamp": quorum_protocol::now_ms()
    })
}

fn fail(id: &str, code: &str, message: &str) -> Value {
    json!({
        "id": id,
        "success": false,
        "error": { "code": code, "message": message },
        "timestamp": quorum_protocol::now_ms()
    })
}

async fn send_json(sink: &mut Sink, value: &Value) {
    let _ = sink
        .send(Message::Text(value.to_string().into()))
        .await;
}
