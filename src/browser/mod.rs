//! Minimal Chrome DevTools Protocol client for the broker's debug channel.
//!
//! The broker opens fingerprint-isolated windows and hands back a debug
//! endpoint (`ws://…` or `http://host:port`). This module attaches to that
//! endpoint, drives one page target, and evaluates in-page JavaScript with
//! awaited promises, which is how the engine performs upstream calls that
//! must originate from inside the profile (session token, `nf/create` with
//! the anti-abuse SDK token, publish). Network events are recorded so the
//! genid phase can recover the upstream generation id from request URLs.

use ahash::AHashMap;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use regex::Regex;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};

use crate::error::SorapoolError;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(20);
const NAVIGATE_BUDGET: Duration = Duration::from_secs(40);
const CAPTURED_URL_CAP: usize = 512;

static GENERATION_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"gen_[a-zA-Z0-9_]{8,}").expect("valid generation id regex"));

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

fn channel_err(context: &str, detail: impl std::fmt::Display) -> SorapoolError {
    SorapoolError::DebugChannel(format!("{context}: {detail}"))
}

/// One attached CDP session against a page target.
pub struct DebugSession {
    sink: Mutex<mpsc::Sender<Message>>,
    pending: Arc<Mutex<AHashMap<u64, oneshot::Sender<Value>>>>,
    captured_urls: Arc<Mutex<Vec<String>>>,
    session_id: Option<String>,
    next_id: AtomicU64,
    _writer: tokio::task::JoinHandle<()>,
    _reader: tokio::task::JoinHandle<()>,
}

impl DebugSession {
    /// Attach to a broker debug endpoint. `http://…` endpoints are resolved
    /// to the browser websocket via `/json/version` first.
    pub async fn connect(endpoint: &str) -> Result<Self, SorapoolError> {
        let ws_url = if endpoint.starts_with("ws") {
            endpoint.to_string()
        } else {
            resolve_browser_ws(endpoint).await?
        };

        let (stream, _) = timeout(COMMAND_TIMEOUT, connect_async(ws_url.as_str()))
            .await
            .map_err(|_| channel_err("connect", "timed out"))?
            .map_err(|e| channel_err("connect", e))?;

        let (ws_sink, ws_source) = stream.split();
        let (tx, rx) = mpsc::channel::<Message>(64);

        let pending: Arc<Mutex<AHashMap<u64, oneshot::Sender<Value>>>> =
            Arc::new(Mutex::new(AHashMap::new()));
        let captured_urls = Arc::new(Mutex::new(Vec::new()));

        let writer = tokio::spawn(write_loop(ws_sink, rx));
        let reader = tokio::spawn(read_loop(
            ws_source,
            pending.clone(),
            captured_urls.clone(),
        ));

        let mut session = Self {
            sink: Mutex::new(tx),
            pending,
            captured_urls,
            session_id: None,
            next_id: AtomicU64::new(1),
            _writer: writer,
            _reader: reader,
        };

        session.attach_page().await?;
        session.command("Network.enable", json!({})).await?;
        Ok(session)
    }

    /// Find (or create) a page target and attach a flat session to it.
    async fn attach_page(&mut self) -> Result<(), SorapoolError> {
        let targets = self.command("Target.getTargets", json!({})).await?;
        let mut target_id: Option<String> = None;
        if let Some(infos) = targets.get("targetInfos").and_then(Value::as_array) {
            target_id = infos
                .iter()
                .filter(|t| t.get("type").and_then(Value::as_str) == Some("page"))
                .max_by_key(|t| {
                    // Prefer a page already on the upstream.
                    t.get("url")
                        .and_then(Value::as_str)
                        .is_some_and(|u| u.contains("sora.chatgpt.com")) as u8
                })
                .and_then(|t| t.get("targetId").and_then(Value::as_str))
                .map(ToString::to_string);
        }

        let target_id = match target_id {
            Some(id) => id,
            None => {
                let created = self
                    .command("Target.createTarget", json!({"url": "about:blank"}))
                    .await?;
                created
                    .get("targetId")
                    .and_then(Value::as_str)
                    .map(ToString::to_string)
                    .ok_or_else(|| channel_err("createTarget", "no targetId"))?
            }
        };

        let attached = self
            .command(
                "Target.attachToTarget",
                json!({"targetId": target_id, "flatten": true}),
            )
            .await?;
        let session_id = attached
            .get("sessionId")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| channel_err("attachToTarget", "no sessionId"))?;

        debug!(%target_id, %session_id, "attached to page target");
        self.session_id = Some(session_id);
        Ok(())
    }

    /// One CDP command round-trip (session-scoped once attached).
    pub async fn command(&self, method: &str, params: Value) -> Result<Value, SorapoolError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut frame = json!({"id": id, "method": method, "params": params});
        if let Some(session_id) = &self.session_id {
            frame["sessionId"] = json!(session_id);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending map poisoned")
            .insert(id, reply_tx);

        let sender = self.sink.lock().expect("sink poisoned").clone();
        sender
            .send(Message::Text(frame.to_string().into()))
            .await
            .map_err(|e| channel_err(method, e))?;

        let reply = timeout(COMMAND_TIMEOUT, reply_rx)
            .await
            .map_err(|_| channel_err(method, "timed out"))?
            .map_err(|_| channel_err(method, "channel closed"))?;

        if let Some(err) = reply.get("error") {
            return Err(channel_err(method, err));
        }
        Ok(reply.get("result").cloned().unwrap_or(Value::Null))
    }

    /// Navigate and wait for the document to finish loading.
    pub async fn navigate(&self, url: &str) -> Result<(), SorapoolError> {
        self.command("Page.enable", json!({})).await?;
        self.command("Page.navigate", json!({"url": url})).await?;

        let deadline = tokio::time::Instant::now() + NAVIGATE_BUDGET;
        loop {
            let state = self
                .evaluate_value("document.readyState")
                .await
                .unwrap_or(Value::Null);
            if state.as_str() == Some("complete") || state.as_str() == Some("interactive") {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(channel_err("navigate", format!("{url} load timed out")));
            }
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
    }

    /// Evaluate an expression, awaiting promises, and return it by value.
    pub async fn evaluate_value(&self, expression: &str) -> Result<Value, SorapoolError> {
        let result = self
            .command(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "awaitPromise": true,
                    "returnByValue": true,
                }),
            )
            .await?;

        if let Some(exception) = result.get("exceptionDetails") {
            let text = exception
                .get("exception")
                .and_then(|e| e.get("description"))
                .or_else(|| exception.get("text"))
                .cloned()
                .unwrap_or(Value::Null);
            return Err(channel_err("evaluate", text));
        }

        Ok(result
            .get("result")
            .and_then(|r| r.get("value"))
            .cloned()
            .unwrap_or(Value::Null))
    }

    /// Latest generation id observed in the page's outgoing request URLs.
    pub fn captured_generation_id(&self) -> Option<String> {
        let urls = self.captured_urls.lock().expect("captured urls poisoned");
        urls.iter()
            .rev()
            .find_map(|url| GENERATION_ID_RE.find(url).map(|m| m.as_str().to_string()))
    }

}

async fn resolve_browser_ws(endpoint: &str) -> Result<String, SorapoolError> {
    let base = endpoint.trim_end_matches('/');
    let url = format!("{base}/json/version");
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| channel_err("resolve", e))?;
    let info: Value = client
        .get(&url)
        .send()
        .await
        .map_err(|e| channel_err("resolve", e))?
        .json()
        .await
        .map_err(|e| channel_err("resolve", e))?;

    info.get("webSocketDebuggerUrl")
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .ok_or_else(|| channel_err("resolve", "no webSocketDebuggerUrl"))
}

async fn write_loop(mut sink: WsSink, mut rx: mpsc::Receiver<Message>) {
    while let Some(message) = rx.recv().await {
        if sink.send(message).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(
    mut source: WsSource,
    pending: Arc<Mutex<AHashMap<u64, oneshot::Sender<Value>>>>,
    captured_urls: Arc<Mutex<Vec<String>>>,
) {
    while let Some(frame) = source.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text.to_string(),
            Ok(Message::Close(_)) | Err(_) => break,
            _ => continue,
        };
        let Ok(value) = serde_json::from_str::<Value>(&text) else {
            continue;
        };

        if let Some(id) = value.get("id").and_then(Value::as_u64) {
            if let Some(tx) = pending.lock().expect("pending map poisoned").remove(&id) {
                let _ = tx.send(value);
            }
            continue;
        }

        match value.get("method").and_then(Value::as_str) {
            Some("Network.requestWillBeSent") => {
                if let Some(url) = value
                    .get("params")
                    .and_then(|p| p.get("request"))
                    .and_then(|r| r.get("url"))
                    .and_then(Value::as_str)
                {
                    let mut urls = captured_urls.lock().expect("captured urls poisoned");
                    if urls.len() >= CAPTURED_URL_CAP {
                        urls.remove(0);
                    }
                    urls.push(url.to_string());
                }
            }
            Some(other) => debug!(method = other, "unhandled CDP event"),
            None => warn!("CDP frame without id or method"),
        }
    }

    // Unblock any in-flight commands.
    pending.lock().expect("pending map poisoned").clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_id_regex_finds_latest_style_ids() {
        let url = "https://sora.chatgpt.com/backend/generations/gen_01jexample7890/status";
        let m = GENERATION_ID_RE.find(url).unwrap();
        assert_eq!(m.as_str(), "gen_01jexample7890");
        assert!(GENERATION_ID_RE.find("https://sora.chatgpt.com/p/s_abc").is_none());
    }
}
