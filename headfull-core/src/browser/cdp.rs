use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};

use super::error::{BrowserError, BrowserResult};
use super::poll::{poll_until, PollOptions};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const LOAD_TIMEOUT: Duration = Duration::from_secs(30);
const LOAD_POLL_INTERVAL: Duration = Duration::from_millis(500);
const MAX_MESSAGE_BYTES: usize = 100 * 1024 * 1024;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;
type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<BrowserResult<Value>>>>>;

/// Output format for [`CdpClient::screenshot`].
#[derive(Debug, Clone, Copy)]
pub enum ScreenshotFormat {
    Png,
    Jpeg { quality: u8 },
}

impl ScreenshotFormat {
    fn as_str(&self) -> &'static str {
        match self {
            ScreenshotFormat::Png => "png",
            ScreenshotFormat::Jpeg { .. } => "jpeg",
        }
    }
}

#[derive(Debug, Deserialize)]
struct TargetDescriptor {
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(rename = "webSocketDebuggerUrl")]
    web_socket_debugger_url: Option<String>,
}

/// Client for the browser's remote-debugging protocol. Commands are JSON
/// frames over one persistent websocket; replies are correlated back to
/// their caller by message id, events are observed and discarded.
#[derive(Debug)]
pub struct CdpClient {
    devtools_port: u16,
    http: reqwest::Client,
    command_timeout: Duration,
    next_id: AtomicU64,
    pending: PendingMap,
    sink: AsyncMutex<Option<WsSink>>,
    receive_task: Mutex<Option<JoinHandle<()>>>,
}

impl CdpClient {
    pub fn new(devtools_port: u16) -> Self {
        Self {
            devtools_port,
            http: reqwest::Client::new(),
            command_timeout: COMMAND_TIMEOUT,
            next_id: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
            sink: AsyncMutex::new(None),
            receive_task: Mutex::new(None),
        }
    }

    /// Polls the debug endpoint until the browser exposes a page target,
    /// then opens the websocket and starts the receive loop.
    pub async fn connect(&self, timeout: Duration) -> BrowserResult<()> {
        let options = PollOptions {
            timeout,
            interval: CONNECT_POLL_INTERVAL,
        };
        let ws_url = poll_until(options, || self.find_page_target())
            .await
            .ok_or(BrowserError::ConnectTimeout {
                port: self.devtools_port,
                timeout_s: timeout.as_secs(),
            })?;

        let config = WebSocketConfig::default()
            .max_message_size(Some(MAX_MESSAGE_BYTES))
            .max_frame_size(Some(MAX_MESSAGE_BYTES));
        let (socket, _response) = connect_async_with_config(ws_url.as_str(), Some(config), false).await?;
        let (sink, stream) = socket.split();
        *self.sink.lock().await = Some(sink);

        let pending = Arc::clone(&self.pending);
        let task = tokio::spawn(receive_loop(stream, pending));
        *self.receive_task.lock().unwrap() = Some(task);
        debug!(port = self.devtools_port, url = %ws_url, "devtools websocket connected");
        Ok(())
    }

    async fn find_page_target(&self) -> Option<String> {
        let url = format!("http://127.0.0.1:{}/json/list", self.devtools_port);
        let targets = match self.http.get(&url).send().await {
            Ok(response) => match response.json::<Vec<TargetDescriptor>>().await {
                Ok(targets) => targets,
                Err(err) => {
                    trace!(error = %err, "devtools target list unreadable");
                    return None;
                }
            },
            Err(err) => {
                trace!(error = %err, "devtools endpoint not answering yet");
                return None;
            }
        };
        targets
            .into_iter()
            .filter(|target| target.kind == "page")
            .find_map(|target| target.web_socket_debugger_url)
    }

    /// Sends one command and waits for its reply. On timeout the pending
    /// slot is removed, so a reply arriving later is discarded.
    pub async fn send(&self, method: &str, params: Value) -> BrowserResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = serde_json::to_string(&json!({
            "id": id,
            "method": method,
            "params": params,
        }))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, reply_tx);

        {
            let mut sink = self.sink.lock().await;
            let Some(sink) = sink.as_mut() else {
                self.pending.lock().unwrap().remove(&id);
                return Err(BrowserError::NotConnected);
            };
            if let Err(err) = sink.send(Message::Text(frame.into())).await {
                self.pending.lock().unwrap().remove(&id);
                return Err(err.into());
            }
        }
        trace!(id, method, "command sent");

        match timeout(self.command_timeout, reply_rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(BrowserError::Disconnected),
            Err(_) => {
                self.pending.lock().unwrap().remove(&id);
                Err(BrowserError::CommandTimeout(method.to_string()))
            }
        }
    }

    pub async fn navigate(&self, url: &str) -> BrowserResult<Value> {
        debug!(url, "navigating");
        self.send("Page.navigate", json!({ "url": url })).await
    }

    /// Waits until the page reports a complete ready state. Protocol
    /// errors during the poll count as not ready and the poll retries.
    pub async fn wait_for_load(&self) -> BrowserResult<()> {
        self.send("Page.enable", json!({})).await?;
        let options = PollOptions {
            timeout: LOAD_TIMEOUT,
            interval: LOAD_POLL_INTERVAL,
        };
        poll_until(options, || async {
            match self.evaluate("document.readyState").await {
                Ok(state) if state == "complete" => Some(()),
                Ok(_) => None,
                Err(err) => {
                    trace!(error = %err, "ready state probe failed");
                    None
                }
            }
        })
        .await
        .ok_or(BrowserError::LoadTimeout)
    }

    /// Returns the fully rendered page markup.
    pub async fn get_content(&self) -> BrowserResult<String> {
        self.evaluate("document.documentElement.outerHTML").await
    }

    pub async fn get_title(&self) -> BrowserResult<String> {
        self.evaluate("document.title").await
    }

    /// Captures the visible viewport, returning the raw image bytes.
    pub async fn screenshot(&self, format: ScreenshotFormat) -> BrowserResult<Vec<u8>> {
        let mut params = json!({ "format": format.as_str() });
        if let ScreenshotFormat::Jpeg { quality } = format {
            params["quality"] = json!(quality);
        }
        let reply = self.send("Page.captureScreenshot", params).await?;
        let data = reply.get("data").and_then(Value::as_str).unwrap_or_default();
        Ok(STANDARD.decode(data)?)
    }

    /// Opens a new page target and returns its id.
    pub async fn create_target(&self, url: Option<&str>) -> BrowserResult<String> {
        let url = url.unwrap_or("about:blank");
        let reply = self.send("Target.createTarget", json!({ "url": url })).await?;
        Ok(reply
            .get("targetId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    /// Tears down the connection. Pending commands fail immediately with
    /// a disconnected error rather than running out their timeout.
    pub async fn disconnect(&self) {
        if let Some(task) = self.receive_task.lock().unwrap().take() {
            task.abort();
        }
        if let Some(mut sink) = self.sink.lock().await.take() {
            if let Err(err) = sink.close().await {
                debug!(error = %err, "devtools websocket close failed");
            }
        }
        fail_pending(&self.pending, || BrowserError::Disconnected);
        debug!(port = self.devtools_port, "devtools client disconnected");
    }

    async fn evaluate(&self, expression: &str) -> BrowserResult<String> {
        let reply = self
            .send("Runtime.evaluate", json!({ "expression": expression }))
            .await?;
        Ok(reply
            .pointer("/result/value")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }
}

async fn receive_loop(mut stream: WsStream, pending: PendingMap) {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => dispatch_frame(text.as_str(), &pending),
            Ok(Message::Close(_)) => {
                debug!("devtools sent close");
                break;
            }
            Ok(_) => {}
            Err(err) => {
                debug!(error = %err, "devtools websocket read failed");
                break;
            }
        }
    }
    fail_pending(&pending, || BrowserError::Disconnected);
}

fn dispatch_frame(raw: &str, pending: &PendingMap) {
    let data: Value = match serde_json::from_str(raw) {
        Ok(data) => data,
        Err(err) => {
            warn!(error = %err, "unparseable devtools frame");
            return;
        }
    };
    if let Some(id) = data.get("id").and_then(Value::as_u64) {
        let Some(slot) = pending.lock().unwrap().remove(&id) else {
            trace!(id, "reply for unknown or timed out command");
            return;
        };
        let reply = match data.get("error") {
            Some(error) => {
                let message = error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown devtools error")
                    .to_string();
                Err(BrowserError::Protocol(message))
            }
            None => Ok(data.get("result").cloned().unwrap_or_else(|| json!({}))),
        };
        let _ = slot.send(reply);
    } else if let Some(method) = data.get("method").and_then(Value::as_str) {
        trace!(method, "devtools event");
    }
}

fn fail_pending(pending: &PendingMap, error: impl Fn() -> BrowserError) {
    let slots: Vec<_> = pending.lock().unwrap().drain().collect();
    for (id, slot) in slots {
        trace!(id, "failing pending command");
        let _ = slot.send(Err(error()));
    }
}
