use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::{
    domain::UserId,
    protocol::{ClientRequest, ServerEvent},
};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use super::PushChannel;
use crate::error::SyncError;

const EVENT_BUFFER: usize = 1024;
const OUTGOING_BUFFER: usize = 256;

/// Push channel over one websocket connection: a writer task drains the
/// outgoing queue, a reader task fans decoded events out to subscribers.
#[derive(Debug)]
pub struct WebSocketPushChannel {
    outgoing: mpsc::Sender<String>,
    events: broadcast::Sender<ServerEvent>,
    tasks: Vec<JoinHandle<()>>,
}

/// `http(s)://host` becomes `ws(s)://host/ws?user_id=...`.
pub fn websocket_url(server_url: &str, user_id: &UserId) -> Result<Url, SyncError> {
    let ws_url = if server_url.starts_with("https://") {
        server_url.replacen("https://", "wss://", 1)
    } else if server_url.starts_with("http://") {
        server_url.replacen("http://", "ws://", 1)
    } else {
        return Err(SyncError::Validation(format!(
            "server_url must start with http:// or https://: {server_url}"
        )));
    };
    let mut url = Url::parse(ws_url.trim_end_matches('/'))
        .map_err(|err| SyncError::Validation(format!("invalid server_url {server_url}: {err}")))?;
    url.path_segments_mut()
        .map_err(|()| SyncError::Validation(format!("server_url cannot be a base: {server_url}")))?
        .pop_if_empty()
        .push("ws");
    url.query_pairs_mut().append_pair("user_id", user_id.as_str());
    Ok(url)
}

impl WebSocketPushChannel {
    pub async fn connect(server_url: &str, user_id: &UserId) -> Result<Self, SyncError> {
        let ws_url = websocket_url(server_url, user_id)?;
        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|err| {
                SyncError::Network(format!("failed to connect websocket {ws_url}: {err}"))
            })?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (outgoing, mut outgoing_rx) = mpsc::channel::<String>(OUTGOING_BUFFER);

        let writer = tokio::spawn(async move {
            while let Some(text) = outgoing_rx.recv().await {
                if let Err(err) = ws_writer.send(Message::Text(text)).await {
                    warn!("push: websocket write failed: {err}");
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let sender = events.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => {
                            let _ = sender.send(event);
                        }
                        Err(err) => warn!("push: dropping undecodable server event: {err}"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!("push: websocket read failed: {err}");
                        break;
                    }
                }
            }
            debug!("push: websocket reader finished");
        });

        info!(url = %ws_url, "push: websocket connected");
        Ok(Self {
            outgoing,
            events,
            tasks: vec![writer, reader],
        })
    }

    pub fn is_connected(&self) -> bool {
        self.tasks.iter().all(|task| !task.is_finished())
    }
}

#[async_trait]
impl PushChannel for WebSocketPushChannel {
    async fn emit(&self, request: ClientRequest) -> Result<(), SyncError> {
        let text = serde_json::to_string(&request)
            .map_err(|err| SyncError::Validation(format!("failed to encode request: {err}")))?;
        self.outgoing
            .send(text)
            .await
            .map_err(|_| SyncError::Network("push channel closed".into()))
    }

    fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }
}

impl Drop for WebSocketPushChannel {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
