//! Websocket adapter for the realtime channel collaborator.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{
    stream::{SplitSink, StreamExt},
    SinkExt,
};
use shared::{
    domain::ConversationId,
    protocol::{RealtimeEvent, TypingBroadcast},
};
use tokio::{
    net::TcpStream,
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};

use crate::realtime::{RealtimeChannel, RealtimeConnector};

pub struct WsRealtimeConnector {
    server_url: String,
}

impl WsRealtimeConnector {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
        }
    }

    fn channel_url(&self, conversation_id: &ConversationId) -> Result<String> {
        let ws_url = if self.server_url.starts_with("https://") {
            self.server_url.replacen("https://", "wss://", 1)
        } else if self.server_url.starts_with("http://") {
            self.server_url.replacen("http://", "ws://", 1)
        } else {
            return Err(anyhow!("server_url must start with http:// or https://"));
        };
        Ok(format!(
            "{ws_url}/realtime?conversation_id={conversation_id}"
        ))
    }
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

pub struct WsChannel {
    events: Mutex<mpsc::UnboundedReceiver<RealtimeEvent>>,
    writer: Mutex<WsSink>,
    joined: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

#[async_trait]
impl RealtimeConnector for WsRealtimeConnector {
    async fn subscribe(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Arc<dyn RealtimeChannel>> {
        let url = self.channel_url(conversation_id)?;
        let (ws_stream, _) = connect_async(&url)
            .await
            .with_context(|| format!("failed to connect websocket: {url}"))?;
        let (writer, mut reader) = ws_stream.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let joined = Arc::new(AtomicBool::new(true));

        let joined_flag = Arc::clone(&joined);
        let conversation_id = conversation_id.clone();
        let reader_task = tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<RealtimeEvent>(&text) {
                            Ok(event) => {
                                if tx.send(event).is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                warn!(conversation_id = %conversation_id, "realtime: invalid event payload: {err}");
                            }
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(conversation_id = %conversation_id, "realtime: websocket receive failed: {err}");
                        break;
                    }
                }
            }
            joined_flag.store(false, Ordering::SeqCst);
        });

        Ok(Arc::new(WsChannel {
            events: Mutex::new(rx),
            writer: Mutex::new(writer),
            joined,
            reader: reader_task,
        }))
    }
}

#[async_trait]
impl RealtimeChannel for WsChannel {
    async fn next_event(&self) -> Option<RealtimeEvent> {
        self.events.lock().await.recv().await
    }

    async fn broadcast_typing(&self, typing: TypingBroadcast) -> Result<()> {
        let payload = serde_json::to_string(&typing)?;
        self.writer
            .lock()
            .await
            .send(Message::Text(payload))
            .await
            .context("typing broadcast failed")?;
        Ok(())
    }

    fn is_joined(&self) -> bool {
        self.joined.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.reader.abort();
        self.joined.store(false, Ordering::SeqCst);
        if let Err(err) = self.writer.lock().await.send(Message::Close(None)).await {
            info!("realtime: close frame not delivered: {err}");
        }
    }
}
