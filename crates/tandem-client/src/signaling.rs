//! WebSocket connection to the server's real-time channel.
//!
//! A writer task owns the socket's sending half and interleaves outbound
//! frames with a heartbeat ping; a reader task forwards parsed server events
//! to the channel returned by [`SignalingClient::connect`].

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tandem_media::{MediaError, SignalSink};
use tandem_shared::constants::{CONNECTION_QUEUE_CAPACITY, HEARTBEAT_INTERVAL_SECS};
use tandem_shared::{CallId, ClientFrame, ServerEvent, Signal};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};

#[derive(Debug, Clone)]
pub struct SignalingClient {
    frames: mpsc::Sender<ClientFrame>,
}

impl SignalingClient {
    pub async fn connect(config: &ClientConfig) -> Result<(Self, mpsc::Receiver<ServerEvent>)> {
        let url = config.ws_url()?;
        let (socket, _) = connect_async(url.as_str())
            .await
            .map_err(|e| ClientError::WebSocket(e.to_string()))?;
        info!(server = %config.api_base(), "signaling connected");

        let (mut write, mut read) = socket.split();
        let (frame_tx, mut frame_rx) = mpsc::channel::<ClientFrame>(CONNECTION_QUEUE_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel::<ServerEvent>(CONNECTION_QUEUE_CAPACITY);

        tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
            // The first tick completes immediately.
            heartbeat.tick().await;

            loop {
                let frame = tokio::select! {
                    frame = frame_rx.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                    _ = heartbeat.tick() => ClientFrame::Ping,
                };

                let json = match frame.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(error = %e, "failed to encode frame");
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(json)).await {
                    warn!(error = %e, "signaling write failed");
                    break;
                }
            }
            let _ = write.close().await;
            debug!("signaling writer stopped");
        });

        tokio::spawn(async move {
            while let Some(message) = read.next().await {
                match message {
                    Ok(Message::Text(text)) => match ServerEvent::from_json(&text) {
                        Ok(ServerEvent::Pong) => {}
                        Ok(event) => {
                            if event_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "unparseable server event"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "signaling read failed");
                        break;
                    }
                }
            }
            info!("signaling disconnected");
        });

        Ok((Self { frames: frame_tx }, event_rx))
    }

    pub async fn send(&self, frame: ClientFrame) -> Result<()> {
        self.frames
            .send(frame)
            .await
            .map_err(|_| ClientError::WebSocket("connection closed".into()))
    }
}

#[async_trait]
impl SignalSink for SignalingClient {
    async fn send_signal(&self, call_id: CallId, signal: Signal) -> std::result::Result<(), MediaError> {
        self.frames
            .send(ClientFrame::from_signal(call_id, signal))
            .await
            .map_err(|_| MediaError::ChannelClosed)
    }
}
