//! CLOB user-channel WebSocket stream for private order/fill events.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info};

use crate::config::ApiCredentials;
use crate::providers::{OrderEventStream, OrderStreamProvider};

/// Connects to the user channel and yields raw order-event payloads.
#[derive(Clone)]
pub struct ClobUserStream {
    url: String,
    credentials: ApiCredentials,
}

impl ClobUserStream {
    pub fn new(url: &str, credentials: ApiCredentials) -> Self {
        Self {
            url: url.to_string(),
            credentials,
        }
    }
}

#[async_trait]
impl OrderStreamProvider for ClobUserStream {
    async fn subscribe(&self, market_ids: &[String]) -> Result<OrderEventStream> {
        info!(url = %self.url, markets = market_ids.len(), "Connecting to order WS");
        let (ws_stream, resp) = connect_async(&self.url)
            .await
            .context("connect_async user ws")?;
        debug!(status = %resp.status(), "Order WS connected");

        let (mut write, read) = ws_stream.split();

        let sub_msg = serde_json::json!({
            "type": "user",
            "markets": market_ids,
            "auth": {
                "apiKey": self.credentials.api_key,
                "secret": self.credentials.api_secret,
                "passphrase": self.credentials.api_passphrase,
            },
        });
        write
            .send(Message::Text(sub_msg.to_string()))
            .await
            .context("send user subscription")?;

        // The unfold keeps both socket halves so Ping frames can be answered
        // inline while the read loop drains messages.
        let stream = futures_util::stream::unfold((write, read), |(mut write, mut read)| async move {
            loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if text.eq_ignore_ascii_case("PONG") {
                            continue;
                        }
                        match serde_json::from_str::<Value>(&text) {
                            Ok(value) => return Some((Ok(value), (write, read))),
                            Err(e) => {
                                debug!(error = %e, "dropping non-JSON ws frame");
                                continue;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = write.send(Message::Pong(payload)).await;
                        continue;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "order ws close frame");
                        return None;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        return Some((
                            Err(anyhow::anyhow!("order ws error: {e}")),
                            (write, read),
                        ))
                    }
                    None => return None,
                }
            }
        });

        Ok(Box::pin(stream))
    }
}
