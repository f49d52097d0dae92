// Real-time fan-out of token, swap and candle updates to subscriber rooms.
use crate::models::{Candle, Direction, Swap, Token};
use crate::stats::EnrichedToken;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{aio::ConnectionManager, Client};
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::info;

pub const GLOBAL_ROOM: &str = "global";

pub fn token_room(mint: &str) -> String {
    format!("token-{mint}")
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapNotice {
    pub token_mint: String,
    pub user: String,
    pub price: f64,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub amount_in: u64,
    pub amount_out: u64,
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    pub tx_id: String,
}

impl From<&Swap> for SwapNotice {
    fn from(s: &Swap) -> Self {
        Self {
            token_mint: s.token_mint.clone(),
            user: s.user.clone(),
            price: s.price,
            kind: s.direction.label(),
            amount_in: s.amount_in,
            amount_out: s.amount_out,
            timestamp: s.timestamp,
            direction: s.direction,
            tx_id: s.tx_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum FanoutEvent {
    NewToken(Token),
    NewSwap(SwapNotice),
    NewCandle(Candle),
    UpdateToken(EnrichedToken),
}

impl FanoutEvent {
    pub fn name(&self) -> &'static str {
        match self {
            FanoutEvent::NewToken(_) => "newToken",
            FanoutEvent::NewSwap(_) => "newSwap",
            FanoutEvent::NewCandle(_) => "newCandle",
            FanoutEvent::UpdateToken(_) => "updateToken",
        }
    }

    /// Wire envelope: `{event, room, data}`.
    pub fn envelope(&self, room: &str) -> Result<serde_json::Value> {
        let mut value = serde_json::to_value(self)?;
        value["room"] = json!(room);
        Ok(value)
    }
}

#[async_trait]
pub trait RealtimeFanout: Send + Sync {
    async fn publish(&self, room: &str, event: &FanoutEvent) -> Result<()>;
}

/// Publishes through Redis `PUBLISH` on `{prefix}{room}`.
pub struct RedisFanout {
    client: ConnectionManager,
    channel_prefix: String,
}

impl RedisFanout {
    pub async fn new(
        host: &str,
        port: u16,
        db: u8,
        password: &str,
        channel_prefix: String,
    ) -> Result<Self> {
        let connection_string = if password.is_empty() {
            format!("redis://{}:{}/{}", host, port, db)
        } else {
            format!("redis://:{}@{}:{}/{}", password, host, port, db)
        };

        let client = Client::open(connection_string)?;
        let manager = ConnectionManager::new(client).await?;

        info!("Fan-out connected to Redis at {}:{}", host, port);

        Ok(Self {
            client: manager,
            channel_prefix,
        })
    }

    pub async fn from_config(cfg: &crate::config::RedisConfig) -> Result<Self> {
        Self::new(
            &cfg.host,
            cfg.port,
            cfg.db,
            &cfg.password,
            cfg.channel_prefix.clone(),
        )
        .await
    }

    fn channel(&self, room: &str) -> String {
        format!("{}{}", self.channel_prefix, room)
    }
}

#[async_trait]
impl RealtimeFanout for RedisFanout {
    async fn publish(&self, room: &str, event: &FanoutEvent) -> Result<()> {
        let payload = event.envelope(room)?.to_string();
        let _: i64 = redis::cmd("PUBLISH")
            .arg(self.channel(room))
            .arg(payload)
            .query_async(&mut self.client.clone())
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RoomMessage {
    pub room: String,
    pub event: FanoutEvent,
}

/// In-process fan-out over a tokio broadcast channel.
pub struct BroadcastFanout {
    tx: broadcast::Sender<RoomMessage>,
}

impl BroadcastFanout {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoomMessage> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl RealtimeFanout for BroadcastFanout {
    async fn publish(&self, room: &str, event: &FanoutEvent) -> Result<()> {
        // No subscribers is not an error.
        let _ = self.tx.send(RoomMessage {
            room: room.to_string(),
            event: event.clone(),
        });
        Ok(())
    }
}

pub struct NoopFanout;

#[async_trait]
impl RealtimeFanout for NoopFanout {
    async fn publish(&self, _room: &str, _event: &FanoutEvent) -> Result<()> {
        Ok(())
    }
}

/// Publishes and logs instead of failing the caller; fan-out is best effort.
pub async fn emit(fanout: &dyn RealtimeFanout, room: &str, event: FanoutEvent) {
    if let Err(err) = fanout.publish(room, &event).await {
        tracing::warn!(room, event = event.name(), "fan-out publish failed: {err:?}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn swap() -> Swap {
        Swap {
            token_mint: "MintX".into(),
            user: "u".into(),
            direction: Direction::Sell,
            amount_in: 10,
            amount_out: 20,
            price: 2.0,
            tx_id: "sig".into(),
            timestamp: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        }
    }

    #[test]
    fn test_room_names() {
        assert_eq!(token_room("ABC"), "token-ABC");
        assert_eq!(GLOBAL_ROOM, "global");
    }

    #[test]
    fn test_envelope_shape() {
        let ev = FanoutEvent::NewSwap(SwapNotice::from(&swap()));
        let v = ev.envelope("token-MintX").unwrap();
        assert_eq!(v["event"], "newSwap");
        assert_eq!(v["room"], "token-MintX");
        assert_eq!(v["data"]["tokenMint"], "MintX");
        assert_eq!(v["data"]["type"], "sell");
        assert_eq!(v["data"]["direction"], "sell");
        assert_eq!(v["data"]["txId"], "sig");
    }

    #[tokio::test]
    async fn test_broadcast_delivers_to_subscribers() {
        let fanout = BroadcastFanout::new(8);
        let mut rx = fanout.subscribe();
        let candle = Candle {
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 3.0,
            time: 60,
        };
        emit(&fanout, "token-a", FanoutEvent::NewCandle(candle)).await;
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.room, "token-a");
        assert_eq!(msg.event.name(), "newCandle");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let fanout = BroadcastFanout::new(8);
        assert!(fanout
            .publish(GLOBAL_ROOM, &FanoutEvent::NewSwap(SwapNotice::from(&swap())))
            .await
            .is_ok());
    }
}
