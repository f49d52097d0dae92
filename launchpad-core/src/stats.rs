use crate::config::StatsConfig;
use crate::models::{StatsMaxima, Token};
use crate::store::TokenStore;
use serde::Serialize;
use tokio::sync::RwLock;

/// Token payload with the derived ranking score attached.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedToken {
    #[serde(flatten)]
    pub token: Token,
    pub featured_score: f64,
}

struct State {
    maxima: StatsMaxima,
    initialized: bool,
}

/// Running maxima over all tokens, seeded once from the store and only ever
/// raised afterwards. Maxima never drop below 1 so scores stay finite.
pub struct RunningStats {
    state: RwLock<State>,
    volume_weight: f64,
    holder_weight: f64,
}

fn floor_one(m: StatsMaxima) -> StatsMaxima {
    StatsMaxima {
        max_volume_24h: if m.max_volume_24h > 1.0 { m.max_volume_24h } else { 1.0 },
        max_holder_count: m.max_holder_count.max(1),
        max_market_cap: if m.max_market_cap > 1.0 { m.max_market_cap } else { 1.0 },
    }
}

impl RunningStats {
    pub fn new(cfg: &StatsConfig) -> Self {
        Self {
            state: RwLock::new(State {
                maxima: floor_one(StatsMaxima::default()),
                initialized: false,
            }),
            volume_weight: cfg.volume_weight,
            holder_weight: cfg.holder_weight,
        }
    }

    /// Seeds maxima from the store. A failed query leaves the defaults in
    /// place and still marks the instance initialised.
    pub async fn init(&self, store: &dyn TokenStore) {
        let mut state = self.state.write().await;
        if state.initialized {
            return;
        }
        match store.max_stats().await {
            Ok(maxima) => {
                state.maxima = floor_one(maxima);
                tracing::info!(
                    max_volume_24h = state.maxima.max_volume_24h,
                    max_holder_count = state.maxima.max_holder_count,
                    max_market_cap = state.maxima.max_market_cap,
                    "running stats initialised"
                );
            }
            Err(err) => {
                tracing::error!("running stats seed query failed, using defaults: {err:?}");
            }
        }
        state.initialized = true;
    }

    pub async fn shutdown(&self) {
        let mut state = self.state.write().await;
        state.maxima = floor_one(StatsMaxima::default());
        state.initialized = false;
    }

    pub async fn is_initialized(&self) -> bool {
        self.state.read().await.initialized
    }

    pub async fn observe(&self, token: &Token) {
        let mut state = self.state.write().await;
        let m = &mut state.maxima;
        if token.volume_24h > m.max_volume_24h {
            m.max_volume_24h = token.volume_24h;
        }
        if token.holder_count > m.max_holder_count {
            m.max_holder_count = token.holder_count;
        }
        if token.market_cap_usd > m.max_market_cap {
            m.max_market_cap = token.market_cap_usd;
        }
    }

    pub async fn observe_holder_count(&self, count: u64) {
        let mut state = self.state.write().await;
        if count > state.maxima.max_holder_count {
            state.maxima.max_holder_count = count;
        }
    }

    pub async fn snapshot(&self) -> StatsMaxima {
        self.state.read().await.maxima
    }

    pub async fn featured_score(&self, token: &Token) -> f64 {
        let m = self.snapshot().await;
        token.volume_24h / m.max_volume_24h * self.volume_weight
            + token.holder_count as f64 / m.max_holder_count as f64 * self.holder_weight
    }

    pub async fn enrich(&self, token: Token) -> EnrichedToken {
        self.observe(&token).await;
        let featured_score = self.featured_score(&token).await;
        EnrichedToken {
            token,
            featured_score,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::Utc;

    fn cfg() -> StatsConfig {
        StatsConfig {
            volume_weight: 0.7,
            holder_weight: 0.3,
        }
    }

    fn token(mint: &str, volume: f64, holders: u64, mcap: f64) -> Token {
        let mut t = Token::new(mint, "c", "tx", Utc::now());
        t.volume_24h = volume;
        t.holder_count = holders;
        t.market_cap_usd = mcap;
        t
    }

    #[tokio::test]
    async fn test_init_seeds_from_store_with_floor() {
        let store = MemoryStore::new();
        store.upsert_token(&token("a", 500.0, 0, 0.2)).await.unwrap();
        let stats = RunningStats::new(&cfg());
        stats.init(&store).await;
        let m = stats.snapshot().await;
        assert_eq!(m.max_volume_24h, 500.0);
        assert_eq!(m.max_holder_count, 1);
        assert_eq!(m.max_market_cap, 1.0);
        assert!(stats.is_initialized().await);
    }

    #[tokio::test]
    async fn test_maxima_never_decrease() {
        let stats = RunningStats::new(&cfg());
        stats.observe(&token("a", 100.0, 10, 1000.0)).await;
        stats.observe(&token("b", 50.0, 5, 10.0)).await;
        stats.observe_holder_count(3).await;
        let m = stats.snapshot().await;
        assert_eq!(m.max_volume_24h, 100.0);
        assert_eq!(m.max_holder_count, 10);
        assert_eq!(m.max_market_cap, 1000.0);
    }

    #[tokio::test]
    async fn test_featured_score() {
        let stats = RunningStats::new(&cfg());
        stats.observe(&token("top", 200.0, 40, 0.0)).await;
        let score = stats.featured_score(&token("x", 100.0, 10, 0.0)).await;
        assert!((score - (0.5 * 0.7 + 0.25 * 0.3)).abs() < 1e-12);

        let enriched = stats.enrich(token("top", 200.0, 40, 0.0)).await;
        assert!((enriched.featured_score - 1.0).abs() < 1e-12);
        let json = serde_json::to_value(&enriched).unwrap();
        assert_eq!(json["mint"], "top");
        assert!(json["featuredScore"].is_number());
    }
}
