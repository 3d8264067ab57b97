// =============================================================================
// Position Cache — TTL-bounded view of venue positions
// =============================================================================
//
// Read-through cache refreshed either by user-stream pushes or by TTL expiry
// triggering a REST query.  A per-symbol async lock guarantees at most one
// REST refresh in flight per symbol; concurrent readers coalesce onto the
// same refresh and see its result.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{now_ms, MarginType, PositionSide, PositionUpdate};

/// Default cache TTL.
pub const DEFAULT_POSITION_TTL: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Position model
// ---------------------------------------------------------------------------

/// Cached view of one symbol's position. `side == Flat` iff `quantity == 0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    /// Absolute quantity; zero exactly when flat.
    pub quantity: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub unrealized_pnl: f64,
    pub leverage: u32,
    pub margin_type: MarginType,
    /// Epoch milliseconds of the last refresh or push.
    pub last_updated_ms: i64,
}

impl Position {
    /// A flat position for `symbol`.
    pub fn flat(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            side: PositionSide::Flat,
            quantity: 0.0,
            entry_price: 0.0,
            mark_price: 0.0,
            unrealized_pnl: 0.0,
            leverage: 1,
            margin_type: MarginType::Isolated,
            last_updated_ms: now_ms(),
        }
    }

    /// Build from the venue's signed quantity convention (positive = long,
    /// negative = short, zero = flat), preserving the flat invariant.
    pub fn from_signed(
        symbol: impl Into<String>,
        signed_quantity: f64,
        entry_price: f64,
        mark_price: f64,
        unrealized_pnl: f64,
        leverage: u32,
        margin_type: MarginType,
    ) -> Self {
        let side = if signed_quantity > 0.0 {
            PositionSide::Long
        } else if signed_quantity < 0.0 {
            PositionSide::Short
        } else {
            PositionSide::Flat
        };
        Self {
            symbol: symbol.into(),
            side,
            quantity: signed_quantity.abs(),
            entry_price,
            mark_price,
            unrealized_pnl,
            leverage,
            margin_type,
            last_updated_ms: now_ms(),
        }
    }

    pub fn is_flat(&self) -> bool {
        self.side == PositionSide::Flat
    }
}

// ---------------------------------------------------------------------------
// Source abstraction
// ---------------------------------------------------------------------------

/// Where refreshes come from. Implemented by the exchange REST client;
/// tests substitute a recording stub.
#[async_trait]
pub trait PositionSource: Send + Sync {
    async fn fetch_position(&self, symbol: &str) -> Result<Position>;
}

// ---------------------------------------------------------------------------
// PositionCache
// ---------------------------------------------------------------------------

/// TTL read-through cache over a [`PositionSource`].
pub struct PositionCache {
    source: Arc<dyn PositionSource>,
    positions: RwLock<HashMap<String, Position>>,
    /// One refresh lock per symbol, created lazily.
    refresh_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    ttl: Duration,
}

impl PositionCache {
    pub fn new(source: Arc<dyn PositionSource>, ttl: Duration) -> Self {
        Self {
            source,
            positions: RwLock::new(HashMap::new()),
            refresh_locks: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Cached value when fresh, otherwise a REST refresh under the symbol's
    /// lock. Concurrent callers for the same symbol coalesce: whoever wins
    /// the lock refreshes, the rest observe the refreshed entry.
    pub async fn get(&self, symbol: &str) -> Result<Position> {
        if let Some(pos) = self.fresh_entry(symbol) {
            return Ok(pos);
        }

        let lock = self.lock_for(symbol);
        let _guard = lock.lock().await;

        // Re-check under the lock: a concurrent caller may have refreshed
        // while this one was waiting.
        if let Some(pos) = self.fresh_entry(symbol) {
            return Ok(pos);
        }

        self.refresh(symbol).await
    }

    /// Force a refresh regardless of freshness.
    pub async fn get_fresh(&self, symbol: &str) -> Result<Position> {
        let lock = self.lock_for(symbol);
        let _guard = lock.lock().await;
        self.refresh(symbol).await
    }

    /// Mark the symbol stale; the next read refreshes.
    pub fn invalidate(&self, symbol: &str) {
        if let Some(pos) = self.positions.write().get_mut(symbol) {
            pos.last_updated_ms = 0;
            debug!(symbol, "position cache invalidated");
        }
    }

    /// Merge a user-stream push and stamp it fresh.
    pub fn apply_user_stream(&self, update: &PositionUpdate) {
        let mut map = self.positions.write();
        let existing = map.get(&update.symbol);
        let leverage = existing.map(|p| p.leverage).unwrap_or(1);
        let margin_type = existing.map(|p| p.margin_type).unwrap_or_default();
        let mark_price = existing.map(|p| p.mark_price).unwrap_or(update.entry_price);

        let mut pos = Position::from_signed(
            update.symbol.clone(),
            update.quantity,
            update.entry_price,
            mark_price,
            update.unrealized_pnl,
            leverage,
            margin_type,
        );
        pos.last_updated_ms = now_ms();

        debug!(
            symbol = %update.symbol,
            side = %pos.side,
            quantity = pos.quantity,
            "position cache updated from user stream"
        );
        map.insert(update.symbol.clone(), pos);
    }

    /// Number of cached non-flat positions (risk guard input).
    pub fn non_flat_count(&self) -> usize {
        self.positions
            .read()
            .values()
            .filter(|p| !p.is_flat())
            .count()
    }

    /// All cached non-flat positions.
    pub fn non_flat(&self) -> Vec<Position> {
        self.positions
            .read()
            .values()
            .filter(|p| !p.is_flat())
            .cloned()
            .collect()
    }

    fn fresh_entry(&self, symbol: &str) -> Option<Position> {
        let map = self.positions.read();
        let pos = map.get(symbol)?;
        let age_ms = now_ms().saturating_sub(pos.last_updated_ms);
        if age_ms < self.ttl.as_millis() as i64 {
            Some(pos.clone())
        } else {
            None
        }
    }

    fn lock_for(&self, symbol: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.refresh_locks
            .lock()
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn refresh(&self, symbol: &str) -> Result<Position> {
        let mut pos = self.source.fetch_position(symbol).await?;
        pos.last_updated_ms = now_ms();
        self.positions
            .write()
            .insert(symbol.to_string(), pos.clone());
        debug!(symbol, side = %pos.side, quantity = pos.quantity, "position refreshed from venue");
        Ok(pos)
    }
}

impl std::fmt::Debug for PositionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionCache")
            .field("cached", &self.positions.read().len())
            .field("ttl", &self.ttl)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubSource {
        fetches: AtomicUsize,
        signed_quantity: parking_lot::Mutex<f64>,
        delay: Duration,
    }

    impl StubSource {
        fn new(signed_quantity: f64) -> Arc<Self> {
            Arc::new(Self {
                fetches: AtomicUsize::new(0),
                signed_quantity: parking_lot::Mutex::new(signed_quantity),
                delay: Duration::from_millis(0),
            })
        }

        fn with_delay(signed_quantity: f64, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                fetches: AtomicUsize::new(0),
                signed_quantity: parking_lot::Mutex::new(signed_quantity),
                delay,
            })
        }
    }

    #[async_trait]
    impl PositionSource for StubSource {
        async fn fetch_position(&self, symbol: &str) -> Result<Position> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(Position::from_signed(
                symbol,
                *self.signed_quantity.lock(),
                100.0,
                100.5,
                0.0,
                5,
                MarginType::Isolated,
            ))
        }
    }

    #[tokio::test]
    async fn fresh_entry_skips_rest() {
        let source = StubSource::new(1.0);
        let cache = PositionCache::new(source.clone(), Duration::from_secs(60));

        let p1 = cache.get("BTCUSDT").await.unwrap();
        let p2 = cache.get("BTCUSDT").await.unwrap();
        assert_eq!(p1.side, PositionSide::Long);
        assert_eq!(p2.side, PositionSide::Long);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_reads_coalesce_onto_one_refresh() {
        let source = StubSource::with_delay(2.0, Duration::from_millis(50));
        let cache = Arc::new(PositionCache::new(source.clone(), Duration::from_secs(60)));

        let a = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get("BTCUSDT").await.unwrap() })
        };
        let b = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get("BTCUSDT").await.unwrap() })
        };

        let (pa, pb) = (a.await.unwrap(), b.await.unwrap());
        assert_eq!(pa.quantity, 2.0);
        assert_eq!(pb.quantity, 2.0);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidate_forces_next_read_to_refresh() {
        let source = StubSource::new(1.0);
        let cache = PositionCache::new(source.clone(), Duration::from_secs(60));

        cache.get("BTCUSDT").await.unwrap();
        cache.invalidate("BTCUSDT");
        cache.get("BTCUSDT").await.unwrap();
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn user_stream_push_refreshes_without_rest() {
        let source = StubSource::new(0.0);
        let cache = PositionCache::new(source.clone(), Duration::from_secs(60));

        cache.apply_user_stream(&PositionUpdate {
            symbol: "BTCUSDT".into(),
            quantity: -3.0,
            entry_price: 99.0,
            unrealized_pnl: 1.5,
            timestamp_ms: now_ms(),
        });

        let pos = cache.get("BTCUSDT").await.unwrap();
        assert_eq!(pos.side, PositionSide::Short);
        assert_eq!(pos.quantity, 3.0);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 0);
        assert_eq!(cache.non_flat_count(), 1);
    }

    #[tokio::test]
    async fn flat_iff_quantity_zero() {
        let p = Position::from_signed("BTCUSDT", 0.0, 0.0, 0.0, 0.0, 1, MarginType::Isolated);
        assert!(p.is_flat());
        assert_eq!(p.quantity, 0.0);

        let p = Position::from_signed("BTCUSDT", -0.5, 100.0, 100.0, 0.0, 1, MarginType::Isolated);
        assert!(!p.is_flat());
        assert_eq!(p.side, PositionSide::Short);
        assert_eq!(p.quantity, 0.5);
    }
}
