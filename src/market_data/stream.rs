// =============================================================================
// Market Stream — one WebSocket per symbol carrying its interval streams
// =============================================================================
//
// Each symbol gets its own connection with that symbol's required intervals
// combined into one stream.  Per-symbol isolation keeps one symbol's
// disconnection independent from the others (a single connection carrying
// four or more streams was observed to deliver no data on the venue
// testnet).
//
// The candle callback is invoked inline on the stream task and must return
// immediately without blocking on I/O — in practice it is a non-blocking
// enqueue onto the engine's data queue, safe to call from any thread.
//
// Reconnect policy: exponential backoff, base 1 s, cap 60 s, reset after a
// successful connect; all streams are re-subscribed by reconnecting the
// combined URL.  Before the first message is ever forwarded the task waits
// (bounded) for the engine readiness signal; a timeout there is a fatal
// initialization error.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

use crate::market_data::candle::{parse_kline_message, Candle};

/// Reconnect backoff bounds.
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// How long the stream waits for engine readiness before giving up.
pub const READY_TIMEOUT: Duration = Duration::from_secs(5);

/// Build the combined-stream URL for one symbol's interval set.
pub fn stream_url(ws_base: &str, symbol: &str, intervals: &[String]) -> String {
    let lower = symbol.to_lowercase();
    let streams: Vec<String> = intervals
        .iter()
        .map(|iv| format!("{lower}@kline_{iv}"))
        .collect();
    format!("{}/stream?streams={}", ws_base, streams.join("/"))
}

/// Exponential reconnect backoff for `attempt` (0-based).
pub fn next_backoff(attempt: u32) -> Duration {
    BACKOFF_CAP.min(BACKOFF_BASE * 2u32.saturating_pow(attempt))
}

/// Wait (bounded) until the readiness flag flips true.
pub async fn wait_ready(ready: &mut watch::Receiver<bool>, timeout: Duration) -> Result<()> {
    if *ready.borrow() {
        return Ok(());
    }
    tokio::time::timeout(timeout, async {
        while !*ready.borrow() {
            ready
                .changed()
                .await
                .context("readiness channel closed before engine ran")?;
        }
        Ok::<(), anyhow::Error>(())
    })
    .await
    .context("engine readiness signal timed out")?
}

/// Run the market stream for one symbol until the task is cancelled.
///
/// Returns an error only for the fatal readiness timeout; connection drops
/// are retried forever with capped backoff.
pub async fn run_market_stream(
    symbol: String,
    intervals: Vec<String>,
    ws_base: String,
    mut ready: watch::Receiver<bool>,
    on_candle: impl Fn(Candle) + Send + Sync,
) -> Result<()> {
    // Bounded wait for the engine loop before the first enqueue.
    wait_ready(&mut ready, READY_TIMEOUT)
        .await
        .with_context(|| format!("market stream for {symbol} cannot start"))?;

    let url = stream_url(&ws_base, &symbol, &intervals);
    let mut attempt: u32 = 0;

    loop {
        info!(symbol = %symbol, url = %url, "connecting to kline WebSocket");

        match connect_async(&url).await {
            Ok((ws_stream, _response)) => {
                info!(symbol = %symbol, intervals = ?intervals, "kline WebSocket connected");
                attempt = 0;

                let (_write, mut read) = ws_stream.split();
                loop {
                    match read.next().await {
                        Some(Ok(msg)) => {
                            if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                                match parse_kline_message(&text) {
                                    Ok(candle) => {
                                        debug!(
                                            key = %candle.key(),
                                            close = candle.close,
                                            closed = candle.is_closed,
                                            "candle received"
                                        );
                                        on_candle(candle);
                                    }
                                    Err(e) => {
                                        // Combined streams interleave
                                        // subscription acks; only kline
                                        // payload failures matter.
                                        if text.contains("\"k\"") {
                                            warn!(error = %e, "failed to parse kline message");
                                        }
                                    }
                                }
                            }
                            // Ping/pong handled by tungstenite itself.
                        }
                        Some(Err(e)) => {
                            error!(symbol = %symbol, error = %e, "kline WebSocket read error");
                            break;
                        }
                        None => {
                            warn!(symbol = %symbol, "kline WebSocket stream ended");
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                error!(symbol = %symbol, error = %e, "kline WebSocket connect failed");
            }
        }

        let backoff = next_backoff(attempt);
        attempt = attempt.saturating_add(1);
        warn!(
            symbol = %symbol,
            backoff_secs = backoff.as_secs(),
            "reconnecting kline WebSocket"
        );
        tokio::time::sleep(backoff).await;
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_combines_all_intervals_for_one_symbol() {
        let url = stream_url(
            "wss://fstream.binance.com",
            "BTCUSDT",
            &["5m".to_string(), "15m".to_string(), "1h".to_string()],
        );
        assert_eq!(
            url,
            "wss://fstream.binance.com/stream?streams=btcusdt@kline_5m/btcusdt@kline_15m/btcusdt@kline_1h"
        );
    }

    #[test]
    fn backoff_doubles_and_caps_at_sixty_seconds() {
        assert_eq!(next_backoff(0), Duration::from_secs(1));
        assert_eq!(next_backoff(1), Duration::from_secs(2));
        assert_eq!(next_backoff(5), Duration::from_secs(32));
        assert_eq!(next_backoff(6), Duration::from_secs(60));
        assert_eq!(next_backoff(20), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn wait_ready_returns_once_flag_flips() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move {
            wait_ready(&mut rx, Duration::from_secs(1)).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn wait_ready_times_out_when_engine_never_runs() {
        let (_tx, mut rx) = watch::channel(false);
        let result = wait_ready(&mut rx, Duration::from_millis(50)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn wait_ready_is_immediate_when_already_ready() {
        let (tx, mut rx) = watch::channel(true);
        assert!(wait_ready(&mut rx, Duration::from_millis(10)).await.is_ok());
        drop(tx);
    }
}
