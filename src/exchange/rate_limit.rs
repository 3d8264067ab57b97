// =============================================================================
// Rate Limiter — rolling request-weight window with pre-flight delay
// =============================================================================
//
// The venue publishes a per-minute request-weight limit.  This limiter keeps
// its own rolling window and, when a request would push projected usage past
// 90 % of the limit, delays the caller until the minute rolls over instead of
// dropping the request.  The actual server-side usage reported in the
// `X-MBX-USED-WEIGHT-1M` response header overrides the local estimate, so
// drift between the two self-corrects after every response.
// =============================================================================

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

/// Window length the venue accounts weight over.
const WINDOW: Duration = Duration::from_secs(60);

/// Fraction of the published limit we allow ourselves to use.
const USAGE_THRESHOLD: f64 = 0.90;

/// Default published weight limit per minute for the futures REST API.
pub const DEFAULT_WEIGHT_LIMIT: u32 = 2400;

struct WindowState {
    window_start: Instant,
    used: u32,
}

/// Thread-safe rolling weight tracker.
pub struct RateLimiter {
    limit_per_minute: u32,
    state: Mutex<WindowState>,
}

impl RateLimiter {
    pub fn new(limit_per_minute: u32) -> Self {
        Self {
            limit_per_minute,
            state: Mutex::new(WindowState {
                window_start: Instant::now(),
                used: 0,
            }),
        }
    }

    /// Reserve `weight` against the current window.  Returns how long the
    /// caller must wait before sending; `Duration::ZERO` means send now.
    /// The weight is committed either way (to the next window when a wait is
    /// returned), so concurrent callers queue up correctly.
    pub fn reserve(&self, weight: u32) -> Duration {
        let mut s = self.state.lock();
        let now = Instant::now();

        if now.duration_since(s.window_start) >= WINDOW {
            s.window_start = now;
            s.used = 0;
        }

        let projected = s.used.saturating_add(weight);
        let budget = (self.limit_per_minute as f64 * USAGE_THRESHOLD) as u32;

        if projected <= budget {
            s.used = projected;
            return Duration::ZERO;
        }

        // Push the request into the next window and account it there.
        let wait = WINDOW.saturating_sub(now.duration_since(s.window_start));
        warn!(
            used = s.used,
            weight,
            budget,
            wait_ms = wait.as_millis() as u64,
            "request-weight budget exhausted — delaying until window rolls"
        );
        s.window_start = now + wait;
        s.used = weight;
        wait
    }

    /// Reserve and, if needed, sleep out the delay.
    pub async fn acquire(&self, weight: u32) {
        let wait = self.reserve(weight);
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    /// Sync the local estimate with the venue's own accounting from the
    /// `X-MBX-USED-WEIGHT-1M` response header.
    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap) {
        if let Some(used) = headers
            .get("X-MBX-USED-WEIGHT-1M")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u32>().ok())
        {
            let mut s = self.state.lock();
            // Only adopt the server figure for the live window.
            if Instant::now().duration_since(s.window_start) < WINDOW {
                s.used = used;
                debug!(used_weight_1m = used, "weight synced from response header");
            }
        }
    }

    /// Current local usage estimate (for diagnostics).
    pub fn used(&self) -> u32 {
        self.state.lock().used
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("limit_per_minute", &self.limit_per_minute)
            .field("used", &self.used())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn within_budget_sends_immediately() {
        let limiter = RateLimiter::new(100);
        for _ in 0..9 {
            assert_eq!(limiter.reserve(10), Duration::ZERO);
        }
        assert_eq!(limiter.used(), 90);
    }

    #[test]
    fn exceeding_budget_delays_until_rollover() {
        let limiter = RateLimiter::new(100);
        assert_eq!(limiter.reserve(90), Duration::ZERO);
        // 90 + 10 > 90-unit budget: must wait close to a full window.
        let wait = limiter.reserve(10);
        assert!(wait > Duration::from_secs(55));
        assert!(wait <= Duration::from_secs(60));
        // The delayed request is accounted against the next window.
        assert_eq!(limiter.used(), 10);
    }

    #[test]
    fn header_sync_overrides_local_estimate() {
        let limiter = RateLimiter::new(1000);
        limiter.reserve(5);

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "X-MBX-USED-WEIGHT-1M",
            reqwest::header::HeaderValue::from_static("123"),
        );
        limiter.update_from_headers(&headers);
        assert_eq!(limiter.used(), 123);
    }

    #[test]
    fn garbage_header_is_ignored() {
        let limiter = RateLimiter::new(1000);
        limiter.reserve(5);

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "X-MBX-USED-WEIGHT-1M",
            reqwest::header::HeaderValue::from_static("not-a-number"),
        );
        limiter.update_from_headers(&headers);
        assert_eq!(limiter.used(), 5);
    }
}
