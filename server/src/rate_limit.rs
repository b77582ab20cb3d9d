use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;

use common::clock::{Clock, UnixMillis};

use crate::api::AppState;

/// Drop all client records periodically so inactive clients don't pile up.
const RESET_PERIOD_MS: i64 = 600_000;

/// Lightweight per-client rate limit shared by all routes.
///
/// A client can stock up to `burst` requests at once and regains one every
/// `period_ms`. Tracking is a single timestamp per client: the next time a
/// request would be permitted with a fully used backlog.
pub struct RateLimiter {
    period_ms: i64,
    burst: i64,
    clock: Arc<dyn Clock>,
    state: Mutex<LimiterState>,
}

struct LimiterState {
    next_request_time: HashMap<String, UnixMillis>,
    next_reset_time: UnixMillis,
}

impl RateLimiter {
    pub fn new(period_ms: i64, burst: u32, clock: Arc<dyn Clock>) -> Self {
        let next_reset_time = clock.now() + RESET_PERIOD_MS;
        RateLimiter {
            period_ms,
            burst: i64::from(burst),
            clock,
            state: Mutex::new(LimiterState {
                next_request_time: HashMap::new(),
                next_reset_time,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LimiterState> {
        self.state.lock().expect("rate limiter mutex poisoned")
    }

    pub fn allow(&self, client: &str) -> bool {
        let mut state = self.lock();
        let now = self.clock.now();

        if now >= state.next_reset_time {
            state.next_request_time.clear();
            state.next_reset_time = now + RESET_PERIOD_MS;
        }

        // A client that has been idle cannot bank more than `burst` requests.
        let backlog_floor = now - self.period_ms * (self.burst - 1);
        let next_time = state
            .next_request_time
            .get(client)
            .map_or(backlog_floor, |t| (*t).max(backlog_floor));

        if now < next_time {
            return false;
        }

        state
            .next_request_time
            .insert(client.to_string(), next_time + self.period_ms);
        true
    }
}

/// Router middleware applying the rate limit to every request.
pub async fn rate_limit_mw(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(limiter) = &state.rate_limiter {
        let client = client_ip(&request);
        if !limiter.allow(&client) {
            return (
                StatusCode::TOO_MANY_REQUESTS,
                Json(serde_json::json!({
                    "code": "RATE_LIMIT",
                    "message": "Rate limit exceeded.",
                })),
            )
                .into_response();
        }
    }
    next.run(request).await
}

fn client_ip(request: &Request) -> String {
    if let Some(forwarded) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_default()
}
