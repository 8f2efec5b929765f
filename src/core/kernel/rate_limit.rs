//! Outbound request throttling shared by the REST sender and the gateway.
//!
//! Two independent checks guard every REST call to a tracked route:
//! a local burst cap counted per (credential, route) in fixed windows,
//! and the last quota the server advertised for that pair. Both are
//! evaluated before any network I/O; a rejection is an ordinary
//! `ClientError::RateLimited` outcome.

use crate::core::config::SendCap;
use crate::core::errors::ClientError;
use dashmap::DashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tokio::time::Instant;
use tracing::{debug, trace};

/// Seconds past the advertised reset during which an exhausted quota is
/// still honoured. Tolerates clock skew against the API host.
pub const RESET_GRACE_SECS: f64 = -3.0;

/// Opaque identity of a credential for keying limiter state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CredentialKey(u64);

impl CredentialKey {
    pub fn from_token(token: &str) -> Self {
        let mut hasher = DefaultHasher::new();
        token.hash(&mut hasher);
        Self(hasher.finish())
    }
}

type LimiterKey = (CredentialKey, String);

/// Derive the rate-limit route for a request path.
///
/// Only `/channels/{id}` and `/guilds/{id}` prefixes are tracked; any other
/// path returns `None` and is not throttled here.
pub fn route_for(path: &str) -> Option<String> {
    let mut segments = path.trim_start_matches('/').split(['/', '?']);
    let resource = segments.next()?;
    if resource != "channels" && resource != "guilds" {
        return None;
    }
    let id = segments.next()?;
    if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(format!("/{}/{}", resource, id))
}

/// Sends counted in the current fixed window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SendWindow {
    /// Window start in seconds on the caller's clock
    pub start: f64,
    pub count: u32,
}

impl SendWindow {
    pub const fn new(start: f64) -> Self {
        Self { start, count: 0 }
    }

    /// Count one send at `now`, opening a fresh window once `cap.period`
    /// has elapsed. Returns false when the window is already full.
    pub fn try_take(&mut self, now: f64, cap: SendCap) -> bool {
        if now - self.start >= cap.period.as_secs_f64() {
            self.start = now;
            self.count = 0;
        }
        if self.count >= cap.max {
            return false;
        }
        self.count += 1;
        true
    }
}

/// Last quota advertised by the server for one (credential, route)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServerQuota {
    pub limit: Option<u32>,
    pub remaining: i64,
    /// Unix epoch seconds
    pub reset: f64,
}

impl ServerQuota {
    /// True while the quota is exhausted and its reset (plus grace) is ahead
    pub fn blocks_at(&self, now: f64) -> bool {
        self.remaining <= 0 && self.reset - now > RESET_GRACE_SECS
    }
}

#[derive(Debug, Default)]
struct RouteState {
    server: Option<ServerQuota>,
    window: Option<SendWindow>,
}

/// Rate limiter for REST requests, shared by every session of a process
pub struct RestRateLimiter {
    routes: DashMap<LimiterKey, RouteState>,
    cap: SendCap,
}

impl std::fmt::Debug for RestRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestRateLimiter")
            .field("cap", &self.cap)
            .field("tracked_routes", &self.routes.len())
            .finish()
    }
}

impl RestRateLimiter {
    pub fn new(cap: SendCap) -> Self {
        Self {
            routes: DashMap::new(),
            cap,
        }
    }

    /// Check both caps against the current wall clock
    pub fn allow(&self, credential: CredentialKey, route: &str) -> Result<(), ClientError> {
        self.check_at(credential, route, now_epoch())
    }

    /// Check both caps, treating `now` (epoch seconds) as the current time.
    ///
    /// The server quota is consulted first so a blocked route does not
    /// consume local burst capacity. The entry stays locked for both
    /// checks, so concurrent callers on one route are serialized.
    pub fn check_at(
        &self,
        credential: CredentialKey,
        route: &str,
        now: f64,
    ) -> Result<(), ClientError> {
        let mut state = self
            .routes
            .entry((credential, route.to_string()))
            .or_default();

        if let Some(quota) = state.server.filter(|q| q.blocks_at(now)) {
            debug!(route, reset = quota.reset, "Server quota exhausted");
            return Err(ClientError::RateLimited {
                route: route.to_string(),
                reason: format!(
                    "server quota exhausted, resets in {:.1}s",
                    (quota.reset - now).max(0.0)
                ),
            });
        }

        let cap = self.cap;
        let window = state.window.get_or_insert_with(|| SendWindow::new(now));
        if !window.try_take(now, cap) {
            debug!(route, max = cap.max, "Local burst cap reached");
            return Err(ClientError::RateLimited {
                route: route.to_string(),
                reason: format!(
                    "local burst cap of {} per {:?} reached",
                    cap.max, cap.period
                ),
            });
        }

        Ok(())
    }

    /// Refresh the server-advertised quota for a route
    pub fn record(
        &self,
        credential: CredentialKey,
        route: &str,
        limit: Option<u32>,
        remaining: i64,
        reset: f64,
    ) {
        trace!(route, remaining, reset, "Recording server quota");
        let mut state = self
            .routes
            .entry((credential, route.to_string()))
            .or_default();
        state.server = Some(ServerQuota {
            limit,
            remaining,
            reset,
        });
    }

    pub fn server_quota(&self, credential: CredentialKey, route: &str) -> Option<ServerQuota> {
        self.routes
            .get(&(credential, route.to_string()))
            .and_then(|state| state.server)
    }
}

/// Per-connection cap on outbound gateway frames.
///
/// Owned by the session task, so it needs no locking.
#[derive(Debug)]
pub struct GatewaySendLimiter {
    origin: Instant,
    window: SendWindow,
    cap: SendCap,
}

impl GatewaySendLimiter {
    pub fn new(cap: SendCap) -> Self {
        Self {
            origin: Instant::now(),
            window: SendWindow::new(0.0),
            cap,
        }
    }

    pub fn try_acquire(&mut self) -> Result<(), ClientError> {
        let now = self.origin.elapsed().as_secs_f64();
        if self.window.try_take(now, self.cap) {
            return Ok(());
        }
        Err(ClientError::RateLimited {
            route: "gateway".to_string(),
            reason: format!(
                "gateway send cap of {} per {:?} reached",
                self.cap.max, self.cap.period
            ),
        })
    }
}

/// Current time as fractional Unix epoch seconds
pub fn now_epoch() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}
