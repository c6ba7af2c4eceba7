//! Credential pool: N refresh-token configurations multiplexed onto upstream
//! calls with round-robin rotation, cached access tokens, single-flight
//! refresh, and per-credential quota tracking.

pub mod refresh;
pub mod single_flight;

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::config::CredentialConfig;
use crate::error::GatewayError;
use self::refresh::{RefreshError, TokenRefresher, UsageLimitsResponse};
use self::single_flight::SingleFlight;

/// Tokens within this margin of expiry are treated as stale.
const EXPIRY_SAFETY_MARGIN: Duration = Duration::from_secs(5 * 60);
/// Cached entries older than this are evicted by the sweep regardless of
/// their reported expiry.
const CACHE_TTL: Duration = Duration::from_secs(30 * 60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// One cached access token with its bookkeeping.
#[derive(Debug, Clone)]
pub struct CachedToken {
    pub access_token: String,
    pub profile_arn: Option<String>,
    pub cached_at: Instant,
    pub expires_at: Instant,
    pub available_quota: f64,
    pub usage: Option<UsageLimitsResponse>,
    pub last_used: Option<Instant>,
}

/// What `select()` hands to the request path.
#[derive(Debug, Clone)]
pub struct SelectedCredential {
    pub access_token: String,
    pub index: usize,
    pub profile_arn: Option<String>,
    /// Quota snapshot before this selection's decrement.
    pub available_before: f64,
    /// The credential was handed out with no known remaining quota.
    pub exceeded: bool,
}

struct PoolState {
    entries: Vec<Option<CachedToken>>,
    cursor: usize,
    exhausted: FxHashSet<usize>,
}

struct PoolInner {
    configs: Vec<CredentialConfig>,
    refresher: Arc<dyn TokenRefresher>,
    state: Mutex<PoolState>,
    refreshes: Arc<SingleFlight<CachedToken, RefreshError>>,
    sweep: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl PoolInner {
    fn fresh_cached(&self, index: usize) -> Option<CachedToken> {
        let state = self.state.lock();
        let cached = state.entries.get(index)?.as_ref()?;
        if cached.expires_at > Instant::now() + EXPIRY_SAFETY_MARGIN {
            Some(cached.clone())
        } else {
            None
        }
    }

    fn sweep_once(&self) {
        let now = Instant::now();
        let mut state = self.state.lock();
        for (index, entry) in state.entries.iter_mut().enumerate() {
            let evict = entry
                .as_ref()
                .is_some_and(|c| now.duration_since(c.cached_at) > CACHE_TTL || c.expires_at <= now);
            if evict {
                tracing::debug!(index, "evicting stale cached token");
                *entry = None;
            }
        }
    }
}

/// Process-wide credential pool. Clone-cheap; all clones share state.
#[derive(Clone)]
pub struct CredentialPool {
    inner: Arc<PoolInner>,
}

impl CredentialPool {
    /// Build a pool over the enabled credentials and start the periodic
    /// sweep. Must be called within a tokio runtime.
    #[must_use]
    pub fn new(configs: Vec<CredentialConfig>, refresher: Arc<dyn TokenRefresher>) -> Self {
        let configs: Vec<CredentialConfig> =
            configs.into_iter().filter(|c| !c.disabled).collect();
        let entries = configs.iter().map(|_| None).collect();
        let inner = Arc::new(PoolInner {
            configs,
            refresher,
            state: Mutex::new(PoolState {
                entries,
                cursor: 0,
                exhausted: FxHashSet::default(),
            }),
            refreshes: SingleFlight::new(),
            sweep: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                inner.sweep_once();
            }
        });
        *inner.sweep.lock() = Some(handle);

        Self { inner }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.configs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.configs.is_empty()
    }

    /// Pick the next usable credential: skip cached entries with no quota,
    /// refresh on demand, decrement quota on hand-out, advance the cursor.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Credential`] when every credential is
    /// exhausted or fails to refresh.
    pub async fn select(&self) -> Result<SelectedCredential, GatewayError> {
        let n = self.inner.configs.len();
        if n == 0 {
            return Err(GatewayError::Credential(
                "no credentials configured".to_string(),
            ));
        }

        for _ in 0..n {
            let index = {
                let mut state = self.inner.state.lock();
                let index = state.cursor;
                let out_of_quota = state.entries[index]
                    .as_ref()
                    .is_some_and(|c| c.available_quota <= 0.0);
                if out_of_quota {
                    state.exhausted.insert(index);
                    state.cursor = (state.cursor + 1) % n;
                    tracing::debug!(index, "credential exhausted, rotating past");
                    continue;
                }
                index
            };

            match self.get_or_refresh(index).await {
                Ok(token) => {
                    let mut state = self.inner.state.lock();
                    let selected = match state.entries[index].as_mut() {
                        Some(cached) => {
                            let available_before = cached.available_quota;
                            if available_before > 0.0 {
                                cached.available_quota -= 1.0;
                            }
                            cached.last_used = Some(Instant::now());
                            SelectedCredential {
                                access_token: cached.access_token.clone(),
                                index,
                                profile_arn: cached.profile_arn.clone(),
                                available_before,
                                exceeded: available_before <= 0.0,
                            }
                        }
                        // Entry evicted between refresh and here; the token
                        // we hold is still good for this request.
                        None => SelectedCredential {
                            access_token: token.access_token.clone(),
                            index,
                            profile_arn: token.profile_arn.clone(),
                            available_before: token.available_quota,
                            exceeded: token.available_quota <= 0.0,
                        },
                    };
                    state.cursor = (state.cursor + 1) % n;
                    if selected.exceeded {
                        tracing::warn!(index, "credential handed out with no known quota");
                    }
                    return Ok(selected);
                }
                Err(err) => {
                    tracing::warn!(index, "credential refresh failed: {err}");
                    let mut state = self.inner.state.lock();
                    state.exhausted.insert(index);
                    state.cursor = (state.cursor + 1) % n;
                }
            }
        }

        Err(GatewayError::Credential(
            "all credentials failed".to_string(),
        ))
    }

    /// Return a fresh cached token or refresh with single-flight discipline.
    ///
    /// # Errors
    ///
    /// Propagates the [`RefreshError`] from the shared refresh attempt.
    pub async fn get_or_refresh(&self, index: usize) -> Result<CachedToken, RefreshError> {
        if let Some(cached) = self.inner.fresh_cached(index) {
            return Ok(cached);
        }

        let inner = Arc::clone(&self.inner);
        let shared = self.inner.refreshes.run(index, move || async move {
            // Double-checked: a concurrent caller may have completed the
            // refresh while this task queued for the single-flight slot.
            if let Some(cached) = inner.fresh_cached(index) {
                return Ok(cached);
            }
            let config = inner.configs[index].clone();
            let refreshed = inner.refresher.refresh(&config).await?;
            let now = Instant::now();
            let token = CachedToken {
                access_token: refreshed.access_token,
                profile_arn: refreshed.profile_arn,
                cached_at: now,
                expires_at: now + refreshed.expires_in,
                available_quota: refreshed.available_quota,
                usage: refreshed.usage,
                last_used: None,
            };
            let mut state = inner.state.lock();
            state.entries[index] = Some(token.clone());
            state.exhausted.remove(&index);
            tracing::info!(
                index,
                auth = %config.auth,
                quota = token.available_quota,
                "credential refreshed"
            );
            Ok(token)
        });
        shared.await
    }

    /// Cancel the sweep, drop in-flight refresh registrations, and empty the
    /// caches. Safe to call more than once.
    pub fn destroy(&self) {
        if let Some(handle) = self.inner.sweep.lock().take() {
            handle.abort();
        }
        self.inner.refreshes.clear();
        let mut state = self.inner.state.lock();
        for entry in &mut state.entries {
            *entry = None;
        }
        state.exhausted.clear();
    }

    #[cfg(test)]
    fn seed(&self, index: usize, available_quota: f64, ttl: Duration) {
        let now = Instant::now();
        let mut state = self.inner.state.lock();
        state.entries[index] = Some(CachedToken {
            access_token: format!("seeded-{index}"),
            profile_arn: None,
            cached_at: now,
            expires_at: now + ttl,
            available_quota,
            usage: None,
            last_used: None,
        });
    }

    #[cfg(test)]
    fn is_exhausted(&self, index: usize) -> bool {
        self.inner.state.lock().exhausted.contains(&index)
    }

    #[cfg(test)]
    fn sweep_now(&self) {
        self.inner.sweep_once();
    }
}
