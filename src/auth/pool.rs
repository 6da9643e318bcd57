//! In-memory credential pool: round-robin dispatch, liveness validation,
//! automatic quarantine of dead credentials.

use super::jwt;
use super::store;
use crate::upstream::{ProbeOutcome, UpstreamClient};
use anyhow::Result;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const VALIDATE_INTERVAL: Duration = Duration::from_secs(300);
const VALIDATE_INITIAL_DELAY: Duration = Duration::from_secs(10);
const VALIDATE_SPACING: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct CredentialRecord {
    pub credential: String,
    pub email: String,
    pub user_id: String,
    pub valid: bool,
    pub last_checked: Option<chrono::DateTime<chrono::Utc>>,
    pub use_count: u64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStats {
    pub valid_credentials: usize,
    pub total_credentials: usize,
    pub multimodal_calls: u64,
    pub total_calls: u64,
    pub success_calls: u64,
    pub success_rate: f64,
}

#[derive(Default)]
struct PoolInner {
    records: HashMap<String, CredentialRecord>,
    /// All credentials in pool-file order; the ring is its valid projection.
    order: Vec<String>,
    ring: Vec<String>,
    cursor: usize,
}

impl PoolInner {
    fn rebuild_ring(&mut self) {
        self.ring = self
            .order
            .iter()
            .filter(|c| self.records.get(*c).is_some_and(|r| r.valid))
            .cloned()
            .collect();
    }
}

pub struct CredentialPool {
    inner: RwLock<PoolInner>,
    token_file: PathBuf,
    quarantine_file: PathBuf,
    total_calls: AtomicU64,
    success_calls: AtomicU64,
    multimodal_calls: AtomicU64,
}

/// Shortened credential form for logs. Full credentials never hit the log.
pub fn mask(credential: &str) -> String {
    let prefix: String = credential.chars().take(8).collect();
    format!("{}…", prefix)
}

impl CredentialPool {
    pub fn new(token_file: PathBuf, quarantine_file: PathBuf) -> Self {
        Self {
            inner: RwLock::new(PoolInner::default()),
            token_file,
            quarantine_file,
            total_calls: AtomicU64::new(0),
            success_calls: AtomicU64::new(0),
            multimodal_calls: AtomicU64::new(0),
        }
    }

    /// Reload the pool from disk. Records for credentials already present
    /// keep their use counts, liveness state and claims; new lines start
    /// optimistically valid with claims decoded from the JWT payload.
    ///
    /// This is the only path that adds or removes map entries outside of
    /// quarantine.
    pub fn reload(&self) -> Result<usize> {
        let credentials = store::load_pool_file(&self.token_file)?;

        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let old = std::mem::take(&mut inner.records);
        inner.order.clear();

        for credential in credentials {
            if inner.records.contains_key(&credential) {
                continue;
            }
            let record = old.get(&credential).cloned().unwrap_or_else(|| {
                let claims = jwt::decode_payload(&credential).unwrap_or_default();
                CredentialRecord {
                    credential: credential.clone(),
                    email: claims.email,
                    user_id: claims.id,
                    valid: true,
                    last_checked: None,
                    use_count: 0,
                }
            });
            inner.records.insert(credential.clone(), record);
            inner.order.push(credential);
        }

        inner.rebuild_ring();
        let count = inner.ring.len();
        info!("loaded {} valid credentials", count);
        Ok(count)
    }

    /// Round-robin dispatch: next valid credential, or `None` when the pool
    /// is empty. O(1), brief write lock for the cursor and use-count bump.
    pub fn acquire(&self) -> Option<String> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if inner.ring.is_empty() {
            return None;
        }
        let idx = inner.cursor % inner.ring.len();
        let credential = inner.ring[idx].clone();
        inner.cursor = inner.cursor.wrapping_add(1);
        if let Some(record) = inner.records.get_mut(&credential) {
            record.use_count += 1;
        }
        Some(credential)
    }

    /// Claims for a specific credential, if known.
    pub fn claims_for(&self, credential: &str) -> Option<jwt::Claims> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.records.get(credential).map(|r| jwt::Claims {
            id: r.user_id.clone(),
            email: r.email.clone(),
        })
    }

    pub fn record_call(&self, success: bool, multimodal: bool) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        if success {
            self.success_calls.fetch_add(1, Ordering::Relaxed);
        }
        if multimodal {
            self.multimodal_calls.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let total = self.total_calls.load(Ordering::Relaxed);
        let success = self.success_calls.load(Ordering::Relaxed);
        let success_rate = if total > 0 {
            success as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        PoolStats {
            valid_credentials: inner.ring.len(),
            total_credentials: inner.records.len(),
            multimodal_calls: self.multimodal_calls.load(Ordering::Relaxed),
            total_calls: total,
            success_calls: success,
            success_rate,
        }
    }

    fn snapshot_credentials(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.order.clone()
    }

    /// One full validation pass: probe every credential against the
    /// upstream auths endpoint, then quarantine the dead ones.
    pub async fn validate_all(&self, upstream: &UpstreamClient) {
        let credentials = self.snapshot_credentials();
        if credentials.is_empty() {
            return;
        }
        info!("validating {} credentials", credentials.len());

        let mut dead_count = 0;
        for credential in &credentials {
            let outcome = upstream.probe_credential(credential).await;
            {
                let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
                if let Some(record) = inner.records.get_mut(credential) {
                    record.last_checked = Some(chrono::Utc::now());
                    match &outcome {
                        ProbeOutcome::Alive(claims) => {
                            record.valid = true;
                            if let Some(claims) = claims {
                                if !claims.email.is_empty() {
                                    record.email = claims.email.clone();
                                }
                                if !claims.id.is_empty() {
                                    record.user_id = claims.id.clone();
                                }
                            }
                        }
                        ProbeOutcome::Dead => {
                            debug!("credential {} failed liveness probe", mask(credential));
                            record.valid = false;
                            dead_count += 1;
                        }
                    }
                }
            }
            tokio::time::sleep(VALIDATE_SPACING).await;
        }

        {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            inner.rebuild_ring();
            info!(
                "validation pass done: {} dead, {} valid",
                dead_count,
                inner.ring.len()
            );
        }

        if dead_count > 0 {
            self.quarantine_invalid();
        }
    }

    /// Drop invalid records from the map, append them to the quarantine
    /// file, and rewrite the live file with only the survivors.
    pub fn quarantine_invalid(&self) {
        let (dead, survivors) = {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            let PoolInner { records, order, .. } = &mut *inner;
            let dead: Vec<String> = order
                .iter()
                .filter(|c| records.get(*c).is_some_and(|r| !r.valid))
                .cloned()
                .collect();
            if dead.is_empty() {
                return;
            }
            for credential in &dead {
                records.remove(credential);
            }
            order.retain(|c| records.contains_key(c));
            inner.rebuild_ring();
            (dead, inner.ring.clone())
        };

        if let Err(e) = store::append_quarantined(&self.quarantine_file, &dead) {
            warn!("failed to append quarantine file: {}", e);
        }
        if let Err(e) = store::write_survivors(&self.token_file, &survivors) {
            warn!("failed to rewrite pool file: {}", e);
        }
        info!(
            "quarantined {} credentials to {}",
            dead.len(),
            self.quarantine_file.display()
        );
    }

    /// Background liveness loop: first pass shortly after startup, then on
    /// a fixed interval until cancelled.
    pub fn spawn_validator(
        self: &Arc<Self>,
        upstream: Arc<UpstreamClient>,
        cancel: CancellationToken,
    ) {
        let pool = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(VALIDATE_INITIAL_DELAY) => {}
                _ = cancel.cancelled() => return,
            }
            pool.validate_all(&upstream).await;

            let mut ticker = tokio::time::interval(VALIDATE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => pool.validate_all(&upstream).await,
                    _ = cancel.cancelled() => return,
                }
            }
        });
    }

    /// Start watching the pool file for edits; reloads on change.
    pub fn spawn_watcher(self: &Arc<Self>) -> Option<notify::RecommendedWatcher> {
        let data_dir = self.token_file.parent()?.to_path_buf();
        let pool = self.clone();
        match store::spawn_watcher(data_dir, move || {
            if let Err(e) = pool.reload() {
                warn!("pool reload after file change failed: {}", e);
            }
        }) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!("pool file watcher unavailable, hot reload disabled: {}", e);
                None
            }
        }
    }

    /// Force a credential out of the ring without waiting for the next
    /// validation pass. Quarantine still requires `quarantine_invalid`.
    pub fn mark_invalid(&self, credential: &str) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(record) = inner.records.get_mut(credential) {
            record.valid = false;
        }
        inner.rebuild_ring();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn pool_with(creds: &[&str]) -> (CredentialPool, TempDir) {
        let dir = TempDir::new().unwrap();
        let token_file = dir.path().join("tokens.txt");
        std::fs::write(&token_file, creds.join("\n")).unwrap();
        let pool = CredentialPool::new(token_file, dir.path().join("tokens_invalid.txt"));
        pool.reload().unwrap();
        (pool, dir)
    }

    #[test]
    fn acquire_round_robins() {
        let (pool, _dir) = pool_with(&["a", "b", "c"]);
        let got: Vec<String> = (0..6).map(|_| pool.acquire().unwrap()).collect();
        assert_eq!(got, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn acquire_on_empty_pool_is_none() {
        let (pool, _dir) = pool_with(&[]);
        assert!(pool.acquire().is_none());
    }

    #[test]
    fn reload_preserves_use_counts() {
        let (pool, _dir) = pool_with(&["a", "b"]);
        pool.acquire();
        pool.acquire();
        pool.acquire();
        pool.reload().unwrap();
        let inner = pool.inner.read().unwrap();
        assert_eq!(inner.records["a"].use_count, 2);
        assert_eq!(inner.records["b"].use_count, 1);
    }

    #[test]
    fn invalid_credentials_leave_the_ring() {
        let (pool, _dir) = pool_with(&["a", "b", "c"]);
        pool.mark_invalid("b");
        let got: Vec<String> = (0..4).map(|_| pool.acquire().unwrap()).collect();
        assert!(!got.contains(&"b".to_string()));
    }

    #[test]
    fn quarantine_rewrites_both_files() {
        let (pool, dir) = pool_with(&["tok-a", "tok-b", "tok-c"]);
        pool.mark_invalid("tok-b");
        pool.quarantine_invalid();

        let live = std::fs::read_to_string(dir.path().join("tokens.txt")).unwrap();
        let dead = std::fs::read_to_string(dir.path().join("tokens_invalid.txt")).unwrap();
        assert!(!live.contains("tok-b"));
        assert!(dead.contains("tok-b"));

        // Reloading from disk yields exactly the survivors, in order.
        pool.reload().unwrap();
        let got: Vec<String> = (0..2).map(|_| pool.acquire().unwrap()).collect();
        assert_eq!(got, vec!["tok-a", "tok-c"]);
    }

    #[test]
    fn stats_track_calls() {
        let (pool, _dir) = pool_with(&["a"]);
        pool.record_call(true, false);
        pool.record_call(false, true);
        let stats = pool.stats();
        assert_eq!(stats.total_calls, 2);
        assert_eq!(stats.success_calls, 1);
        assert_eq!(stats.multimodal_calls, 1);
        assert!((stats.success_rate - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn mask_keeps_prefix_only() {
        assert_eq!(mask("abcdefghijkl"), "abcdefgh…");
    }
}
