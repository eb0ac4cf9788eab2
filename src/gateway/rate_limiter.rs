// Rate Limiter
// Per-channel sliding window: at most `limit` admissions in any trailing window

use dashmap::DashMap;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::config::{RateLimitConfig, WindowStoreConfig};
use super::error::GatewayError;
use crate::error::{AppError, AppResult};
use crate::modules::db;

/// Result of one atomic prune-count-record step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowDecision {
    /// Timestamp recorded; `in_window` includes it
    Recorded { in_window: u32 },
    /// Budget full; nothing recorded
    Full {
        in_window: u32,
        oldest_ms: Option<i64>,
    },
}

/// Shared counter store with atomic insert, prune-by-age and count.
///
/// `try_record` must run as one atomic step per channel, also across
/// processes when the store is shared.
pub trait WindowStore: Send + Sync {
    /// Drop timestamps `<= now_ms - window_ms`, then record `now_ms` if fewer
    /// than `limit` remain.
    fn try_record(
        &self,
        channel: &str,
        now_ms: i64,
        window_ms: i64,
        limit: u32,
    ) -> AppResult<WindowDecision>;

    /// Timestamps currently inside the window
    fn count(&self, channel: &str, now_ms: i64, window_ms: i64) -> AppResult<u32>;
}

/// In-process store for single-instance deployments
#[derive(Default)]
pub struct MemoryWindowStore {
    windows: DashMap<String, VecDeque<i64>>,
}

impl MemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WindowStore for MemoryWindowStore {
    fn try_record(
        &self,
        channel: &str,
        now_ms: i64,
        window_ms: i64,
        limit: u32,
    ) -> AppResult<WindowDecision> {
        let cutoff = now_ms - window_ms;
        // The entry guard holds the shard lock for the whole sequence
        let mut window = self.windows.entry(channel.to_string()).or_default();
        window.retain(|&ts| ts > cutoff);

        let in_window = window.len() as u32;
        if in_window >= limit {
            return Ok(WindowDecision::Full {
                in_window,
                oldest_ms: window.iter().min().copied(),
            });
        }

        window.push_back(now_ms);
        Ok(WindowDecision::Recorded {
            in_window: in_window + 1,
        })
    }

    fn count(&self, channel: &str, now_ms: i64, window_ms: i64) -> AppResult<u32> {
        let cutoff = now_ms - window_ms;
        Ok(self
            .windows
            .get(channel)
            .map(|w| w.iter().filter(|&&ts| ts > cutoff).count() as u32)
            .unwrap_or(0))
    }
}

/// SQLite-backed store; instances sharing the file share the budget.
///
/// Each admission runs in a `BEGIN IMMEDIATE` transaction, which takes the
/// database write lock before reading, so prune-count-insert is atomic
/// across connections and processes.
pub struct SqliteWindowStore {
    conn: Mutex<Connection>,
}

impl SqliteWindowStore {
    pub fn open(path: &Path) -> AppResult<Self> {
        let conn = db::open_connection(path)?;
        db::init_window_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> AppResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Unknown("rate window connection poisoned".to_string()))
    }
}

impl WindowStore for SqliteWindowStore {
    fn try_record(
        &self,
        channel: &str,
        now_ms: i64,
        window_ms: i64,
        limit: u32,
    ) -> AppResult<WindowDecision> {
        let cutoff = now_ms - window_ms;
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "DELETE FROM rate_window WHERE channel = ?1 AND admitted_ms <= ?2",
            params![channel, cutoff],
        )?;

        let (in_window, oldest_ms): (u32, Option<i64>) = tx.query_row(
            "SELECT COUNT(*), MIN(admitted_ms) FROM rate_window WHERE channel = ?1",
            params![channel],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let decision = if in_window >= limit {
            WindowDecision::Full {
                in_window,
                oldest_ms,
            }
        } else {
            tx.execute(
                "INSERT INTO rate_window (channel, admitted_ms) VALUES (?1, ?2)",
                params![channel, now_ms],
            )?;
            WindowDecision::Recorded {
                in_window: in_window + 1,
            }
        };

        tx.commit()?;
        Ok(decision)
    }

    fn count(&self, channel: &str, now_ms: i64, window_ms: i64) -> AppResult<u32> {
        let conn = self.lock()?;
        let count: Option<u32> = conn
            .query_row(
                "SELECT COUNT(*) FROM rate_window WHERE channel = ?1 AND admitted_ms > ?2",
                params![channel, now_ms - window_ms],
                |row| row.get(0),
            )
            .optional()?;
        Ok(count.unwrap_or(0))
    }
}

/// Build the store named by configuration; a relative SQLite path lands in `data_dir`
pub fn open_window_store(
    config: &WindowStoreConfig,
    data_dir: &Path,
) -> AppResult<Arc<dyn WindowStore>> {
    match config {
        WindowStoreConfig::Memory => Ok(Arc::new(MemoryWindowStore::new())),
        WindowStoreConfig::Sqlite { path } => {
            let path = if path.is_absolute() {
                path.clone()
            } else {
                data_dir.join(path)
            };
            tracing::info!("Rate windows shared through {:?}", path);
            Ok(Arc::new(SqliteWindowStore::open(&path)?))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admitted { in_window: u32, limit: u32 },
    /// Rejected; `retry_after` is when the oldest admission leaves the window
    Rejected { retry_after: Duration, limit: u32 },
    /// Enforcement disabled (non-production bypass)
    Bypassed,
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Self::Rejected { .. })
    }
}

pub struct RateLimiter {
    store: Arc<dyn WindowStore>,
    config: RateLimitConfig,
    bypass: bool,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn WindowStore>, config: RateLimitConfig, bypass: bool) -> Self {
        if bypass {
            tracing::warn!("Rate limiting is BYPASSED; this must never be used in production");
        }
        Self {
            store,
            config,
            bypass,
        }
    }

    pub fn limit_for(&self, channel: &str) -> u32 {
        self.config.limit_for(channel)
    }

    /// Admit one call on `channel` at the current wall-clock time
    pub fn admit(&self, channel: &str) -> Result<Admission, GatewayError> {
        self.admit_at(channel, chrono::Utc::now().timestamp_millis())
    }

    pub fn admit_at(&self, channel: &str, now_ms: i64) -> Result<Admission, GatewayError> {
        if self.bypass {
            return Ok(Admission::Bypassed);
        }

        let limit = self.config.limit_for(channel);
        let window_ms = self.window_ms();

        let decision = self
            .store
            .try_record(channel, now_ms, window_ms, limit)
            .map_err(|e| {
                // Without the counter we cannot prove the budget holds
                tracing::error!("Rate window store failed for {}: {}", channel, e);
                GatewayError::Unknown("rate limit store unavailable".to_string())
            })?;

        match decision {
            WindowDecision::Recorded { in_window } => {
                tracing::debug!("Admitted {} call {}/{}", channel, in_window, limit);
                Ok(Admission::Admitted { in_window, limit })
            }
            WindowDecision::Full { oldest_ms, .. } => {
                let wait_ms = oldest_ms
                    .map(|oldest| oldest + window_ms - now_ms)
                    .unwrap_or(window_ms)
                    .max(1);
                tracing::warn!(
                    "Channel {} over budget ({}/{}s), retry in {}ms",
                    channel,
                    limit,
                    self.config.window_secs,
                    wait_ms
                );
                Ok(Admission::Rejected {
                    retry_after: Duration::from_millis(wait_ms as u64),
                    limit,
                })
            }
        }
    }

    /// Admissions currently counted for `channel`
    pub fn in_window(&self, channel: &str) -> AppResult<u32> {
        self.store
            .count(channel, chrono::Utc::now().timestamp_millis(), self.window_ms())
    }

    fn window_ms(&self) -> i64 {
        self.config.window().as_millis() as i64
    }
}
