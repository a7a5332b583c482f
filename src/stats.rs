//! Session statistics bookkeeping
//!
//! The tunnel adapter hands byte counters to a [`SessionStatsHandler`] as the
//! tunnel reports them, and the connection manager marks the moment a
//! session actually started.
//!
//! The client wires a [`CompositeStatsHandler`] that saves the counters on
//! the local keeper ([`StatsSaver`]) and reports them to the directory
//! ([`StatsSender`]).

use crate::discovery::DiscoveryError;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum StatsError {
    #[error("Failed to report session stats: {0}")]
    ReportError(#[from] DiscoveryError),
}

/// Traffic counters for the current session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Shared keeper of per-session statistics
pub trait SessionStatsKeeper: Send + Sync {
    fn save(&self, stats: SessionStats);
    fn retrieve(&self) -> SessionStats;
    fn mark_session_start(&self);
    /// Time elapsed since the last session start, if one was marked
    fn session_duration(&self) -> Option<Duration>;
}

#[derive(Default)]
struct KeeperState {
    stats: SessionStats,
    started_at: Option<Instant>,
}

/// In-memory stats keeper
pub struct StatsKeeper {
    state: Mutex<KeeperState>,
    now: fn() -> Instant,
}

impl StatsKeeper {
    pub fn new() -> Self {
        Self::with_clock(Instant::now)
    }

    pub fn with_clock(now: fn() -> Instant) -> Self {
        Self {
            state: Mutex::new(KeeperState::default()),
            now,
        }
    }

    fn lock(&self) -> MutexGuard<'_, KeeperState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for StatsKeeper {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStatsKeeper for StatsKeeper {
    fn save(&self, stats: SessionStats) {
        self.lock().stats = stats;
    }

    fn retrieve(&self) -> SessionStats {
        self.lock().stats
    }

    fn mark_session_start(&self) {
        let mut state = self.lock();
        state.started_at = Some((self.now)());
        state.stats = SessionStats::default();
    }

    fn session_duration(&self) -> Option<Duration> {
        let started_at = self.lock().started_at?;
        Some((self.now)().saturating_duration_since(started_at))
    }
}

/// Consumer of byte-count updates from a running tunnel
#[async_trait]
pub trait SessionStatsHandler: Send + Sync {
    async fn handle(&self, stats: SessionStats) -> Result<(), StatsError>;
}

/// Remote endpoint accepting per-session traffic reports
#[async_trait]
pub trait StatsReporter: Send + Sync {
    async fn send_session_stats(
        &self,
        session_id: &str,
        stats: SessionStats,
    ) -> Result<(), DiscoveryError>;
}

/// Saves counters on the local keeper
pub struct StatsSaver {
    keeper: Arc<dyn SessionStatsKeeper>,
}

impl StatsSaver {
    pub fn new(keeper: Arc<dyn SessionStatsKeeper>) -> Self {
        Self { keeper }
    }
}

#[async_trait]
impl SessionStatsHandler for StatsSaver {
    async fn handle(&self, stats: SessionStats) -> Result<(), StatsError> {
        self.keeper.save(stats);
        Ok(())
    }
}

/// Reports counters of one session
pub struct StatsSender {
    reporter: Arc<dyn StatsReporter>,
    session_id: String,
}

impl StatsSender {
    pub fn new(reporter: Arc<dyn StatsReporter>, session_id: impl Into<String>) -> Self {
        Self {
            reporter,
            session_id: session_id.into(),
        }
    }
}

#[async_trait]
impl SessionStatsHandler for StatsSender {
    async fn handle(&self, stats: SessionStats) -> Result<(), StatsError> {
        self.reporter
            .send_session_stats(&self.session_id, stats)
            .await?;
        debug!("Reported stats of session {}", self.session_id);
        Ok(())
    }
}

/// Runs every handler in order, even after one fails; returns the first error
pub struct CompositeStatsHandler {
    handlers: Vec<Arc<dyn SessionStatsHandler>>,
}

impl CompositeStatsHandler {
    pub fn new(handlers: Vec<Arc<dyn SessionStatsHandler>>) -> Self {
        Self { handlers }
    }
}

#[async_trait]
impl SessionStatsHandler for CompositeStatsHandler {
    async fn handle(&self, stats: SessionStats) -> Result<(), StatsError> {
        let mut first_error = None;
        for handler in &self.handlers {
            if let Err(e) = handler.handle(stats).await {
                match first_error {
                    None => first_error = Some(e),
                    Some(_) => warn!("{}", e),
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
