//! Lease-based leader election over the shared store
//!
//! ## Protocol
//!
//! One claim per scope lives under `leader:<scope>`. Every context:
//! 1. Reads the claim on start and takes over when it is missing or stale
//! 2. On each heartbeat tick: the leader re-reads and refreshes its claim,
//!    stepping down only when another context holds a valid claim;
//!    followers re-read and take over once the claim goes stale
//! 3. Re-reads whenever the store reports the key changed
//!
//! Takeover writes unconditionally and then reads back; whichever claim the
//! read-back observes is the effective leader. This is not a compare-and-swap:
//! two contexts can both believe they lead until the next tick's re-read.
//!
//! ## Driving
//!
//! The owner awaits [`Election::next_trigger`] (cancel-safe, suitable for
//! `select!`) and passes the result to [`Election::handle`], which does the
//! store I/O and returns the resulting transitions.

pub mod claim;

pub use claim::LeaderClaim;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::store::SharedStore;
use crate::types::{Result, TetherError};
use crate::util::{leader_key, Clock};

/// Default heartbeat / poll interval
pub const DEFAULT_HEARTBEAT_MS: u64 = 3_000;

/// Default staleness threshold
pub const DEFAULT_TIMEOUT_MS: u64 = 9_000;

/// Election timing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionConfig {
    /// Leader refresh interval and follower poll interval
    pub heartbeat_ms: u64,
    /// A claim older than this is stale
    pub timeout_ms: u64,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_ms: DEFAULT_HEARTBEAT_MS,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

impl ElectionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_ms == 0 {
            return Err(TetherError::Config("heartbeat_ms must be positive".into()));
        }
        if self.timeout_ms <= self.heartbeat_ms {
            return Err(TetherError::Config(format!(
                "timeout_ms ({}) must exceed heartbeat_ms ({})",
                self.timeout_ms, self.heartbeat_ms
            )));
        }
        Ok(())
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }
}

/// Transitions reported by [`Election::handle`] and [`Election::start`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionEvent {
    /// The effective leader changed (always first in a batch)
    LeadershipChanged { leader_id: Option<String> },
    /// This context became leader
    LeaderAcquired { id: String },
    /// Another context (or nobody) leads now
    LeaderLost { leader_id: Option<String> },
}

/// Per-context view of the election
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionState {
    /// Before the first read
    Unknown,
    Follower { leader_id: Option<String> },
    Leader,
}

/// What woke the election up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Tick,
    StoreChanged,
}

/// Leader election for one context in one scope
pub struct Election {
    id: String,
    scope: String,
    key: String,
    config: ElectionConfig,
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    leader_id: Option<String>,
    observed: bool,
    running: bool,
    ticker: Option<Interval>,
    changes: Option<broadcast::Receiver<String>>,
}

impl Election {
    pub fn new(
        id: String,
        scope: &str,
        config: ElectionConfig,
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            id,
            scope: scope.to_string(),
            key: leader_key(scope),
            config,
            store,
            clock,
            leader_id: None,
            observed: false,
            running: false,
            ticker: None,
            changes: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Store key holding this scope's claim
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn leader_id(&self) -> Option<&str> {
        self.leader_id.as_deref()
    }

    pub fn is_leader(&self) -> bool {
        self.leader_id.as_deref() == Some(self.id.as_str())
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn state(&self) -> ElectionState {
        if !self.observed {
            ElectionState::Unknown
        } else if self.is_leader() {
            ElectionState::Leader
        } else {
            ElectionState::Follower {
                leader_id: self.leader_id.clone(),
            }
        }
    }

    /// Subscribe to store changes, read, attempt takeover if needed, arm the ticker
    pub async fn start(&mut self) -> Vec<ElectionEvent> {
        if self.running {
            warn!("Election for {} already running", self.scope);
            return Vec::new();
        }
        self.running = true;
        self.changes = self.store.changes();

        info!(
            id = %self.id,
            scope = %self.scope,
            heartbeat_ms = self.config.heartbeat_ms,
            timeout_ms = self.config.timeout_ms,
            "Starting leader election"
        );

        let events = self.try_claim_if_expired().await;

        let period = self.config.heartbeat();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.ticker = Some(ticker);

        events
    }

    /// Wait for the next tick or relevant store change
    ///
    /// Cancel-safe. Never resolves once the election is stopped.
    pub async fn next_trigger(&mut self) -> Trigger {
        loop {
            let Some(ticker) = self.ticker.as_mut() else {
                return std::future::pending().await;
            };
            let changes = self.changes.as_mut();

            let changed = tokio::select! {
                _ = ticker.tick() => return Trigger::Tick,
                changed = recv_change(changes) => changed,
            };

            match changed {
                Ok(key) if key == self.key => return Trigger::StoreChanged,
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    debug!("Missed {} store notifications, re-reading", skipped);
                    return Trigger::StoreChanged;
                }
                Err(RecvError::Closed) => {
                    debug!("Store notifications ended for {}, polling only", self.scope);
                    self.changes = None;
                }
            }
        }
    }

    /// React to a trigger; no-op once stopped
    pub async fn handle(&mut self, trigger: Trigger) -> Vec<ElectionEvent> {
        if !self.running {
            return Vec::new();
        }
        match trigger {
            Trigger::Tick if self.is_leader() => self.heartbeat().await,
            Trigger::Tick => self.try_claim_if_expired().await,
            Trigger::StoreChanged => self.read_leader().await,
        }
    }

    /// Stop ticking and release the claim if we hold it
    pub async fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        self.ticker = None;
        self.changes = None;

        if self.is_leader() {
            // Only clear the claim if it is still ours
            let ours = matches!(
                self.read_claim().await,
                Some(claim) if claim.id == self.id
            );
            if ours {
                if let Err(e) = self.store.remove(&self.key).await {
                    debug!("Failed to release claim for {}: {}", self.scope, e);
                } else {
                    info!(id = %self.id, scope = %self.scope, "Released leadership");
                }
            }
        }
        info!(id = %self.id, scope = %self.scope, "Stopped leader election");
    }

    /// Leader tick: step down only to another valid claim, otherwise refresh
    ///
    /// A missing, stale or unreadable claim is rewritten rather than treated
    /// as lost leadership.
    async fn heartbeat(&mut self) -> Vec<ElectionEvent> {
        let now = self.clock.now_ms();
        match self.read_claim().await {
            Some(claim) if claim.id != self.id && claim.is_valid(now, self.config.timeout_ms) => {
                self.apply(Some(claim.id))
            }
            _ => {
                self.write_claim().await;
                Vec::new()
            }
        }
    }

    /// Follower tick / start: take over when the claim is missing or stale
    async fn try_claim_if_expired(&mut self) -> Vec<ElectionEvent> {
        let mut events = self.read_leader().await;
        if self.leader_id.is_some() {
            return events;
        }

        debug!(id = %self.id, scope = %self.scope, "Claim missing or stale, attempting takeover");
        self.write_claim().await;
        events.extend(self.read_leader().await);
        events
    }

    async fn write_claim(&self) {
        let claim = LeaderClaim::new(self.id.clone(), self.clock.now_ms());
        if let Err(e) = self.store.set(&self.key, &claim.to_json()).await {
            debug!("Failed to write claim for {}: {}", self.scope, e);
        }
    }

    async fn read_claim(&self) -> Option<LeaderClaim> {
        match self.store.get(&self.key).await {
            Ok(Some(raw)) => LeaderClaim::parse(&raw),
            Ok(None) => None,
            Err(e) => {
                debug!("Failed to read claim for {}: {}", self.scope, e);
                None
            }
        }
    }

    /// Recompute the effective leader and report any transition
    async fn read_leader(&mut self) -> Vec<ElectionEvent> {
        let now = self.clock.now_ms();
        let next = self
            .read_claim()
            .await
            .filter(|claim| claim.is_valid(now, self.config.timeout_ms))
            .map(|claim| claim.id);
        self.apply(next)
    }

    fn apply(&mut self, next: Option<String>) -> Vec<ElectionEvent> {
        self.observed = true;
        if next == self.leader_id {
            return Vec::new();
        }
        self.leader_id = next.clone();

        let mut events = vec![ElectionEvent::LeadershipChanged {
            leader_id: next.clone(),
        }];
        if self.is_leader() {
            info!(id = %self.id, scope = %self.scope, "Acquired leadership");
            events.push(ElectionEvent::LeaderAcquired {
                id: self.id.clone(),
            });
        } else {
            info!(
                id = %self.id,
                scope = %self.scope,
                leader = next.as_deref().unwrap_or("none"),
                "Following"
            );
            events.push(ElectionEvent::LeaderLost { leader_id: next });
        }
        events
    }
}

async fn recv_change(
    rx: Option<&mut broadcast::Receiver<String>>,
) -> std::result::Result<String, RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
