//! Core rate decision engine.
//!
//! Each identity has two independent timers in the counter store: a window
//! counter that lives for exactly one second from the first request of the
//! window, and a block flag that lives for the block duration from the
//! first over-quota request. A block outlives any number of window resets.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::store::{CounterStore, StoreResult};

/// Length of a counter window.
pub const WINDOW: Duration = Duration::from_secs(1);

/// Value written to block flags; only their presence is meaningful.
const BLOCK_MARKER: &str = "1";

/// Store key of the block flag for an identity key.
pub fn block_key(key: &str) -> String {
    format!("block:{}", key)
}

/// How a block flag is established once an identity exceeds its quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockFlagMode {
    /// Read the flag, then write it if absent.
    ///
    /// Two concurrent over-quota requests can both observe no flag and both
    /// write it, re-stamping its expiry a few requests after the first
    /// violation. Admission decisions are unaffected.
    #[default]
    CheckThenSet,
    /// Create the flag with a single conditional write.
    SetIfAbsent,
}

impl FromStr for BlockFlagMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "check_then_set" => Ok(BlockFlagMode::CheckThenSet),
            "set_if_absent" => Ok(BlockFlagMode::SetIfAbsent),
            other => Err(format!("unknown block flag mode: {}", other)),
        }
    }
}

/// Why a request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// The window counter exceeded the limit on this request
    OverQuota,
    /// The identity is serving out a block from an earlier violation
    Blocked,
}

/// Outcome of evaluating one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request may proceed
    Admit,
    /// The request must be rejected
    Deny(DenyReason),
}

impl Decision {
    /// Whether the request may proceed.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admit)
    }
}

/// Evaluates requests against quotas using a shared counter store.
///
/// The engine holds no per-identity state of its own, so any number of
/// engines, in one process or many, can share a store.
#[derive(Clone)]
pub struct RateDecisionEngine {
    store: Arc<dyn CounterStore>,
    block_mode: BlockFlagMode,
}

impl RateDecisionEngine {
    /// Create an engine using the default block flag mode.
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self::with_block_mode(store, BlockFlagMode::default())
    }

    /// Create an engine with an explicit block flag mode.
    pub fn with_block_mode(store: Arc<dyn CounterStore>, block_mode: BlockFlagMode) -> Self {
        Self { store, block_mode }
    }

    /// Count a request against `key` and decide whether it is admitted.
    ///
    /// Any store failure is returned as an error; callers must treat it as
    /// a denial. The increment is never rolled back.
    pub async fn evaluate(
        &self,
        key: &str,
        limit: u64,
        block_duration: Duration,
    ) -> StoreResult<Decision> {
        let count = self.store.increment(key).await?;
        if count == 1 {
            self.store.set_expiry(key, WINDOW).await?;
        }

        trace!(key = %key, count = count, limit = limit, "Evaluated window counter");

        let block_key = block_key(key);

        if u64::try_from(count).unwrap_or(0) > limit {
            self.establish_block(&block_key, block_duration).await?;
            debug!(key = %key, count = count, limit = limit, "Rate limit exceeded");
            return Ok(Decision::Deny(DenyReason::OverQuota));
        }

        if self.store.get(&block_key).await?.is_some() {
            debug!(key = %key, "Identity is blocked");
            return Ok(Decision::Deny(DenyReason::Blocked));
        }

        Ok(Decision::Admit)
    }

    /// Create the block flag unless one is already live.
    async fn establish_block(&self, block_key: &str, block_duration: Duration) -> StoreResult<()> {
        // A zero duration would expire immediately; Redis rejects it outright.
        if block_duration.is_zero() {
            return Ok(());
        }

        let created = match self.block_mode {
            BlockFlagMode::CheckThenSet => {
                if self.store.get(block_key).await?.is_some() {
                    false
                } else {
                    self.store
                        .set_with_expiry(block_key, BLOCK_MARKER, block_duration)
                        .await?;
                    true
                }
            }
            BlockFlagMode::SetIfAbsent => {
                self.store
                    .set_if_absent(block_key, BLOCK_MARKER, block_duration)
                    .await?
            }
        };

        if created {
            debug!(
                block_key = %block_key,
                duration_secs = block_duration.as_secs(),
                "Block flag created"
            );
        }
        Ok(())
    }
}

impl std::fmt::Debug for RateDecisionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateDecisionEngine")
            .field("block_mode", &self.block_mode)
            .finish_non_exhaustive()
    }
}
