use std::sync::Arc;

use log::{debug, info};

use crate::chain::ChainClient;
use crate::error::SnapshotError;
use crate::types::Result;

/// Upper bound on bisection rounds; a u64 range halves to adjacency in 64.
pub const MAX_BISECTION_ITERATIONS: u32 = 128;

/// Maps a unix timestamp to the last block produced at or before it.
pub struct BlockLocator {
    client: Arc<dyn ChainClient>,
    max_step_backs: u32,
}

impl BlockLocator {
    pub fn new(client: Arc<dyn ChainClient>, max_step_backs: u32) -> Self {
        Self {
            client,
            max_step_backs,
        }
    }

    /// Returns the greatest `b` with `timestamp(b) <= target < timestamp(b + 1)`.
    ///
    /// Walks back from `initial_block` in `step`-sized jumps until the target is
    /// bracketed, then bisects. Requires non-decreasing block timestamps and
    /// fails with `BlockSearch` instead of looping when that does not hold.
    pub async fn locate(&self, target_timestamp: u64, initial_block: u64, step: u64) -> Result<u64> {
        if step == 0 {
            return Err(SnapshotError::BlockSearch("step must be positive".to_string()));
        }

        let mut upper = initial_block;
        let mut lower = initial_block.checked_sub(step).ok_or_else(|| {
            SnapshotError::BlockSearch(format!(
                "initial block {} is less than one step ({}) above genesis",
                initial_block, step
            ))
        })?;
        let mut lower_ts = self.timestamp(lower).await?;

        let mut step_backs = 0u32;
        while lower_ts > target_timestamp {
            step_backs += 1;
            if step_backs > self.max_step_backs {
                return Err(SnapshotError::BlockSearch(format!(
                    "no block at or before timestamp {} within {} steps of {}",
                    target_timestamp, self.max_step_backs, initial_block
                )));
            }
            upper = lower;
            lower = lower.checked_sub(step).ok_or_else(|| {
                SnapshotError::BlockSearch(format!(
                    "timestamp {} predates the chain's first blocks",
                    target_timestamp
                ))
            })?;
            lower_ts = self.timestamp(lower).await?;
        }

        let mut upper_ts = self.timestamp(upper).await?;
        if upper_ts <= target_timestamp {
            return Err(SnapshotError::BlockSearch(format!(
                "timestamp {} is not before block {} (timestamp {})",
                target_timestamp, upper, upper_ts
            )));
        }

        debug!(
            "[BlockLocator::locate] Bracket [{}, {}] after {} step-backs",
            lower, upper, step_backs
        );

        let mut iterations = 0u32;
        while upper - lower > 1 {
            iterations += 1;
            if iterations > MAX_BISECTION_ITERATIONS {
                return Err(SnapshotError::BlockSearch(format!(
                    "bisection did not converge within {} iterations",
                    MAX_BISECTION_ITERATIONS
                )));
            }

            let mid = lower + (upper - lower) / 2;
            let mid_ts = self.timestamp(mid).await?;
            if mid_ts < lower_ts || mid_ts > upper_ts {
                return Err(SnapshotError::BlockSearch(format!(
                    "timestamps are not monotonic: block {} has {}, outside [{}, {}] of blocks {}..{}",
                    mid, mid_ts, lower_ts, upper_ts, lower, upper
                )));
            }

            if mid_ts <= target_timestamp {
                lower = mid;
                lower_ts = mid_ts;
            } else {
                upper = mid;
                upper_ts = mid_ts;
            }
        }

        info!(
            "[BlockLocator::locate] Timestamp {} -> block {} ({} bisection rounds)",
            target_timestamp, lower, iterations
        );
        Ok(lower)
    }

    async fn timestamp(&self, block: u64) -> Result<u64> {
        Ok(self.client.block_timestamp(block).await?)
    }
}
