use std::collections::BTreeSet;
use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};
use log::info;
use web3::types::Address;

use crate::chain::ChainClient;
use crate::error::SnapshotError;
use crate::types::{EMode, Result, UserEMode};

/// Reads users' efficiency-mode assignments and the referenced categories.
pub struct EModeResolver {
    client: Arc<dyn ChainClient>,
    concurrency: usize,
}

impl EModeResolver {
    pub fn new(client: Arc<dyn ChainClient>, concurrency: usize) -> Self {
        Self {
            client,
            concurrency: concurrency.max(1),
        }
    }

    /// Mode id of every user, in input order. The first failed lookup aborts
    /// the whole call: later joins need an id for every user.
    pub async fn resolve_users(&self, users: &[Address], block_number: u64) -> Result<Vec<UserEMode>> {
        let modes: Vec<UserEMode> = stream::iter(users.iter().copied())
            .map(|user| async move {
                let emode_id = self
                    .client
                    .get_user_risk_mode(user, block_number)
                    .await
                    .map_err(|source| SnapshotError::ModeResolution { user, source })?;
                Ok::<_, SnapshotError>(UserEMode {
                    user_address: user,
                    snapshot_block: block_number,
                    emode_id,
                })
            })
            .buffered(self.concurrency)
            .try_collect()
            .await?;

        info!(
            "[EModeResolver::resolve_users] Resolved {} users at block {} ({} in a non-zero mode)",
            modes.len(),
            block_number,
            modes.iter().filter(|m| m.emode_id != 0).count()
        );
        Ok(modes)
    }

    /// Label and collateral configuration for each id, in ascending id order.
    pub async fn resolve_categories(
        &self,
        emode_ids: &BTreeSet<u8>,
        block_number: u64,
    ) -> Result<Vec<EMode>> {
        let mut categories = Vec::with_capacity(emode_ids.len());
        for &id in emode_ids {
            let (config, label) = futures::try_join!(
                self.client.get_risk_mode_config(id, block_number),
                self.client.get_risk_mode_label(id, block_number),
            )?;

            categories.push(EMode {
                id,
                label,
                ltv: config.ltv,
                liquidation_threshold: config.liquidation_threshold,
                liquidation_bonus: config.liquidation_bonus,
            });
        }

        info!(
            "[EModeResolver::resolve_categories] Resolved {} categories at block {}",
            categories.len(),
            block_number
        );
        Ok(categories)
    }
}

/// Distinct ids referenced by `modes`, optionally without the default mode 0.
pub fn distinct_ids(modes: &[UserEMode], include_zero: bool) -> BTreeSet<u8> {
    modes
        .iter()
        .map(|m| m.emode_id)
        .filter(|id| include_zero || *id != 0)
        .collect()
}
