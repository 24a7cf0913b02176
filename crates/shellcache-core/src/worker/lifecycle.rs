//! Install and activate handlers.

use futures::future::join_all;
use tracing::{info, warn};

use crate::models::Request;

use super::{VersionState, Worker, WorkerError};

/// What an activation did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivateReport {
    /// Superseded stores that were deleted.
    pub deleted: Vec<String>,
    /// Clients that switched to this version.
    pub claimed: usize,
}

impl Worker {
    /// Precache the asset manifest into this version's store.
    ///
    /// All-or-nothing: if any manifest entry cannot be fetched the worker
    /// becomes redundant and none of the batch is kept. A store created by
    /// this attempt is removed again so nothing named after the failed
    /// version lingers.
    pub(crate) async fn install(&self) -> Result<(), WorkerError> {
        self.transition(&[VersionState::Parsed], VersionState::Installing, "install")
            .await?;
        let version = self.config.version.clone();

        let result = async {
            let requests = self
                .config
                .manifest
                .iter()
                .map(|path| self.config.resolve(path).map(Request::get))
                .collect::<Result<Vec<_>, _>>()?;

            let existed = self.storage.has(&version).await?;
            let store = self.store().await?;
            if let Err(source) = store.add_all(&*self.network, &requests).await {
                if !existed {
                    if let Err(e) = self.storage.delete(&version).await {
                        warn!(version = %version, error = %e, "Failed to remove store after failed precache");
                    }
                }
                return Err(WorkerError::Precache {
                    version: version.clone(),
                    source,
                });
            }
            Ok::<usize, WorkerError>(requests.len())
        }
        .await;

        match result {
            Ok(count) => {
                self.transition(&[VersionState::Installing], VersionState::Installed, "finish install")
                    .await?;
                info!(version = %version, assets = count, "Precache complete");
                if self.config.skip_waiting_on_install {
                    self.skip_waiting();
                }
                Ok(())
            }
            Err(e) => {
                warn!(version = %version, error = %e, "Install failed");
                self.mark_redundant().await;
                Err(e)
            }
        }
    }

    /// Delete every store not named after this version, then claim all clients.
    ///
    /// Claiming only happens once every deletion has settled. If any deletion
    /// fails the worker returns to `Installed` and no client is claimed.
    pub(crate) async fn activate(&self) -> Result<ActivateReport, WorkerError> {
        self.transition(&[VersionState::Installed], VersionState::Activating, "activate")
            .await?;
        let version = self.config.version.as_str();

        let names = match self.storage.keys().await {
            Ok(names) => names,
            Err(e) => {
                self.transition(&[VersionState::Activating], VersionState::Installed, "abort activation")
                    .await?;
                return Err(e.into());
            }
        };
        let condemned: Vec<String> = names.into_iter().filter(|n| n != version).collect();

        // Every deletion runs to completion before any failure is reported
        let results = join_all(condemned.iter().map(|name| async move {
            self.storage
                .delete(name)
                .await
                .map_err(|source| WorkerError::StaleStoreDeletion {
                    name: name.clone(),
                    source,
                })
        }))
        .await;

        let mut deleted = Vec::with_capacity(condemned.len());
        let mut first_error = None;
        for (name, result) in condemned.into_iter().zip(results) {
            match result {
                Ok(_) => deleted.push(name),
                Err(e) => {
                    warn!(version, error = %e, "Stale store deletion failed");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        if let Some(e) = first_error {
            self.transition(&[VersionState::Activating], VersionState::Installed, "abort activation")
                .await?;
            return Err(e);
        }

        let claimed = self.clients.claim(version).await;
        self.transition(&[VersionState::Activating], VersionState::Activated, "finish activation")
            .await?;
        info!(version, deleted = ?deleted, claimed, "Activated");
        Ok(ActivateReport { deleted, claimed })
    }

    /// Resume as the active version after a restart, without reinstalling.
    /// Only valid for a fresh instance whose store already exists.
    pub async fn restore_active(&self) -> Result<(), WorkerError> {
        if !self.storage.has(&self.config.version).await? {
            return Err(WorkerError::InvalidState {
                version: self.config.version.clone(),
                action: "restore without a cache store",
                state: self.state().await,
            });
        }
        self.transition(&[VersionState::Parsed], VersionState::Activated, "restore")
            .await?;
        info!(version = %self.config.version, "Restored active version");
        Ok(())
    }
}
