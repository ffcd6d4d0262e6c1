//! State shared by the hub components.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use crate::config::EngineLimits;
use crate::error::{HubError, Result};
use crate::events::EventBus;
use crate::ledger::LedgerClient;
use crate::store::{get_json, keys, Store};
use crate::types::{Hub, HubId, SecurityLevel};

/// Hot-wallet settings of the engine.
#[derive(Clone)]
pub struct EngineConfig {
    pub hot_wallet_seed: String,
    pub hot_wallet_security: SecurityLevel,
    pub limits: EngineLimits,
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("hot_wallet_security", &self.hot_wallet_security)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl TryFrom<&crate::config::HubConfig> for EngineConfig {
    type Error = anyhow::Error;

    fn try_from(config: &crate::config::HubConfig) -> anyhow::Result<Self> {
        config.limits.validate()?;
        Ok(Self {
            hot_wallet_seed: config.hot_wallet_seed.clone(),
            hot_wallet_security: config.security()?,
            limits: config.limits.clone(),
        })
    }
}

/// A hub registered with this process.
#[derive(Debug, Clone)]
pub(crate) struct AttachedHub {
    pub hub: Hub,
    /// Credited sweeps may still sit in the pending list.
    pub not_even_with_db: bool,
}

/// Collaborators and process-local state of a [`HubEngine`](super::HubEngine).
pub struct HubContext {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) ledger: Arc<dyn LedgerClient>,
    pub(crate) config: EngineConfig,
    pub(crate) events: EventBus,
    attached: RwLock<HashMap<HubId, AttachedHub>>,
}

impl HubContext {
    pub(crate) fn new(
        store: Arc<dyn Store>,
        ledger: Arc<dyn LedgerClient>,
        config: EngineConfig,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            ledger,
            config,
            events,
            attached: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub(crate) fn limits(&self) -> &EngineLimits {
        &self.config.limits
    }

    fn registry(&self) -> RwLockReadGuard<'_, HashMap<HubId, AttachedHub>> {
        self.attached
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn registry_mut(&self) -> RwLockWriteGuard<'_, HashMap<HubId, AttachedHub>> {
        self.attached
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn attach(&self, hub: Hub) -> Result<()> {
        let mut registry = self.registry_mut();
        if registry.contains_key(&hub.id) {
            return Err(HubError::AlreadyAttached(hub.id));
        }
        registry.insert(
            hub.id,
            AttachedHub {
                hub,
                not_even_with_db: false,
            },
        );
        Ok(())
    }

    pub(crate) fn detach(&self, id: HubId) -> Result<()> {
        self.registry_mut()
            .remove(&id)
            .map(|_| ())
            .ok_or(HubError::NotAttached(id))
    }

    pub(crate) fn is_attached(&self, id: HubId) -> bool {
        self.registry().contains_key(&id)
    }

    pub(crate) fn attached_hub(&self, id: HubId) -> Result<Hub> {
        self.registry()
            .get(&id)
            .map(|attached| attached.hub.clone())
            .ok_or(HubError::NotAttached(id))
    }

    pub(crate) fn attached_ids(&self) -> Vec<HubId> {
        let mut ids: Vec<HubId> = self.registry().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub(crate) fn is_not_even_with_db(&self, id: HubId) -> bool {
        self.registry()
            .get(&id)
            .map(|attached| attached.not_even_with_db)
            .unwrap_or(false)
    }

    pub(crate) fn set_not_even_with_db(&self, id: HubId, value: bool) -> Result<()> {
        let mut registry = self.registry_mut();
        let attached = registry.get_mut(&id).ok_or(HubError::NotAttached(id))?;
        attached.not_even_with_db = value;
        Ok(())
    }

    /// The hub record, from the registry when attached or else from the store.
    pub(crate) async fn load_hub(&self, id: HubId) -> Result<Hub> {
        if let Ok(hub) = self.attached_hub(id) {
            return Ok(hub);
        }
        get_json::<Hub>(self.store(), &keys::hub(id))
            .await?
            .ok_or(HubError::HubNotFound(id))
    }
}
