//! Provider registry
//!
//! The registry is built once at startup and is immutable afterwards, so the
//! Manager reads it concurrently without locking. Adapters register themselves
//! through their `register` function; which adapters exist is decided by cargo
//! features, never by the Manager.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use super::{Provider, ProviderFactory};
use crate::exec::CommandRunner;

/// Immutable mapping from provider name to adapter
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Provider>> {
        self.providers.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn Provider>)> {
        self.providers.iter().map(|(name, p)| (name.as_str(), p))
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.names())
            .finish()
    }
}

/// Collects adapters during initialization
#[derive(Default)]
pub struct RegistryBuilder {
    providers: BTreeMap<String, Arc<dyn Provider>>,
}

impl RegistryBuilder {
    /// Add an adapter under its own name. A second registration under the same
    /// name is ignored.
    pub fn register(mut self, provider: Arc<dyn Provider>) -> Self {
        let name = provider.name().to_string();
        if self.providers.contains_key(&name) {
            warn!("Provider {} registered twice, keeping the first", name);
            return self;
        }
        info!("Registering VPN provider: {}", name);
        self.providers.insert(name, provider);
        self
    }

    /// Construct an adapter from its factory and add it
    pub fn register_factory(self, factory: ProviderFactory, runner: Arc<dyn CommandRunner>) -> Self {
        self.register(factory(runner))
    }

    pub fn build(self) -> ProviderRegistry {
        ProviderRegistry {
            providers: self.providers,
        }
    }
}

/// Registry with every adapter compiled into this build
pub fn default_registry(runner: Arc<dyn CommandRunner>) -> ProviderRegistry {
    #[allow(unused_mut)]
    let mut builder = ProviderRegistry::builder();

    #[cfg(feature = "expressvpn")]
    {
        builder = super::expressvpn::register(builder, runner.clone());
    }
    #[cfg(feature = "mullvad")]
    {
        builder = super::mullvad::register(builder, runner.clone());
    }
    #[cfg(feature = "nordvpn")]
    {
        builder = super::nordvpn::register(builder, runner.clone());
    }
    #[cfg(feature = "pia")]
    {
        builder = super::pia::register(builder, runner.clone());
    }
    #[cfg(feature = "surfshark")]
    {
        builder = super::surfshark::register(builder, runner.clone());
    }

    let _ = runner;
    builder.build()
}
