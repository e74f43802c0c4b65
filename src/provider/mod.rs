//! Provider module for tundler
//!
//! This module collapses several mutually incompatible vendor VPN clients into
//! one capability contract.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │               Manager (Unified API)              │
//! └────────────────────────┬─────────────────────────┘
//!                          │ ProviderRegistry
//!     ┌──────────┬─────────┼─────────┬───────────┐
//!     ▼          ▼         ▼         ▼           ▼
//! ┌───────┐  ┌───────┐  ┌─────┐  ┌───────┐  ┌──────────┐
//! │mullvad│  │nordvpn│  │ pia │  │surfsh.│  │expressvpn│  <- Adapters
//! └───────┘  └───────┘  └─────┘  └───────┘  └──────────┘
//!                          │
//!                    CommandRunner
//! ```
//!
//! Each adapter implements the [`Provider`] trait. Vendor output parsing never
//! leaves the adapter: the Manager only sees [`Status`] values, booleans and
//! location lists.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use libtundler::exec::SystemRunner;
//! use libtundler::provider::registry;
//!
//! # async fn demo() {
//! let registry = registry::default_registry(Arc::new(SystemRunner::from_env()));
//! for (name, provider) in registry.iter() {
//!     println!("{}: logged in = {}", name, provider.logged_in().await);
//! }
//! # }
//! ```

pub mod cache;
pub mod common;
pub mod poll;
pub mod registry;

#[cfg(feature = "expressvpn")]
pub mod expressvpn;
#[cfg(feature = "mullvad")]
pub mod mullvad;
#[cfg(feature = "nordvpn")]
pub mod nordvpn;
#[cfg(feature = "pia")]
pub mod pia;
#[cfg(feature = "surfshark")]
pub mod surfshark;

pub use cache::LocationCache;
pub use poll::{PollOutcome, PollPolicy};
pub use registry::{ProviderRegistry, RegistryBuilder};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::TundlerResult;
use crate::exec::CommandRunner;

/// Snapshot of tunnel state.
///
/// Empty optional fields are omitted from JSON rather than serialised as null.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

impl Status {
    pub fn disconnected() -> Self {
        Self::default()
    }

    /// A connected snapshot; empty strings are stored as absent
    pub fn connected(provider: &str, ip: Option<String>, location: Option<String>) -> Self {
        Self {
            connected: true,
            ip: ip.filter(|s| !s.is_empty()),
            location: location.filter(|s| !s.is_empty()),
            provider: Some(provider.to_string()),
        }
    }

    /// `connected && ip present`
    pub fn is_established(&self) -> bool {
        self.connected && self.ip.is_some()
    }

    /// `!connected && ip absent`
    pub fn is_torn_down(&self) -> bool {
        !self.connected && self.ip.is_none()
    }

    pub fn with_provider(mut self, name: &str) -> Self {
        if self.provider.is_none() {
            self.provider = Some(name.to_string());
        }
        self
    }
}

/// Common interface that every vendor adapter must implement.
///
/// All operations are synchronous from the caller's point of view: they return
/// only once the underlying CLI command has finished or timed out.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    /// Unique lowercase provider name (e.g. "mullvad")
    fn name(&self) -> &'static str;

    /// Authenticate with environment-sourced credentials. Succeeds without
    /// side effects when already logged in.
    async fn login(&self) -> TundlerResult<()>;

    /// Clear credentials. Never fails just because the session is gone.
    async fn logout(&self) -> TundlerResult<()>;

    /// Current authentication state; "not logged in" is `false`, not an error
    async fn logged_in(&self) -> bool;

    /// Start or switch a tunnel; an empty location means provider default.
    /// A timeout shows up as `connected: false` in the returned status.
    async fn connect(&self, location: &str) -> Status;

    /// Cheap probe of the tunnel state
    async fn connected(&self) -> bool;

    /// Tear down any tunnel; a no-op when nothing is connected
    async fn disconnect(&self) -> TundlerResult<()>;

    /// Locations this backend currently understands
    async fn locations(&self) -> Vec<String>;

    /// Full snapshot, safe to call at any time
    async fn status(&self) -> Status;

    /// Backend client version
    async fn version(&self) -> TundlerResult<String>;

    /// Location in use, empty when disconnected
    async fn active_location(&self) -> String;
}

/// Factory function type for constructing adapters
pub type ProviderFactory = fn(Arc<dyn CommandRunner>) -> Arc<dyn Provider>;
