use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::common::{self, Cli};
use super::poll::{self, PollPolicy};
use super::registry::RegistryBuilder;
use super::{LocationCache, Provider, Status};
use crate::error::{TundlerError, TundlerResult};
use crate::exec::CommandRunner;

pub const NAME: &str = "expressvpn";
const BIN: &str = "expressvpnctl";
const ACTIVATION_ENV: &str = "EXPRESSVPN_ACTIVATION_CODE";

const CONNECT_POLL: PollPolicy = PollPolicy::new(Duration::from_millis(250), Duration::from_secs(30));
const DISCONNECT_POLL: PollPolicy = PollPolicy::new(Duration::from_millis(250), Duration::from_secs(15));

/// ExpressVPN adapter (`expressvpnctl`)
pub struct ExpressVpn {
    cli: Cli,
    locations: LocationCache,
    connect_poll: PollPolicy,
    disconnect_poll: PollPolicy,
}

impl ExpressVpn {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            cli: Cli::new(BIN, runner),
            locations: LocationCache::default(),
            connect_poll: CONNECT_POLL,
            disconnect_poll: DISCONNECT_POLL,
        }
    }

    pub fn with_poll_policies(mut self, connect: PollPolicy, disconnect: PollPolicy) -> Self {
        self.connect_poll = connect;
        self.disconnect_poll = disconnect;
        self
    }

    /// `expressvpnctl get <key>`, trimmed
    async fn get(&self, key: &str) -> String {
        self.cli.output(&["get", key]).await.trim().to_string()
    }

    async fn fetch_locations(&self) -> Option<Vec<String>> {
        let out = self.cli.check(&["get", "regions"]).await.ok()?;
        let regions: Vec<String> = out.split_whitespace().map(str::to_string).collect();
        (!regions.is_empty()).then_some(regions)
    }
}

#[async_trait]
impl Provider for ExpressVpn {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn login(&self) -> TundlerResult<()> {
        let code = common::require_env(&[ACTIVATION_ENV])?.remove(0);
        if self.logged_in().await {
            debug!("ExpressVPN: already logged in");
            return Ok(());
        }

        let file = common::secret_file(&format!("{}\n", code))?;
        let path = file.path().to_string_lossy().into_owned();
        self.cli
            .check(&["login", &path])
            .await
            .map_err(|e| TundlerError::LoginFailed {
                provider: NAME.to_string(),
                reason: e.to_string(),
            })?;

        // Keep the daemon connected across sessions
        self.cli.quiet(&["background", "enable"]).await;
        info!("ExpressVPN: logged in");
        Ok(())
    }

    async fn logout(&self) -> TundlerResult<()> {
        if !self.logged_in().await {
            return Ok(());
        }
        self.cli.check(&["logout"]).await?;
        Ok(())
    }

    async fn logged_in(&self) -> bool {
        match self.cli.run(&["status"]).await {
            Ok(out) if out.success() => {
                !out.output.is_empty() && !out.output.contains("Not logged in")
            }
            _ => false,
        }
    }

    async fn connect(&self, location: &str) -> Status {
        let mut args = vec!["connect"];
        if !location.is_empty() {
            args.push(location);
        }
        self.cli.quiet(&args).await;
        poll::wait_connected("expressvpn connect", self.connect_poll, || self.status())
            .await
            .into_status()
    }

    async fn connected(&self) -> bool {
        self.get("connectionstate").await == "Connected"
    }

    async fn disconnect(&self) -> TundlerResult<()> {
        if !self.connected().await {
            return Ok(());
        }
        self.cli.check(&["disconnect"]).await?;
        poll::wait_disconnected("expressvpn disconnect", self.disconnect_poll, || self.status()).await;
        Ok(())
    }

    async fn locations(&self) -> Vec<String> {
        self.locations
            .get_or_refresh(|| self.fetch_locations())
            .await
            .unwrap_or_default()
    }

    async fn status(&self) -> Status {
        if !self.connected().await {
            return Status::disconnected();
        }
        let ip = common::first_ipv4(&self.get("vpnip").await);
        Status::connected(NAME, ip, Some(self.get("region").await))
    }

    async fn version(&self) -> TundlerResult<String> {
        common::parse_version(&self.cli.check(&["-v"]).await?)
    }

    async fn active_location(&self) -> String {
        if !self.connected().await {
            return String::new();
        }
        self.get("region").await
    }
}

/// Factory function to create an ExpressVPN adapter
pub fn create_provider(runner: Arc<dyn CommandRunner>) -> Arc<dyn Provider> {
    Arc::new(ExpressVpn::new(runner))
}

pub fn register(builder: RegistryBuilder, runner: Arc<dyn CommandRunner>) -> RegistryBuilder {
    builder.register_factory(create_provider, runner)
}
