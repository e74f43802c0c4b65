use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::common::{self, Cli};
use super::poll::{self, PollPolicy};
use super::registry::RegistryBuilder;
use super::{LocationCache, Provider, Status};
use crate::error::{TundlerError, TundlerResult};
use crate::exec::CommandRunner;

pub const NAME: &str = "privateinternetaccess";
const BIN: &str = "piactl";
const USERNAME_ENV: &str = "PRIVATEINTERNETACCESS_USERNAME";
const PASSWORD_ENV: &str = "PRIVATEINTERNETACCESS_PASSWORD";

/// The PIA daemon can take ~60s to bring its network stack up
const LOGIN_TIMEOUT_SECS: &str = "90";
const LOGIN_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

const CONNECT_POLL: PollPolicy = PollPolicy::new(Duration::from_secs(1), Duration::from_secs(60));
const DISCONNECT_POLL: PollPolicy = PollPolicy::new(Duration::from_secs(1), Duration::from_secs(30));

/// Private Internet Access adapter (`piactl`)
///
/// `piactl` has no way to query the login state, so the adapter mirrors it in
/// memory. The mirror starts out false after every restart.
pub struct Pia {
    cli: Cli,
    logged_in: RwLock<bool>,
    locations: LocationCache,
    connect_poll: PollPolicy,
    disconnect_poll: PollPolicy,
}

impl Pia {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            cli: Cli::new(BIN, runner),
            logged_in: RwLock::new(false),
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

    async fn region(&self) -> String {
        self.cli.output(&["get", "region"]).await.trim().to_string()
    }

    async fn vpn_ip(&self) -> Option<String> {
        let out = self.cli.check(&["get", "vpnip"]).await.ok()?;
        common::first_ipv4(&out)
    }

    async fn fetch_locations(&self) -> Option<Vec<String>> {
        let out = self.cli.check(&["get", "regions"]).await.ok()?;
        let regions: Vec<String> = out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect();
        (!regions.is_empty()).then_some(regions)
    }
}

#[async_trait]
impl Provider for Pia {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn login(&self) -> TundlerResult<()> {
        let creds = common::require_env(&[USERNAME_ENV, PASSWORD_ENV])?;

        self.cli.quiet(&["background", "enable"]).await;
        if self.logged_in().await {
            debug!("PIA: already logged in");
            return Ok(());
        }

        // Holds the write lock so concurrent logins run piactl once
        let mut logged_in = self.logged_in.write().await;
        if *logged_in {
            return Ok(());
        }

        let file = common::secret_file(&format!("{}\n{}", creds[0], creds[1]))?;
        let path = file.path().to_string_lossy().into_owned();
        let out = self
            .cli
            .run_with_timeout(&["--timeout", LOGIN_TIMEOUT_SECS, "login", &path], LOGIN_COMMAND_TIMEOUT)
            .await?;
        debug!("PIA: login output: {}", out.output);

        // piactl exits non-zero when the account is already logged in
        if out.success() || out.output.contains("Already logged into account") {
            *logged_in = true;
            info!("PIA: logged in");
            return Ok(());
        }

        Err(TundlerError::LoginFailed {
            provider: NAME.to_string(),
            reason: out.output,
        })
    }

    async fn logout(&self) -> TundlerResult<()> {
        *self.logged_in.write().await = false;
        self.cli.check(&["logout"]).await?;
        Ok(())
    }

    async fn logged_in(&self) -> bool {
        *self.logged_in.read().await
    }

    async fn connect(&self, location: &str) -> Status {
        if !location.is_empty() {
            debug!("PIA: setting region to {}", location);
            self.cli.quiet(&["set", "region", location]).await;
        }
        self.cli.quiet(&["connect"]).await;
        poll::wait_connected("pia connect", self.connect_poll, || self.status())
            .await
            .into_status()
    }

    async fn connected(&self) -> bool {
        match self.cli.run(&["get", "connectionstate"]).await {
            Ok(out) if out.success() => {
                let state = out.output.trim().to_lowercase();
                !state.is_empty() && !state.contains("disconnected")
            }
            _ => false,
        }
    }

    async fn disconnect(&self) -> TundlerResult<()> {
        if !self.connected().await {
            return Ok(());
        }
        self.cli.check(&["disconnect"]).await?;
        poll::wait_disconnected("pia disconnect", self.disconnect_poll, || self.status()).await;
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
        let location = self.region().await;
        Status::connected(NAME, self.vpn_ip().await, Some(location))
    }

    async fn version(&self) -> TundlerResult<String> {
        common::parse_version(&self.cli.check(&["--version"]).await?)
    }

    async fn active_location(&self) -> String {
        if !self.connected().await {
            return String::new();
        }
        self.region().await
    }
}

/// Factory function to create a PIA adapter
pub fn create_provider(runner: Arc<dyn CommandRunner>) -> Arc<dyn Provider> {
    Arc::new(Pia::new(runner))
}

pub fn register(builder: RegistryBuilder, runner: Arc<dyn CommandRunner>) -> RegistryBuilder {
    builder.register_factory(create_provider, runner)
}
