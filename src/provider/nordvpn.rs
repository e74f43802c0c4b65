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

pub const NAME: &str = "nordvpn";
const BIN: &str = "nordvpn";
const TOKEN_ENV: &str = "NORDVPN_TOKEN";

const CONNECT_POLL: PollPolicy = PollPolicy::new(Duration::from_secs(1), Duration::from_secs(30));
const DISCONNECT_POLL: PollPolicy = PollPolicy::new(Duration::from_secs(1), Duration::from_secs(15));

/// NordVPN adapter (`nordvpn` CLI)
pub struct NordVpn {
    cli: Cli,
    locations: LocationCache,
    connect_poll: PollPolicy,
    disconnect_poll: PollPolicy,
}

impl NordVpn {
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

    async fn fetch_locations(&self) -> Option<Vec<String>> {
        let out = self.cli.check(&["countries"]).await.ok()?;
        let countries = parse_countries(&out);
        (!countries.is_empty()).then_some(countries)
    }

    fn parse_status(out: &str) -> Status {
        if !out.contains("Status: Connected") {
            return Status::disconnected();
        }
        let ip = common::line_value(out, "IP:")
            .and_then(|l| common::first_ipv4(&l))
            .or_else(|| common::first_ipv4(out));
        Status::connected(NAME, ip, common::line_value(out, "Country:"))
    }
}

/// `nordvpn countries` prints names separated by whitespace and commas,
/// sometimes preceded by a spinner
fn parse_countries(out: &str) -> Vec<String> {
    out.split(|c: char| c.is_whitespace() || c == ',')
        .map(str::trim)
        .filter(|tok| tok.chars().next().is_some_and(|c| c.is_ascii_alphabetic()))
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl Provider for NordVpn {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn login(&self) -> TundlerResult<()> {
        let token = common::require_env(&[TOKEN_ENV])?.remove(0);
        if self.logged_in().await {
            debug!("NordVPN: already logged in");
            return Ok(());
        }
        self.cli
            .check(&["login", "--token", &token])
            .await
            .map_err(|e| TundlerError::LoginFailed {
                provider: NAME.to_string(),
                reason: e.to_string(),
            })?;
        info!("NordVPN: logged in");
        Ok(())
    }

    async fn logout(&self) -> TundlerResult<()> {
        if !self.logged_in().await {
            return Ok(());
        }
        self.cli.check(&["logout", "--persist-token"]).await?;
        Ok(())
    }

    async fn logged_in(&self) -> bool {
        self.cli
            .output(&["login"])
            .await
            .contains("You are already logged in.")
    }

    async fn connect(&self, location: &str) -> Status {
        let mut args = vec!["connect"];
        if !location.is_empty() {
            args.push(location);
        }
        self.cli.quiet(&args).await;
        poll::wait_connected("nordvpn connect", self.connect_poll, || self.status())
            .await
            .into_status()
    }

    async fn connected(&self) -> bool {
        self.cli.output(&["status"]).await.contains("Status: Connected")
    }

    async fn disconnect(&self) -> TundlerResult<()> {
        if !self.connected().await {
            return Ok(());
        }
        self.cli.check(&["disconnect"]).await?;
        poll::wait_disconnected("nordvpn disconnect", self.disconnect_poll, || self.status()).await;
        Ok(())
    }

    async fn locations(&self) -> Vec<String> {
        self.locations
            .get_or_refresh(|| self.fetch_locations())
            .await
            .unwrap_or_default()
    }

    async fn status(&self) -> Status {
        Self::parse_status(&self.cli.output(&["status"]).await)
    }

    async fn version(&self) -> TundlerResult<String> {
        common::parse_version(&self.cli.check(&["--version"]).await?)
    }

    async fn active_location(&self) -> String {
        self.status().await.location.unwrap_or_default()
    }
}

/// Factory function to create a NordVPN adapter
pub fn create_provider(runner: Arc<dyn CommandRunner>) -> Arc<dyn Provider> {
    Arc::new(NordVpn::new(runner))
}

pub fn register(builder: RegistryBuilder, runner: Arc<dyn CommandRunner>) -> RegistryBuilder {
    builder.register_factory(create_provider, runner)
}
