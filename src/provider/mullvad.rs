use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::common::{self, Cli};
use super::poll::{self, PollPolicy};
use super::registry::RegistryBuilder;
use super::{LocationCache, Provider, Status};
use crate::error::{TundlerError, TundlerResult};
use crate::exec::CommandRunner;

pub const NAME: &str = "mullvad";
const BIN: &str = "mullvad";
const ACCOUNT_ENV: &str = "MULLVAD_ACCOUNT_NUMBER";

const CONNECT_POLL: PollPolicy = PollPolicy::new(Duration::from_millis(500), Duration::from_secs(30));
const DISCONNECT_POLL: PollPolicy = PollPolicy::new(Duration::from_millis(500), Duration::from_secs(15));

/// Mullvad VPN adapter (`mullvad` CLI)
pub struct Mullvad {
    cli: Cli,
    locations: LocationCache,
    connect_poll: PollPolicy,
    disconnect_poll: PollPolicy,
}

impl Mullvad {
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

    /// `--account` arguments for device commands, needed while logged out
    fn account_args(account: Option<&str>) -> Vec<&str> {
        match account {
            Some(acct) => vec!["--account", acct],
            None => Vec::new(),
        }
    }

    /// Revoke every device on the account to get under the device limit
    async fn revoke_all_devices(&self, account: &str) {
        let mut args = vec!["account", "list-devices", "-v"];
        args.extend(Self::account_args(Some(account)));
        let out = self.cli.output(&args).await;

        for id in parse_device_ids(&out) {
            info!("Mullvad: revoking device {}", id);
            let mut revoke = vec!["account", "revoke-device", id.as_str()];
            revoke.extend(Self::account_args(Some(account)));
            self.cli.quiet(&revoke).await;
        }
    }

    /// WireGuard public key of this device
    async fn device_key(&self) -> Option<String> {
        let out = self.cli.output(&["tunnel", "get"]).await;
        common::line_value(&out, "Public key:").filter(|k| !k.is_empty())
    }

    async fn device_id(&self, public_key: &str) -> Option<String> {
        let out = self.cli.output(&["account", "list-devices", "-v"]).await;
        find_device_id(&out, public_key)
    }

    async fn fetch_locations(&self) -> Option<Vec<String>> {
        let out = self.cli.check(&["relay", "list"]).await.ok()?;
        let codes = parse_relay_countries(&out);
        (!codes.is_empty()).then_some(codes)
    }

    fn parse_status(out: &str) -> Status {
        if !out.starts_with("Connected") {
            return Status::disconnected();
        }
        let ip = common::line_value(out, "Visible location:").and_then(|l| common::first_ipv4(&l));
        Status::connected(NAME, ip, common::line_value(out, "Relay:"))
    }
}

/// Country codes from `mullvad relay list`: the `(xx)` of unindented lines
fn parse_relay_countries(out: &str) -> Vec<String> {
    out.lines()
        .filter(|line| !line.starts_with('\t') && !line.starts_with(' '))
        .filter_map(|line| {
            let start = line.find('(')?;
            let end = line[start + 1..].find(')')?;
            let code = line[start + 1..start + 1 + end].trim();
            (!code.is_empty()).then(|| code.to_string())
        })
        .collect()
}

fn parse_device_ids(out: &str) -> Vec<String> {
    out.lines()
        .map(str::trim)
        .filter(|line| line.starts_with("Id"))
        .filter_map(|line| line.split_once(':'))
        .map(|(_, id)| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .collect()
}

fn find_device_id(out: &str, public_key: &str) -> Option<String> {
    let mut current = None;
    for line in out.lines().map(str::trim) {
        if line.starts_with("Id") {
            current = line.split_once(':').map(|(_, id)| id.trim().to_string());
        } else if let Some(key) = line.strip_prefix("Public key:") {
            if key.trim() == public_key {
                return current.filter(|id| !id.is_empty());
            }
        }
    }
    None
}

#[async_trait]
impl Provider for Mullvad {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn login(&self) -> TundlerResult<()> {
        let account = common::require_env(&[ACCOUNT_ENV])?.remove(0);
        if self.logged_in().await {
            debug!("Mullvad: already logged in");
            return Ok(());
        }

        let mut out = self.cli.run(&["account", "login", &account]).await?;
        if !out.success() {
            let lower = out.output.to_lowercase();
            if lower.contains("too many devices") || lower.contains("device limit") {
                warn!("Mullvad: device limit reached, revoking existing devices");
                self.revoke_all_devices(&account).await;
                out = self.cli.run(&["account", "login", &account]).await?;
            }
        }

        if !out.success() {
            return Err(TundlerError::LoginFailed {
                provider: NAME.to_string(),
                reason: out.output,
            });
        }
        info!("Mullvad: logged in");
        Ok(())
    }

    async fn logout(&self) -> TundlerResult<()> {
        if !self.logged_in().await {
            return Ok(());
        }
        if let Some(key) = self.device_key().await {
            if let Some(id) = self.device_id(&key).await {
                self.cli.quiet(&["account", "revoke-device", &id]).await;
            }
        }
        self.cli.check(&["account", "logout"]).await?;
        Ok(())
    }

    async fn logged_in(&self) -> bool {
        match self.cli.run(&["account", "get"]).await {
            Ok(out) => out.success() && !out.output.contains("Not logged in"),
            Err(_) => false,
        }
    }

    async fn connect(&self, location: &str) -> Status {
        if !location.is_empty() {
            self.cli.quiet(&["relay", "set", "location", location]).await;
        }
        self.cli.quiet(&["connect"]).await;
        poll::wait_connected("mullvad connect", self.connect_poll, || self.status())
            .await
            .into_status()
    }

    async fn connected(&self) -> bool {
        self.cli.output(&["status"]).await.starts_with("Connected")
    }

    async fn disconnect(&self) -> TundlerResult<()> {
        if !self.connected().await {
            return Ok(());
        }
        self.cli.check(&["disconnect"]).await?;
        poll::wait_disconnected("mullvad disconnect", self.disconnect_poll, || self.status()).await;
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

/// Factory function to create a Mullvad adapter
pub fn create_provider(runner: Arc<dyn CommandRunner>) -> Arc<dyn Provider> {
    Arc::new(Mullvad::new(runner))
}

pub fn register(builder: RegistryBuilder, runner: Arc<dyn CommandRunner>) -> RegistryBuilder {
    builder.register_factory(create_provider, runner)
}
