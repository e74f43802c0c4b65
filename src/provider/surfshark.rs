use async_trait::async_trait;
use directories::BaseDirs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::common::{self, Cli};
use super::poll::{self, PollPolicy};
use super::registry::RegistryBuilder;
use super::{Provider, Status};
use crate::error::{TundlerError, TundlerResult};
use crate::exec::{CommandRunner, Invocation};

pub const NAME: &str = "surfshark";
const BIN: &str = "surfshark-vpn";
const EMAIL_ENV: &str = "SURFSHARK_EMAIL";
const PASSWORD_ENV: &str = "SURFSHARK_PASSWORD";

const CONNECT_POLL: PollPolicy = PollPolicy::new(Duration::from_secs(1), Duration::from_secs(45));
const DISCONNECT_POLL: PollPolicy = PollPolicy::new(Duration::from_secs(1), Duration::from_secs(30));

/// Surfshark adapter (`surfshark-vpn`)
///
/// The CLI is interactive, so login is driven through `expect`. It also needs
/// host networking and never gets namespace wrapping.
pub struct Surfshark {
    cli: Cli,
    credentials_dir: Option<PathBuf>,
    connect_poll: PollPolicy,
    disconnect_poll: PollPolicy,
}

impl Surfshark {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            cli: Cli::new(BIN, runner).host_network(),
            credentials_dir: BaseDirs::new().map(|dirs| dirs.home_dir().join(".surfshark")),
            connect_poll: CONNECT_POLL,
            disconnect_poll: DISCONNECT_POLL,
        }
    }

    /// Look for the saved credentials somewhere other than `~/.surfshark`
    pub fn with_credentials_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.credentials_dir = Some(dir.into());
        self
    }

    pub fn with_poll_policies(mut self, connect: PollPolicy, disconnect: PollPolicy) -> Self {
        self.connect_poll = connect;
        self.disconnect_poll = disconnect;
        self
    }

    /// `expect` program answering the login prompts
    ///
    /// Credentials come from the environment `expect` inherits, never from
    /// the script text.
    fn login_script() -> String {
        format!(
            "set timeout 30\n\
             spawn {BIN}\n\
             expect \"email:\"\n\
             send -- \"$env({EMAIL_ENV})\\r\"\n\
             expect \"assword:\"\n\
             send -- \"$env({PASSWORD_ENV})\\r\"\n\
             expect eof"
        )
    }
}

/// Location from `surfshark-vpn status`, which has used several layouts
fn parse_location(out: &str) -> Option<String> {
    for line in out.lines().map(str::trim) {
        if line.to_lowercase().contains("connected to") {
            if let Some((_, loc)) = line.split_once(':') {
                let loc = loc.trim();
                if !loc.is_empty() {
                    return Some(loc.to_string());
                }
            }
        }
    }
    common::line_value(out, "Server:").or_else(|| common::line_value(out, "Location:"))
}

fn is_connected(out: &str) -> bool {
    let out = out.to_lowercase();
    out.contains("connected") && !out.contains("not connected") && !out.contains("disconnected")
}

#[async_trait]
impl Provider for Surfshark {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn login(&self) -> TundlerResult<()> {
        common::require_env(&[EMAIL_ENV, PASSWORD_ENV])?;
        if self.logged_in().await {
            debug!("Surfshark: already logged in");
            return Ok(());
        }

        let script = Self::login_script();
        let invocation = Invocation::new("expect", ["-c", script.as_str()]).host_network();
        let out = self.cli.exec(&invocation).await?;
        if !out.success() {
            return Err(TundlerError::LoginFailed {
                provider: NAME.to_string(),
                reason: out.output,
            });
        }
        info!("Surfshark: logged in");
        Ok(())
    }

    async fn logout(&self) -> TundlerResult<()> {
        if !self.logged_in().await {
            return Ok(());
        }
        self.cli.check(&["forget"]).await?;
        Ok(())
    }

    async fn logged_in(&self) -> bool {
        let Some(dir) = &self.credentials_dir else {
            warn!("Surfshark: cannot determine home directory");
            return false;
        };
        match tokio::fs::metadata(dir.join("credentials")).await {
            Ok(meta) => meta.is_file() && meta.len() > 0,
            Err(_) => false,
        }
    }

    async fn connect(&self, location: &str) -> Status {
        if location.is_empty() {
            self.cli.quiet(&["attack"]).await;
        } else {
            self.cli.quiet(&[location]).await;
        }
        poll::wait_connected("surfshark connect", self.connect_poll, || self.status())
            .await
            .into_status()
    }

    async fn connected(&self) -> bool {
        is_connected(&self.cli.output(&["status"]).await)
    }

    async fn disconnect(&self) -> TundlerResult<()> {
        if !self.connected().await {
            return Ok(());
        }
        self.cli.check(&["down"]).await?;
        poll::wait_disconnected("surfshark disconnect", self.disconnect_poll, || self.status()).await;
        Ok(())
    }

    /// The CLI offers no location listing
    async fn locations(&self) -> Vec<String> {
        Vec::new()
    }

    async fn status(&self) -> Status {
        let out = self.cli.output(&["status"]).await;
        if !is_connected(&out) {
            return Status::disconnected();
        }
        Status::connected(NAME, common::first_ipv4(&out), parse_location(&out))
    }

    async fn version(&self) -> TundlerResult<String> {
        match self.cli.check(&["version"]).await {
            Ok(out) => common::parse_version(&out),
            Err(_) => common::parse_version(&self.cli.check(&["--version"]).await?),
        }
    }

    async fn active_location(&self) -> String {
        parse_location(&self.cli.output(&["status"]).await).unwrap_or_default()
    }
}

/// Factory function to create a Surfshark adapter
pub fn create_provider(runner: Arc<dyn CommandRunner>) -> Arc<dyn Provider> {
    Arc::new(Surfshark::new(runner))
}

pub fn register(builder: RegistryBuilder, runner: Arc<dyn CommandRunner>) -> RegistryBuilder {
    builder.register_factory(create_provider, runner)
}
