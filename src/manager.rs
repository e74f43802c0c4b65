//! Provider orchestration
//!
//! The Manager is the only place that knows about more than one provider. It
//! picks a provider and location, keeps at most one tunnel up, and
//! reconciles status across adapters. It never parses vendor output.
//!
//! Mutating operations (`connect`, `disconnect`, `login`, `logout`) take a
//! per-provider lock, so two requests never drive the same vendor CLI at the
//! same time. No call ever holds more than one of these locks.
//!
//! `connect` and `disconnect` also hold the tunnel lock for their whole run,
//! so at most one of them changes the live tunnel at a time. It is always
//! taken before any provider lock.

use futures::future::join_all;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::error::{TundlerError, TundlerResult};
use crate::provider::{Provider, ProviderRegistry, Status};
use crate::telemetry::{NoopTelemetry, Telemetry};

/// Reported for a provider whose version cannot be determined
pub const UNKNOWN_VERSION: &str = "unknown";

/// Entry of [`Manager::list`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub logged_in: bool,
    pub version: String,
}

pub struct Manager {
    registry: ProviderRegistry,
    /// Per-provider location allow-lists, already checked against the live lists
    allowed_locations: HashMap<String, Vec<String>>,
    telemetry: Arc<dyn Telemetry>,
    locks: HashMap<String, Mutex<()>>,
    tunnel: Mutex<()>,
}

impl Manager {
    pub fn new(
        registry: ProviderRegistry,
        allowed_locations: HashMap<String, Vec<String>>,
        telemetry: Arc<dyn Telemetry>,
    ) -> Self {
        let locks = registry
            .names()
            .into_iter()
            .map(|name| (name, Mutex::new(())))
            .collect();
        Self {
            registry,
            allowed_locations,
            telemetry,
            locks,
            tunnel: Mutex::new(()),
        }
    }

    /// Manager without allow-lists or telemetry
    pub fn with_registry(registry: ProviderRegistry) -> Self {
        Self::new(registry, HashMap::new(), Arc::new(NoopTelemetry))
    }

    fn provider(&self, name: &str) -> TundlerResult<&Arc<dyn Provider>> {
        self.registry
            .get(name)
            .ok_or_else(|| TundlerError::UnknownProvider(name.to_string()))
    }

    async fn exclusive(&self, name: &str) -> Option<MutexGuard<'_, ()>> {
        match self.locks.get(name) {
            Some(lock) => Some(lock.lock().await),
            None => None,
        }
    }

    /// First provider reporting a live tunnel
    async fn connected_provider(&self) -> Option<&Arc<dyn Provider>> {
        let probes = self
            .registry
            .iter()
            .map(|(_, p)| async move { p.connected().await.then_some(p) });
        join_all(probes).await.into_iter().flatten().next()
    }

    async fn logged_in_providers(&self) -> Vec<&Arc<dyn Provider>> {
        let probes = self
            .registry
            .iter()
            .map(|(_, p)| async move { p.logged_in().await.then_some(p) });
        join_all(probes).await.into_iter().flatten().collect()
    }

    /// Allow-list when one is configured, else whatever the provider offers
    async fn candidate_locations(&self, provider: &dyn Provider) -> Vec<String> {
        match self.allowed_locations.get(provider.name()) {
            Some(allowed) if !allowed.is_empty() => allowed.clone(),
            _ => provider.locations().await,
        }
    }

    async fn pick_location(&self, provider: &dyn Provider) -> String {
        let candidates = self.candidate_locations(provider).await;
        candidates
            .choose(&mut rand::thread_rng())
            .cloned()
            .unwrap_or_default()
    }

    async fn resolve_target(&self, name: &str) -> TundlerResult<Arc<dyn Provider>> {
        if !name.is_empty() {
            let provider = self.provider(name)?;
            if !provider.logged_in().await {
                return Err(TundlerError::ProviderNotLoggedIn(name.to_string()));
            }
            return Ok(provider.clone());
        }

        let logged_in = self.logged_in_providers().await;
        logged_in
            .choose(&mut rand::thread_rng())
            .map(|&p| p.clone())
            .ok_or(TundlerError::NoLoggedInProviders)
    }

    /// Bring up a tunnel, tearing down any existing one first
    ///
    /// Fails without connecting when the old tunnel cannot be torn down.
    ///
    /// An empty `provider` picks a random logged-in provider, an empty
    /// `location` a random location of that provider (or the provider's own
    /// default when it lists none). A connect that times out is not an error:
    /// the returned status has `connected == false`.
    pub async fn connect(&self, provider: &str, location: &str) -> TundlerResult<Status> {
        let target = self.resolve_target(provider).await?;
        let name = target.name();
        let _tunnel = self.tunnel.lock().await;

        if let Some(current) = self.connected_provider().await {
            info!("Disconnecting {} before connecting {}", current.name(), name);
            let _guard = self.exclusive(current.name()).await;
            if let Err(e) = current.disconnect().await {
                if current.connected().await {
                    warn!("{} is still connected, not connecting {}", current.name(), name);
                    return Err(e);
                }
                warn!("Failed to disconnect {}: {}", current.name(), e);
            }
        }

        let location = if location.is_empty() {
            self.pick_location(target.as_ref()).await
        } else {
            location.to_string()
        };

        let _guard = self.exclusive(name).await;
        info!("Connecting {} (location: {:?})", name, location);
        let status = target.connect(&location).await.with_provider(name);

        if status.connected {
            info!("Connected via {} ({:?})", name, status.ip);
            let reported = status.location.as_deref().unwrap_or(location.as_str());
            self.telemetry
                .record_connect(name, reported, status.ip.as_deref());
        } else {
            warn!("{} did not report a tunnel in time", name);
        }
        Ok(status)
    }

    /// Tear down the active tunnel, if any
    pub async fn disconnect(&self) -> TundlerResult<()> {
        let _tunnel = self.tunnel.lock().await;
        let Some(current) = self.connected_provider().await else {
            debug!("Nothing to disconnect");
            return Ok(());
        };
        let _guard = self.exclusive(current.name()).await;
        info!("Disconnecting {}", current.name());
        current.disconnect().await
    }

    /// Every registered provider with its login state and client version
    pub async fn list(&self) -> BTreeMap<String, ProviderInfo> {
        let entries = self.registry.iter().map(|(name, p)| async move {
            let (logged_in, version) = tokio::join!(p.logged_in(), p.version());
            let version = version.unwrap_or_else(|e| {
                warn!("Could not determine {} version: {}", name, e);
                UNKNOWN_VERSION.to_string()
            });
            (name.to_string(), ProviderInfo { logged_in, version })
        });
        join_all(entries).await.into_iter().collect()
    }

    /// Log in one provider, or every provider when `name` is empty
    ///
    /// The fan-out form succeeds when at least one provider ends up logged in.
    pub async fn login(&self, name: &str) -> TundlerResult<()> {
        if !name.is_empty() {
            let provider = self.provider(name)?;
            let _guard = self.exclusive(name).await;
            return provider.login().await;
        }

        let attempts = self.registry.iter().map(|(name, p)| async move {
            let _guard = self.exclusive(name).await;
            match p.login().await {
                Ok(()) => true,
                Err(e) => {
                    warn!("Login failed for {}: {}", name, e);
                    false
                }
            }
        });
        if join_all(attempts).await.into_iter().any(|ok| ok) {
            Ok(())
        } else {
            Err(TundlerError::NoLoggedInProviders)
        }
    }

    /// Log out one provider, or every logged-in provider when `name` is empty
    ///
    /// The fan-out form attempts all of them and returns the first failure.
    pub async fn logout(&self, name: &str) -> TundlerResult<()> {
        if !name.is_empty() {
            let provider = self.provider(name)?;
            let _guard = self.exclusive(name).await;
            if !provider.logged_in().await {
                return Err(TundlerError::ProviderNotLoggedIn(name.to_string()));
            }
            return provider.logout().await;
        }

        let logged_in = self.logged_in_providers().await;
        if logged_in.is_empty() {
            return Err(TundlerError::NoLoggedInProviders);
        }

        let mut first_err = None;
        for provider in logged_in {
            let _guard = self.exclusive(provider.name()).await;
            if let Err(e) = provider.logout().await {
                warn!("Logout failed for {}: {}", provider.name(), e);
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Status of the connected provider, else of a logged-in one
    pub async fn status(&self) -> TundlerResult<Status> {
        if let Some(current) = self.connected_provider().await {
            return Ok(current.status().await.with_provider(current.name()));
        }

        let logged_in = self.logged_in_providers().await;
        let provider = logged_in.first().ok_or(TundlerError::NoLoggedInProviders)?;
        let status = provider.status().await;
        if status.connected {
            Ok(status.with_provider(provider.name()))
        } else {
            Ok(Status {
                provider: None,
                ..status
            })
        }
    }

    /// Locations per provider: the allow-list when configured, else the live list
    pub async fn locations(&self) -> BTreeMap<String, Vec<String>> {
        let entries = self.registry.iter().map(|(name, p)| async move {
            (name.to_string(), self.candidate_locations(p.as_ref()).await)
        });
        join_all(entries).await.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MockProvider;
    use std::sync::Mutex as StdMutex;

    fn provider(name: &'static str, logged_in: bool, connected: bool) -> MockProvider {
        let mut p = MockProvider::new();
        p.expect_name().return_const(name);
        p.expect_logged_in().returning(move || logged_in);
        p.expect_connected().returning(move || connected);
        p
    }

    fn registry(providers: Vec<MockProvider>) -> ProviderRegistry {
        providers
            .into_iter()
            .fold(ProviderRegistry::builder(), |b, p| b.register(Arc::new(p)))
            .build()
    }

    #[derive(Default)]
    struct RecordingTelemetry {
        events: StdMutex<Vec<(String, String, Option<String>)>>,
    }

    impl Telemetry for RecordingTelemetry {
        fn record_connect(&self, provider: &str, location: &str, ip: Option<&str>) {
            self.events.lock().unwrap().push((
                provider.to_string(),
                location.to_string(),
                ip.map(str::to_string),
            ));
        }
    }

    #[tokio::test]
    async fn test_connect_unknown_provider() {
        let mut p = MockProvider::new();
        p.expect_name().return_const("mullvad");
        p.expect_connect().never();
        p.expect_disconnect().never();
        let manager = Manager::with_registry(registry(vec![p]));

        let err = manager.connect("not-a-real-provider", "").await.unwrap_err();
        assert!(matches!(err, TundlerError::UnknownProvider(_)));
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn test_connect_named_provider_not_logged_in() {
        let mut p = provider("nordvpn", false, false);
        p.expect_connect().never();
        let manager = Manager::with_registry(registry(vec![p]));

        let err = manager.connect("nordvpn", "").await.unwrap_err();
        assert!(matches!(err, TundlerError::ProviderNotLoggedIn(name) if name == "nordvpn"));
    }

    #[tokio::test]
    async fn test_connect_with_nothing_logged_in() {
        let manager = Manager::with_registry(registry(vec![
            provider("mullvad", false, false),
            provider("nordvpn", false, false),
        ]));
        let err = manager.connect("", "").await.unwrap_err();
        assert!(matches!(err, TundlerError::NoLoggedInProviders));
        assert_eq!(err.status_code(), 424);
    }

    #[tokio::test]
    async fn test_connect_picks_allowed_location_and_records() {
        let mut p = provider("mullvad", true, false);
        p.expect_locations().never();
        p.expect_connect()
            .withf(|loc| loc == "se" || loc == "ch")
            .times(1)
            .returning(|loc| Status::connected("mullvad", Some("185.65.134.1".into()), Some(loc.into())));

        let telemetry = Arc::new(RecordingTelemetry::default());
        let allowed = HashMap::from([("mullvad".to_string(), vec!["se".to_string(), "ch".to_string()])]);
        let manager = Manager::new(registry(vec![p]), allowed, telemetry.clone());

        let status = manager.connect("", "").await.unwrap();
        assert!(status.connected);
        assert_eq!(status.provider.as_deref(), Some("mullvad"));

        let events = telemetry.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "mullvad");
        assert_eq!(events[0].2.as_deref(), Some("185.65.134.1"));
    }

    #[tokio::test]
    async fn test_connect_stops_when_teardown_leaves_tunnel_up() {
        let mut current = provider("mullvad", true, true);
        current
            .expect_disconnect()
            .times(1)
            .returning(|| Err(TundlerError::Timeout("mullvad disconnect".into())));
        let mut target = provider("nordvpn", true, false);
        target.expect_locations().never();
        target.expect_connect().never();
        let manager = Manager::with_registry(registry(vec![current, target]));

        let err = manager.connect("nordvpn", "Sweden").await.unwrap_err();
        assert!(matches!(err, TundlerError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_connect_after_failed_teardown_that_went_down() {
        let down = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let mut current = MockProvider::new();
        current.expect_name().return_const("mullvad");
        current.expect_logged_in().returning(|| true);
        let seen = down.clone();
        current
            .expect_connected()
            .returning(move || !seen.load(std::sync::atomic::Ordering::SeqCst));
        let flag = down.clone();
        current.expect_disconnect().times(1).returning(move || {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
            Err(TundlerError::Timeout("mullvad disconnect".into()))
        });
        let mut target = provider("nordvpn", true, false);
        target
            .expect_connect()
            .times(1)
            .returning(|loc| Status::connected("nordvpn", Some("10.5.0.2".into()), Some(loc.into())));
        let manager = Manager::with_registry(registry(vec![current, target]));

        let status = manager.connect("nordvpn", "Sweden").await.unwrap();
        assert_eq!(status.provider.as_deref(), Some("nordvpn"));
    }

    #[tokio::test]
    async fn test_connect_without_locations_uses_default() {
        let mut p = provider("surfshark", true, false);
        p.expect_locations().returning(Vec::new);
        p.expect_connect()
            .withf(|loc| loc.is_empty())
            .returning(|_| Status::disconnected());
        let telemetry = Arc::new(RecordingTelemetry::default());
        let manager = Manager::new(registry(vec![p]), HashMap::new(), telemetry.clone());

        // A timed-out connect is a status, not an error
        let status = manager.connect("surfshark", "").await.unwrap();
        assert!(!status.connected);
        assert!(telemetry.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_reports_unknown_version() {
        let mut a = provider("mullvad", true, false);
        a.expect_version().returning(|| Ok("2024.8".to_string()));
        let mut b = provider("nordvpn", false, false);
        b.expect_version()
            .returning(|| Err(TundlerError::Timeout("nordvpn --version".into())));
        let manager = Manager::with_registry(registry(vec![a, b]));

        let list = manager.list().await;
        assert_eq!(list["mullvad"], ProviderInfo { logged_in: true, version: "2024.8".into() });
        assert_eq!(list["nordvpn"], ProviderInfo { logged_in: false, version: UNKNOWN_VERSION.into() });
    }

    #[tokio::test]
    async fn test_login_all_succeeds_if_any_does() {
        let mut a = provider("mullvad", false, false);
        a.expect_login()
            .returning(|| Err(TundlerError::AuthConfig("MULLVAD_ACCOUNT_NUMBER not set".into())));
        let mut b = provider("nordvpn", false, false);
        b.expect_login().times(1).returning(|| Ok(()));
        let manager = Manager::with_registry(registry(vec![a, b]));

        manager.login("").await.unwrap();
    }

    #[tokio::test]
    async fn test_login_all_failing() {
        let mut a = provider("mullvad", false, false);
        a.expect_login()
            .returning(|| Err(TundlerError::AuthConfig("MULLVAD_ACCOUNT_NUMBER not set".into())));
        let manager = Manager::with_registry(registry(vec![a]));

        assert!(matches!(
            manager.login("").await,
            Err(TundlerError::NoLoggedInProviders)
        ));
        assert!(matches!(
            manager.login("expressvpn").await,
            Err(TundlerError::UnknownProvider(_))
        ));
    }

    #[tokio::test]
    async fn test_logout_named_not_logged_in() {
        let mut p = provider("mullvad", false, false);
        p.expect_logout().never();
        let manager = Manager::with_registry(registry(vec![p]));

        assert!(matches!(
            manager.logout("mullvad").await,
            Err(TundlerError::ProviderNotLoggedIn(_))
        ));
    }

    #[tokio::test]
    async fn test_logout_all_skips_logged_out_and_reports_first_error() {
        let mut a = provider("expressvpn", true, false);
        a.expect_logout()
            .times(1)
            .returning(|| Err(TundlerError::Timeout("expressvpnctl logout".into())));
        let mut b = provider("mullvad", false, false);
        b.expect_logout().never();
        let mut c = provider("nordvpn", true, false);
        c.expect_logout().times(1).returning(|| Ok(()));
        let manager = Manager::with_registry(registry(vec![a, b, c]));

        assert!(matches!(manager.logout("").await, Err(TundlerError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_logout_all_with_nothing_logged_in() {
        let manager = Manager::with_registry(registry(vec![provider("mullvad", false, false)]));
        assert!(matches!(
            manager.logout("").await,
            Err(TundlerError::NoLoggedInProviders)
        ));
    }

    #[tokio::test]
    async fn test_status_prefers_connected_provider() {
        let mut a = provider("mullvad", true, true);
        a.expect_status()
            .returning(|| Status::connected("mullvad", Some("185.65.134.1".into()), Some("se".into())));
        let mut b = provider("nordvpn", true, false);
        b.expect_status().never();
        let manager = Manager::with_registry(registry(vec![a, b]));

        let status = manager.status().await.unwrap();
        assert_eq!(status.provider.as_deref(), Some("mullvad"));
        assert_eq!(status.location.as_deref(), Some("se"));
    }

    #[tokio::test]
    async fn test_status_logged_in_only() {
        let mut p = provider("nordvpn", true, false);
        p.expect_status().returning(Status::disconnected);
        let manager = Manager::with_registry(registry(vec![p]));

        let status = manager.status().await.unwrap();
        assert_eq!(status, Status::disconnected());
    }

    #[tokio::test]
    async fn test_status_nothing_logged_in() {
        let manager = Manager::with_registry(registry(vec![provider("nordvpn", false, false)]));
        assert!(matches!(
            manager.status().await,
            Err(TundlerError::NoLoggedInProviders)
        ));
    }

    #[tokio::test]
    async fn test_disconnect_without_tunnel_is_noop() {
        let mut p = provider("mullvad", true, false);
        p.expect_disconnect().never();
        let manager = Manager::with_registry(registry(vec![p]));
        manager.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_locations_prefer_allow_list() {
        let mut a = provider("mullvad", true, false);
        a.expect_locations().never();
        let mut b = provider("nordvpn", true, false);
        b.expect_locations()
            .returning(|| vec!["Sweden".to_string(), "Norway".to_string()]);
        let allowed = HashMap::from([("mullvad".to_string(), vec!["se".to_string()])]);
        let manager = Manager::new(registry(vec![a, b]), allowed, Arc::new(NoopTelemetry));

        let locations = manager.locations().await;
        assert_eq!(locations["mullvad"], vec!["se"]);
        assert_eq!(locations["nordvpn"], vec!["Sweden", "Norway"]);
    }
}
