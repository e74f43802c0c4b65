//! In-memory providers shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use libtundler::provider::{Provider, ProviderRegistry, Status};
use libtundler::{TundlerError, TundlerResult};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Provider whose "external" state is a handful of flags
pub struct FakeProvider {
    name: &'static str,
    logged_in: AtomicBool,
    connected: AtomicBool,
    never_connects: bool,
    login_fails: bool,
    locations: Vec<String>,
    version: Option<String>,
    connect_delay: Duration,
    pub logins: AtomicUsize,
    pub logouts: AtomicUsize,
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub last_location: Mutex<Option<String>>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl FakeProvider {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            logged_in: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            never_connects: false,
            login_fails: false,
            locations: Vec::new(),
            version: Some("1.0.0".to_string()),
            connect_delay: Duration::ZERO,
            logins: AtomicUsize::new(0),
            logouts: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            last_location: Mutex::new(None),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn logged_in(self) -> Self {
        self.logged_in.store(true, Ordering::SeqCst);
        self
    }

    pub fn connected(self) -> Self {
        self.connected.store(true, Ordering::SeqCst);
        self
    }

    pub fn never_connects(mut self) -> Self {
        self.never_connects = true;
        self
    }

    pub fn login_fails(mut self) -> Self {
        self.login_fails = true;
        self
    }

    pub fn with_locations(mut self, locations: &[&str]) -> Self {
        self.locations = locations.iter().map(|l| l.to_string()).collect();
        self
    }

    pub fn without_version(mut self) -> Self {
        self.version = None;
        self
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::SeqCst)
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    fn ip(&self) -> String {
        format!("10.8.0.{}", self.name.len())
    }
}

#[async_trait]
impl Provider for FakeProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn login(&self) -> TundlerResult<()> {
        if self.login_fails {
            return Err(TundlerError::LoginFailed {
                provider: self.name.to_string(),
                reason: "bad credentials".to_string(),
            });
        }
        if !self.logged_in.swap(true, Ordering::SeqCst) {
            self.logins.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn logout(&self) -> TundlerResult<()> {
        if self.logged_in.swap(false, Ordering::SeqCst) {
            self.logouts.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn logged_in(&self) -> bool {
        self.is_logged_in()
    }

    async fn connect(&self, location: &str) -> Status {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }

        self.connects.fetch_add(1, Ordering::SeqCst);
        *self.last_location.lock().unwrap() = Some(location.to_string());
        if !self.never_connects {
            self.connected.store(true, Ordering::SeqCst);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.status().await
    }

    async fn connected(&self) -> bool {
        self.is_connected()
    }

    async fn disconnect(&self) -> TundlerResult<()> {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn locations(&self) -> Vec<String> {
        self.locations.clone()
    }

    async fn status(&self) -> Status {
        if !self.is_connected() {
            return Status::disconnected();
        }
        let location = self.last_location.lock().unwrap().clone();
        Status::connected(self.name, Some(self.ip()), location)
    }

    async fn version(&self) -> TundlerResult<String> {
        self.version
            .clone()
            .ok_or_else(|| TundlerError::Timeout(format!("{} --version", self.name)))
    }

    async fn active_location(&self) -> String {
        if !self.is_connected() {
            return String::new();
        }
        self.last_location.lock().unwrap().clone().unwrap_or_default()
    }
}

pub fn registry(providers: &[Arc<FakeProvider>]) -> ProviderRegistry {
    providers
        .iter()
        .fold(ProviderRegistry::builder(), |builder, p| {
            builder.register(p.clone() as Arc<dyn Provider>)
        })
        .build()
}
