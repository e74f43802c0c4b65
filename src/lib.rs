//! tundler - VPN provider control plane
//!
//! Drives the command-line clients of several commercial VPN services behind
//! one interface:
//! - Provider adapters (Mullvad, NordVPN, PIA, Surfshark, ExpressVPN)
//! - Manager for provider/location selection and a single active tunnel
//! - HTTP API
//! - Optional connect telemetry

pub mod api;
pub mod config;
pub mod error;
pub mod exec;
pub mod manager;
pub mod provider;
pub mod telemetry;

// Re-export commonly used types
pub use config::TundlerConfig;
pub use error::{TundlerError, TundlerResult};
pub use exec::{CommandOutput, CommandRunner, Invocation, SystemRunner};
pub use manager::{Manager, ProviderInfo};
pub use provider::{Provider, ProviderRegistry, Status};
pub use telemetry::{HttpTelemetry, NoopTelemetry, Telemetry};
