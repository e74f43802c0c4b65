//! Error types for tundler

use std::io;
use thiserror::Error;

/// Machine code reported for every error outside the coded taxonomy.
pub const INTERNAL_ERROR_CODE: &str = "INTERNAL_ERROR";

#[derive(Debug, Error)]
pub enum TundlerError {
    /// Requested provider is not in the registry
    #[error("Unknown VPN provider: {0}")]
    UnknownProvider(String),
    /// Named provider is not authenticated
    #[error("You need to login in with the specified provider first ({0}).")]
    ProviderNotLoggedIn(String),
    /// No provider at all is authenticated
    #[error("You need to login with a provider.")]
    NoLoggedInProviders,
    /// Required credentials are missing from the environment
    #[error("Authentication configuration error: {0}")]
    AuthConfig(String),
    /// The backend rejected the credentials
    #[error("{provider} login failed: {reason}")]
    LoginFailed { provider: String, reason: String },
    /// Command execution failed
    #[error("{}", command_failed_message(.cmd, .code, .output))]
    CommandFailed { cmd: String, code: Option<i32>, output: String },
    /// Timeout
    #[error("Timeout: {0}")]
    Timeout(String),
    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

fn command_failed_message(cmd: &str, code: &Option<i32>, output: &str) -> String {
    match code {
        Some(code) => format!("Command '{}' failed with code {}: {}", cmd, code, output),
        None => format!("Command '{}' failed: {}", cmd, output),
    }
}

impl TundlerError {
    /// Stable uppercase code exposed to API callers.
    pub fn code(&self) -> &'static str {
        match self {
            TundlerError::UnknownProvider(_) => "UNKNOWN_PROVIDER",
            TundlerError::ProviderNotLoggedIn(_) => "PROVIDER_NOT_LOGGED_IN",
            TundlerError::NoLoggedInProviders => "NO_LOGGED_IN_PROVIDERS",
            _ => INTERNAL_ERROR_CODE,
        }
    }

    /// HTTP status class, chosen by kind and never by message text.
    pub fn status_code(&self) -> u16 {
        match self {
            TundlerError::UnknownProvider(_) => 400,
            TundlerError::ProviderNotLoggedIn(_) | TundlerError::NoLoggedInProviders => 424,
            _ => 500,
        }
    }
}

impl From<toml::de::Error> for TundlerError {
    fn from(error: toml::de::Error) -> Self {
        TundlerError::ConfigError(error.to_string())
    }
}

pub type TundlerResult<T> = Result<T, TundlerError>;
