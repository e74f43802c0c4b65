use std::io::Write;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{TundlerError, TundlerResult};
use crate::exec::{CommandOutput, CommandRunner, Invocation};

/// Handle on one vendor binary
#[derive(Clone)]
pub struct Cli {
    program: &'static str,
    runner: Arc<dyn CommandRunner>,
    host_network: bool,
}

impl Cli {
    pub fn new(program: &'static str, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            program,
            runner,
            host_network: false,
        }
    }

    /// Never wrap this binary in the configured network namespace
    pub fn host_network(mut self) -> Self {
        self.host_network = true;
        self
    }

    pub fn invocation(&self, args: &[&str]) -> Invocation {
        let invocation = Invocation::new(self.program, args.iter().copied());
        if self.host_network {
            invocation.host_network()
        } else {
            invocation
        }
    }

    /// Run an arbitrary invocation through the shared runner
    pub async fn exec(&self, invocation: &Invocation) -> TundlerResult<CommandOutput> {
        self.runner.run(invocation).await
    }

    pub async fn run(&self, args: &[&str]) -> TundlerResult<CommandOutput> {
        self.exec(&self.invocation(args)).await
    }

    pub async fn run_with_timeout(&self, args: &[&str], timeout: Duration) -> TundlerResult<CommandOutput> {
        self.exec(&self.invocation(args).timeout(timeout)).await
    }

    /// Combined output, empty if the command could not run at all
    pub async fn output(&self, args: &[&str]) -> String {
        match self.run(args).await {
            Ok(out) => out.output,
            Err(e) => {
                debug!("[{}] {:?}: {}", self.program, args, e);
                String::new()
            }
        }
    }

    /// Output of a command that must exit successfully
    pub async fn check(&self, args: &[&str]) -> TundlerResult<String> {
        let invocation = self.invocation(args);
        self.exec(&invocation).await?.into_result(&invocation)
    }

    /// Fire a command for its side effect only
    pub async fn quiet(&self, args: &[&str]) {
        let _ = self.output(args).await;
    }
}

// Parsing helpers shared by the adapters

/// First whitespace-separated token that parses as an IPv4 address
pub fn first_ipv4(text: &str) -> Option<String> {
    text.split_whitespace()
        .map(|tok| tok.trim_matches(|c: char| !c.is_ascii_digit() && c != '.'))
        .find(|tok| tok.parse::<Ipv4Addr>().is_ok())
        .map(str::to_string)
}

/// Extract a semantic version (`x.y.z`, optional `-pre` and `+build`) from
/// free-form `--version` output
pub fn extract_version(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    let mut start = 0;
    while start < bytes.len() {
        if bytes[start].is_ascii_digit() && (start == 0 || !bytes[start - 1].is_ascii_digit()) {
            if let Some(end) = match_semver(&text[start..]) {
                return Some(text[start..start + end].to_string());
            }
        }
        start += 1;
    }
    None
}

/// Length of the semver at the beginning of `s`, if any
fn match_semver(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut pos = 0;
    for part in 0..3 {
        let digits = bytes[pos..].iter().take_while(|b| b.is_ascii_digit()).count();
        if digits == 0 {
            return None;
        }
        pos += digits;
        if part < 2 {
            if bytes.get(pos) != Some(&b'.') {
                return None;
            }
            pos += 1;
        }
    }

    let is_ident = |b: &u8| b.is_ascii_alphanumeric() || *b == b'.' || *b == b'-';
    for marker in [b'-', b'+'] {
        if bytes.get(pos) == Some(&marker) {
            let len = bytes[pos + 1..].iter().take_while(|b| is_ident(b)).count();
            if len > 0 {
                pos += 1 + len;
            }
        }
    }
    Some(pos)
}

/// Version string from CLI output: the semver if one is present, else the
/// trimmed output. Empty output is an error, never a made-up version.
pub fn parse_version(output: &str) -> TundlerResult<String> {
    if let Some(version) = extract_version(output) {
        return Ok(version);
    }
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Err(TundlerError::CommandFailed {
            cmd: "version".to_string(),
            code: None,
            output: "empty version output".to_string(),
        });
    }
    Ok(trimmed.to_string())
}

/// Value following `prefix` on the first matching (trimmed) line
pub fn line_value(text: &str, prefix: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix(prefix))
        .map(|value| value.trim().to_string())
}

/// Read required credential variables, all or nothing
pub fn require_env(names: &[&str]) -> TundlerResult<Vec<String>> {
    let mut values = Vec::with_capacity(names.len());
    let mut missing = Vec::new();
    for name in names {
        match std::env::var(name) {
            Ok(value) if !value.is_empty() => values.push(value),
            _ => missing.push(*name),
        }
    }
    if !missing.is_empty() {
        return Err(TundlerError::AuthConfig(format!(
            "{} environment variable(s) not set",
            missing.join(" and ")
        )));
    }
    Ok(values)
}

/// Write a secret to a private (0600) temp file removed on drop; for CLIs that
/// only read credentials from a path
pub fn secret_file(content: &str) -> TundlerResult<NamedTempFile> {
    let mut file = NamedTempFile::new()?;
    file.write_all(content.as_bytes())?;
    file.flush()?;
    debug!("Wrote credentials to {:?}", file.path());
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_first_ipv4() {
        assert_eq!(
            first_ipv4("Visible location: Sweden, Malmo. IPv4: 185.65.134.1"),
            Some("185.65.134.1".to_string())
        );
        assert_eq!(first_ipv4("Server IP: 10.8.0.2\nOther 1.2.3.4"), Some("10.8.0.2".to_string()));
        assert_eq!(first_ipv4("no address here 1.2.3"), None);
        assert_eq!(first_ipv4(""), None);
    }

    #[test]
    fn test_extract_version() {
        assert_eq!(extract_version("mullvad-cli 2024.8.0"), Some("2024.8.0".to_string()));
        assert_eq!(extract_version("NordVPN Version 3.17.2"), Some("3.17.2".to_string()));
        assert_eq!(
            extract_version("expressvpnctl 4.1.0-beta.2+build7 (abc)"),
            Some("4.1.0-beta.2+build7".to_string())
        );
        assert_eq!(extract_version("v1.2"), None);
        assert_eq!(extract_version("3.10.1"), Some("3.10.1".to_string()));
    }

    #[test]
    fn test_parse_version_falls_back_to_raw_output() {
        assert_eq!(parse_version("2024.8").unwrap(), "2024.8");
        assert_eq!(parse_version("piactl 3.6.1+08339").unwrap(), "3.6.1+08339");
        assert!(parse_version("   ").is_err());
    }

    #[test]
    fn test_line_value() {
        let out = "Connected\n    Relay: se-mma-wg-001\n    Visible location: Sweden";
        assert_eq!(line_value(out, "Relay:"), Some("se-mma-wg-001".to_string()));
        assert_eq!(line_value(out, "Missing:"), None);
    }

    #[test]
    #[serial]
    fn test_require_env_reports_missing() {
        std::env::set_var("TUNDLER_TEST_USER", "alice");
        std::env::remove_var("TUNDLER_TEST_PASS");

        match require_env(&["TUNDLER_TEST_USER", "TUNDLER_TEST_PASS"]) {
            Err(TundlerError::AuthConfig(msg)) => assert!(msg.contains("TUNDLER_TEST_PASS")),
            other => panic!("unexpected: {:?}", other),
        }

        std::env::set_var("TUNDLER_TEST_PASS", "secret");
        let values = require_env(&["TUNDLER_TEST_USER", "TUNDLER_TEST_PASS"]).unwrap();
        assert_eq!(values, vec!["alice", "secret"]);

        std::env::remove_var("TUNDLER_TEST_USER");
        std::env::remove_var("TUNDLER_TEST_PASS");
    }

    #[test]
    fn test_secret_file_roundtrip() {
        let file = secret_file("user\npass").unwrap();
        let path = file.path().to_path_buf();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "user\npass");
        drop(file);
        assert!(!path.exists());
    }
}
