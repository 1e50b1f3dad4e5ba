//! Service configuration.
//!
//! The configuration is read from one or more YAML files (see [`ConfigLoader`]):
//!
//! ```yaml
//! awx:
//!   address: https://awx.example.com/api
//!   proxy: http://proxy.example.com:3128
//!   credentials:
//!     username: autoheal
//!     password: ...
//!   tls:
//!     caFile: /etc/autoheal/ca.pem
//!   tlsRef:
//!     namespace: autoheal
//!     name: awx-ca
//!   insecure: false
//!   project: Healing
//!   jobStatusCheckInterval: 5m
//! throttling:
//!   interval: 1h
//! rules:
//! - metadata:
//!     name: start-node
//!   labels:
//!     alertname: NodeDown
//!   awxJob:
//!     template: Start node
//! ```

pub mod loader;
pub mod secrets;
pub mod watcher;

use k8s_openapi::api::core::v1::SecretReference;
use serde::Deserialize;
use std::time::Duration;

use crate::error::ConfigError;
use crate::rules::HealingRule;
use crate::runner::AwxSettings;

pub use loader::ConfigLoader;
pub use secrets::{resolve_secrets, KubeSecrets, SecretSource};
pub use watcher::ConfigWatcher;

/// Default time an executed action is remembered.
pub const DEFAULT_THROTTLING_INTERVAL: Duration = Duration::from_secs(60 * 60);
/// Default interval between two checks of the active AWX jobs.
pub const DEFAULT_JOB_STATUS_CHECK_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Default interval between two reloads of the configuration files.
pub const DEFAULT_CONFIG_RELOAD_INTERVAL: Duration = Duration::from_secs(30);

/// Environment variable overriding the AWX user name.
pub const AWX_USERNAME_ENV: &str = "AWX_USERNAME";
/// Environment variable overriding the AWX password.
pub const AWX_PASSWORD_ENV: &str = "AWX_PASSWORD";

/// Merged configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    pub awx: AwxConfig,
    pub throttling: ThrottlingConfig,
    /// Rules in the order they appear in the files
    pub rules: Vec<HealingRule>,
}

/// AWX connection details.
#[derive(Debug, Clone, PartialEq)]
pub struct AwxConfig {
    pub address: String,
    pub proxy: Option<String>,
    pub username: String,
    pub password: String,
    pub insecure: bool,
    /// PEM bundle gathered from `tls.caCerts` and `tls.caFile`
    pub ca_certs: Option<String>,
    pub project: String,
    pub job_status_check_interval: Duration,
    /// Secret with the credentials, resolved by [`resolve_secrets`]
    pub credentials_ref: Option<SecretReference>,
    /// Secrets with CA certificates, resolved by [`resolve_secrets`]
    pub tls_refs: Vec<SecretReference>,
}

impl Default for AwxConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            proxy: None,
            username: String::new(),
            password: String::new(),
            insecure: false,
            ca_certs: None,
            project: String::new(),
            job_status_check_interval: DEFAULT_JOB_STATUS_CHECK_INTERVAL,
            credentials_ref: None,
            tls_refs: Vec::new(),
        }
    }
}

impl AwxConfig {
    /// AWX is used only when an address is configured.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        !self.address.is_empty()
    }

    #[must_use]
    pub fn settings(&self) -> AwxSettings {
        AwxSettings {
            address: self.address.clone(),
            proxy: self.proxy.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            insecure: self.insecure,
            ca_certs: self.ca_certs.clone(),
            project: self.project.clone(),
            ..AwxSettings::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThrottlingConfig {
    /// How long an executed action is remembered; zero disables throttling
    pub interval: Duration,
}

impl Default for ThrottlingConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_THROTTLING_INTERVAL,
        }
    }
}

/// Content of one configuration file, before merging.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ConfigFile {
    #[serde(default)]
    pub awx: Option<AwxFile>,
    #[serde(default)]
    pub throttling: Option<ThrottlingFile>,
    #[serde(default)]
    pub rules: Vec<HealingRule>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AwxFile {
    pub address: Option<String>,
    pub proxy: Option<String>,
    pub credentials: Option<CredentialsFile>,
    pub credentials_ref: Option<SecretReference>,
    pub tls: Option<TlsFile>,
    pub tls_ref: Option<SecretReference>,
    pub insecure: Option<bool>,
    pub project: Option<String>,
    pub job_status_check_interval: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct CredentialsFile {
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TlsFile {
    /// Inline PEM certificates
    pub ca_certs: Option<String>,
    /// File containing PEM certificates
    pub ca_file: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ThrottlingFile {
    pub interval: Option<String>,
}

/// Append PEM certificates to a bundle, keeping them on separate lines.
pub(crate) fn append_pem(bundle: &mut Option<String>, certs: &str) {
    let bundle = bundle.get_or_insert_with(String::new);
    if !bundle.is_empty() && !bundle.ends_with('\n') {
        bundle.push('\n');
    }
    bundle.push_str(certs);
}

/// Parse a duration written the Go way: a sequence of decimal numbers, each with a
/// unit (`ns`, `us`, `ms`, `s`, `m`, `h`), like `90s`, `1h30m` or `1.5h`. A bare
/// `0` is accepted.
pub fn parse_duration(text: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidDuration(text.to_string());

    let mut rest = text.trim();
    if rest == "0" {
        return Ok(Duration::ZERO);
    }
    if rest.is_empty() {
        return Err(invalid());
    }

    let mut nanos: u128 = 0;
    while !rest.is_empty() {
        let number_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_end == 0 {
            return Err(invalid());
        }
        let value: f64 = rest[..number_end].parse().map_err(|_| invalid())?;
        rest = &rest[number_end..];

        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_end] {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return Err(invalid()),
        };
        let term = (value * scale).round() as u128;
        nanos = nanos.saturating_add(term);
        rest = &rest[unit_end..];
    }

    u64::try_from(nanos)
        .map(Duration::from_nanos)
        .map_err(|_| invalid())
}

/// Parse a polling interval, like [`parse_duration`] but rejecting zero.
pub fn parse_interval(text: &str) -> Result<Duration, ConfigError> {
    let interval = parse_duration(text)?;
    if interval.is_zero() {
        return Err(ConfigError::ZeroInterval(text.trim().to_string()));
    }
    Ok(interval)
}
