//! Loading and merging of configuration files.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::{
    append_pem, parse_duration, parse_interval, resolve_secrets, AwxFile, Config, ConfigFile,
    SecretSource, ThrottlingFile, AWX_PASSWORD_ENV, AWX_USERNAME_ENV,
};
use crate::error::ConfigError;

/// Loads the configuration from a list of files and directories.
///
/// Paths are merged in the order given. A directory contributes its `.yml` and
/// `.yaml` files in alphabetical order. Values from later files override earlier
/// ones, except rules, which are appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigLoader {
    paths: Vec<PathBuf>,
}

impl ConfigLoader {
    #[must_use]
    pub fn new<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
        }
    }

    /// Load the configuration, read the secrets it references from `secrets`, then
    /// apply the credential environment variables.
    pub async fn load(&self, secrets: Option<&dyn SecretSource>) -> Result<Config, ConfigError> {
        let mut config = self.load_files()?;
        resolve_secrets(&mut config.awx, secrets).await?;
        apply_env(&mut config, |name| std::env::var(name).ok());
        Ok(config)
    }

    /// Load the configuration from the files only.
    pub fn load_files(&self) -> Result<Config, ConfigError> {
        if self.paths.is_empty() {
            return Err(ConfigError::NoFiles);
        }

        let mut config = Config::default();
        for path in &self.paths {
            let metadata = fs::metadata(path).map_err(|source| io_error(path, source))?;
            if metadata.is_dir() {
                merge_dir(&mut config, path)?;
            } else {
                merge_file(&mut config, path)?;
            }
        }
        Ok(config)
    }
}

/// Override the AWX credentials with the values of `AWX_USERNAME` and `AWX_PASSWORD`.
pub fn apply_env<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(username) = lookup(AWX_USERNAME_ENV).filter(|v| !v.is_empty()) {
        debug!("Using AWX user name from the environment");
        config.awx.username = username;
    }
    if let Some(password) = lookup(AWX_PASSWORD_ENV).filter(|v| !v.is_empty()) {
        debug!("Using AWX password from the environment");
        config.awx.password = password;
    }
}

fn merge_dir(config: &mut Config, dir: &Path) -> Result<(), ConfigError> {
    let entries = fs::read_dir(dir).map_err(|source| io_error(dir, source))?;

    let mut files = Vec::new();
    for entry in entries {
        let path = entry.map_err(|source| io_error(dir, source))?.path();
        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext == "yml" || ext == "yaml");
        if is_yaml && path.is_file() {
            files.push(path);
        }
    }
    files.sort();

    for file in files {
        merge_file(config, &file)?;
    }
    Ok(())
}

fn merge_file(config: &mut Config, file: &Path) -> Result<(), ConfigError> {
    info!(file = %file.display(), "Loading configuration");
    let content = fs::read_to_string(file).map_err(|source| io_error(file, source))?;
    if content.trim().is_empty() {
        return Ok(());
    }

    let decoded: ConfigFile = serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: file.display().to_string(),
        source,
    })?;

    if let Some(awx) = decoded.awx {
        merge_awx(config, awx)?;
    }
    if let Some(throttling) = decoded.throttling {
        merge_throttling(config, throttling)?;
    }
    config.rules.extend(decoded.rules);
    Ok(())
}

fn merge_awx(config: &mut Config, decoded: AwxFile) -> Result<(), ConfigError> {
    let awx = &mut config.awx;
    if let Some(address) = decoded.address.filter(|v| !v.is_empty()) {
        awx.address = address;
    }
    if let Some(proxy) = decoded.proxy.filter(|v| !v.is_empty()) {
        awx.proxy = Some(proxy);
    }
    if let Some(credentials) = decoded.credentials {
        if let Some(username) = credentials.username.filter(|v| !v.is_empty()) {
            awx.username = username;
        }
        if let Some(password) = credentials.password.filter(|v| !v.is_empty()) {
            awx.password = password;
        }
    }
    if let Some(reference) = decoded.credentials_ref {
        awx.credentials_ref = Some(reference);
    }
    if let Some(tls) = decoded.tls {
        if let Some(certs) = tls.ca_certs.filter(|v| !v.is_empty()) {
            append_pem(&mut awx.ca_certs, &certs);
        }
        if let Some(file) = tls.ca_file.filter(|v| !v.is_empty()) {
            let certs = fs::read_to_string(&file).map_err(|source| ConfigError::Io {
                path: file.clone(),
                source,
            })?;
            append_pem(&mut awx.ca_certs, &certs);
        }
    }
    if let Some(reference) = decoded.tls_ref {
        awx.tls_refs.push(reference);
    }
    if let Some(insecure) = decoded.insecure {
        awx.insecure = insecure;
    }
    if let Some(project) = decoded.project.filter(|v| !v.is_empty()) {
        awx.project = project;
    }
    if let Some(interval) = decoded.job_status_check_interval.filter(|v| !v.is_empty()) {
        awx.job_status_check_interval = parse_interval(&interval)?;
    }
    Ok(())
}

fn merge_throttling(config: &mut Config, decoded: ThrottlingFile) -> Result<(), ConfigError> {
    if let Some(interval) = decoded.interval.filter(|v| !v.is_empty()) {
        config.throttling.interval = parse_duration(&interval)?;
    }
    Ok(())
}

fn io_error(path: &Path, source: std::io::Error) -> ConfigError {
    ConfigError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    const BASE: &str = r#"
awx:
  address: https://awx.example.com/api
  credentials:
    username: admin
    password: secret
  project: Healing
  jobStatusCheckInterval: 1m
throttling:
  interval: 30m
rules:
- metadata:
    name: start-node
  labels:
    alertname: NodeDown
  awxJob:
    template: Start node
"#;

    #[test]
    fn test_load_single_file() {
        let dir = TempDir::new().unwrap();
        let file = write(&dir, "autoheal.yml", BASE);

        let config = ConfigLoader::new([file]).load_files().unwrap();

        assert_eq!(config.awx.address, "https://awx.example.com/api");
        assert_eq!(config.awx.username, "admin");
        assert_eq!(config.awx.project, "Healing");
        assert_eq!(config.awx.job_status_check_interval, Duration::from_secs(60));
        assert_eq!(config.throttling.interval, Duration::from_secs(1800));
        assert_eq!(config.rules.len(), 1);
        assert_eq!(config.rules[0].name(), "start-node");
    }

    #[test]
    fn test_later_files_override_scalars_and_append_rules() {
        let dir = TempDir::new().unwrap();
        let base = write(&dir, "base.yml", BASE);
        let extra = write(
            &dir,
            "extra.yml",
            r#"
awx:
  project: Other
throttling:
  interval: "0"
rules:
- metadata:
    name: restart
  batchJob:
    metadata:
      name: restart
"#,
        );

        let config = ConfigLoader::new([base, extra]).load_files().unwrap();

        assert_eq!(config.awx.project, "Other");
        assert_eq!(config.awx.username, "admin");
        assert_eq!(config.throttling.interval, Duration::ZERO);
        let names: Vec<&str> = config.rules.iter().map(|r| r.name()).collect();
        assert_eq!(names, ["start-node", "restart"]);
    }

    #[test]
    fn test_directory_is_loaded_in_alphabetical_order() {
        let dir = TempDir::new().unwrap();
        let rule = |name: &str| {
            format!("rules:\n- metadata:\n    name: {name}\n  awxJob:\n    template: t\n")
        };
        write(&dir, "b.yaml", &rule("second"));
        write(&dir, "a.yml", &rule("first"));
        write(&dir, "c.txt", &rule("ignored"));
        write(&dir, "empty.yml", "");

        let config = ConfigLoader::new([dir.path()]).load_files().unwrap();

        let names: Vec<&str> = config.rules.iter().map(|r| r.name()).collect();
        assert_eq!(names, ["first", "second"]);
        assert_eq!(config.throttling.interval, Duration::from_secs(3600));
    }

    #[test]
    fn test_tls_certificates_are_collected() {
        let dir = TempDir::new().unwrap();
        let ca = write(&dir, "ca.pem", "-----BEGIN CERTIFICATE-----\nfile\n-----END CERTIFICATE-----\n");
        let file = write(
            &dir,
            "autoheal.yml",
            &format!(
                "awx:\n  tls:\n    caCerts: |\n      inline\n    caFile: {}\n",
                ca.display()
            ),
        );

        let config = ConfigLoader::new([file]).load_files().unwrap();
        let certs = config.awx.ca_certs.unwrap();
        assert!(certs.starts_with("inline\n"));
        assert!(certs.contains("file"));
    }

    #[test]
    fn test_secret_references_are_collected() {
        let dir = TempDir::new().unwrap();
        let first = write(
            &dir,
            "a.yml",
            "awx:\n  credentialsRef:\n    namespace: autoheal\n    name: old\n  tlsRef:\n    namespace: autoheal\n    name: ca-1\n",
        );
        let second = write(
            &dir,
            "b.yml",
            "awx:\n  credentialsRef:\n    namespace: autoheal\n    name: new\n  tlsRef:\n    namespace: autoheal\n    name: ca-2\n",
        );

        let config = ConfigLoader::new([first, second]).load_files().unwrap();

        let credentials = config.awx.credentials_ref.unwrap();
        assert_eq!(credentials.name.as_deref(), Some("new"));
        assert_eq!(credentials.namespace.as_deref(), Some("autoheal"));
        let tls: Vec<_> = config.awx.tls_refs.iter().filter_map(|r| r.name.as_deref()).collect();
        assert_eq!(tls, ["ca-1", "ca-2"]);
    }

    #[tokio::test]
    async fn test_load_without_kubernetes_fails_on_secret_references() {
        let dir = TempDir::new().unwrap();
        let file = write(
            &dir,
            "autoheal.yml",
            "awx:\n  credentialsRef:\n    namespace: autoheal\n    name: creds\n",
        );

        assert!(matches!(
            ConfigLoader::new([file]).load(None).await,
            Err(ConfigError::NoKubernetes { .. })
        ));
    }

    #[test]
    fn test_errors() {
        assert!(matches!(
            ConfigLoader::new(Vec::<PathBuf>::new()).load_files(),
            Err(ConfigError::NoFiles)
        ));

        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing.yml");
        assert!(matches!(
            ConfigLoader::new([missing]).load_files(),
            Err(ConfigError::Io { .. })
        ));

        let bad = write(&dir, "bad.yml", "throttling: [1, 2");
        assert!(matches!(
            ConfigLoader::new([bad]).load_files(),
            Err(ConfigError::Parse { .. })
        ));

        let bad_duration = write(&dir, "duration.yml", "throttling:\n  interval: soon\n");
        assert!(matches!(
            ConfigLoader::new([bad_duration]).load_files(),
            Err(ConfigError::InvalidDuration(_))
        ));

        let zero_interval = write(&dir, "zero.yml", "awx:\n  jobStatusCheckInterval: \"0\"\n");
        assert!(matches!(
            ConfigLoader::new([zero_interval]).load_files(),
            Err(ConfigError::ZeroInterval(_))
        ));
    }

    #[test]
    fn test_environment_overrides_credentials() {
        let mut config = Config::default();
        config.awx.username = "from-file".to_string();
        config.awx.password = "from-file".to_string();

        let env: HashMap<&str, &str> = [("AWX_USERNAME", "from-env")].into_iter().collect();
        apply_env(&mut config, |name| env.get(name).map(ToString::to_string));

        assert_eq!(config.awx.username, "from-env");
        assert_eq!(config.awx.password, "from-file");
    }
}
