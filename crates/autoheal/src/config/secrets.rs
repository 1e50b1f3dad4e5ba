//! AWX credentials and CA certificates kept in Kubernetes secrets.
//!
//! The `awx` section can point to secrets instead of carrying the values inline:
//!
//! ```yaml
//! awx:
//!   credentialsRef:
//!     namespace: autoheal
//!     name: awx-credentials
//!   tlsRef:
//!     namespace: autoheal
//!     name: awx-ca
//! ```
//!
//! The credentials secret provides the `username` and `password` keys, the TLS one
//! the `ca.crt` key. Both the namespace and the name of a reference are mandatory.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Secret, SecretReference};
use kube::{Api, Client};
use tracing::info;

use super::{append_pem, AwxConfig};
use crate::error::ConfigError;

/// Key of the user name in a credentials secret.
pub const USERNAME_KEY: &str = "username";
/// Key of the password in a credentials secret.
pub const PASSWORD_KEY: &str = "password";
/// Key of the CA certificates in a TLS secret.
pub const CA_CERT_KEY: &str = "ca.crt";

/// Where secrets are read from.
#[async_trait]
pub trait SecretSource: Send + Sync {
    /// Fetch a secret, `None` when it doesn't exist.
    async fn secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, kube::Error>;
}

/// Reads secrets through the Kubernetes API.
#[derive(Clone)]
pub struct KubeSecrets {
    client: Client,
}

impl KubeSecrets {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretSource for KubeSecrets {
    async fn secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, kube::Error> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        secrets.get_opt(name).await
    }
}

/// Replace the secret references of `awx` with the values they point to.
///
/// Credentials from the secret override the ones written in the files, certificates
/// are appended to the CA bundle.
pub async fn resolve_secrets(
    awx: &mut AwxConfig,
    source: Option<&dyn SecretSource>,
) -> Result<(), ConfigError> {
    if let Some(reference) = awx.credentials_ref.take() {
        let loaded = load(source, &reference).await?;
        if let Some(username) = loaded.value(USERNAME_KEY)? {
            awx.username = username;
        }
        if let Some(password) = loaded.value(PASSWORD_KEY)? {
            awx.password = password;
        }
        info!(
            namespace = %loaded.namespace,
            name = %loaded.name,
            "Loaded AWX credentials from secret"
        );
    }

    for reference in std::mem::take(&mut awx.tls_refs) {
        let loaded = load(source, &reference).await?;
        if let Some(certs) = loaded.value(CA_CERT_KEY)? {
            append_pem(&mut awx.ca_certs, &certs);
            info!(
                namespace = %loaded.namespace,
                name = %loaded.name,
                "Loaded AWX CA certificates from secret"
            );
        }
    }
    Ok(())
}

struct LoadedSecret {
    namespace: String,
    name: String,
    secret: Secret,
}

impl LoadedSecret {
    fn value(&self, key: &str) -> Result<Option<String>, ConfigError> {
        let Some(bytes) = self.secret.data.as_ref().and_then(|data| data.get(key)) else {
            return Ok(None);
        };
        String::from_utf8(bytes.0.clone())
            .map(Some)
            .map_err(|_| ConfigError::SecretValue {
                namespace: self.namespace.clone(),
                name: self.name.clone(),
                key: key.to_string(),
            })
    }
}

async fn load(
    source: Option<&dyn SecretSource>,
    reference: &SecretReference,
) -> Result<LoadedSecret, ConfigError> {
    let name = reference
        .name
        .clone()
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::InvalidSecretRef("name"))?;
    let namespace = reference
        .namespace
        .clone()
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::InvalidSecretRef("namespace"))?;

    let Some(source) = source else {
        return Err(ConfigError::NoKubernetes { namespace, name });
    };
    match source.secret(&namespace, &name).await {
        Ok(Some(secret)) => Ok(LoadedSecret {
            namespace,
            name,
            secret,
        }),
        Ok(None) => Err(ConfigError::SecretNotFound { namespace, name }),
        Err(source) => Err(ConfigError::Secret {
            namespace,
            name,
            source,
        }),
    }
}
