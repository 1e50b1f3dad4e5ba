//! Error types for the healer.

use thiserror::Error;

/// Errors raised while checking whether a rule matches an alert.
#[derive(Debug, Error)]
pub enum MatchError {
    /// A label or annotation pattern of the rule isn't a valid regular expression
    #[error("invalid {field} pattern for key '{key}': {source}")]
    InvalidPattern {
        field: &'static str,
        key: String,
        #[source]
        source: regex::Error,
    },
}

/// Errors raised while expanding the templates inside an action.
#[derive(Debug, Error)]
pub enum TemplateError {
    /// The template is malformed or references something that doesn't exist
    #[error("failed to render template '{text}': {source}")]
    Render {
        text: String,
        #[source]
        source: Box<handlebars::RenderError>,
    },

    /// The alert or the action couldn't be converted to or from JSON
    #[error("JSON conversion failed: {0}")]
    Json(#[from] serde_json::Error),

    /// A variable path doesn't point inside the alert
    #[error("variable '{name}' refers to missing path '{path}'")]
    UnknownVariable { name: String, path: String },
}

/// Errors returned by the action runners and the job status querier.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The backend needed by the action isn't configured
    #[error("{0} is not configured")]
    NotConfigured(&'static str),

    /// No AWX job template with the requested name exists in the project
    #[error("template '{template}' not found in project '{project}'")]
    TemplateNotFound { template: String, project: String },

    /// The batch job of a rule has no name
    #[error("can't create job for rule '{rule}', the name hasn't been specified")]
    MissingJobName { rule: String },

    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The AWX API answered with an unexpected status
    #[error("AWX API returned {status}: {body}")]
    Api { status: u16, body: String },

    /// A request or response body couldn't be converted to or from JSON
    #[error("JSON conversion failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Kubernetes API request failed
    #[error("Kubernetes API request failed: {0}")]
    Kube(#[from] kube::Error),
}

/// Errors raised while loading the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No configuration file was given
    #[error("no configuration file has been provided")]
    NoFiles,

    /// A file or directory couldn't be read
    #[error("can't read '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A file isn't valid YAML or doesn't follow the schema
    #[error("can't parse '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    /// A duration string can't be parsed
    #[error("invalid duration '{0}'")]
    InvalidDuration(String),

    /// A polling interval was set to zero
    #[error("interval '{0}' must be greater than zero")]
    ZeroInterval(String),

    /// A secret reference lacks its name or namespace
    #[error("the {0} of the secret is mandatory, but it hasn't been specified")]
    InvalidSecretRef(&'static str),

    /// A secret is referenced but there is no connection to Kubernetes
    #[error("can't load secret '{name}' from namespace '{namespace}' because there is no connection to the Kubernetes API")]
    NoKubernetes { namespace: String, name: String },

    /// The referenced secret doesn't exist
    #[error("secret '{name}' doesn't exist in namespace '{namespace}'")]
    SecretNotFound { namespace: String, name: String },

    /// The referenced secret couldn't be retrieved
    #[error("can't load secret '{name}' from namespace '{namespace}': {source}")]
    Secret {
        namespace: String,
        name: String,
        #[source]
        source: kube::Error,
    },

    /// A secret value isn't valid UTF-8
    #[error("key '{key}' of secret '{name}' in namespace '{namespace}' isn't valid text")]
    SecretValue {
        namespace: String,
        name: String,
        key: String,
    },
}

/// Errors that abort the processing of a whole alert.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The alert couldn't be turned into a template context
    #[error("can't build template context for alert '{alert}': {source}")]
    Context {
        alert: String,
        #[source]
        source: TemplateError,
    },
}
