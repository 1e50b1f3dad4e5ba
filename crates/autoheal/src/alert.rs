//! Alertmanager webhook types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Alertmanager webhook payload.
///
/// Reference: <https://prometheus.io/docs/alerting/latest/configuration/#webhook_config>
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertmanagerPayload {
    /// Version of the payload format
    #[serde(default)]
    pub version: String,
    /// Unique identifier for this group of alerts
    #[serde(default)]
    pub group_key: String,
    /// Number of truncated alerts (if any)
    #[serde(default)]
    pub truncated_alerts: u32,
    /// Status of the group
    #[serde(default)]
    pub status: AlertStatus,
    /// Receiver that matched this alert
    #[serde(default)]
    pub receiver: String,
    /// Labels common to all alerts in this group
    #[serde(default)]
    pub group_labels: HashMap<String, String>,
    /// Labels common to all alerts (may include group labels)
    #[serde(default)]
    pub common_labels: HashMap<String, String>,
    /// Annotations common to all alerts
    #[serde(default)]
    pub common_annotations: HashMap<String, String>,
    /// External URL for Alertmanager
    #[serde(default, rename = "externalURL")]
    pub external_url: String,
    /// List of alerts in this notification
    #[serde(default)]
    pub alerts: Vec<Alert>,
}

/// Lifecycle state reported by Alertmanager.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    #[default]
    Firing,
    Resolved,
    /// Anything else Alertmanager may send; kept so the payload still parses
    #[serde(other)]
    Unknown,
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Firing => "firing",
            Self::Resolved => "resolved",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Individual alert from Alertmanager.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    /// Firing or resolved
    #[serde(default)]
    pub status: AlertStatus,
    /// Alert labels
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Alert annotations
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    /// When the alert started firing
    #[serde(default)]
    pub starts_at: Option<DateTime<Utc>>,
    /// When the alert was resolved (if resolved)
    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
    /// URL to the alert source
    #[serde(default, rename = "generatorURL")]
    pub generator_url: String,
    /// Unique fingerprint for this alert
    #[serde(default)]
    pub fingerprint: String,
}

impl Alert {
    /// Create a firing alert with the given name and no other data.
    #[must_use]
    pub fn firing(name: &str) -> Self {
        let mut labels = HashMap::new();
        labels.insert("alertname".to_string(), name.to_string());
        Self {
            status: AlertStatus::Firing,
            labels,
            ..Self::default()
        }
    }

    /// Add a label, builder style.
    #[must_use]
    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    /// Add an annotation, builder style.
    #[must_use]
    pub fn with_annotation(mut self, key: &str, value: &str) -> Self {
        self.annotations.insert(key.to_string(), value.to_string());
        self
    }

    /// Get the alert name (the `alertname` label).
    #[must_use]
    pub fn name(&self) -> &str {
        self.labels.get("alertname").map_or("", String::as_str)
    }
}
