//! Healing rules.
//!
//! A healing rule pairs a set of label/annotation regular expressions with exactly
//! one remediation action:
//! - `awxJob`: launch an AWX job template
//! - `batchJob`: create a Kubernetes batch job
//!
//! Rules arrive from the configuration as [`RuleChange`] events and live in the
//! [`RuleStore`] until they are deleted.

pub mod matcher;
pub mod store;

use k8s_openapi::api::batch::v1::Job;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;

use crate::error::TemplateError;
use crate::template::{Expand, Renderer};

pub use matcher::matches;
pub use store::{RuleStore, UpsertOutcome};

/// Namespace used for batch jobs when neither the job nor the rule names one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// A named predicate-plus-action configuration entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RuleDocument")]
pub struct HealingRule {
    /// Identity of the rule
    pub metadata: RuleMetadata,
    /// Label name -> regular expression the alert label has to match
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Annotation name -> regular expression the alert annotation has to match
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Template delimiters for this rule's action, when `{{ }}` collides with the payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delimiters: Option<Delimiters>,
    /// What to run when the rule is activated
    #[serde(flatten)]
    pub action: Action,
}

/// Rule identity.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleMetadata {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Version reported by the rule source; a content digest is used when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

/// Opening and closing template delimiters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delimiters {
    pub left: String,
    pub right: String,
}

/// Remediation action of a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Action {
    /// Launch an AWX job template
    AwxJob(JobAction),
    /// Create a Kubernetes batch job
    BatchJob(Box<Job>),
}

/// How to launch an AWX job.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobAction {
    /// Name of the AWX job template
    pub template: String,
    /// Extra variables passed to the job
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub extra_vars: serde_json::Value,
    /// Host limit pattern
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<String>,
}

/// Rule as written in a configuration file, where the action is one of two optional
/// fields.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RuleDocument {
    metadata: RuleMetadata,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
    #[serde(default)]
    delimiters: Option<Delimiters>,
    #[serde(default)]
    awx_job: Option<JobAction>,
    #[serde(default)]
    batch_job: Option<Box<Job>>,
}

impl TryFrom<RuleDocument> for HealingRule {
    type Error = String;

    fn try_from(document: RuleDocument) -> Result<Self, Self::Error> {
        let action = match (document.awx_job, document.batch_job) {
            (Some(job), None) => Action::AwxJob(job),
            (None, Some(job)) => Action::BatchJob(job),
            (Some(_), Some(_)) => {
                return Err(format!(
                    "rule '{}' has both an AWX job and a batch job action, only one is allowed",
                    document.metadata.name
                ))
            }
            (None, None) => {
                return Err(format!(
                    "rule '{}' has no action, it needs an AWX job or a batch job",
                    document.metadata.name
                ))
            }
        };
        Ok(Self {
            metadata: document.metadata,
            labels: document.labels,
            annotations: document.annotations,
            delimiters: document.delimiters,
            action,
        })
    }
}

impl HealingRule {
    /// Create a rule without constraints.
    #[must_use]
    pub fn new(name: &str, action: Action) -> Self {
        Self {
            metadata: RuleMetadata {
                name: name.to_string(),
                ..RuleMetadata::default()
            },
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            delimiters: None,
            action,
        }
    }

    /// Add a label constraint, builder style.
    #[must_use]
    pub fn with_label(mut self, key: &str, pattern: &str) -> Self {
        self.labels.insert(key.to_string(), pattern.to_string());
        self
    }

    /// Add an annotation constraint, builder style.
    #[must_use]
    pub fn with_annotation(mut self, key: &str, pattern: &str) -> Self {
        self.annotations.insert(key.to_string(), pattern.to_string());
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Namespace of the rule, `default` when unset.
    #[must_use]
    pub fn namespace(&self) -> &str {
        self.metadata
            .namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .unwrap_or(DEFAULT_NAMESPACE)
    }

    /// Version used to decide whether an upsert replaces the stored rule.
    ///
    /// Rules coming from configuration files have no resource version, so the SHA-1 of
    /// their serialized content stands in for it.
    #[must_use]
    pub fn version(&self) -> String {
        if let Some(version) = &self.metadata.resource_version {
            return version.clone();
        }
        let content = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha1::digest(&content))
    }
}

impl Action {
    /// Action type label used in metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AwxJob(_) => "AWXJob",
            Self::BatchJob(_) => "BatchJob",
        }
    }

    /// Template (AWX) or job (batch) name used in metrics and logs.
    #[must_use]
    pub fn target(&self) -> &str {
        match self {
            Self::AwxJob(job) => &job.template,
            Self::BatchJob(job) => job.metadata.name.as_deref().unwrap_or(""),
        }
    }
}

impl Expand for JobAction {
    fn expand(&mut self, renderer: &Renderer<'_>) -> Result<(), TemplateError> {
        self.template.expand(renderer)?;
        self.extra_vars.expand(renderer)?;
        self.limit.expand(renderer)
    }
}

impl Expand for Action {
    fn expand(&mut self, renderer: &Renderer<'_>) -> Result<(), TemplateError> {
        match self {
            Self::AwxJob(job) => job.expand(renderer),
            Self::BatchJob(job) => job.expand(renderer),
        }
    }
}

/// Kind of change applied to the rule store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

/// A change event for the rule store.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleChange {
    pub kind: ChangeKind,
    pub rule: HealingRule,
}

impl RuleChange {
    #[must_use]
    pub fn added(rule: HealingRule) -> Self {
        Self {
            kind: ChangeKind::Added,
            rule,
        }
    }

    #[must_use]
    pub fn modified(rule: HealingRule) -> Self {
        Self {
            kind: ChangeKind::Modified,
            rule,
        }
    }

    #[must_use]
    pub fn deleted(rule: HealingRule) -> Self {
        Self {
            kind: ChangeKind::Deleted,
            rule,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_awx_rule() {
        let yaml = r#"
metadata:
  name: start-node
labels:
  alertname: "NodeDown"
awxJob:
  template: "Start node"
  extraVars:
    node: "{{labels.instance}}"
  limit: "{{labels.instance}}"
"#;
        let rule: HealingRule = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(rule.name(), "start-node");
        assert_eq!(rule.labels["alertname"], "NodeDown");
        match &rule.action {
            Action::AwxJob(job) => {
                assert_eq!(job.template, "Start node");
                assert_eq!(job.extra_vars["node"], "{{labels.instance}}");
                assert_eq!(job.limit.as_deref(), Some("{{labels.instance}}"));
            }
            Action::BatchJob(_) => panic!("expected an AWX job action"),
        }
        assert_eq!(rule.action.kind(), "AWXJob");
        assert_eq!(rule.namespace(), DEFAULT_NAMESPACE);
    }

    #[test]
    fn test_parse_batch_rule() {
        let yaml = r#"
metadata:
  name: restart-pod
  namespace: ops
annotations:
  severity: "critical|warning"
delimiters:
  left: "[["
  right: "]]"
batchJob:
  metadata:
    name: restart
  spec:
    template:
      spec:
        restartPolicy: Never
        containers:
        - name: restart
          image: busybox
          command: ["echo", "[[ labels.pod ]]"]
"#;
        let rule: HealingRule = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(rule.namespace(), "ops");
        assert_eq!(rule.action.kind(), "BatchJob");
        assert_eq!(rule.action.target(), "restart");
        assert_eq!(rule.delimiters.as_ref().unwrap().left, "[[");
    }

    #[test]
    fn test_rule_without_action_is_rejected() {
        let yaml = "metadata:\n  name: nothing\nlabels:\n  alertname: NodeDown\n";
        assert!(serde_yaml::from_str::<HealingRule>(yaml).is_err());
    }

    #[test]
    fn test_rule_with_two_actions_is_rejected() {
        let yaml = r#"
metadata:
  name: both
awxJob:
  template: Start node
batchJob:
  metadata:
    name: restart
"#;
        let err = serde_yaml::from_str::<HealingRule>(yaml).unwrap_err();
        assert!(err.to_string().contains("only one is allowed"), "{err}");
    }

    #[test]
    fn test_serialized_rule_parses_back() {
        let rule = HealingRule::new(
            "start-node",
            Action::AwxJob(JobAction {
                template: "Start node".to_string(),
                ..JobAction::default()
            }),
        )
        .with_label("alertname", "NodeDown");
        let yaml = serde_yaml::to_string(&rule).unwrap();
        assert!(yaml.contains("awxJob:"));
        assert_eq!(serde_yaml::from_str::<HealingRule>(&yaml).unwrap(), rule);
    }

    #[test]
    fn test_version_prefers_resource_version() {
        let mut rule = HealingRule::new("r", Action::AwxJob(JobAction::default()));
        let digest = rule.version();
        assert_eq!(digest.len(), 40);
        assert_eq!(digest, rule.clone().version());

        rule.metadata.resource_version = Some("42".to_string());
        assert_eq!(rule.version(), "42");
    }

    #[test]
    fn test_version_changes_with_content() {
        let rule = HealingRule::new("r", Action::AwxJob(JobAction::default()));
        let changed = rule.clone().with_label("alertname", "NodeDown");
        assert_ne!(rule.version(), changed.version());
    }
}
