//! Dispatch engine.
//!
//! For every firing alert the engine takes a snapshot of the rules, keeps the ones the
//! alert activates, and runs each of them:
//!
//! 1. the rule's action is cloned and its templates are expanded with the alert data
//! 2. the action is counted as requested
//! 3. if an equal action ran within the throttling interval, nothing else happens
//! 4. otherwise the action is dispatched and remembered, even when dispatching fails
//!
//! Failures are confined to the rule they happen in; sibling rules still run.

use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::active_jobs::{ActiveJob, ActiveJobs};
use crate::alert::{Alert, AlertStatus};
use crate::error::{EngineError, RunnerError, TemplateError};
use crate::memory::ExpiringMemory;
use crate::metrics::MetricsSink;
use crate::rules::{matches, Action, HealingRule, RuleStore};
use crate::runner::{prepare_job, BatchJobCreator, BatchJobOutcome, JobLauncher};
use crate::template::{Expand, ObjectTemplate};

/// What happened to one activated rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleOutcome {
    /// The action was handed to its runner successfully
    Dispatched,
    /// An equal action ran recently, so this one was skipped
    Throttled,
    /// The action templates couldn't be expanded
    ExpansionFailed(String),
    /// The runner reported an error
    DispatchFailed(String),
}

impl fmt::Display for RuleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dispatched => f.write_str("dispatched"),
            Self::Throttled => f.write_str("throttled"),
            Self::ExpansionFailed(e) => write!(f, "expansion failed: {e}"),
            Self::DispatchFailed(e) => write!(f, "dispatch failed: {e}"),
        }
    }
}

/// Outcome of one activated rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleReport {
    pub rule: String,
    pub outcome: RuleOutcome,
}

/// Summary of the processing of one alert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertReport {
    pub alert: String,
    pub status: AlertStatus,
    /// One entry per activated rule, in execution order. Empty for resolved alerts.
    pub rules: Vec<RuleReport>,
}

impl AlertReport {
    fn new(alert: &Alert) -> Self {
        Self {
            alert: alert.name().to_string(),
            status: alert.status.clone(),
            rules: Vec::new(),
        }
    }

    /// Outcome of the named rule, if it was activated.
    #[must_use]
    pub fn outcome(&self, rule: &str) -> Option<&RuleOutcome> {
        self.rules
            .iter()
            .find(|report| report.rule == rule)
            .map(|report| &report.outcome)
    }

    /// Number of actions that were dispatched.
    #[must_use]
    pub fn dispatched(&self) -> usize {
        self.rules
            .iter()
            .filter(|report| report.outcome == RuleOutcome::Dispatched)
            .count()
    }
}

/// The healer's core: matches alerts to rules and runs their actions.
pub struct Engine {
    rules: Arc<RuleStore>,
    memory: ExpiringMemory<Action>,
    launcher: Arc<dyn JobLauncher>,
    creator: Arc<dyn BatchJobCreator>,
    active_jobs: Arc<ActiveJobs>,
    metrics: Arc<dyn MetricsSink>,
}

impl Engine {
    /// Create an engine that throttles equal actions for `throttle`.
    #[must_use]
    pub fn new(
        rules: Arc<RuleStore>,
        throttle: Duration,
        launcher: Arc<dyn JobLauncher>,
        creator: Arc<dyn BatchJobCreator>,
        active_jobs: Arc<ActiveJobs>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            rules,
            memory: ExpiringMemory::new(throttle),
            launcher,
            creator,
            active_jobs,
            metrics,
        }
    }

    #[must_use]
    pub fn rules(&self) -> &Arc<RuleStore> {
        &self.rules
    }

    #[must_use]
    pub fn memory(&self) -> &ExpiringMemory<Action> {
        &self.memory
    }

    /// Process one alert.
    ///
    /// Only a failure to turn the alert into template data is an error; everything
    /// that goes wrong with individual rules is logged and reported.
    pub async fn process_alert(&self, alert: &Alert) -> Result<AlertReport, EngineError> {
        match alert.status {
            AlertStatus::Firing => self.start_healing(alert).await,
            AlertStatus::Resolved => Ok(self.cancel_healing(alert)),
            AlertStatus::Unknown => {
                warn!(
                    alert = %alert.name(),
                    "Unknown status reported by alert manager, ignoring it"
                );
                Ok(AlertReport::new(alert))
            }
        }
    }

    async fn start_healing(&self, alert: &Alert) -> Result<AlertReport, EngineError> {
        let data = serde_json::to_value(alert).map_err(|e| EngineError::Context {
            alert: alert.name().to_string(),
            source: TemplateError::Json(e),
        })?;
        let mut report = AlertReport::new(alert);

        let activated: Vec<Arc<HealingRule>> = self
            .rules
            .snapshot()
            .await
            .into_iter()
            .filter(|rule| self.check_rule(rule, alert))
            .collect();
        if activated.is_empty() {
            info!(alert = %alert.name(), "No rule matches alert");
            return Ok(report);
        }

        for rule in activated {
            let outcome = self.run_rule(&rule, alert, &data).await;
            report.rules.push(RuleReport {
                rule: rule.name().to_string(),
                outcome,
            });
        }
        Ok(report)
    }

    /// Placeholder for undoing the healing of resolved alerts. Nothing to do yet.
    fn cancel_healing(&self, alert: &Alert) -> AlertReport {
        debug!(alert = %alert.name(), "Alert resolved");
        AlertReport::new(alert)
    }

    fn check_rule(&self, rule: &HealingRule, alert: &Alert) -> bool {
        debug!(rule = %rule.name(), alert = %alert.name(), "Checking rule");
        match matches(rule, alert) {
            Ok(true) => {
                info!(rule = %rule.name(), alert = %alert.name(), "Rule matches alert");
                true
            }
            Ok(false) => false,
            Err(e) => {
                error!(
                    rule = %rule.name(),
                    alert = %alert.name(),
                    error = %e,
                    "Error while checking if rule matches alert"
                );
                false
            }
        }
    }

    async fn run_rule(&self, rule: &HealingRule, alert: &Alert, data: &Value) -> RuleOutcome {
        info!(rule = %rule.name(), alert = %alert.name(), "Running rule for alert");

        // Work on a copy so the stored rule keeps its templates
        let mut action = rule.action.clone();
        let template = ObjectTemplate::for_alerts(rule.delimiters.as_ref());
        if let Err(e) = template
            .renderer(data)
            .and_then(|renderer| action.expand(&renderer))
        {
            error!(
                rule = %rule.name(),
                alert = %alert.name(),
                error = %e,
                "Failed to expand action templates"
            );
            return RuleOutcome::ExpansionFailed(e.to_string());
        }

        let kind = action.kind();
        let target = action.target().to_string();
        self.metrics.action_requested(kind, rule.name(), alert.name());

        if self.memory.has(&action) {
            info!(
                rule = %rule.name(),
                alert = %alert.name(),
                "Action has been executed recently, it will be ignored"
            );
            return RuleOutcome::Throttled;
        }

        let result = self.dispatch(rule, &action, alert).await;

        // Remembered even on failure, so a broken action doesn't run in a loop
        self.memory.add(action);

        match result {
            Ok(()) => RuleOutcome::Dispatched,
            Err(e) => {
                error!(
                    rule = %rule.name(),
                    alert = %alert.name(),
                    action = kind,
                    error = %e,
                    "Failed to run action"
                );
                self.metrics.action_failed(kind, &target, rule.name());
                RuleOutcome::DispatchFailed(e.to_string())
            }
        }
    }

    async fn dispatch(
        &self,
        rule: &HealingRule,
        action: &Action,
        alert: &Alert,
    ) -> Result<(), RunnerError> {
        let kind = action.kind();
        match action {
            Action::AwxJob(job) => {
                let id = self.launcher.launch(job, alert).await?;
                self.metrics.action_started(kind, &job.template, rule.name());
                self.active_jobs
                    .insert(
                        id,
                        ActiveJob {
                            rule: rule.name().to_string(),
                            template: job.template.clone(),
                        },
                    )
                    .await;
            }
            Action::BatchJob(job) => {
                let job = prepare_job(rule, (**job).clone())?;
                let name = action.target();
                info!(job = %name, alert = %alert.name(), "Running batch job to heal alert");
                match self.creator.create(job).await? {
                    BatchJobOutcome::Created => {
                        self.metrics.action_started(kind, name, rule.name());
                    }
                    BatchJobOutcome::AlreadyExists => {
                        warn!(
                            job = %name,
                            alert = %alert.name(),
                            "Batch job already exists, will do nothing to heal alert"
                        );
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::PrometheusMetrics;
    use crate::rules::JobAction;
    use crate::runner::{Disabled, JobId};
    use async_trait::async_trait;
    use k8s_openapi::api::batch::v1::Job;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingLauncher {
        launched: Mutex<Vec<JobAction>>,
    }

    #[async_trait]
    impl JobLauncher for RecordingLauncher {
        async fn launch(&self, action: &JobAction, _alert: &Alert) -> Result<JobId, RunnerError> {
            let mut launched = self.launched.lock().unwrap();
            launched.push(action.clone());
            Ok(JobId(i64::try_from(launched.len()).unwrap()))
        }
    }

    #[derive(Default)]
    struct RecordingCreator {
        created: Mutex<Vec<Job>>,
    }

    #[async_trait]
    impl BatchJobCreator for RecordingCreator {
        async fn create(&self, job: Job) -> Result<BatchJobOutcome, RunnerError> {
            self.created.lock().unwrap().push(job);
            Ok(BatchJobOutcome::Created)
        }
    }

    struct Fixture {
        engine: Engine,
        launcher: Arc<RecordingLauncher>,
        creator: Arc<RecordingCreator>,
        active_jobs: Arc<ActiveJobs>,
        metrics: Arc<PrometheusMetrics>,
    }

    async fn fixture(rules: Vec<HealingRule>) -> Fixture {
        let store = Arc::new(RuleStore::new());
        for rule in rules {
            store.upsert(rule).await;
        }
        let launcher = Arc::new(RecordingLauncher::default());
        let creator = Arc::new(RecordingCreator::default());
        let active_jobs = Arc::new(ActiveJobs::new());
        let metrics = Arc::new(PrometheusMetrics::new());
        let engine = Engine::new(
            store,
            Duration::from_secs(3600),
            Arc::clone(&launcher) as Arc<dyn JobLauncher>,
            Arc::clone(&creator) as Arc<dyn BatchJobCreator>,
            Arc::clone(&active_jobs),
            Arc::clone(&metrics) as Arc<dyn MetricsSink>,
        );
        Fixture {
            engine,
            launcher,
            creator,
            active_jobs,
            metrics,
        }
    }

    fn awx_rule(name: &str, template: &str) -> HealingRule {
        HealingRule::new(
            name,
            Action::AwxJob(JobAction {
                template: template.to_string(),
                extra_vars: json!({ "node": "{{labels.instance}}" }),
                limit: None,
            }),
        )
    }

    fn batch_rule(name: &str, job_name: &str) -> HealingRule {
        let job: Job = serde_json::from_value(json!({
            "metadata": { "name": job_name },
            "spec": { "template": { "spec": { "containers": [] } } }
        }))
        .unwrap();
        HealingRule::new(name, Action::BatchJob(Box::new(job)))
    }

    #[tokio::test]
    async fn test_expanded_action_is_dispatched() {
        let f = fixture(vec![awx_rule("start-node", "Start node").with_label("alertname", "NodeDown")]).await;
        let alert = Alert::firing("NodeDown").with_label("instance", "node0");

        let report = f.engine.process_alert(&alert).await.unwrap();

        assert_eq!(report.outcome("start-node"), Some(&RuleOutcome::Dispatched));
        let launched = f.launcher.launched.lock().unwrap().clone();
        assert_eq!(launched[0].extra_vars, json!({ "node": "node0" }));
        assert_eq!(f.active_jobs.ids().await, vec![JobId(1)]);
        assert_eq!(f.metrics.requested("AWXJob", "start-node", "NodeDown"), 1);
        assert_eq!(f.metrics.launched("AWXJob", "Start node", "start-node", "running"), 1);

        // The stored rule keeps its template
        let stored = f.engine.rules().get("start-node").await.unwrap();
        match &stored.action {
            Action::AwxJob(job) => assert_eq!(job.extra_vars["node"], "{{labels.instance}}"),
            Action::BatchJob(_) => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_repeated_alert_is_throttled_but_counted() {
        let f = fixture(vec![awx_rule("start-node", "Start node")]).await;
        let alert = Alert::firing("NodeDown").with_label("instance", "node0");

        f.engine.process_alert(&alert).await.unwrap();
        let report = f.engine.process_alert(&alert).await.unwrap();

        assert_eq!(report.outcome("start-node"), Some(&RuleOutcome::Throttled));
        assert_eq!(f.launcher.launched.lock().unwrap().len(), 1);
        assert_eq!(f.metrics.requested("AWXJob", "start-node", "NodeDown"), 2);
    }

    #[tokio::test]
    async fn test_different_expansion_is_not_throttled() {
        let f = fixture(vec![awx_rule("start-node", "Start node")]).await;

        f.engine
            .process_alert(&Alert::firing("NodeDown").with_label("instance", "node0"))
            .await
            .unwrap();
        let report = f
            .engine
            .process_alert(&Alert::firing("NodeDown").with_label("instance", "node1"))
            .await
            .unwrap();

        assert_eq!(report.dispatched(), 1);
        assert_eq!(f.launcher.launched.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_expansion_failure_skips_only_that_rule() {
        let broken = HealingRule::new(
            "broken",
            Action::AwxJob(JobAction {
                template: "{{labels.missing}}".to_string(),
                ..JobAction::default()
            }),
        );
        let f = fixture(vec![broken, awx_rule("start-node", "Start node")]).await;
        let alert = Alert::firing("NodeDown").with_label("instance", "node0");

        let report = f.engine.process_alert(&alert).await.unwrap();

        assert!(matches!(report.outcome("broken"), Some(RuleOutcome::ExpansionFailed(_))));
        assert_eq!(report.outcome("start-node"), Some(&RuleOutcome::Dispatched));
        assert_eq!(f.metrics.requested("AWXJob", "broken", "NodeDown"), 0);
    }

    #[tokio::test]
    async fn test_dispatch_failure_is_remembered() {
        let store = Arc::new(RuleStore::new());
        store.upsert(awx_rule("start-node", "Start node")).await;
        let metrics = Arc::new(PrometheusMetrics::new());
        let engine = Engine::new(
            store,
            Duration::from_secs(3600),
            Arc::new(Disabled("AWX")),
            Arc::new(Disabled("Kubernetes")),
            Arc::new(ActiveJobs::new()),
            Arc::clone(&metrics) as Arc<dyn MetricsSink>,
        );
        let alert = Alert::firing("NodeDown").with_label("instance", "node0");

        let first = engine.process_alert(&alert).await.unwrap();
        assert_eq!(
            first.outcome("start-node"),
            Some(&RuleOutcome::DispatchFailed("AWX is not configured".to_string()))
        );
        assert_eq!(metrics.launched("AWXJob", "Start node", "start-node", "failed"), 1);
        assert_eq!(engine.memory().len(), 1);

        let second = engine.process_alert(&alert).await.unwrap();
        assert_eq!(second.outcome("start-node"), Some(&RuleOutcome::Throttled));
        assert_eq!(metrics.requested("AWXJob", "start-node", "NodeDown"), 2);
    }

    #[tokio::test]
    async fn test_batch_job_is_created_in_rule_namespace() {
        let mut rule = batch_rule("restart", "restart-{{labels.instance}}");
        rule.metadata.namespace = Some("ops".to_string());
        let f = fixture(vec![rule]).await;

        let report = f
            .engine
            .process_alert(&Alert::firing("PodDown").with_label("instance", "node0"))
            .await
            .unwrap();

        assert_eq!(report.dispatched(), 1);
        let created = f.creator.created.lock().unwrap().clone();
        assert_eq!(created[0].metadata.name.as_deref(), Some("restart-node0"));
        assert_eq!(created[0].metadata.namespace.as_deref(), Some("ops"));
        assert!(f.active_jobs.is_empty().await);
        assert_eq!(f.metrics.launched("BatchJob", "restart-node0", "restart", "running"), 1);
    }

    #[tokio::test]
    async fn test_nameless_batch_job_fails() {
        let f = fixture(vec![batch_rule("restart", "")]).await;
        let report = f.engine.process_alert(&Alert::firing("PodDown")).await.unwrap();
        assert!(matches!(report.outcome("restart"), Some(RuleOutcome::DispatchFailed(_))));
        assert!(f.creator.created.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_pattern_is_not_activated() {
        let f = fixture(vec![
            awx_rule("bad", "t").with_label("alertname", "Node(Down"),
            awx_rule("good", "t").with_label("alertname", "NodeDown"),
        ])
        .await;
        let report = f
            .engine
            .process_alert(&Alert::firing("NodeDown").with_label("instance", "node0"))
            .await
            .unwrap();
        assert_eq!(report.outcome("bad"), None);
        assert_eq!(report.outcome("good"), Some(&RuleOutcome::Dispatched));
    }

    #[tokio::test]
    async fn test_resolved_and_unknown_alerts_do_nothing() {
        let f = fixture(vec![awx_rule("start-node", "Start node")]).await;

        let mut resolved = Alert::firing("NodeDown").with_label("instance", "node0");
        resolved.status = AlertStatus::Resolved;
        let report = f.engine.process_alert(&resolved).await.unwrap();
        assert!(report.rules.is_empty());

        let mut unknown = resolved.clone();
        unknown.status = AlertStatus::Unknown;
        assert!(f.engine.process_alert(&unknown).await.unwrap().rules.is_empty());

        assert!(f.launcher.launched.lock().unwrap().is_empty());
    }
}
