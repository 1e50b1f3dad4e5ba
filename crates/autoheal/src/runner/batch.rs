//! Kubernetes batch job creation.

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use kube::api::PostParams;
use kube::{Api, Client};
use tracing::{info, warn};

use super::{BatchJobCreator, BatchJobOutcome};
use crate::error::RunnerError;
use crate::rules::{HealingRule, DEFAULT_NAMESPACE};

/// Check that the job of `rule` has a name and give it the rule's namespace if it
/// has none.
pub fn prepare_job(rule: &HealingRule, mut job: Job) -> Result<Job, RunnerError> {
    if job.metadata.name.as_deref().unwrap_or("").is_empty() {
        return Err(RunnerError::MissingJobName {
            rule: rule.name().to_string(),
        });
    }
    if job.metadata.namespace.as_deref().unwrap_or("").is_empty() {
        job.metadata.namespace = Some(rule.namespace().to_string());
    }
    Ok(job)
}

/// Creates batch jobs through the Kubernetes API.
#[derive(Clone)]
pub struct KubeBatchJobCreator {
    client: Client,
}

impl KubeBatchJobCreator {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BatchJobCreator for KubeBatchJobCreator {
    async fn create(&self, job: Job) -> Result<BatchJobOutcome, RunnerError> {
        let name = job.metadata.name.clone().unwrap_or_default();
        let namespace = job
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());

        let jobs: Api<Job> = Api::namespaced(self.client.clone(), &namespace);
        match jobs.create(&PostParams::default(), &job).await {
            Ok(_) => {
                info!(job = %name, namespace = %namespace, "Batch job was created");
                Ok(BatchJobOutcome::Created)
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                warn!(
                    job = %name,
                    namespace = %namespace,
                    "Batch job already exists, not creating it again"
                );
                Ok(BatchJobOutcome::AlreadyExists)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::Action;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn job(name: Option<&str>, namespace: Option<&str>) -> Job {
        Job {
            metadata: ObjectMeta {
                name: name.map(str::to_string),
                namespace: namespace.map(str::to_string),
                ..ObjectMeta::default()
            },
            ..Job::default()
        }
    }

    fn rule(namespace: Option<&str>) -> HealingRule {
        let mut rule = HealingRule::new("restart", Action::BatchJob(Box::default()));
        rule.metadata.namespace = namespace.map(str::to_string);
        rule
    }

    #[test]
    fn test_job_without_name_is_rejected() {
        let err = prepare_job(&rule(None), job(None, None)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "can't create job for rule 'restart', the name hasn't been specified"
        );
        assert!(prepare_job(&rule(None), job(Some(""), None)).is_err());
    }

    #[test]
    fn test_namespace_defaults_to_rule() {
        let prepared = prepare_job(&rule(Some("ops")), job(Some("heal"), None)).unwrap();
        assert_eq!(prepared.metadata.namespace.as_deref(), Some("ops"));

        let prepared = prepare_job(&rule(None), job(Some("heal"), None)).unwrap();
        assert_eq!(prepared.metadata.namespace.as_deref(), Some("default"));
    }

    #[test]
    fn test_job_namespace_wins() {
        let prepared =
            prepare_job(&rule(Some("ops")), job(Some("heal"), Some("batch"))).unwrap();
        assert_eq!(prepared.metadata.namespace.as_deref(), Some("batch"));
    }
}
