//! Minimal AWX REST client.
//!
//! Only the three calls the healer needs are implemented:
//! - find a job template by project and name
//! - launch it with extra variables and a host limit
//! - read the status of a job

use async_trait::async_trait;
use reqwest::{Certificate, Client, Proxy, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{JobId, JobLauncher, JobStatus, JobStatusQuerier};
use crate::alert::Alert;
use crate::error::RunnerError;
use crate::rules::JobAction;

/// Default timeout of each request to AWX.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection details for the AWX server.
#[derive(Debug, Clone, PartialEq)]
pub struct AwxSettings {
    /// Base URL, with or without the trailing `/api`
    pub address: String,
    pub proxy: Option<String>,
    pub username: String,
    pub password: String,
    /// Skip TLS certificate verification
    pub insecure: bool,
    /// Extra trusted CA certificates, PEM encoded
    pub ca_certs: Option<String>,
    /// Project the job templates belong to
    pub project: String,
    pub timeout: Duration,
}

impl Default for AwxSettings {
    fn default() -> Self {
        Self {
            address: String::new(),
            proxy: None,
            username: String::new(),
            password: String::new(),
            insecure: false,
            ca_certs: None,
            project: String::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(default)]
    count: u64,
    #[serde(default = "Vec::new")]
    results: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct JobTemplate {
    id: i64,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct LaunchResponse {
    job: i64,
}

#[derive(Debug, Deserialize)]
struct JobResponse {
    id: i64,
    status: JobStatus,
}

/// AWX client implementing [`JobLauncher`] and [`JobStatusQuerier`].
#[derive(Debug, Clone)]
pub struct AwxClient {
    http: Client,
    api: String,
    username: String,
    password: String,
    project: String,
}

impl AwxClient {
    /// Build the client. Fails if the proxy URL or the CA certificates are invalid.
    pub fn new(settings: &AwxSettings) -> Result<Self, RunnerError> {
        let mut builder = Client::builder()
            .timeout(settings.timeout)
            .danger_accept_invalid_certs(settings.insecure);
        if let Some(proxy) = settings.proxy.as_deref().filter(|p| !p.is_empty()) {
            builder = builder.proxy(Proxy::all(proxy)?);
        }
        if let Some(pem) = settings.ca_certs.as_deref().filter(|p| !p.is_empty()) {
            for certificate in Certificate::from_pem_bundle(pem.as_bytes())? {
                builder = builder.add_root_certificate(certificate);
            }
        }

        Ok(Self {
            http: builder.build()?,
            api: api_root(&settings.address),
            username: settings.username.clone(),
            password: settings.password.clone(),
            project: settings.project.clone(),
        })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        if self.username.is_empty() {
            request
        } else {
            request.basic_auth(&self.username, Some(&self.password))
        }
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, RunnerError> {
        let response = self.authorize(request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RunnerError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }

    async fn find_template(&self, name: &str) -> Result<JobTemplate, RunnerError> {
        let request = self
            .http
            .get(format!("{}/v2/job_templates/", self.api))
            .query(&[("project__name", self.project.as_str()), ("name", name)]);
        let page: Page<JobTemplate> = self.send(request).await?;

        if page.count > 1 {
            warn!(
                template = %name,
                project = %self.project,
                count = page.count,
                "Several job templates match, using the first one"
            );
        }
        page.results
            .into_iter()
            .next()
            .ok_or_else(|| RunnerError::TemplateNotFound {
                template: name.to_string(),
                project: self.project.clone(),
            })
    }
}

#[async_trait]
impl JobLauncher for AwxClient {
    async fn launch(&self, action: &JobAction, alert: &Alert) -> Result<JobId, RunnerError> {
        let template = self.find_template(&action.template).await?;
        info!(
            project = %self.project,
            template = %template.name,
            alert = %alert.name(),
            "Running AWX job to heal alert"
        );

        let body = launch_body(action, alert)?;
        let request = self
            .http
            .post(format!("{}/v2/job_templates/{}/launch/", self.api, template.id))
            .json(&body);
        let response: LaunchResponse = self.send(request).await?;

        info!(
            template = %template.name,
            job = response.job,
            "Request to launch AWX job has been sent"
        );
        Ok(JobId(response.job))
    }
}

#[async_trait]
impl JobStatusQuerier for AwxClient {
    async fn status(&self, id: JobId) -> Result<JobStatus, RunnerError> {
        let request = self.http.get(format!("{}/v2/jobs/{id}/", self.api));
        let job: JobResponse = self.send(request).await?;
        debug!(job = job.id, status = %job.status, "Retrieved AWX job status");
        Ok(job.status)
    }
}

/// `https://awx.example.com` and `https://awx.example.com/api/` both become
/// `https://awx.example.com/api`.
fn api_root(address: &str) -> String {
    let address = address.trim_end_matches('/');
    if address.ends_with("/api") {
        address.to_string()
    } else {
        format!("{address}/api")
    }
}

/// Request body of the launch call: the action's extra variables plus the alert.
fn launch_body(action: &JobAction, alert: &Alert) -> Result<Value, RunnerError> {
    let mut extra_vars = match &action.extra_vars {
        Value::Object(vars) => vars.clone(),
        Value::Null => Map::new(),
        other => {
            warn!(
                template = %action.template,
                extra_vars = %other,
                "Extra variables aren't an object, ignoring them"
            );
            Map::new()
        }
    };
    extra_vars.insert("alert".to_string(), serde_json::to_value(alert)?);

    let mut body = json!({ "extra_vars": extra_vars });
    if let Some(limit) = action.limit.as_deref().filter(|l| !l.is_empty()) {
        body["limit"] = json!(limit);
    }
    Ok(body)
}
