//! Cluster access over the plain Kubernetes REST API, authenticated with the
//! in-cluster service account.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use base64::Engine;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::binding::{RepositoryBinding, SecretRef, SecretStore};
use crate::tekton::{
    Recorder, RunObject, RunSnapshot, RunState, TektonClient, run_state_of,
};

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
const PIPELINERUN_API: &str = "/apis/tekton.dev/v1/namespaces";

pub struct KubeHttpClient {
    client: reqwest::Client,
    base_url: String,
    token: SecretString,
}

impl KubeHttpClient {
    /// Build a client from the in-cluster service account environment
    /// (`KUBERNETES_SERVICE_HOST`/`PORT`, token and CA under
    /// `/var/run/secrets/kubernetes.io/serviceaccount`).
    pub fn from_cluster_env() -> anyhow::Result<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .context("KUBERNETES_SERVICE_HOST is not set, not running in a cluster?")?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());
        let dir = Path::new(SERVICE_ACCOUNT_DIR);
        let token = std::fs::read_to_string(dir.join("token"))
            .context("Could not read service account token")?;
        let ca = std::fs::read(dir.join("ca.crt")).context("Could not read cluster CA")?;
        let client = reqwest::Client::builder()
            .add_root_certificate(
                reqwest::Certificate::from_pem(&ca).context("Invalid cluster CA certificate")?,
            )
            .build()
            .context("Could not build Kubernetes HTTP client")?;
        Ok(Self {
            client,
            base_url: format!("https://{host}:{port}"),
            token: SecretString::new(token.trim().to_string()),
        })
    }

    pub fn new(client: reqwest::Client, base_url: String, token: SecretString) -> Self {
        Self {
            client,
            base_url,
            token,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{path}", self.base_url))
            .bearer_auth(self.token.expose_secret())
    }

    async fn check(response: reqwest::Response, action: &str) -> anyhow::Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(anyhow::anyhow!("{action} failed ({status}): {body}"))
    }
}

#[async_trait]
impl TektonClient for KubeHttpClient {
    async fn create_pipeline_run(&self, run: &RunObject, pending: bool) -> anyhow::Result<()> {
        let mut manifest = run.manifest.clone();
        if pending {
            manifest["spec"]["status"] = serde_json::json!("PipelineRunPending");
        }
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("{PIPELINERUN_API}/{}/pipelineruns", run.namespace),
            )
            .json(&manifest)
            .send()
            .await
            .context("Cannot reach the cluster API")?;
        Self::check(response, "PipelineRun creation").await?;
        Ok(())
    }

    async fn start_pipeline_run(&self, namespace: &str, name: &str) -> anyhow::Result<()> {
        self.patch_spec_status(namespace, name, serde_json::Value::Null)
            .await
    }

    async fn cancel_pipeline_run(&self, namespace: &str, name: &str) -> anyhow::Result<()> {
        self.patch_spec_status(namespace, name, serde_json::json!("CancelledRunFinally"))
            .await
    }

    async fn delete_pipeline_run(&self, namespace: &str, name: &str) -> anyhow::Result<()> {
        let response = self
            .request(
                reqwest::Method::DELETE,
                &format!("{PIPELINERUN_API}/{namespace}/pipelineruns/{name}"),
            )
            .send()
            .await
            .context("Cannot reach the cluster API")?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check(response, "PipelineRun deletion").await?;
        Ok(())
    }

    async fn list_pipeline_runs(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> anyhow::Result<Vec<RunSnapshot>> {
        #[derive(Deserialize)]
        struct RunList {
            #[serde(default)]
            items: Vec<serde_json::Value>,
        }

        let response = self
            .request(
                reqwest::Method::GET,
                &format!("{PIPELINERUN_API}/{namespace}/pipelineruns"),
            )
            .query(&[("labelSelector", label_selector)])
            .send()
            .await
            .context("Cannot reach the cluster API")?;
        let list: RunList = Self::check(response, "PipelineRun listing")
            .await?
            .json()
            .await
            .context("Cannot deserialize PipelineRun list")?;

        Ok(list.items.iter().map(snapshot_of).collect())
    }

    async fn list_task_runs(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> anyhow::Result<Vec<serde_json::Value>> {
        #[derive(Deserialize)]
        struct TaskRunList {
            #[serde(default)]
            items: Vec<serde_json::Value>,
        }

        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/apis/tekton.dev/v1/namespaces/{namespace}/taskruns"),
            )
            .query(&[("labelSelector", label_selector)])
            .send()
            .await
            .context("Cannot reach the cluster API")?;
        let list: TaskRunList = Self::check(response, "TaskRun listing")
            .await?
            .json()
            .await
            .context("Cannot deserialize TaskRun list")?;
        Ok(list.items)
    }
}

impl KubeHttpClient {
    /// All `Repository` resources in the cluster, to seed and refresh the
    /// binding cache.
    pub async fn list_repository_bindings(&self) -> anyhow::Result<Vec<RepositoryBinding>> {
        #[derive(Deserialize)]
        struct BindingList {
            #[serde(default)]
            items: Vec<RepositoryBinding>,
        }

        let response = self
            .request(
                reqwest::Method::GET,
                "/apis/pipelinesascode.tekton.dev/v1alpha1/repositories",
            )
            .send()
            .await
            .context("Cannot reach the cluster API")?;
        let list: BindingList = Self::check(response, "Repository listing")
            .await?
            .json()
            .await
            .context("Cannot deserialize the Repository list")?;
        Ok(list.items)
    }

    async fn patch_spec_status(
        &self,
        namespace: &str,
        name: &str,
        status: serde_json::Value,
    ) -> anyhow::Result<()> {
        let response = self
            .request(
                reqwest::Method::PATCH,
                &format!("{PIPELINERUN_API}/{namespace}/pipelineruns/{name}"),
            )
            .header(reqwest::header::CONTENT_TYPE, "application/merge-patch+json")
            .json(&serde_json::json!({ "spec": { "status": status } }))
            .send()
            .await
            .context("Cannot reach the cluster API")?;
        Self::check(response, "PipelineRun patch").await?;
        Ok(())
    }
}

fn snapshot_of(manifest: &serde_json::Value) -> RunSnapshot {
    let metadata = &manifest["metadata"];
    let string_map = |value: &serde_json::Value| -> BTreeMap<String, String> {
        value
            .as_object()
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    };
    let state = run_state_of(manifest);
    RunSnapshot {
        object: RunObject {
            name: metadata["name"].as_str().unwrap_or_default().to_string(),
            namespace: metadata["namespace"].as_str().unwrap_or_default().to_string(),
            labels: string_map(&metadata["labels"]),
            annotations: string_map(&metadata["annotations"]),
            manifest: manifest.clone(),
        },
        pending: state == RunState::Queued,
        state,
        completion_time: manifest["status"]["completionTime"]
            .as_str()
            .and_then(|t| t.parse().ok()),
    }
}

#[async_trait]
impl Recorder for KubeHttpClient {
    async fn event(&self, namespace: &str, reason: &str, message: &str) {
        let body = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Event",
            "metadata": { "generateName": "pipelines-as-code-" },
            "type": "Normal",
            "reason": reason,
            "message": message,
            "source": { "component": "pipelines-as-code" },
            "involvedObject": { "namespace": namespace },
        });
        let result = self
            .request(
                reqwest::Method::POST,
                &format!("/api/v1/namespaces/{namespace}/events"),
            )
            .json(&body)
            .send()
            .await;
        match result {
            Ok(response) if !response.status().is_success() => {
                tracing::warn!(
                    namespace,
                    reason,
                    "Could not record cluster event: {}",
                    response.status()
                );
            }
            Err(error) => {
                tracing::warn!(namespace, reason, "Could not record cluster event: {error}");
            }
            _ => {}
        }
    }
}

#[async_trait]
impl SecretStore for KubeHttpClient {
    async fn token(&self, namespace: &str, secret: &SecretRef) -> anyhow::Result<SecretString> {
        #[derive(Deserialize)]
        struct Secret {
            #[serde(default)]
            data: BTreeMap<String, String>,
        }

        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/api/v1/namespaces/{namespace}/secrets/{}", secret.name),
            )
            .send()
            .await
            .context("Cannot reach the cluster API")?;
        let parsed: Secret = Self::check(response, "Secret read")
            .await?
            .json()
            .await
            .context("Cannot deserialize Secret")?;
        let encoded = parsed.data.get(&secret.key).ok_or_else(|| {
            anyhow::anyhow!("Secret {namespace}/{} has no key {}", secret.name, secret.key)
        })?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .context("Secret value is not valid base64")?;
        Ok(SecretString::new(
            String::from_utf8(decoded).context("Secret value is not valid UTF-8")?,
        ))
    }
}
