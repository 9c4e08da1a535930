//! The `Repository` custom resource (`pipelinesascode.tekton.dev/v1alpha1`)
//! that binds a repository URL to a namespace, credentials and settings, and
//! the read-mostly cache the webhook path resolves against.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::pac::event::normalize_url;

pub mod secrets;

pub use secrets::{SecretRef, SecretStore, StaticSecretStore};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryBinding {
    pub metadata: ObjectMeta,
    pub spec: RepositorySpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepositorySpec {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub git_provider: Option<GitProvider>,
    #[serde(default)]
    pub params: Vec<Param>,
    #[serde(default)]
    pub settings: Option<Settings>,
    #[serde(default)]
    pub concurrency_limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GitProvider {
    /// Provider family: github, gitlab, gitea or bitbucket. Inferred from
    /// the URL host when omitted.
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    /// API base URL for self-hosted installations.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub secret: Option<SecretRef>,
    /// Secret holding the webhook shared secret for this repository.
    #[serde(default)]
    pub webhook_secret: Option<SecretRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub secret_ref: Option<SecretRef>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub policy: Option<Policy>,
    #[serde(default)]
    pub pipelinerun_provenance: Option<String>,
    /// Cancel superseded runs on a new push to the same branch.
    /// Defaults to true for pull_request events when unset.
    #[serde(default)]
    pub cancel_in_progress: Option<bool>,
}

/// Policy relaxations: logins granted access without going through the
/// membership/collaborator/OWNERS ladder.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default)]
    pub ok_to_test: Vec<String>,
    #[serde(default)]
    pub pull_request: Vec<String>,
}

impl RepositoryBinding {
    pub fn cancel_in_progress(&self) -> Option<bool> {
        self.spec
            .settings
            .as_ref()
            .and_then(|s| s.cancel_in_progress)
    }

    pub fn policy(&self) -> Option<&Policy> {
        self.spec.settings.as_ref().and_then(|s| s.policy.as_ref())
    }
}

/// Fill unset fields of `specific` from the cluster-wide default binding.
/// The default augments but never overrides per-repository settings.
fn merge_with_default(
    specific: &RepositoryBinding,
    default: Option<&RepositoryBinding>,
) -> RepositoryBinding {
    let Some(default) = default else {
        return specific.clone();
    };
    let mut merged = specific.clone();
    if merged.spec.git_provider.is_none() {
        merged.spec.git_provider = default.spec.git_provider.clone();
    }
    if merged.spec.settings.is_none() {
        merged.spec.settings = default.spec.settings.clone();
    }
    if merged.spec.concurrency_limit.is_none() {
        merged.spec.concurrency_limit = default.spec.concurrency_limit;
    }
    let existing: Vec<String> = merged.spec.params.iter().map(|p| p.name.clone()).collect();
    for param in &default.spec.params {
        if !existing.contains(&param.name) {
            merged.spec.params.push(param.clone());
        }
    }
    merged
}

/// Read-mostly cache of repository bindings, keyed by normalized URL.
/// Invalidated wholesale by the cluster watch through [`BindingStore::replace_all`].
pub struct BindingStore {
    bindings: RwLock<HashMap<String, Arc<RepositoryBinding>>>,
    default_binding: RwLock<Option<Arc<RepositoryBinding>>>,
    ready: AtomicBool,
}

impl Default for BindingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BindingStore {
    pub fn new() -> Self {
        Self {
            bindings: RwLock::new(HashMap::new()),
            default_binding: RwLock::new(None),
            ready: AtomicBool::new(false),
        }
    }

    /// Replace the cache contents. A binding whose URL is `*` (or empty)
    /// becomes the cluster-wide default. At most one binding per URL is
    /// kept; later duplicates are dropped with a warning.
    pub fn replace_all(&self, bindings: Vec<RepositoryBinding>) {
        let mut map = HashMap::new();
        let mut default = None;
        for binding in bindings {
            if binding.spec.url.is_empty() || binding.spec.url == "*" {
                default = Some(Arc::new(binding));
                continue;
            }
            let url = normalize_url(&binding.spec.url);
            if map.contains_key(&url) {
                tracing::warn!(
                    "Duplicate repository binding for {url}, keeping the first one"
                );
                continue;
            }
            map.insert(url, Arc::new(binding));
        }
        *self.bindings.write() = map;
        *self.default_binding.write() = default;
        self.ready.store(true, Ordering::Release);
    }

    /// Has the cache been seeded at least once?
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Resolve a binding: exact URL match, then `host+owner+repo` match,
    /// then the cluster-wide default. The result has default settings
    /// merged in.
    pub fn resolve(&self, repo_url: &str) -> Option<RepositoryBinding> {
        let url = normalize_url(repo_url);
        let bindings = self.bindings.read();
        let default = self.default_binding.read();

        if let Some(binding) = bindings.get(&url) {
            return Some(merge_with_default(binding, default.as_deref()));
        }
        if let Some(key) = host_owner_repo(&url) {
            for binding in bindings.values() {
                if host_owner_repo(&normalize_url(&binding.spec.url)).as_deref()
                    == Some(key.as_str())
                {
                    return Some(merge_with_default(binding, default.as_deref()));
                }
            }
        }
        default
            .as_deref()
            .map(|binding| merge_with_default(binding, None))
    }

    /// All namespaces with at least one binding. Used by the run-status
    /// poller to bound its listing.
    pub fn namespaces(&self) -> Vec<String> {
        let mut namespaces: Vec<String> = self
            .bindings
            .read()
            .values()
            .map(|b| b.metadata.namespace.clone())
            .collect();
        namespaces.sort();
        namespaces.dedup();
        namespaces
    }
}

fn host_owner_repo(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    let mut segments = parsed.path_segments()?;
    let owner = segments.next()?;
    let repo = segments.next_back().unwrap_or(owner);
    Some(format!(
        "{host}/{owner}/{}",
        repo.trim_end_matches(".git").to_lowercase()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(name: &str, url: &str) -> RepositoryBinding {
        RepositoryBinding {
            metadata: ObjectMeta {
                name: name.to_string(),
                namespace: format!("{name}-ns"),
                ..Default::default()
            },
            spec: RepositorySpec {
                url: url.to_string(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn resolves_exact_url() {
        let store = BindingStore::new();
        store.replace_all(vec![binding("demo", "https://github.com/owner/repo")]);
        let found = store.resolve("https://github.com/owner/repo/").unwrap();
        assert_eq!(found.metadata.name, "demo");
    }

    #[test]
    fn resolves_by_host_owner_repo() {
        let store = BindingStore::new();
        store.replace_all(vec![binding("demo", "https://github.com/owner/repo.git")]);
        let found = store.resolve("https://github.com/owner/repo").unwrap();
        assert_eq!(found.metadata.name, "demo");
    }

    #[test]
    fn falls_back_to_default_binding() {
        let store = BindingStore::new();
        store.replace_all(vec![binding("default", "*")]);
        let found = store.resolve("https://github.com/anyone/anything").unwrap();
        assert_eq!(found.metadata.name, "default");
    }

    #[test]
    fn missing_binding_resolves_to_none() {
        let store = BindingStore::new();
        store.replace_all(vec![binding("demo", "https://github.com/owner/repo")]);
        assert!(store.resolve("https://github.com/other/repo").is_none());
    }

    #[test]
    fn default_augments_but_does_not_override() {
        let mut specific = binding("demo", "https://github.com/owner/repo");
        specific.spec.concurrency_limit = Some(2);
        let mut default = binding("default", "*");
        default.spec.concurrency_limit = Some(9);
        default.spec.params.push(Param {
            name: "team".to_string(),
            value: Some("platform".to_string()),
            secret_ref: None,
        });

        let store = BindingStore::new();
        store.replace_all(vec![specific, default]);
        let found = store.resolve("https://github.com/owner/repo").unwrap();
        assert_eq!(found.spec.concurrency_limit, Some(2));
        assert_eq!(found.spec.params.len(), 1);
        assert_eq!(found.spec.params[0].name, "team");
    }

    #[test]
    fn ready_flips_after_first_seed() {
        let store = BindingStore::new();
        assert!(!store.is_ready());
        store.replace_all(vec![]);
        assert!(store.is_ready());
    }
}
