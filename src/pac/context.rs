use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::binding::{BindingStore, SecretStore};
use crate::pac::concurrency::ConcurrencyManager;
use crate::pac::reporter::StatusReporter;
use crate::provider::ProviderFactory;
use crate::tekton::{Recorder, TektonClient};

/// Process-wide settings, hot-swappable from the config watch.
#[derive(Debug, Clone, Default)]
pub struct GlobalSettings {
    /// Base URL of the console runs are linked to from statuses.
    pub console_url: String,
}

/// Shared state for the whole controller: caches, cluster access and the
/// admission/reporting machinery. Constructed once in the binary and
/// injected everywhere; there is no ambient global state.
pub struct PacContext {
    pub bindings: Arc<BindingStore>,
    pub secrets: Arc<dyn SecretStore>,
    pub providers: Arc<dyn ProviderFactory>,
    pub tekton: Arc<dyn TektonClient>,
    pub recorder: Arc<dyn Recorder>,
    pub concurrency: ConcurrencyManager,
    pub reporter: StatusReporter,
    pub settings: ArcSwap<GlobalSettings>,
}

impl PacContext {
    pub fn new(
        bindings: Arc<BindingStore>,
        secrets: Arc<dyn SecretStore>,
        providers: Arc<dyn ProviderFactory>,
        tekton: Arc<dyn TektonClient>,
        recorder: Arc<dyn Recorder>,
        settings: GlobalSettings,
    ) -> Self {
        Self {
            bindings,
            secrets,
            providers,
            tekton: tekton.clone(),
            recorder,
            concurrency: ConcurrencyManager::new(tekton),
            reporter: StatusReporter::new(),
            settings: ArcSwap::new(Arc::new(settings)),
        }
    }

    pub fn console_url(&self) -> String {
        self.settings.load().console_url.trim_end_matches('/').to_string()
    }

    pub fn run_log_url(&self, namespace: &str, name: &str) -> String {
        let base = self.console_url();
        if base.is_empty() {
            return String::new();
        }
        format!("{base}/{namespace}/{name}")
    }
}
