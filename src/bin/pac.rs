use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use secrecy::SecretString;
use tracing_subscriber::EnvFilter;

use pac::binding::{BindingStore, RepositoryBinding};
use pac::pac::context::{GlobalSettings, PacContext};
use pac::pac::process::PacProcess;
use pac::provider::DefaultProviderFactory;
use pac::tekton::http::KubeHttpClient;
use pac::tekton::watcher::RunWatcher;
use pac::{ServerState, WebhookSecrets, create_app, create_pac_process};

/// How long in-flight work may finish after SIGTERM.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
/// Interval for refreshing the binding cache from the cluster.
const BINDING_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

#[derive(clap::Parser)]
struct Opts {
    /// Address the webhook server listens on.
    #[arg(long, env = "PAC_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    listen_addr: SocketAddr,
    /// Shared webhook secret applied to every provider family.
    #[arg(long, env = "PAC_WEBHOOK_SECRET")]
    webhook_secret: Option<String>,
    /// Base URL of the console linked from statuses.
    #[arg(long, env = "PAC_CONSOLE_URL", default_value = "")]
    console_url: String,
    /// Seed repository bindings from a YAML file instead of the cluster
    /// Repository resources (a YAML sequence of Repository objects).
    #[arg(long, env = "PAC_BINDINGS_FILE")]
    bindings_file: Option<PathBuf>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();
    if let Err(error) = try_main(opts) {
        tracing::error!("Error: {error:?}");
        std::process::exit(1);
    }
}

fn try_main(opts: Opts) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Cannot build the tokio runtime")?;
    runtime.block_on(run(opts))
}

async fn run(opts: Opts) -> anyhow::Result<()> {
    let kube = Arc::new(KubeHttpClient::from_cluster_env()?);
    let bindings = Arc::new(BindingStore::new());

    match &opts.bindings_file {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Could not read {}", path.display()))?;
            let seeded: Vec<RepositoryBinding> =
                serde_yaml::from_str(&content).context("Could not parse the bindings file")?;
            tracing::info!("Seeded {} repository bindings from a file", seeded.len());
            bindings.replace_all(seeded);
        }
        None => {
            let seeded = kube.list_repository_bindings().await?;
            tracing::info!("Loaded {} repository bindings from the cluster", seeded.len());
            bindings.replace_all(seeded);
        }
    }

    let ctx = Arc::new(PacContext::new(
        bindings.clone(),
        kube.clone(),
        Arc::new(DefaultProviderFactory::new(kube.clone())),
        kube.clone(),
        kube.clone(),
        GlobalSettings {
            console_url: opts.console_url.clone(),
        },
    ));
    ctx.concurrency
        .rebuild(&bindings.namespaces())
        .await
        .context("Could not rebuild the concurrency queues")?;

    let PacProcess {
        event_tx,
        status_tx,
        process,
    } = create_pac_process(ctx.clone());
    let watcher = RunWatcher::new(
        kube.clone(),
        bindings.clone(),
        opts.console_url.clone(),
        status_tx.clone(),
    );

    // The binding cache refresh stands in for a cluster watch.
    let seeded_from_file = opts.bindings_file.is_some();
    let refresh = {
        let kube = kube.clone();
        let bindings = bindings.clone();
        async move {
            if seeded_from_file {
                // File-seeded bindings have no cluster watch to refresh from.
                std::future::pending::<()>().await;
            }
            loop {
                tokio::time::sleep(BINDING_REFRESH_INTERVAL).await;
                match kube.list_repository_bindings().await {
                    Ok(seeded) => bindings.replace_all(seeded),
                    Err(error) => {
                        tracing::warn!("Could not refresh repository bindings: {error:#}");
                    }
                }
            }
        }
    };

    let state = ServerState::new(
        event_tx.clone(),
        WebhookSecrets::uniform(opts.webhook_secret.map(SecretString::new)),
        bindings,
    );
    let app = create_app(state);
    let listener = tokio::net::TcpListener::bind(opts.listen_addr)
        .await
        .with_context(|| format!("Cannot bind {}", opts.listen_addr))?;
    tracing::info!("Listening on {}", opts.listen_addr);

    let process_handle = tokio::spawn(process);
    let watcher_handle = tokio::spawn(watcher.run());
    let refresh_handle = tokio::spawn(refresh);

    // SIGTERM drains: stop accepting webhooks, let in-flight work finish for
    // a bounded time. SIGINT aborts immediately (no handler installed).
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server failed")?;

    tracing::info!("Server stopped, draining in-flight work");
    watcher_handle.abort();
    refresh_handle.abort();
    // Closing the channels lets the consumer loops finish what is queued.
    drop(event_tx);
    drop(status_tx);
    if tokio::time::timeout(DRAIN_TIMEOUT, process_handle)
        .await
        .is_err()
    {
        tracing::warn!("In-flight work did not finish within {DRAIN_TIMEOUT:?}");
    }
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(error) => {
            tracing::error!("Cannot install the SIGTERM handler: {error}");
            return std::future::pending().await;
        }
    };
    sigterm.recv().await;
    tracing::info!("Received SIGTERM, draining");
}
