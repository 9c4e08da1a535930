//! The long-lived consumer loops: webhook events on one channel, PipelineRun
//! status transitions on the other. Handlers run under a per-event deadline
//! so a hung provider call cannot wedge a consumer.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Error;
use tokio::sync::mpsc;
use tracing::{Instrument, Span};

use crate::pac::context::PacContext;
use crate::pac::event::Event;
use crate::pac::handlers::{handle_run_status, handle_webhook_event};
use crate::tekton::RunStatusEvent;

/// Per-request deadline for webhook processing (provider calls included).
const EVENT_DEADLINE: Duration = Duration::from_secs(30);

pub struct PacProcess {
    pub event_tx: mpsc::Sender<Event>,
    pub status_tx: mpsc::Sender<RunStatusEvent>,
    pub process: Pin<Box<dyn Future<Output = ()> + Send>>,
}

/// Creates the controller process that continuously consumes webhook events
/// and run status transitions.
pub fn create_pac_process(ctx: Arc<PacContext>) -> PacProcess {
    let (event_tx, event_rx) = mpsc::channel::<Event>(1024);
    let (status_tx, status_rx) = mpsc::channel::<RunStatusEvent>(1024);

    let service = async move {
        // In tests the futures are shut down by dropping the senders; wait
        // for both so queued events are drained before finishing.
        #[cfg(test)]
        {
            tokio::join!(
                consume_webhook_events(ctx.clone(), event_rx),
                consume_run_status_events(ctx, status_rx)
            );
        }
        // In real execution the process runs forever; either loop ending is
        // a bug.
        #[cfg(not(test))]
        {
            tokio::select! {
                _ = consume_webhook_events(ctx.clone(), event_rx) => {
                    tracing::error!("Webhook event handling process has ended");
                }
                _ = consume_run_status_events(ctx, status_rx) => {
                    tracing::error!("Run status handling process has ended");
                }
            }
        }
    };

    PacProcess {
        event_tx,
        status_tx,
        process: Box::pin(service),
    }
}

async fn consume_webhook_events(ctx: Arc<PacContext>, mut event_rx: mpsc::Receiver<Event>) {
    while let Some(event) = event_rx.recv().await {
        let span = tracing::info_span!(
            "WebhookEvent",
            repo = event.repo_slug(),
            kind = event.kind.as_str(),
            sha = event.sha
        );
        let result = tokio::time::timeout(EVENT_DEADLINE, handle_webhook_event(ctx.clone(), event))
            .instrument(span.clone())
            .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(error)) => handle_root_error(span, error),
            Err(_) => handle_root_error(
                span,
                anyhow::anyhow!("event processing exceeded the {EVENT_DEADLINE:?} deadline"),
            ),
        }
    }
}

async fn consume_run_status_events(
    ctx: Arc<PacContext>,
    mut status_rx: mpsc::Receiver<RunStatusEvent>,
) {
    while let Some(status) = status_rx.recv().await {
        let span = tracing::info_span!(
            "RunStatus",
            run = status.name,
            state = status.state.as_str()
        );
        if let Err(error) = handle_run_status(ctx.clone(), status)
            .instrument(span.clone())
            .await
        {
            handle_root_error(span, error);
        }
    }
}

#[allow(unused_variables)]
fn handle_root_error(span: Span, error: Error) {
    // In tests, we want to panic on all errors.
    #[cfg(test)]
    {
        panic!("Handler failed: {error:?}");
    }
    #[cfg(not(test))]
    {
        use crate::utils::logging::LogError;
        span.log_error(error);
    }
}
