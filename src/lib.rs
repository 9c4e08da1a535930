pub mod binding;
pub mod pac;
pub mod provider;
pub mod server;
pub mod tekton;
pub(crate) mod utils;

#[cfg(test)]
pub(crate) mod tests;

pub use pac::context::PacContext;
pub use pac::error::PacError;
pub use pac::event::{Event, EventKind, ProviderKind, TriggerTarget};
pub use pac::process::create_pac_process;
pub use server::{create_app, ServerState, WebhookSecrets};
