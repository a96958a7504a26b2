//! Reconciliation core of a cloud infrastructure provider.
//!
//! Declarative configurations for servers, volumes, and their attachments
//! are moved onto a remote cloud through an injected [`api::CloudApi`]
//! client. Every remote call runs under a bounded [`retry`] policy and every
//! asynchronous operation is awaited through an [`action::ActionWaiter`]
//! before the next step starts.

pub mod action;
pub mod api;
pub mod config;
pub mod error;
pub mod provider;
pub mod resource;
pub mod retry;
pub mod server;
pub mod server_network;
pub mod test_support;
pub mod types;
pub mod volume;
pub mod volume_attachment;

pub use action::{Action, ActionError, ActionStatus, ActionWaiter};
pub use api::{ApiError, CloudApi, ErrorKind};
pub use config::{ConfigError, ReconcilerConfig};
pub use error::{Diagnostic, ReconcileError, Severity};
pub use provider::Provider;
pub use resource::Resource;
pub use retry::{AttemptError, Backoff, RetryPolicy, retry};
pub use server::{AttachmentDiff, NetworkAttachmentConfig, PublicNetConfig, ServerConfig};
pub use server_network::{ServerNetwork, ServerNetworkConfig, ServerNetworkId};
pub use volume::VolumeConfig;
pub use volume_attachment::{VolumeAttachment, VolumeAttachmentConfig};
