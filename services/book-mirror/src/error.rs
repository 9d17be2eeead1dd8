//! Top-level error type for the mirror.

use thiserror::Error;

use crate::config::ConfigError;
use crate::decoder::DecodeError;
use crate::reconciler::ReconcileError;
use crate::transport::TransportError;
use crate::view::ViewError;

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("reconcile error: {0}")]
    Reconcile(#[from] ReconcileError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("view error: {0}")]
    View(#[from] ViewError),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("subscription rejected: {0}")]
    SubscriptionRejected(String),

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MirrorError>;
