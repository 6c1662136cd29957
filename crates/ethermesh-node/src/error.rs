//! Error types for the node orchestrator.

use ethermesh_core::CoreError;
use ethermesh_overlay::OverlayError;

/// Errors that can occur during node startup and operation.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Core(#[from] CoreError),
    #[error("{0}")]
    Overlay(#[from] OverlayError),
    #[error("could not write {0} (home path not writable?)")]
    HomeNotWritable(&'static str),
    #[error("could not bind local control UDP port: {0}")]
    ControlBind(std::io::Error),
    #[error("could not bind a local client UDP port after {0} attempts")]
    ClientBind(u32),
}
