//! Runtime errors.

#![allow(missing_docs)]

use smol_str::SmolStr;
use thiserror::Error;

use crate::image::ImageError;
use crate::module::LinkError;

/// Errors reported by loader, scheduler and trace engine operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    /// Staged image does not fit the staging buffer.
    #[error("image too large ({size} bytes, staging capacity {capacity})")]
    ImageTooLarge { size: usize, capacity: usize },

    /// Image signature or checksum verification failed.
    #[error("image integrity failure: {0}")]
    IntegrityFailure(#[from] ImageError),

    /// A required module export is missing or has the wrong shape.
    #[error("symbol resolution failure: '{0}'")]
    SymbolResolutionFailure(SmolStr),

    /// Relocation or external binding failed.
    #[error("link failure: {0}")]
    Link(#[from] LinkError),

    /// Operation not permitted in the current state.
    #[error("permission denied: {0}")]
    PermissionDenied(SmolStr),

    /// No module is bound.
    #[error("no plc module loaded")]
    NoModuleLoaded,

    /// Trace configuration requested more variables than the engine supports.
    #[error("too many traced variables ({requested} requested, {max} allowed)")]
    TooManyTraced { requested: usize, max: usize },

    /// Reading a variable through the module accessor failed.
    #[error("variable query failed for index {index}")]
    VariableQuery { index: u32 },

    /// The module does not export the force entry point.
    #[error("force is not supported by the loaded module")]
    ForceUnsupported,

    /// The ring buffer could not accommodate a sample even after one retry.
    #[error("trace capture dropped")]
    CaptureDropped,

    /// Flash region access error.
    #[error("flash error: {0}")]
    Flash(SmolStr),

    /// Filesystem access error.
    #[error("storage error: {0}")]
    Storage(SmolStr),

    /// Thread spawn error.
    #[error("thread spawn error: {0}")]
    ThreadSpawn(SmolStr),

    /// Configuration error.
    #[error("invalid config: {0}")]
    InvalidConfig(SmolStr),
}

impl RuntimeError {
    pub(crate) fn storage(err: &std::io::Error) -> Self {
        Self::Storage(err.to_string().into())
    }
}
