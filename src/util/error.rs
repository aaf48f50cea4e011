//! Error types for the tracer controller.

use std::path::PathBuf;
use thiserror::Error;

use crate::compute::ApiError;

/// Main error type for tracer operations.
///
/// Every setup step and every stage of block processing maps to its own
/// variant so the orchestrator can tell a compile problem from an
/// allocation or transfer failure.
#[derive(Error, Debug)]
pub enum TracerError {
    /// The compute context for the bound device could not be created
    #[error("failed to create compute context: {0}")]
    ContextCreationFailed(#[source] ApiError),

    /// The command queue for the bound device could not be created
    #[error("failed to create command queue: {0}")]
    CmdQueueCreationFailed(#[source] ApiError),

    /// `setup` was called while device resources are still attached
    #[error("tracer is already attached to a scene")]
    AlreadyAttached,

    /// The operation needs a successful `setup` first
    #[error("tracer setup has not been completed")]
    PendingSetup,

    /// The controller has been closed and cannot be attached again
    #[error("tracer has been closed")]
    Closed,

    /// Kernel source file could not be read
    #[error("failed to read kernel source {path}: {source}")]
    KernelSourceUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Program object could not be created from the kernel source
    #[error("failed to create program: {0}")]
    ProgramCreationFailed(#[source] ApiError),

    /// Kernel compilation failed; `log` holds the compiler diagnostics
    #[error("failed to build program:\n{log}")]
    ProgramBuildFailed { log: String },

    /// Kernel entry point could not be resolved
    #[error("failed to create kernel: {0}")]
    KernelCreationFailed(#[source] ApiError),

    /// Device buffer or image allocation failed
    #[error("failed to allocate device buffers: {0}")]
    AllocatingBuffers(#[source] ApiError),

    /// Host to device transfer failed
    #[error("failed to copy data to device: {0}")]
    CopyingDataToDevice(#[source] ApiError),

    /// Binding kernel argument `index` failed
    #[error("failed to set kernel argument {index}: {source}")]
    SettingKernelArguments {
        index: u32,
        #[source]
        source: ApiError,
    },

    /// Kernel dispatch or completion reported an error
    #[error("kernel execution failed: {0}")]
    KernelExecutionFailed(#[source] ApiError),

    /// Device to host transfer failed
    #[error("failed to copy data to host: {0}")]
    CopyingDataToHost(#[source] ApiError),

    /// Block rows fall outside the frame or the render target has the wrong size
    #[error("invalid block request: {0}")]
    InvalidBlockRequest(String),

    /// The worker thread could not be started
    #[error("failed to spawn tracer worker: {0}")]
    WorkerSpawn(#[source] std::io::Error),

    /// Configuration file could not be read or written
    #[error("failed to access config {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration file is not valid JSON for `TracerConfig`
    #[error("invalid config {path}: {source}")]
    ConfigFormat {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Result type alias for tracer operations.
pub type Result<T> = std::result::Result<T, TracerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = TracerError::ProgramBuildFailed {
            log: "line 3: unknown identifier `foo`".into(),
        };
        assert!(e.to_string().contains("unknown identifier"));

        let e = TracerError::SettingKernelArguments {
            index: 7,
            source: ApiError::new("type mismatch"),
        };
        assert!(e.to_string().contains("argument 7"));
        assert!(e.to_string().contains("type mismatch"));
    }

    #[test]
    fn test_error_source_chain() {
        use std::error::Error as _;

        let e = TracerError::AllocatingBuffers(ApiError::new("out of device memory"));
        let source = e.source().expect("allocation error keeps its api cause");
        assert_eq!(source.to_string(), "out of device memory");
    }
}
