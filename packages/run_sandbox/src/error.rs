use std::io;

/// Errors that prevent a job from starting
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Toolchain (plus sandbox prefix) resolved to an empty argv
    #[error("toolchain command is empty")]
    EmptyCommand,
    /// Source file name would escape the scratch directory
    #[error("invalid source file name: {0}")]
    InvalidSourceFile(String),
    /// Could not create the scratch directory or write the source into it
    #[error("failed to prepare scratch directory: {0}")]
    Scratch(#[source] io::Error),
    /// The toolchain program could not be launched
    #[error("failed to launch '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
}
