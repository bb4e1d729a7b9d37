use crate::archive::ArchiveError;
use crate::graph::GraphError;
use crate::graph_module::CallError;
use crate::shape_env::ConstraintViolation;
use crate::tree::TreeError;

/// Errors produced while exporting, transforming or compiling a program.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    /// A program input is neither a tensor, an opaque object nor absent.
    #[error("unsupported input at {path}: only tensors and opaque objects are allowed, got {kind}")]
    InvalidInputKind { path: String, kind: &'static str },

    /// The dynamic shape declarations do not match the program inputs.
    #[error("invalid dynamic shapes: {0}")]
    InvalidDynamicShapes(String),

    /// Tracing recorded guards that conflict with the declared constraints.
    #[error(transparent)]
    ConstraintViolation(#[from] ConstraintViolation),

    /// The program could not be traced with the example inputs.
    #[error("tracing failed: {0}")]
    Trace(String),

    /// A shape environment was modified after being frozen.
    #[error("shape environment is frozen and cannot be modified")]
    ShapeEnvFrozen,

    /// A graph signature does not match the graph it describes.
    #[error("signature mismatch: {0}")]
    SignatureMismatch(String),

    /// A mutation output names neither a graph attribute nor a user input.
    #[error("could not find {0} in either buffer or input nodes")]
    UnresolvedMutationTarget(String),

    /// The graph has already been unlifted.
    #[error("graph is already unlifted")]
    AlreadyUnlifted,

    #[error("graph error: {0}")]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Call(#[from] CallError),

    #[error("unsupported device \"{0}\"")]
    UnsupportedDevice(String),

    /// A code generator or compiled artifact failed.
    #[error("code generation failed: {0}")]
    Codegen(String),
}
