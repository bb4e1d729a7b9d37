//! rten-export exports programs into a frozen graph IR ahead of time.
//!
//! # Exporting programs
//!
//! A program is a type implementing [`Module`]. Its `forward` method records
//! operations using a [`Tracer`](trace::Tracer), which operates on fake
//! tensors whose sizes may be symbolic. The basic workflow is:
//!
//! 1. Describe which input dimensions may vary in size using [`Dim`] and
//!    [`DynamicShapes`].
//! 2. Call [`export`] with example inputs. Dimensions not declared dynamic
//!    are specialized to the sizes of the example inputs.
//! 3. Run, save or transform the resulting [`ExportedProgram`].
//!
//! If the traced program places restrictions on a dynamic dimension that the
//! declaration does not, export fails with a [`ConstraintViolation`] which
//! lists every problem found together with suggested fixes.
//!
//! # Lifted and unlifted programs
//!
//! An [`ExportedProgram`] holds a "lifted" graph, where parameters, buffers
//! and constants are graph inputs and in-place updates are extra outputs.
//! [`ExportedProgram::module`] converts this into a [`StatefulGraphModule`]
//! which holds the state as attributes, updates buffers in place and is
//! called with the same arguments as the original program.
//! [`StatefulGraphModule::lift`] converts back.
//!
//! # Saving programs
//!
//! The [`archive`] module saves programs together with their state.
//! Archives can be inspected with the `rten-export` CLI tool.
//!
//! # Ahead-of-time compilation
//!
//! The [`aot`] module passes exported programs to a code generator and loads
//! the resulting artifacts.
//!
//! # Environment variables
//!
//! - `RTEN_EXPORT_DISABLE_SOLVER` sets the default for
//!   [`ExportOptions::disable_constraint_solver`].
//! - `RTEN_EXPORT_LOG_GUARDS` logs every guard recorded during tracing.

mod env;
mod error;

pub mod aot;
pub mod archive;
pub mod dynamic_shapes;
pub mod export;
pub mod fake;
pub mod graph;
pub mod graph_module;
pub mod interpreter;
pub mod program;
pub mod shape_env;
pub mod signature;
pub mod source;
pub mod trace;
pub mod tree;
pub mod unlift;
pub mod value;

pub use aot::{aot_compile, aot_load, AotModule, AotOptions, Device};
pub use archive::{load, load_from_path, save, save_to_path, ArchiveError};
pub use dynamic_shapes::{Constraint, Dim, DynamicShapes, ShapeSpec};
pub use error::ExportError;
pub use export::{export, ExportOptions};
pub use graph_module::{CallError, StatefulGraphModule};
pub use program::{ExportedProgram, InputDim, RangeConstraint};
pub use shape_env::{ConstraintViolation, ViolationKind};
pub use signature::{GraphSignature, InputKind, OutputKind};
pub use trace::Module;
pub use tree::{Tree, TreeSpec};
pub use value::{Constant, OpaqueHandle, Value};
