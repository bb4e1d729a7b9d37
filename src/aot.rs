//! Ahead-of-time compilation of programs into loadable artifacts.
//!
//! [`aot_compile`] exports a program, converts it into a
//! [`StatefulGraphModule`] and hands it to a [`CodeGenerator`]. [`aot_load`]
//! uses an [`ArtifactLoader`] to load the result and wraps it in an
//! [`AotModule`], which restores the program's calling convention.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::ExportError;
use crate::export::{export, ExportOptions};
use crate::graph_module::{CallError, StatefulGraphModule};
use crate::trace::Module;
use crate::tree::{reorder_kwargs, Tree, TreeSpec};
use crate::value::Value;

mod archive_backend;

pub use archive_backend::ArchiveBackend;

/// Device which a compiled artifact runs on.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Device {
    Cpu,

    /// A CUDA device, with an optional device index.
    Cuda(Option<u32>),
}

impl FromStr for Device {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Device, ExportError> {
        let unsupported = || ExportError::UnsupportedDevice(s.to_string());
        match s {
            "cpu" => Ok(Device::Cpu),
            "cuda" => Ok(Device::Cuda(None)),
            _ => {
                let index = s.strip_prefix("cuda:").ok_or_else(unsupported)?;
                let index = index.parse().map_err(|_| unsupported())?;
                Ok(Device::Cuda(Some(index)))
            }
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(None) => write!(f, "cuda"),
            Device::Cuda(Some(index)) => write!(f, "cuda:{}", index),
        }
    }
}

/// Options for [`aot_compile`].
#[derive(Clone, Debug, Default)]
pub struct AotOptions {
    /// Where to write the artifact. If not set, the code generator chooses.
    pub output_path: Option<PathBuf>,

    /// Generator-specific settings.
    pub config: Vec<(String, String)>,
}

/// Lowers an unlifted program into an artifact on disk.
pub trait CodeGenerator {
    /// Compile `module` and return the path of the artifact.
    ///
    /// `example_inputs` are the flattened user inputs which the program was
    /// exported with.
    fn compile(
        &self,
        module: &StatefulGraphModule,
        example_inputs: &[Value],
        options: &AotOptions,
    ) -> Result<PathBuf, ExportError>;
}

/// A loaded artifact which runs on flat lists of values.
pub trait CompiledArtifact {
    /// Return the serialized input and output [`TreeSpec`]s of the program.
    fn call_spec(&self) -> (Vec<u8>, Vec<u8>);

    fn run(&mut self, inputs: Vec<Value>) -> Result<Vec<Value>, ExportError>;
}

/// Loads artifacts created by a [`CodeGenerator`].
pub trait ArtifactLoader {
    fn load(&self, path: &Path, device: Device) -> Result<Box<dyn CompiledArtifact>, ExportError>;
}

/// Export `module` and compile it with `codegen`.
///
/// Returns the path of the compiled artifact.
pub fn aot_compile(
    module: &dyn Module,
    args: Vec<Tree<Value>>,
    kwargs: Vec<(String, Tree<Value>)>,
    options: &ExportOptions,
    codegen: &dyn CodeGenerator,
    aot_options: &AotOptions,
) -> Result<PathBuf, ExportError> {
    let _span = tracing::info_span!("aot_compile").entered();

    let (example_inputs, _) = Tree::call_args(args.clone(), kwargs.clone()).flatten();
    let program = export(module, args, kwargs, options)?;
    let graph_module = program.module()?;
    let path = codegen.compile(&graph_module, &example_inputs, aot_options)?;

    tracing::debug!(path = %path.display(), "compiled artifact");
    Ok(path)
}

/// Load an artifact compiled by [`aot_compile`].
///
/// `device` is one of `cpu`, `cuda` or `cuda:N`.
pub fn aot_load(
    path: &Path,
    device: &str,
    loader: &dyn ArtifactLoader,
) -> Result<AotModule, ExportError> {
    let device: Device = device.parse()?;
    let artifact = loader.load(path, device)?;
    Ok(AotModule { artifact, device })
}

/// A compiled artifact which is called like the original program.
pub struct AotModule {
    artifact: Box<dyn CompiledArtifact>,
    device: Device,
}

impl AotModule {
    pub fn device(&self) -> Device {
        self.device
    }

    /// Call the program with positional and keyword arguments.
    ///
    /// Keyword arguments may be given in any order. Outputs are returned in
    /// the structure the original program returned them.
    pub fn call(
        &mut self,
        args: Vec<Tree<Value>>,
        kwargs: Vec<(String, Tree<Value>)>,
    ) -> Result<Tree<Value>, ExportError> {
        let (in_spec, out_spec) = self.artifact.call_spec();
        let in_spec = TreeSpec::from_bytes(&in_spec)?;
        let out_spec = TreeSpec::from_bytes(&out_spec)?;

        let kwargs = reorder_kwargs(kwargs, &in_spec)?;
        let (flat_inputs, spec) = Tree::call_args(args, kwargs).flatten();
        if spec != in_spec {
            return Err(CallError::InputSpecMismatch {
                expected: in_spec.to_string(),
                actual: spec.to_string(),
            }
            .into());
        }

        let flat_outputs = self.artifact.run(flat_inputs)?;
        Ok(out_spec.unflatten(flat_outputs)?)
    }
}

#[cfg(test)]
mod tests {
    use rten_testing::TestCases;

    use super::Device;
    use crate::error::ExportError;

    #[test]
    fn test_parse_device() {
        #[derive(Debug)]
        struct Case<'a> {
            device: &'a str,
            expected: Option<Device>,
        }

        let cases = [
            Case {
                device: "cpu",
                expected: Some(Device::Cpu),
            },
            Case {
                device: "cuda",
                expected: Some(Device::Cuda(None)),
            },
            Case {
                device: "cuda:1",
                expected: Some(Device::Cuda(Some(1))),
            },
            Case {
                device: "cuda:x",
                expected: None,
            },
            Case {
                device: "tpu",
                expected: None,
            },
        ];

        cases.test_each(|case| {
            let parsed = case.device.parse::<Device>();
            match case.expected {
                Some(device) => {
                    assert_eq!(parsed.unwrap(), device);
                    assert_eq!(device.to_string(), case.device);
                }
                None => assert!(matches!(parsed, Err(ExportError::UnsupportedDevice(_)))),
            }
        })
    }
}
