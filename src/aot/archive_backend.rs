use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::{AotOptions, ArtifactLoader, CodeGenerator, CompiledArtifact, Device};
use crate::archive::{load_from_path, save_to_path};
use crate::error::ExportError;
use crate::graph_module::StatefulGraphModule;
use crate::value::Value;

/// Backend which "compiles" a program by saving it as an archive, and runs
/// loaded artifacts with the graph interpreter.
///
/// Only the CPU device is supported.
#[derive(Clone, Debug, Default)]
pub struct ArchiveBackend;

const DEFAULT_FILE_NAME: &str = "rten_export_aot.rtxa";

impl CodeGenerator for ArchiveBackend {
    fn compile(
        &self,
        module: &StatefulGraphModule,
        example_inputs: &[Value],
        options: &AotOptions,
    ) -> Result<PathBuf, ExportError> {
        let path = options
            .output_path
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join(DEFAULT_FILE_NAME));

        let program = module.lift()?;
        if example_inputs.len() != program.graph_signature().user_inputs().len() {
            return Err(ExportError::Codegen(format!(
                "expected {} example inputs but got {}",
                program.graph_signature().user_inputs().len(),
                example_inputs.len()
            )));
        }

        let extra_files: BTreeMap<String, String> = options.config.iter().cloned().collect();
        save_to_path(&program, &path, &extra_files)?;
        Ok(path)
    }
}

impl ArtifactLoader for ArchiveBackend {
    fn load(&self, path: &Path, device: Device) -> Result<Box<dyn CompiledArtifact>, ExportError> {
        if device != Device::Cpu {
            return Err(ExportError::UnsupportedDevice(device.to_string()));
        }
        let (program, _) = load_from_path(path)?;
        let module = program.module()?;
        Ok(Box::new(InterpretedArtifact { module }))
    }
}

struct InterpretedArtifact {
    module: StatefulGraphModule,
}

impl CompiledArtifact for InterpretedArtifact {
    fn call_spec(&self) -> (Vec<u8>, Vec<u8>) {
        let codegen = self.module.codegen();
        (codegen.in_spec.to_bytes(), codegen.out_spec.to_bytes())
    }

    fn run(&mut self, inputs: Vec<Value>) -> Result<Vec<Value>, ExportError> {
        let mut inputs = self.module.codegen().in_spec.unflatten(inputs)?;
        let (outputs, _) = self.module.forward(&mut inputs)?.flatten();
        Ok(outputs)
    }
}
