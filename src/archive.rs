//! Saving and loading exported programs.
//!
//! An archive is a [`Container`] with one entry per payload. The graph,
//! signature and constraints are stored as JSON, and the state dict and
//! constants use a compact binary encoding.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ExportError;
use crate::graph::Graph;
use crate::program::{ExportedProgram, InputDim, RangeConstraint};
use crate::signature::{CallSpec, GraphSignature};

mod container;
mod tensor_data;

pub use container::{Container, ContainerError};

/// Version of the archive schema written by [`save`].
///
/// Archives can be loaded if their major version matches.
pub const SCHEMA_VERSION: &str = "1.0";

pub const PROGRAM_PAYLOAD: &str = "serialized_exported_program.json";
pub const STATE_DICT_PAYLOAD: &str = "serialized_state_dict.pt";
pub const CONSTANTS_PAYLOAD: &str = "serialized_constants.pt";
pub const VERSION_PAYLOAD: &str = "version";

const LEGACY_STATE_DICT_PAYLOAD: &str = "serialized_state_dict.json";
const LEGACY_CONSTANTS_PAYLOAD: &str = "serialized_constants.json";
const EXTRA_FILES_PREFIX: &str = "extra_files/";

/// Errors reading or writing an archive.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid archive: {0}")]
    InvalidContainer(#[from] ContainerError),

    /// The version payload is not a dotted list of integers, or has a
    /// different number of components than [`SCHEMA_VERSION`].
    #[error("invalid archive version \"{0}\"")]
    InvalidVersion(String),

    #[error("archive has schema version {actual} but this version of the library reads {expected}")]
    SchemaVersionMismatch { expected: String, actual: String },

    #[error("archive is missing payload \"{0}\"")]
    MissingPayload(String),

    #[error("payload \"{name}\" is invalid: {reason}")]
    InvalidPayload { name: String, reason: String },

    #[error("invalid program payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serialized form of everything in an [`ExportedProgram`] except its state.
#[derive(Serialize, Deserialize)]
struct ProgramPayload {
    graph: Graph,
    graph_signature: GraphSignature,
    range_constraints: Vec<RangeConstraint>,
    equality_constraints: Vec<(InputDim, InputDim)>,
    call_spec: CallSpec,
}

fn parse_version(version: &str) -> Result<Vec<u32>, ArchiveError> {
    version
        .trim()
        .split('.')
        .map(|part| part.parse::<u32>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| ArchiveError::InvalidVersion(version.to_string()))
}

/// Check that an archive with version `version` can be read.
pub fn check_version(version: &str) -> Result<(), ArchiveError> {
    let actual = parse_version(version)?;
    let expected = parse_version(SCHEMA_VERSION)?;
    if actual.len() != expected.len() {
        return Err(ArchiveError::InvalidVersion(version.to_string()));
    }
    if actual[0] != expected[0] {
        return Err(ArchiveError::SchemaVersionMismatch {
            expected: SCHEMA_VERSION.to_string(),
            actual: version.trim().to_string(),
        });
    }
    Ok(())
}

fn to_container(
    program: &ExportedProgram,
    extra_files: &BTreeMap<String, String>,
) -> Result<Container, ArchiveError> {
    let payload = ProgramPayload {
        graph: program.graph().clone(),
        graph_signature: program.graph_signature().clone(),
        range_constraints: program.range_constraints().to_vec(),
        equality_constraints: program.equality_constraints().to_vec(),
        call_spec: program.call_spec().clone(),
    };

    let mut container = Container::new();
    container.add(PROGRAM_PAYLOAD, serde_json::to_vec(&payload)?);
    container.add(
        STATE_DICT_PAYLOAD,
        tensor_data::encode_tensors(program.state_dict()),
    );
    container.add(
        CONSTANTS_PAYLOAD,
        tensor_data::encode_constants(program.constants()),
    );
    container.add(VERSION_PAYLOAD, SCHEMA_VERSION.as_bytes().to_vec());
    for (name, content) in extra_files {
        container.add(
            &format!("{}{}", EXTRA_FILES_PREFIX, name),
            content.as_bytes().to_vec(),
        );
    }
    Ok(container)
}

/// Write `program` to `writer`, together with named text files.
///
/// The archive is assembled in memory and written with a single call.
pub fn save<W: Write>(
    program: &ExportedProgram,
    writer: &mut W,
    extra_files: &BTreeMap<String, String>,
) -> Result<(), ExportError> {
    let buf = to_container(program, extra_files)?.to_buf();
    writer.write_all(&buf).map_err(ArchiveError::from)?;
    writer.flush().map_err(ArchiveError::from)?;
    tracing::debug!(bytes = buf.len(), "saved archive");
    Ok(())
}

/// Save `program` to a file.
///
/// The archive is first written to a temporary file alongside `path`, which
/// is then renamed into place. If saving fails, any existing file at `path`
/// is left unchanged.
pub fn save_to_path(
    program: &ExportedProgram,
    path: &Path,
    extra_files: &BTreeMap<String, String>,
) -> Result<(), ExportError> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "archive".to_string());
    let tmp_path: PathBuf = path.with_file_name(format!(".{}.tmp", file_name));

    let write_tmp = || -> Result<(), ExportError> {
        let mut file = fs::File::create(&tmp_path).map_err(ArchiveError::from)?;
        save(program, &mut file, extra_files)?;
        file.sync_all().map_err(ArchiveError::from)?;
        Ok(())
    };

    if let Err(err) = write_tmp().and_then(|_| {
        fs::rename(&tmp_path, path).map_err(|err| ArchiveError::from(err).into())
    }) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }
    Ok(())
}

fn invalid_payload(name: &str) -> impl FnOnce(String) -> ArchiveError + '_ {
    move |reason| ArchiveError::InvalidPayload {
        name: name.to_string(),
        reason,
    }
}

/// Return the payload `name`, or its legacy JSON counterpart.
///
/// The flag in the result is true if the legacy payload was used.
fn find_payload<'a>(
    container: &'a Container,
    name: &'static str,
    legacy_name: &'static str,
) -> Result<(&'a [u8], bool), ArchiveError> {
    if let Some(data) = container.get(name) {
        return Ok((data, false));
    }
    if let Some(data) = container.get(legacy_name) {
        tracing::warn!(
            payload = legacy_name,
            "archive uses deprecated payload name, re-save it to use \"{}\"",
            name
        );
        return Ok((data, true));
    }
    Err(ArchiveError::MissingPayload(name.to_string()))
}

/// Return the schema version recorded in an archive.
pub fn read_version(container: &Container) -> Result<String, ArchiveError> {
    let data = container
        .get(VERSION_PAYLOAD)
        .ok_or_else(|| ArchiveError::MissingPayload(VERSION_PAYLOAD.to_string()))?;
    let version = std::str::from_utf8(data)
        .map_err(|err| invalid_payload(VERSION_PAYLOAD)(err.to_string()))?;
    Ok(version.trim().to_string())
}

/// Load a program and all of its extra files from archive bytes.
pub fn load_with_extra_files(
    bytes: &[u8],
) -> Result<(ExportedProgram, BTreeMap<String, String>), ExportError> {
    let container = Container::from_buf(bytes).map_err(ArchiveError::from)?;
    check_version(&read_version(&container)?)?;

    let program_data = container
        .get(PROGRAM_PAYLOAD)
        .ok_or_else(|| ArchiveError::MissingPayload(PROGRAM_PAYLOAD.to_string()))?;
    let payload: ProgramPayload =
        serde_json::from_slice(program_data).map_err(ArchiveError::from)?;

    let (state_data, legacy) =
        find_payload(&container, STATE_DICT_PAYLOAD, LEGACY_STATE_DICT_PAYLOAD)?;
    let state_dict = if legacy {
        tensor_data::decode_tensors_json(state_data)
    } else {
        tensor_data::decode_tensors(state_data)
    }
    .map_err(invalid_payload(STATE_DICT_PAYLOAD))?;

    let (constants_data, legacy) =
        find_payload(&container, CONSTANTS_PAYLOAD, LEGACY_CONSTANTS_PAYLOAD)?;
    let constants = if legacy {
        tensor_data::decode_constants_json(constants_data)
    } else {
        tensor_data::decode_constants(constants_data)
    }
    .map_err(invalid_payload(CONSTANTS_PAYLOAD))?;

    let mut extra_files = BTreeMap::new();
    for name in container.names() {
        let Some(file_name) = name.strip_prefix(EXTRA_FILES_PREFIX) else {
            continue;
        };
        let data = container.get(name).unwrap_or_default();
        let content = String::from_utf8(data.to_vec())
            .map_err(|err| invalid_payload(name)(err.to_string()))?;
        extra_files.insert(file_name.to_string(), content);
    }

    let program = ExportedProgram::new(
        payload.graph,
        payload.graph_signature,
        state_dict,
        constants,
        payload.range_constraints,
        payload.equality_constraints,
        payload.call_spec,
    )?;
    Ok((program, extra_files))
}

/// Load a program from archive bytes.
pub fn load(bytes: &[u8]) -> Result<ExportedProgram, ExportError> {
    load_with_extra_files(bytes).map(|(program, _)| program)
}

/// Load a program and its extra files from a file.
pub fn load_from_path(
    path: &Path,
) -> Result<(ExportedProgram, BTreeMap<String, String>), ExportError> {
    let bytes = fs::read(path).map_err(ArchiveError::from)?;
    load_with_extra_files(&bytes)
}
