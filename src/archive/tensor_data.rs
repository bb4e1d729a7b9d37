//! Encoding of state dicts and constants.
//!
//! The binary encoding is a `u32` entry count followed by entries. Each entry
//! is a length-prefixed name, a `u8` tag and the value. Tensors (tag 0) are a
//! `u32` rank, a `u64` per dimension and the `f32` elements. Opaque objects
//! (tag 1) are a length-prefixed type name and a `u64` id.
//!
//! Older archives stored the same maps as JSON.

use std::collections::BTreeMap;

use rten_tensor::prelude::*;
use rten_tensor::Tensor;
use serde::{Deserialize, Serialize};

use super::container::{write_str, ValueReader};
use crate::value::{Constant, OpaqueHandle};

const TAG_TENSOR: u8 = 0;
const TAG_OBJECT: u8 = 1;

fn write_tensor(buf: &mut Vec<u8>, tensor: &Tensor<f32>) {
    buf.push(TAG_TENSOR);
    buf.extend((tensor.ndim() as u32).to_le_bytes());
    for &size in tensor.shape() {
        buf.extend((size as u64).to_le_bytes());
    }
    for x in tensor.iter() {
        buf.extend(x.to_le_bytes());
    }
}

fn read_tensor(reader: &mut ValueReader) -> Result<Tensor<f32>, String> {
    let ndim = reader.read::<u32>().ok_or("truncated tensor rank")?;
    let mut shape = Vec::with_capacity(ndim as usize);
    for _ in 0..ndim {
        let size = reader.read::<u64>().ok_or("truncated tensor shape")?;
        shape.push(usize::try_from(size).map_err(|_| "tensor size is too large")?);
    }
    let len = shape
        .iter()
        .try_fold(1usize, |acc, &size| acc.checked_mul(size))
        .ok_or("tensor size is too large")?;
    if len.saturating_mul(4) > reader.remaining() {
        return Err("truncated tensor data".into());
    }
    let data = (0..len)
        .map(|_| reader.read::<f32>())
        .collect::<Option<Vec<_>>>()
        .ok_or("truncated tensor data")?;
    Ok(Tensor::from_data(shape.as_slice(), data))
}

/// Encode a map of tensors, such as a state dict.
pub fn encode_tensors(tensors: &BTreeMap<String, Tensor<f32>>) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend((tensors.len() as u32).to_le_bytes());
    for (name, tensor) in tensors {
        write_str(&mut buf, name);
        write_tensor(&mut buf, tensor);
    }
    buf
}

pub fn encode_constants(constants: &BTreeMap<String, Constant>) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend((constants.len() as u32).to_le_bytes());
    for (name, constant) in constants {
        write_str(&mut buf, name);
        match constant {
            Constant::Tensor(tensor) => write_tensor(&mut buf, tensor),
            Constant::Object(obj) => {
                buf.push(TAG_OBJECT);
                write_str(&mut buf, &obj.type_name);
                buf.extend(obj.id.to_le_bytes());
            }
        }
    }
    buf
}

pub fn decode_constants(buf: &[u8]) -> Result<BTreeMap<String, Constant>, String> {
    let mut reader = ValueReader::new(buf);
    let count = reader.read::<u32>().ok_or("missing entry count")?;
    let mut constants = BTreeMap::new();

    for _ in 0..count {
        let name = reader.read_str().ok_or("invalid entry name")?.to_string();
        let constant = match reader.read::<u8>() {
            Some(TAG_TENSOR) => Constant::Tensor(read_tensor(&mut reader)?),
            Some(TAG_OBJECT) => {
                let type_name = reader.read_str().ok_or("invalid object type name")?;
                let id = reader.read::<u64>().ok_or("truncated object id")?;
                Constant::Object(OpaqueHandle::new(type_name, id))
            }
            Some(tag) => return Err(format!("unknown value tag {} for \"{}\"", tag, name)),
            None => return Err("truncated entry".into()),
        };
        constants.insert(name, constant);
    }

    if reader.remaining() > 0 {
        return Err(format!("{} bytes of trailing data", reader.remaining()));
    }
    Ok(constants)
}

pub fn decode_tensors(buf: &[u8]) -> Result<BTreeMap<String, Tensor<f32>>, String> {
    decode_constants(buf)?
        .into_iter()
        .map(|(name, constant)| match constant {
            Constant::Tensor(t) => Ok((name, t)),
            Constant::Object(_) => Err(format!("\"{}\" is not a tensor", name)),
        })
        .collect()
}

/// JSON representation of a tensor in older archives.
#[derive(Serialize, Deserialize)]
struct JsonTensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum JsonConstant {
    Tensor(JsonTensor),
    Object { type_name: String, id: u64 },
}

fn tensor_from_json(name: &str, t: JsonTensor) -> Result<Tensor<f32>, String> {
    let len: usize = t.shape.iter().product();
    if len != t.data.len() {
        return Err(format!(
            "\"{}\" has shape {:?} but {} elements",
            name,
            t.shape,
            t.data.len()
        ));
    }
    Ok(Tensor::from_data(t.shape.as_slice(), t.data))
}

/// Decode a state dict stored as JSON by older versions.
pub fn decode_tensors_json(buf: &[u8]) -> Result<BTreeMap<String, Tensor<f32>>, String> {
    let map: BTreeMap<String, JsonTensor> =
        serde_json::from_slice(buf).map_err(|err| err.to_string())?;
    map.into_iter()
        .map(|(name, t)| tensor_from_json(&name, t).map(|t| (name, t)))
        .collect()
}

/// Decode constants stored as JSON by older versions.
pub fn decode_constants_json(buf: &[u8]) -> Result<BTreeMap<String, Constant>, String> {
    let map: BTreeMap<String, JsonConstant> =
        serde_json::from_slice(buf).map_err(|err| err.to_string())?;
    map.into_iter()
        .map(|(name, c)| {
            let constant = match c {
                JsonConstant::Tensor(t) => Constant::Tensor(tensor_from_json(&name, t)?),
                JsonConstant::Object { type_name, id } => {
                    Constant::Object(OpaqueHandle::new(&type_name, id))
                }
            };
            Ok((name, constant))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use rten_tensor::Tensor;

    use super::{
        decode_constants, decode_constants_json, decode_tensors, decode_tensors_json,
        encode_constants, encode_tensors,
    };
    use crate::value::{Constant, OpaqueHandle};

    #[test]
    fn test_encode_decode() {
        let mut tensors = BTreeMap::new();
        tensors.insert(
            "fc.weight".to_string(),
            Tensor::from_data(&[2, 2], vec![1., 2., 3., 4.]),
        );
        tensors.insert("scalar".to_string(), Tensor::from_data(&[], vec![5.]));
        let decoded = decode_tensors(&encode_tensors(&tensors)).unwrap();
        assert_eq!(decoded, tensors);

        let mut constants = BTreeMap::new();
        constants.insert("one".to_string(), Constant::Tensor(Tensor::from_data(&[1], vec![1.])));
        constants.insert(
            "tok".to_string(),
            Constant::Object(OpaqueHandle::new("Tokenizer", 7)),
        );
        let encoded = encode_constants(&constants);
        assert_eq!(decode_constants(&encoded).unwrap(), constants);

        // Objects are not allowed in a state dict.
        assert!(decode_tensors(&encoded).is_err());
        assert!(decode_tensors(&encoded[..encoded.len() - 1]).is_err());
    }

    #[test]
    fn test_decode_json() {
        let tensors =
            decode_tensors_json(br#"{"w": {"shape": [2], "data": [1.0, 2.0]}}"#).unwrap();
        assert_eq!(tensors["w"], Tensor::from_data(&[2], vec![1., 2.]));
        assert!(decode_tensors_json(br#"{"w": {"shape": [3], "data": [1.0]}}"#).is_err());

        let constants = decode_constants_json(
            br#"{"tok": {"object": {"type_name": "Tokenizer", "id": 3}}}"#,
        )
        .unwrap();
        assert_eq!(
            constants["tok"],
            Constant::Object(OpaqueHandle::new("Tokenizer", 3))
        );
    }
}
