use rten_tensor::prelude::*;
use rten_tensor::Tensor;
use serde::{Deserialize, Serialize};

/// Handle to an object which is opaque to the exporter.
///
/// Opaque objects are passed through tracing unchanged. They can be program
/// inputs or graph-resident custom objects, but no operator reads them.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpaqueHandle {
    /// Fully qualified name of the object's type.
    pub type_name: String,
    pub id: u64,
}

impl OpaqueHandle {
    pub fn new(type_name: &str, id: u64) -> OpaqueHandle {
        OpaqueHandle {
            type_name: type_name.to_string(),
            id,
        }
    }
}

/// A value passed to or returned from a program.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Tensor(Tensor<f32>),
    Opaque(OpaqueHandle),
    Int(i64),
    Float(f64),
}

impl Value {
    /// Return a short description of the kind of value.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Tensor(_) => "tensor",
            Value::Opaque(_) => "opaque object",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
        }
    }

    pub fn as_tensor(&self) -> Option<&Tensor<f32>> {
        match self {
            Value::Tensor(t) => Some(t),
            _ => None,
        }
    }

    pub fn into_tensor(self) -> Option<Tensor<f32>> {
        match self {
            Value::Tensor(t) => Some(t),
            _ => None,
        }
    }

    /// Return the shape if this is a tensor.
    pub fn shape(&self) -> Option<&[usize]> {
        self.as_tensor().map(|t| t.shape())
    }
}

impl From<Tensor<f32>> for Value {
    fn from(value: Tensor<f32>) -> Self {
        Value::Tensor(value)
    }
}

impl From<OpaqueHandle> for Value {
    fn from(value: OpaqueHandle) -> Self {
        Value::Opaque(value)
    }
}

/// A constant held by a program, outside of its parameters and buffers.
#[derive(Clone, Debug, PartialEq)]
pub enum Constant {
    Tensor(Tensor<f32>),
    Object(OpaqueHandle),
}

impl Constant {
    pub fn as_tensor(&self) -> Option<&Tensor<f32>> {
        match self {
            Constant::Tensor(t) => Some(t),
            Constant::Object(_) => None,
        }
    }
}

impl From<Tensor<f32>> for Constant {
    fn from(value: Tensor<f32>) -> Self {
        Constant::Tensor(value)
    }
}

impl From<OpaqueHandle> for Constant {
    fn from(value: OpaqueHandle) -> Self {
        Constant::Object(value)
    }
}
