//! Abstract tensor values used while tracing.
//!
//! A [`FakeTensor`] records the shape of a tensor without its data. Each
//! dimension is a [`SymExpr`], which is a fixed value for static dimensions
//! and a symbol for dimensions declared dynamic.

use std::fmt;

use rten_symbolic::{SymExpr, ValueRange};
use rten_tensor::prelude::*;
use rten_tensor::Tensor;
use serde::{Deserialize, Serialize};

use crate::error::ExportError;
use crate::shape_env::{ShapeEnv, TrackedFake};
use crate::source::Source;
use crate::value::OpaqueHandle;

/// Shape-only stand-in for a real tensor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FakeTensor {
    shape: Vec<SymExpr>,
}

impl FakeTensor {
    pub fn new(shape: Vec<SymExpr>) -> FakeTensor {
        FakeTensor { shape }
    }

    /// Create a fake tensor where every dimension is static.
    pub fn from_shape(shape: &[usize]) -> FakeTensor {
        FakeTensor {
            shape: shape.iter().map(|&size| SymExpr::from(size)).collect(),
        }
    }

    pub fn shape(&self) -> &[SymExpr] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Return true if no dimension is symbolic.
    pub fn is_static(&self) -> bool {
        self.shape.iter().all(|d| d.as_value().is_some())
    }

    /// Return the shape if all dimensions are static.
    pub fn static_shape(&self) -> Option<Vec<usize>> {
        self.shape
            .iter()
            .map(|d| d.as_value().and_then(|v| usize::try_from(v).ok()))
            .collect()
    }

    /// Return a copy of this tensor with every dimension transformed by `f`.
    pub fn map_shape(&self, f: impl Fn(&SymExpr) -> SymExpr) -> FakeTensor {
        FakeTensor {
            shape: self.shape.iter().map(f).collect(),
        }
    }
}

impl fmt::Display for FakeTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, dim) in self.shape.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", dim)?;
        }
        write!(f, "]")
    }
}

/// Abstract counterpart of a program input.
#[derive(Clone, Debug, PartialEq)]
pub enum FakeValue {
    Tensor(FakeTensor),
    /// Opaque objects are passed through without being faked.
    Opaque(OpaqueHandle),
}

impl FakeValue {
    pub fn as_tensor(&self) -> Option<&FakeTensor> {
        match self {
            FakeValue::Tensor(t) => Some(t),
            FakeValue::Opaque(_) => None,
        }
    }
}

/// Whether a dimension is given a symbol or a fixed size when faked.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DimDynamic {
    Static,
    Dynamic,
}

/// Per-dimension instructions for creating a fake tensor.
#[derive(Clone, Debug, PartialEq)]
pub struct SymbolicContext {
    pub dynamic_sizes: Vec<DimDynamic>,

    /// Declared range of each dynamic dimension. `None` for static dimensions.
    pub constraint_sizes: Vec<Option<ValueRange>>,
}

impl SymbolicContext {
    /// Create a context where every one of `ndim` dimensions is static.
    pub fn all_static(ndim: usize) -> SymbolicContext {
        SymbolicContext {
            dynamic_sizes: vec![DimDynamic::Static; ndim],
            constraint_sizes: vec![None; ndim],
        }
    }

    /// Mark dimension `dim` as dynamic with range `range`.
    pub fn set_dynamic(&mut self, dim: usize, range: ValueRange) {
        self.dynamic_sizes[dim] = DimDynamic::Dynamic;
        self.constraint_sizes[dim] = Some(range);
    }
}

/// Creates fake tensors whose symbolic sizes are managed by a [`ShapeEnv`].
pub struct FakeTensorMode {
    pub shape_env: ShapeEnv,
}

impl FakeTensorMode {
    pub fn new(shape_env: ShapeEnv) -> FakeTensorMode {
        FakeTensorMode { shape_env }
    }

    /// Create a fake tensor for `tensor` and track it in the shape
    /// environment.
    pub fn from_tensor(
        &mut self,
        tensor: &Tensor<f32>,
        source: Source,
        context: SymbolicContext,
    ) -> Result<FakeTensor, ExportError> {
        let sizes = tensor
            .shape()
            .iter()
            .enumerate()
            .map(|(dim, &size)| {
                self.shape_env.create_symbolic_size(
                    size,
                    source.size(dim),
                    context.dynamic_sizes[dim],
                    context.constraint_sizes[dim],
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        let fake = FakeTensor::new(sizes);
        self.shape_env.add_tracked_fake(TrackedFake {
            fake: fake.clone(),
            source,
            symbolic_context: context,
        })?;
        Ok(fake)
    }

    /// Create a fake tensor with all-static sizes, without tracking it.
    pub fn from_tensor_static(&self, tensor: &Tensor<f32>) -> FakeTensor {
        FakeTensor::from_shape(tensor.shape())
    }
}

#[cfg(test)]
mod tests {
    use rten_symbolic::{SymExpr, ValueRange};
    use rten_tensor::Tensor;

    use super::{FakeTensor, FakeTensorMode, SymbolicContext};
    use crate::shape_env::ShapeEnv;
    use crate::source::Source;

    #[test]
    fn test_from_tensor() {
        let mut mode = FakeTensorMode::new(ShapeEnv::new());
        let x = Tensor::<f32>::zeros(&[8, 4]);

        let mut ctx = SymbolicContext::all_static(2);
        ctx.set_dynamic(0, ValueRange::new(1, 1024));
        let fake = mode.from_tensor(&x, Source::local("x"), ctx).unwrap();

        assert_eq!(fake.shape(), &[SymExpr::pos_var("s0"), SymExpr::Value(4)]);
        assert!(!fake.is_static());
        assert_eq!(fake.to_string(), "[s0, 4]");
        assert_eq!(mode.shape_env.tracked_fakes().len(), 1);

        let static_fake = mode.from_tensor_static(&x);
        assert_eq!(static_fake, FakeTensor::from_shape(&[8, 4]));
        assert_eq!(static_fake.static_shape(), Some(vec![8, 4]));
    }
}
