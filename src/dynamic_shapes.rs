//! Declarations of which input dimensions are dynamic.
//!
//! Users describe dynamic dimensions with [`Dim`]s arranged in a
//! [`DynamicShapes`] value that mirrors the structure of the program's
//! arguments. [`process_dynamic_shapes`] normalizes the declarations into a
//! flat list of [`Constraint`]s, one per dynamic dimension.

use std::fmt;

use rten_symbolic::{ValueRange, INT_OO};
use rustc_hash::FxHashMap;

use crate::error::ExportError;
use crate::tree::Tree;
use crate::value::Value;

/// A named dynamic dimension with an inclusive range of sizes.
///
/// Using the same `Dim` for several dimensions declares them equal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dim {
    name: String,
    min: i64,
    max: i64,
}

impl Dim {
    /// Create a dimension with no bounds beyond being non-negative.
    pub fn new(name: &str) -> Dim {
        Dim {
            name: name.to_string(),
            min: 0,
            max: INT_OO,
        }
    }

    pub fn with_min(mut self, min: i64) -> Dim {
        self.min = min;
        self
    }

    pub fn with_max(mut self, max: i64) -> Dim {
        self.max = max;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn range(&self) -> ValueRange {
        ValueRange::new(self.min, self.max)
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.max == INT_OO {
            write!(f, "Dim('{}', min={})", self.name, self.min)
        } else {
            write!(f, "Dim('{}', min={}, max={})", self.name, self.min, self.max)
        }
    }
}

/// Dynamic shape declaration for one argument.
#[derive(Clone, Debug, PartialEq)]
pub enum ShapeSpec {
    /// All dimensions are static.
    Static,
    /// Map of dimension index to `Dim`. Other dimensions are static.
    Dims(Vec<(usize, Dim)>),
    /// One entry per dimension. `None` entries are static.
    DimList(Vec<Option<Dim>>),
    /// Specs for each item of a tuple or list argument.
    Seq(Vec<ShapeSpec>),
    /// Specs for items of a dict argument, by key. Missing keys are static.
    Map(Vec<(String, ShapeSpec)>),
}

/// Dynamic shape declarations for all arguments of a program.
#[derive(Clone, Debug, PartialEq)]
pub enum DynamicShapes {
    /// Specs keyed by parameter or keyword argument name.
    ByName(Vec<(String, ShapeSpec)>),
    /// One spec per positional argument, followed by one per keyword
    /// argument.
    Positional(Vec<ShapeSpec>),
}

/// Identifies a tensor by its position among the leaves of the flattened
/// `(args, kwargs)` call tree.
pub type TensorId = usize;

/// A dimension of an input tensor.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct DimRef {
    pub t_id: TensorId,
    pub dim: usize,
}

/// Declaration that one input dimension is dynamic.
#[derive(Clone, Debug, PartialEq)]
pub struct Constraint {
    pub target: DimRef,
    pub range: ValueRange,

    /// Another dimension this one is declared equal to.
    pub shared: Option<DimRef>,

    /// Name of the `Dim` this constraint was created from.
    pub debug_name: Option<String>,
}

impl Constraint {
    /// Declare dimension `dim` of the input with flat index `t_id` dynamic.
    ///
    /// This is the older alternative to [`DynamicShapes`]. Constraints
    /// created this way are passed to export via
    /// [`ExportOptions::constraints`](crate::export::ExportOptions::constraints).
    pub fn dynamic_dim(t_id: TensorId, dim: usize) -> Constraint {
        Constraint {
            target: DimRef { t_id, dim },
            range: ValueRange::new(0, INT_OO),
            shared: None,
            debug_name: None,
        }
    }

    pub fn with_range(mut self, min: i64, max: i64) -> Constraint {
        self.range = ValueRange::new(min, max);
        self
    }

    /// Declare this dimension equal to the dimension of `other`.
    pub fn equal_to(mut self, other: &Constraint) -> Constraint {
        self.shared = Some(other.target);
        self
    }
}

/// An argument of the program together with the flat index of its first leaf.
struct Argument<'a> {
    name: String,
    tree: &'a Tree<Value>,
    first_leaf: TensorId,
}

fn invalid(msg: String) -> ExportError {
    ExportError::InvalidDynamicShapes(msg)
}

struct ConstraintBuilder {
    constraints: Vec<Constraint>,

    /// Primary dimension and range for each `Dim` name.
    primaries: FxHashMap<String, (DimRef, Dim)>,
}

impl ConstraintBuilder {
    fn add_dim(&mut self, target: DimRef, dim: &Dim) -> Result<(), ExportError> {
        let shared = match self.primaries.get(dim.name()) {
            Some((primary, prev)) => {
                if prev != dim {
                    return Err(invalid(format!(
                        "found different definitions {} and {} for the same dimension name",
                        prev, dim
                    )));
                }
                Some(*primary)
            }
            None => {
                self.primaries
                    .insert(dim.name().to_string(), (target, dim.clone()));
                None
            }
        };
        self.constraints.push(Constraint {
            target,
            range: dim.range(),
            shared,
            debug_name: Some(dim.name().to_string()),
        });
        Ok(())
    }

    /// Add constraints for the tensors in `tree` described by `spec`.
    ///
    /// `first_leaf` is the flat index of the first leaf in `tree`.
    fn visit(
        &mut self,
        path: &str,
        spec: &ShapeSpec,
        tree: &Tree<Value>,
        first_leaf: TensorId,
    ) -> Result<(), ExportError> {
        let tensor_ndim = || {
            let shape = match tree {
                Tree::Leaf(value) => value.shape(),
                _ => None,
            };
            shape.map(|s| s.len()).ok_or_else(|| {
                invalid(format!(
                    "expected a tensor at {} to match its dimension spec",
                    path
                ))
            })
        };
        let check_dim = |dim: usize, ndim: usize| {
            if dim >= ndim {
                Err(invalid(format!(
                    "dimension {} of {} is out of range for a tensor with {} dims",
                    dim, path, ndim
                )))
            } else {
                Ok(())
            }
        };

        match spec {
            ShapeSpec::Static => {}
            ShapeSpec::Dims(dims) => {
                let ndim = tensor_ndim()?;
                for (idx, dim) in dims {
                    check_dim(*idx, ndim)?;
                    self.add_dim(
                        DimRef {
                            t_id: first_leaf,
                            dim: *idx,
                        },
                        dim,
                    )?;
                }
            }
            ShapeSpec::DimList(dims) => {
                let ndim = tensor_ndim()?;
                if dims.len() != ndim {
                    return Err(invalid(format!(
                        "spec for {} lists {} dims but the tensor has {}",
                        path,
                        dims.len(),
                        ndim
                    )));
                }
                for (idx, dim) in dims.iter().enumerate() {
                    if let Some(dim) = dim {
                        self.add_dim(
                            DimRef {
                                t_id: first_leaf,
                                dim: idx,
                            },
                            dim,
                        )?;
                    }
                }
            }
            ShapeSpec::Seq(specs) => {
                let items = match tree {
                    Tree::Tuple(items) | Tree::List(items) if items.len() == specs.len() => items,
                    _ => {
                        return Err(invalid(format!(
                            "spec for {} is a sequence of {} items, which does not match the argument",
                            path,
                            specs.len()
                        )))
                    }
                };
                let mut leaf = first_leaf;
                for (i, (spec, item)) in specs.iter().zip(items).enumerate() {
                    self.visit(&format!("{}[{}]", path, i), spec, item, leaf)?;
                    leaf += item.leaves().len();
                }
            }
            ShapeSpec::Map(specs) => {
                let Tree::Dict(items) = tree else {
                    return Err(invalid(format!(
                        "spec for {} is a mapping but the argument is not",
                        path
                    )));
                };
                if let Some((key, _)) = specs
                    .iter()
                    .find(|(key, _)| !items.iter().any(|(k, _)| k == key))
                {
                    return Err(invalid(format!("{} has no key '{}'", path, key)));
                }
                let mut leaf = first_leaf;
                for (key, item) in items {
                    if let Some((_, spec)) = specs.iter().find(|(k, _)| k == key) {
                        self.visit(&format!("{}['{}']", path, key), spec, item, leaf)?;
                    }
                    leaf += item.leaves().len();
                }
            }
        }
        Ok(())
    }
}

/// Convert dynamic shape declarations into a list of constraints.
///
/// `param_names` are the names of the program's positional parameters. The
/// first use of each `Dim` name creates a primary constraint. Further uses
/// create constraints which are `shared` with the primary.
pub fn process_dynamic_shapes(
    param_names: &[String],
    args: &[Tree<Value>],
    kwargs: &[(String, Tree<Value>)],
    dynamic_shapes: Option<&DynamicShapes>,
) -> Result<Vec<Constraint>, ExportError> {
    let Some(dynamic_shapes) = dynamic_shapes else {
        return Ok(Vec::new());
    };

    let mut arguments = Vec::with_capacity(args.len() + kwargs.len());
    let mut first_leaf = 0;
    for (i, arg) in args.iter().enumerate() {
        let name = param_names
            .get(i)
            .cloned()
            .unwrap_or_else(|| format!("arg{}", i));
        arguments.push(Argument {
            name,
            tree: arg,
            first_leaf,
        });
        first_leaf += arg.leaves().len();
    }
    for (name, arg) in kwargs {
        arguments.push(Argument {
            name: name.clone(),
            tree: arg,
            first_leaf,
        });
        first_leaf += arg.leaves().len();
    }

    let mut builder = ConstraintBuilder {
        constraints: Vec::new(),
        primaries: FxHashMap::default(),
    };

    match dynamic_shapes {
        DynamicShapes::ByName(specs) => {
            for (name, spec) in specs {
                let Some(arg) = arguments.iter().find(|a| &a.name == name) else {
                    return Err(invalid(format!(
                        "\"{}\" is not the name of an argument",
                        name
                    )));
                };
                builder.visit(&arg.name, spec, arg.tree, arg.first_leaf)?;
            }
        }
        DynamicShapes::Positional(specs) => {
            if specs.len() != arguments.len() {
                return Err(invalid(format!(
                    "expected {} specs, one for each argument, but got {}",
                    arguments.len(),
                    specs.len()
                )));
            }
            for (spec, arg) in specs.iter().zip(&arguments) {
                builder.visit(&arg.name, spec, arg.tree, arg.first_leaf)?;
            }
        }
    }

    Ok(builder.constraints)
}
