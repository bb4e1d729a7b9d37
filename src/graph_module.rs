//! Executable graph modules which own their program state.

use std::collections::BTreeMap;

use rten_tensor::Tensor;

use crate::error::ExportError;
use crate::graph::{Graph, GraphForm, NodeId, NodeOp, OpKind};
use crate::interpreter::{CopyTarget, ExecutionPlan, RunError};
use crate::program::{ExportedProgram, InputDim, RangeConstraint};
use crate::signature::{
    CallSpec, GraphSignature, InputKind, InputSpec, OutputKind, OutputSpec,
};
use crate::tree::{reorder_kwargs, Tree, TreeSpec};
use crate::value::{Constant, Value};

mod input_check;

pub(crate) use input_check::InputCheck;

/// Errors when calling an exported program.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum CallError {
    /// The structure of the call arguments differs from the one recorded
    /// when the program was exported.
    #[error("call arguments have structure {actual} but the program expects {expected}")]
    InputSpecMismatch { expected: String, actual: String },

    /// An input dimension is outside of its allowed range.
    #[error("{input}.size()[{dim}] = {actual} does not satisfy {bound}")]
    RangeViolation {
        input: String,
        dim: usize,
        actual: usize,
        bound: String,
    },

    #[error("{input}.size()[{dim}] must be {expected} but is {actual}")]
    StaticDimMismatch {
        input: String,
        dim: usize,
        expected: usize,
        actual: usize,
    },

    /// Two dimensions which must be equal have different sizes.
    #[error("{input}.size()[{dim}] = {actual} must equal {other} = {expected}")]
    SymbolMismatch {
        input: String,
        dim: usize,
        actual: usize,
        other: String,
        expected: usize,
    },

    #[error("input \"{input}\" must have {expected} dims but has {actual}")]
    RankMismatch {
        input: String,
        expected: usize,
        actual: usize,
    },

    #[error("input \"{input}\" must be a tensor but is a {kind}")]
    ExpectedTensor { input: String, kind: &'static str },

    #[error("execution failed: {0}")]
    Run(#[from] RunError),

    #[error("{0} is not supported by exported programs")]
    Unsupported(&'static str),
}

/// Calling convention of an unlifted graph module.
#[derive(Clone, Debug, PartialEq)]
pub struct CallCodegen {
    /// Names of the flattened user inputs, `arg_0`, `arg_1` ... for
    /// positional arguments followed by keyword argument names.
    pub arg_names: Vec<String>,
    pub in_spec: TreeSpec,
    pub out_spec: TreeSpec,
}

impl CallCodegen {
    /// Derive argument names from the structure of the call arguments.
    pub fn new(in_spec: TreeSpec, out_spec: TreeSpec) -> CallCodegen {
        let arg_names = match in_spec.as_call_spec() {
            Some((args, kwargs)) => (0..args.len())
                .map(|i| format!("arg_{}", i))
                .chain(kwargs.iter().cloned())
                .collect(),
            None => Vec::new(),
        };
        CallCodegen {
            arg_names,
            in_spec,
            out_spec,
        }
    }
}

/// A piece of state held by a [`StatefulGraphModule`].
#[derive(Clone, Debug)]
pub(crate) struct Attr {
    pub kind: InputKind,

    /// Fully qualified name, eg. `fc.weight`.
    pub fqn: String,

    /// Name of the placeholder in the lifted graph.
    pub input_name: String,

    pub value: Value,
}

/// Components of a [`StatefulGraphModule`], assembled by
/// [`unlift`](crate::unlift::unlift).
pub(crate) struct ModuleParts {
    pub graph: Graph,
    pub plan: ExecutionPlan,

    /// State by normalized attribute name.
    pub attrs: BTreeMap<String, Attr>,

    /// Lifted inputs, in order.
    pub lifted_order: Vec<String>,

    pub codegen: CallCodegen,
    pub input_check: InputCheck,
    pub range_constraints: Vec<RangeConstraint>,
    pub equality_constraints: Vec<(InputDim, InputDim)>,
}

/// Add the value of an attribute to the state dict or constants of a lifted
/// program.
fn add_state(
    attr_name: &str,
    attr: &Attr,
    state_dict: &mut BTreeMap<String, Tensor<f32>>,
    constants: &mut BTreeMap<String, Constant>,
) -> Result<(), ExportError> {
    match (attr.kind, &attr.value) {
        (InputKind::Parameter | InputKind::Buffer, Value::Tensor(t)) => {
            state_dict.insert(attr.fqn.clone(), t.clone());
        }
        (_, Value::Tensor(t)) => {
            constants.insert(attr.fqn.clone(), Constant::Tensor(t.clone()));
        }
        (_, Value::Opaque(obj)) => {
            constants.insert(attr.fqn.clone(), Constant::Object(obj.clone()));
        }
        (_, other) => {
            return Err(ExportError::SignatureMismatch(format!(
                "attribute \"{}\" holds an unsupported {}",
                attr_name,
                other.kind_name()
            )))
        }
    }
    Ok(())
}

/// A graph module with its parameters, buffers and constants stored as
/// attributes.
///
/// In-place updates of buffers made by the program are applied to the
/// module's attributes when it is called.
pub struct StatefulGraphModule {
    graph: Graph,
    plan: ExecutionPlan,
    attrs: BTreeMap<String, Attr>,
    lifted_order: Vec<String>,
    codegen: CallCodegen,
    input_check: InputCheck,
    range_constraints: Vec<RangeConstraint>,
    equality_constraints: Vec<(InputDim, InputDim)>,
}

impl StatefulGraphModule {
    pub(crate) fn new(parts: ModuleParts) -> StatefulGraphModule {
        let ModuleParts {
            graph,
            plan,
            attrs,
            lifted_order,
            codegen,
            input_check,
            range_constraints,
            equality_constraints,
        } = parts;
        StatefulGraphModule {
            graph,
            plan,
            attrs,
            lifted_order,
            codegen,
            input_check,
            range_constraints,
            equality_constraints,
        }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn codegen(&self) -> &CallCodegen {
        &self.codegen
    }

    pub fn range_constraints(&self) -> &[RangeConstraint] {
        &self.range_constraints
    }

    pub fn equality_constraints(&self) -> &[(InputDim, InputDim)] {
        &self.equality_constraints
    }

    /// Return the value of an attribute by its normalized name (eg.
    /// `fc_weight`).
    pub fn attr(&self, name: &str) -> Option<&Value> {
        self.attrs.get(name).map(|attr| &attr.value)
    }

    /// Return the names of all attributes.
    pub fn attr_names(&self) -> impl Iterator<Item = &str> {
        self.attrs.keys().map(|k| k.as_str())
    }

    /// Return a buffer by its fully qualified name.
    pub fn buffer(&self, fqn: &str) -> Option<&Tensor<f32>> {
        self.attrs
            .values()
            .find(|attr| attr.kind == InputKind::Buffer && attr.fqn == fqn)
            .and_then(|attr| attr.value.as_tensor())
    }

    /// Call the module with an `(args, kwargs)` input tree.
    ///
    /// The structure of `inputs` must match the one recorded at export time.
    /// In-place updates of user inputs are written back to `inputs`.
    pub fn forward(&mut self, inputs: &mut Tree<Value>) -> Result<Tree<Value>, CallError> {
        let spec = inputs.spec();
        if spec != self.codegen.in_spec {
            return Err(CallError::InputSpecMismatch {
                expected: self.codegen.in_spec.to_string(),
                actual: spec.to_string(),
            });
        }

        let flat_inputs: Vec<Value> = {
            let leaves = inputs.leaves();
            self.input_check.check(&leaves)?;
            leaves.into_iter().cloned().collect()
        };

        let attrs = &self.attrs;
        let output = self
            .plan
            .run(flat_inputs, &|name| attrs.get(name).map(|a| a.value.clone()))?;

        let mut leaves = inputs.leaves_mut();
        for copy in output.copies {
            match copy.target {
                CopyTarget::Attr(name) => {
                    if let Some(attr) = self.attrs.get_mut(&name) {
                        attr.value = copy.value;
                    }
                }
                CopyTarget::Input(idx) => {
                    if let Some(leaf) = leaves.get_mut(idx) {
                        **leaf = copy.value;
                    }
                }
            }
        }

        self.codegen
            .out_spec
            .unflatten(output.outputs)
            .map_err(|_| {
                RunError::InvalidGraph("output count does not match out_spec".into()).into()
            })
    }

    /// Call the module with positional and keyword arguments.
    ///
    /// Keyword arguments may be given in any order.
    pub fn call(
        &mut self,
        args: Vec<Tree<Value>>,
        kwargs: Vec<(String, Tree<Value>)>,
    ) -> Result<Tree<Value>, CallError> {
        let kwargs = reorder_kwargs(kwargs, &self.codegen.in_spec).map_err(|err| {
            CallError::InputSpecMismatch {
                expected: self.codegen.in_spec.to_string(),
                actual: err.to_string(),
            }
        })?;
        let mut inputs = Tree::call_args(args, kwargs);
        self.forward(&mut inputs)
    }

    pub fn train(&mut self) -> Result<(), CallError> {
        Err(CallError::Unsupported("train()"))
    }

    pub fn eval(&mut self) -> Result<(), CallError> {
        Err(CallError::Unsupported("eval()"))
    }

    /// Convert this module back into a lifted program, with state passed as
    /// graph inputs and in-place copies turned into mutation outputs.
    pub fn lift(&self) -> Result<ExportedProgram, ExportError> {
        let mut graph = self.graph.clone();
        let mut inserted: Vec<NodeId> = Vec::new();

        let mut input_specs = Vec::new();
        let mut state_dict = BTreeMap::new();
        let mut constants = BTreeMap::new();

        for attr_name in &self.lifted_order {
            let Some(attr) = self.attrs.get(attr_name) else {
                return Err(ExportError::SignatureMismatch(format!(
                    "missing attribute \"{}\"",
                    attr_name
                )));
            };
            let get_attr = graph
                .nodes()
                .iter()
                .find(|n| n.attr_target() == Some(attr_name.as_str()))
                .map(|n| (n.id(), n.meta().cloned()));

            let meta = get_attr.as_ref().and_then(|(_, meta)| meta.clone());
            let Some(anchor) = graph
                .nodes()
                .iter()
                .map(|n| n.id())
                .find(|id| !inserted.contains(id))
            else {
                return Err(ExportError::SignatureMismatch("graph is empty".into()));
            };
            let placeholder =
                graph.insert_before(anchor, &attr.input_name, NodeOp::Placeholder, vec![], meta)?;
            inserted.push(placeholder);
            if let Some((get_attr, _)) = get_attr {
                graph.replace_all_uses_with(get_attr, placeholder);
                graph.erase_node(get_attr)?;
            }
            graph.rename(placeholder, &attr.input_name)?;

            input_specs.push(InputSpec {
                kind: attr.kind,
                name: attr.input_name.clone(),
                target: Some(attr.fqn.clone()),
            });
            add_state(attr_name, attr, &mut state_dict, &mut constants)?;
        }

        // State which the graph does not read.
        for (attr_name, attr) in &self.attrs {
            if !self.lifted_order.contains(attr_name) {
                add_state(attr_name, attr, &mut state_dict, &mut constants)?;
            }
        }

        let placeholders: Vec<NodeId> = graph.placeholders().map(|n| n.id()).collect();
        for id in &placeholders[input_specs.len()..] {
            input_specs.push(InputSpec {
                kind: InputKind::UserInput,
                name: graph.node_name(*id).to_string(),
                target: None,
            });
        }

        // Turn copies into mutation outputs, ordered by input position.
        let copies: Vec<(NodeId, NodeId, NodeId)> = graph
            .nodes()
            .iter()
            .filter(|n| matches!(n.op(), NodeOp::Call(OpKind::Copy)))
            .filter_map(|n| match n.inputs() {
                [dst, src] => Some((n.id(), *dst, *src)),
                _ => None,
            })
            .collect();
        let mut mutations = Vec::new();
        for (copy, dst, src) in copies {
            let Some(pos) = placeholders.iter().position(|p| *p == dst) else {
                return Err(ExportError::UnresolvedMutationTarget(
                    graph.node_name(dst).to_string(),
                ));
            };
            graph.erase_node(copy)?;
            let spec = &input_specs[pos];
            let (kind, target) = match spec.kind {
                InputKind::Buffer => (OutputKind::BufferMutation, spec.target.clone()),
                InputKind::UserInput => (OutputKind::UserInputMutation, Some(spec.name.clone())),
                _ => {
                    return Err(ExportError::SignatureMismatch(format!(
                        "\"{}\" cannot be mutated",
                        spec.name
                    )))
                }
            };
            mutations.push((pos, src, kind, target));
        }
        mutations.sort_by_key(|(pos, ..)| *pos);

        let user_outputs = graph.outputs().to_vec();
        let mut output_specs = Vec::new();
        let mut output_values = Vec::new();
        for (_, src, kind, target) in mutations {
            output_values.push(src);
            output_specs.push(OutputSpec {
                kind,
                name: graph.node_name(src).to_string(),
                target,
            });
        }
        for id in user_outputs {
            output_values.push(id);
            output_specs.push(OutputSpec {
                kind: OutputKind::UserOutput,
                name: graph.node_name(id).to_string(),
                target: None,
            });
        }
        graph.set_output(output_values);
        graph.set_form(GraphForm::Lifted);

        tracing::debug!(inputs = input_specs.len(), "lifted graph module");

        ExportedProgram::new(
            graph,
            GraphSignature {
                input_specs,
                output_specs,
            },
            state_dict,
            constants,
            self.range_constraints.clone(),
            self.equality_constraints.clone(),
            CallSpec {
                in_spec: self.codegen.in_spec.clone(),
                out_spec: self.codegen.out_spec.clone(),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::CallCodegen;
    use crate::tree::Tree;

    #[test]
    fn test_call_codegen_arg_names() {
        let in_spec = Tree::<()>::call_args(
            vec![Tree::Leaf(()), Tree::Leaf(())],
            vec![("mask".into(), Tree::Leaf(()))],
        )
        .spec();
        let codegen = CallCodegen::new(in_spec, Tree::<()>::Leaf(()).spec());
        assert_eq!(codegen.arg_names, ["arg_0", "arg_1", "mask"]);
    }
}
