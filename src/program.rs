//! The frozen result of exporting a program.

use std::collections::BTreeMap;
use std::fmt;

use rten_symbolic::{SymExpr, ValueRange};
use rten_tensor::Tensor;
use serde::{Deserialize, Serialize};

use crate::error::ExportError;
use crate::fake::FakeTensor;
use crate::graph::{Graph, GraphForm};
use crate::graph_module::{CallError, InputCheck, StatefulGraphModule};
use crate::interpreter::{ExecutionPlan, RunError};
use crate::signature::{CallSpec, GraphSignature, InputKind, OutputKind};
use crate::tree::{reorder_kwargs, Tree};
use crate::unlift::unlift_exported_program_lifted_states;
use crate::value::{Constant, Value};

/// Allowed range of a symbolic size.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RangeConstraint {
    pub expr: SymExpr,
    pub range: ValueRange,
}

/// A dimension of a user input.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InputDim {
    /// Placeholder name of the input.
    pub input_name: String,
    pub dim: usize,
}

impl fmt::Display for InputDim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.size()[{}]", self.input_name, self.dim)
    }
}

/// A traced program in lifted form, together with its state and the
/// constraints on its input shapes.
#[derive(Clone, Debug)]
pub struct ExportedProgram {
    graph: Graph,
    graph_signature: GraphSignature,

    /// Parameters and buffers, by fully qualified name.
    state_dict: BTreeMap<String, Tensor<f32>>,
    constants: BTreeMap<String, Constant>,
    range_constraints: Vec<RangeConstraint>,

    /// Pairs of input dimensions which must have equal sizes.
    equality_constraints: Vec<(InputDim, InputDim)>,
    call_spec: CallSpec,
}

impl ExportedProgram {
    /// Assemble a program, checking that the parts are consistent.
    pub fn new(
        graph: Graph,
        graph_signature: GraphSignature,
        state_dict: BTreeMap<String, Tensor<f32>>,
        constants: BTreeMap<String, Constant>,
        range_constraints: Vec<RangeConstraint>,
        equality_constraints: Vec<(InputDim, InputDim)>,
        call_spec: CallSpec,
    ) -> Result<ExportedProgram, ExportError> {
        if graph.form() != GraphForm::Lifted {
            return Err(ExportError::SignatureMismatch(
                "exported programs must hold a lifted graph".into(),
            ));
        }
        graph.lint()?;

        let num_placeholders = graph.placeholders().count();
        if graph_signature.input_specs.len() != num_placeholders {
            return Err(ExportError::SignatureMismatch(format!(
                "graph has {} inputs but the signature describes {}",
                num_placeholders,
                graph_signature.input_specs.len()
            )));
        }
        let num_outputs = graph.outputs().len();
        if graph_signature.output_specs.len() != num_outputs {
            return Err(ExportError::SignatureMismatch(format!(
                "graph has {} outputs but the signature describes {}",
                num_outputs,
                graph_signature.output_specs.len()
            )));
        }

        for spec in graph_signature.lifted_inputs() {
            let target = spec.target.as_deref().unwrap_or_default();
            let present = match spec.kind {
                InputKind::Parameter | InputKind::Buffer => state_dict.contains_key(target),
                _ => constants.contains_key(target),
            };
            if !present {
                return Err(ExportError::SignatureMismatch(format!(
                    "no value for {:?} \"{}\"",
                    spec.kind, target
                )));
            }
        }

        let num_user_inputs = graph_signature.user_inputs().len();
        if call_spec.in_spec.num_leaves() != num_user_inputs {
            return Err(ExportError::SignatureMismatch(format!(
                "input spec has {} leaves but the graph has {} user inputs",
                call_spec.in_spec.num_leaves(),
                num_user_inputs
            )));
        }

        Ok(ExportedProgram {
            graph,
            graph_signature,
            state_dict,
            constants,
            range_constraints,
            equality_constraints,
            call_spec,
        })
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn graph_signature(&self) -> &GraphSignature {
        &self.graph_signature
    }

    pub fn state_dict(&self) -> &BTreeMap<String, Tensor<f32>> {
        &self.state_dict
    }

    pub fn constants(&self) -> &BTreeMap<String, Constant> {
        &self.constants
    }

    pub fn range_constraints(&self) -> &[RangeConstraint] {
        &self.range_constraints
    }

    pub fn equality_constraints(&self) -> &[(InputDim, InputDim)] {
        &self.equality_constraints
    }

    pub fn call_spec(&self) -> &CallSpec {
        &self.call_spec
    }

    /// Return the range constraint for a symbolic size, if there is one.
    pub fn range_for(&self, expr: &SymExpr) -> Option<ValueRange> {
        self.range_constraints
            .iter()
            .find(|rc| rc.expr == *expr)
            .map(|rc| rc.range)
    }

    /// Return the placeholder names and abstract values of the user inputs.
    pub(crate) fn user_input_metas(&self) -> Vec<(String, Option<FakeTensor>)> {
        self.graph
            .placeholders()
            .zip(&self.graph_signature.input_specs)
            .filter(|(_, spec)| spec.kind == InputKind::UserInput)
            .map(|(node, _)| (node.name().to_string(), node.meta().cloned()))
            .collect()
    }

    /// Check flattened user inputs against the input shapes and constraints
    /// recorded at export time.
    pub fn check_inputs(&self, user_inputs: &[Value]) -> Result<(), CallError> {
        let check = InputCheck::new(self.user_input_metas(), &self.range_constraints);
        check.check(&user_inputs.iter().collect::<Vec<_>>())
    }

    /// Return the value of a lifted input.
    fn lifted_value(&self, kind: InputKind, target: &str) -> Option<Value> {
        match kind {
            InputKind::Parameter | InputKind::Buffer => {
                self.state_dict.get(target).cloned().map(Value::Tensor)
            }
            _ => self.constants.get(target).map(|c| match c {
                Constant::Tensor(t) => Value::Tensor(t.clone()),
                Constant::Object(obj) => Value::Opaque(obj.clone()),
            }),
        }
    }

    /// Run the lifted graph with flattened user inputs.
    ///
    /// Returns all graph outputs, including mutation outputs. The program's
    /// state is not modified.
    pub fn run_flat(&self, user_inputs: Vec<Value>) -> Result<Vec<Value>, CallError> {
        self.check_inputs(&user_inputs)?;

        let mut inputs = Vec::with_capacity(self.graph_signature.input_specs.len());
        let mut user_inputs = user_inputs.into_iter();
        for spec in &self.graph_signature.input_specs {
            let value = match spec.kind {
                InputKind::UserInput => user_inputs.next(),
                kind => self.lifted_value(kind, spec.target.as_deref().unwrap_or_default()),
            };
            let Some(value) = value else {
                return Err(CallError::InputSpecMismatch {
                    expected: self.call_spec.in_spec.to_string(),
                    actual: format!("no value for input \"{}\"", spec.name),
                });
            };
            inputs.push(value);
        }

        let plan = ExecutionPlan::compile(&self.graph)?;
        Ok(plan.run(inputs, &|_| None)?.outputs)
    }

    /// Run the program with positional and keyword arguments and return the
    /// user outputs, in the structure the traced program returned.
    pub fn run(
        &self,
        args: Vec<Tree<Value>>,
        kwargs: Vec<(String, Tree<Value>)>,
    ) -> Result<Tree<Value>, CallError> {
        let in_spec = &self.call_spec.in_spec;
        let kwargs = reorder_kwargs(kwargs, in_spec).map_err(|err| CallError::InputSpecMismatch {
            expected: in_spec.to_string(),
            actual: err.to_string(),
        })?;
        let (leaves, spec) = Tree::call_args(args, kwargs).flatten();
        if spec != *in_spec {
            return Err(CallError::InputSpecMismatch {
                expected: in_spec.to_string(),
                actual: spec.to_string(),
            });
        }

        let outputs = self.run_flat(leaves)?;
        let user_outputs: Vec<Value> = outputs
            .into_iter()
            .zip(&self.graph_signature.output_specs)
            .filter(|(_, spec)| spec.kind == OutputKind::UserOutput)
            .map(|(value, _)| value)
            .collect();
        self.call_spec.out_spec.unflatten(user_outputs).map_err(|_| {
            CallError::Run(RunError::InvalidGraph(
                "output count does not match out_spec".into(),
            ))
        })
    }

    /// Create an executable module which holds this program's state as
    /// attributes.
    pub fn module(&self) -> Result<StatefulGraphModule, ExportError> {
        unlift_exported_program_lifted_states(self)
    }
}

impl fmt::Display for ExportedProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ExportedProgram:")?;
        write!(f, "{}", self.graph)?;
        writeln!(f, "Graph signature:")?;
        for spec in &self.graph_signature.input_specs {
            match &spec.target {
                Some(target) => writeln!(f, "    {:?} {}: {}", spec.kind, spec.name, target)?,
                None => writeln!(f, "    {:?} {}", spec.kind, spec.name)?,
            }
        }
        for spec in &self.graph_signature.output_specs {
            match &spec.target {
                Some(target) => writeln!(f, "    {:?} {}: {}", spec.kind, spec.name, target)?,
                None => writeln!(f, "    {:?} {}", spec.kind, spec.name)?,
            }
        }
        writeln!(f, "Range constraints:")?;
        for rc in &self.range_constraints {
            writeln!(f, "    {}: {}", rc.expr, rc.range)?;
        }
        if !self.equality_constraints.is_empty() {
            writeln!(f, "Equality constraints:")?;
            for (a, b) in &self.equality_constraints {
                writeln!(f, "    {} == {}", a, b)?;
            }
        }
        Ok(())
    }
}
