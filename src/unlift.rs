//! Conversion of lifted graphs into stateful graph modules.
//!
//! A lifted graph receives parameters, buffers and constants as inputs and
//! returns updated buffers as extra outputs. Unlifting moves that state into
//! attributes of a [`StatefulGraphModule`], reads it with `GetAttr` nodes and
//! writes mutations back with in-place copies, so the module can be called
//! with the same arguments as the original program.

use std::collections::BTreeMap;

use rten_tensor::Tensor;
use rustc_hash::FxHashMap;

use crate::error::ExportError;
use crate::graph::{Graph, GraphForm, NodeId, NodeOp, OpKind};
use crate::graph_module::{Attr, CallCodegen, InputCheck, ModuleParts, StatefulGraphModule};
use crate::interpreter::ExecutionPlan;
use crate::program::{ExportedProgram, InputDim, RangeConstraint};
use crate::signature::{InputKind, InputSpec, OutputKind, OutputSpec};
use crate::tree::TreeSpec;
use crate::value::{Constant, Value};

/// Convert a fully qualified state name into an attribute name.
///
/// Nested names such as `fc.weight` become `fc_weight`.
pub fn normalize_attr_name(name: &str) -> String {
    name.replace('.', "_")
}

/// Register all state as attributes, keyed by attribute name.
///
/// Also returns the attribute names of the lifted inputs, in input order.
/// State which no input reads is registered too, so that lifting the module
/// restores it.
fn register_attrs(
    input_specs: &[InputSpec],
    state_dict: &BTreeMap<String, Tensor<f32>>,
    constants: &BTreeMap<String, Constant>,
) -> Result<(BTreeMap<String, Attr>, Vec<String>), ExportError> {
    let mut attrs = BTreeMap::new();
    let mut order = Vec::new();

    for spec in input_specs.iter().filter(|s| s.kind.is_lifted()) {
        let Some(target) = spec.target.as_deref() else {
            return Err(ExportError::SignatureMismatch(format!(
                "lifted input \"{}\" has no target",
                spec.name
            )));
        };
        let value = match spec.kind {
            InputKind::Parameter | InputKind::Buffer => {
                state_dict.get(target).cloned().map(Value::Tensor)
            }
            _ => constants.get(target).map(|c| match c {
                Constant::Tensor(t) => Value::Tensor(t.clone()),
                Constant::Object(obj) => Value::Opaque(obj.clone()),
            }),
        };
        let Some(value) = value else {
            return Err(ExportError::SignatureMismatch(format!(
                "no value for {:?} \"{}\"",
                spec.kind, target
            )));
        };

        let name = normalize_attr_name(target);
        order.push(name.clone());
        attrs.insert(
            name,
            Attr {
                kind: spec.kind,
                fqn: target.to_string(),
                input_name: spec.name.clone(),
                value,
            },
        );
    }

    for (fqn, tensor) in state_dict {
        let name = normalize_attr_name(fqn);
        attrs.entry(name.clone()).or_insert_with(|| Attr {
            kind: InputKind::Parameter,
            fqn: fqn.clone(),
            input_name: format!("{}{}", InputKind::Parameter.name_prefix(), name),
            value: Value::Tensor(tensor.clone()),
        });
    }
    for (fqn, constant) in constants {
        let name = normalize_attr_name(fqn);
        let (kind, value) = match constant {
            Constant::Tensor(t) => (InputKind::ConstantTensor, Value::Tensor(t.clone())),
            Constant::Object(obj) => (InputKind::CustomObject, Value::Opaque(obj.clone())),
        };
        attrs.entry(name.clone()).or_insert_with(|| Attr {
            kind,
            fqn: fqn.clone(),
            input_name: format!("{}{}", kind.name_prefix(), name),
            value,
        });
    }

    Ok((attrs, order))
}

/// Replace lifted placeholders with `GetAttr` nodes.
///
/// Returns the user inputs that remain, keyed by placeholder name.
fn unlift_inputs_as_getattr(
    graph: &mut Graph,
    input_specs: &[InputSpec],
) -> Result<FxHashMap<String, NodeId>, ExportError> {
    let placeholders: Vec<NodeId> = graph.placeholders().map(|n| n.id()).collect();
    if placeholders.len() != input_specs.len() {
        return Err(ExportError::SignatureMismatch(format!(
            "graph has {} inputs but the signature describes {}",
            placeholders.len(),
            input_specs.len()
        )));
    }

    let mut user_inputs = FxHashMap::default();
    for (id, spec) in placeholders.into_iter().zip(input_specs) {
        let (Some(target), true) = (spec.target.as_deref(), spec.kind.is_lifted()) else {
            user_inputs.insert(graph.node_name(id).to_string(), id);
            continue;
        };

        let meta = graph.node(id).and_then(|n| n.meta().cloned());
        let name = graph.node_name(id).to_string();
        let get_attr = graph.insert_after(
            id,
            &name,
            NodeOp::GetAttr {
                target: normalize_attr_name(target),
            },
            vec![],
            meta,
        )?;
        graph.replace_all_uses_with(id, get_attr);
        graph.erase_node(id)?;
        graph.rename(get_attr, &name)?;

        tracing::debug!(input = %name, target, "replaced lifted input with attribute");
    }
    Ok(user_inputs)
}

/// Write mutation outputs back with in-place copies, and return only the
/// user outputs from the graph.
fn insert_copy_for_mutations(
    graph: &mut Graph,
    output_specs: &[OutputSpec],
    attr_nodes: &FxHashMap<String, NodeId>,
    user_inputs: &FxHashMap<String, NodeId>,
) -> Result<(), ExportError> {
    let outputs = graph.outputs().to_vec();
    if outputs.len() != output_specs.len() {
        return Err(ExportError::SignatureMismatch(format!(
            "graph has {} outputs but the signature describes {}",
            outputs.len(),
            output_specs.len()
        )));
    }
    let Some(output_node) = graph.output_node().map(|n| n.id()) else {
        return Err(ExportError::SignatureMismatch("graph has no output".into()));
    };

    let mut user_outputs = Vec::new();
    for (value, spec) in outputs.into_iter().zip(output_specs) {
        let target = match spec.kind {
            OutputKind::UserOutput => {
                user_outputs.push(value);
                continue;
            }
            OutputKind::BufferMutation => spec
                .target
                .as_deref()
                .and_then(|t| attr_nodes.get(&normalize_attr_name(t))),
            OutputKind::UserInputMutation => {
                spec.target.as_deref().and_then(|t| user_inputs.get(t))
            }
        };
        let Some(&target) = target else {
            return Err(ExportError::UnresolvedMutationTarget(
                spec.target.clone().unwrap_or_else(|| spec.name.clone()),
            ));
        };

        let meta = graph.node(target).and_then(|n| n.meta().cloned());
        graph.insert_before(
            output_node,
            OpKind::Copy.name(),
            NodeOp::Call(OpKind::Copy),
            vec![target, value],
            meta,
        )?;
    }

    graph.set_output(user_outputs);
    Ok(())
}

/// Build the calling convention of an unlifted module.
pub fn get_codegen(in_spec: &TreeSpec, out_spec: &TreeSpec) -> CallCodegen {
    CallCodegen::new(in_spec.clone(), out_spec.clone())
}

/// Convert a lifted graph into a [`StatefulGraphModule`].
///
/// Fails with [`ExportError::AlreadyUnlifted`] if `graph` has already been
/// unlifted, and with [`ExportError::SignatureMismatch`] if the specs do not
/// describe the graph's inputs and outputs.
pub fn unlift(
    graph: &Graph,
    input_specs: &[InputSpec],
    output_specs: &[OutputSpec],
    in_spec: &TreeSpec,
    out_spec: &TreeSpec,
    state_dict: &BTreeMap<String, Tensor<f32>>,
    constants: &BTreeMap<String, Constant>,
) -> Result<StatefulGraphModule, ExportError> {
    unlift_with_constraints(
        graph,
        input_specs,
        output_specs,
        in_spec,
        out_spec,
        state_dict,
        constants,
        &[],
        &[],
    )
}

fn unlift_with_constraints(
    graph: &Graph,
    input_specs: &[InputSpec],
    output_specs: &[OutputSpec],
    in_spec: &TreeSpec,
    out_spec: &TreeSpec,
    state_dict: &BTreeMap<String, Tensor<f32>>,
    constants: &BTreeMap<String, Constant>,
    range_constraints: &[RangeConstraint],
    equality_constraints: &[(InputDim, InputDim)],
) -> Result<StatefulGraphModule, ExportError> {
    let _span = tracing::debug_span!("unlift").entered();

    if graph.form() == GraphForm::Unlifted {
        return Err(ExportError::AlreadyUnlifted);
    }

    let mut graph = graph.clone();
    let (attrs, lifted_order) = register_attrs(input_specs, state_dict, constants)?;
    let user_inputs = unlift_inputs_as_getattr(&mut graph, input_specs)?;

    let attr_nodes: FxHashMap<String, NodeId> = graph
        .nodes()
        .iter()
        .filter_map(|n| n.attr_target().map(|t| (t.to_string(), n.id())))
        .collect();
    insert_copy_for_mutations(&mut graph, output_specs, &attr_nodes, &user_inputs)?;

    graph.set_form(GraphForm::Unlifted);
    graph.lint()?;
    graph.eliminate_dead_code();

    let input_metas = graph
        .placeholders()
        .map(|n| (n.name().to_string(), n.meta().cloned()))
        .collect();
    let input_check = InputCheck::new(input_metas, range_constraints);
    if input_check.num_inputs() != in_spec.num_leaves() {
        return Err(ExportError::SignatureMismatch(format!(
            "input spec has {} leaves but the graph has {} user inputs",
            in_spec.num_leaves(),
            input_check.num_inputs()
        )));
    }

    let plan = ExecutionPlan::compile(&graph)
        .map_err(|err| ExportError::SignatureMismatch(err.to_string()))?;

    Ok(StatefulGraphModule::new(ModuleParts {
        graph,
        plan,
        attrs,
        lifted_order,
        codegen: get_codegen(in_spec, out_spec),
        input_check,
        range_constraints: range_constraints.to_vec(),
        equality_constraints: equality_constraints.to_vec(),
    }))
}

/// Unlift an exported program, keeping its shape constraints for checking
/// the inputs of each call.
pub fn unlift_exported_program_lifted_states(
    program: &ExportedProgram,
) -> Result<StatefulGraphModule, ExportError> {
    let sig = program.graph_signature();
    let call_spec = program.call_spec();
    unlift_with_constraints(
        program.graph(),
        &sig.input_specs,
        &sig.output_specs,
        &call_spec.in_spec,
        &call_spec.out_spec,
        program.state_dict(),
        program.constants(),
        program.range_constraints(),
        program.equality_constraints(),
    )
}
