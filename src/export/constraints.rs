//! Solving of shape constraints after tracing.

use rten_symbolic::SymExpr;

use crate::error::ExportError;
use crate::fake::FakeTensorMode;
use crate::graph::Graph;
use crate::program::{InputDim, RangeConstraint};
use crate::shape_env::{ConstraintViolation, DimConstraints, ViolationKind};
use crate::signature::{GraphSignature, InputKind};
use crate::source::Source;

/// Range and equality constraints on the user inputs of a traced graph.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InputConstraints {
    pub range_constraints: Vec<RangeConstraint>,
    pub equality_constraints: Vec<(InputDim, InputDim)>,
}

/// Check the guards recorded while tracing against the declared dynamic
/// shapes, freeze the shape environment and collect the constraints on the
/// graph's inputs.
///
/// All problems found are reported together in a single
/// [`ConstraintViolation`]. A dimension declared dynamic which can only take
/// one value is always an error.
pub fn make_constraints(
    fake_mode: &mut FakeTensorMode,
    source_equalities: &[(Source, Source)],
    original_signature: &[String],
    graph: &Graph,
    signature: &GraphSignature,
    disable_constraint_solver: bool,
) -> Result<InputConstraints, ExportError> {
    let _span = tracing::info_span!("make_constraints").entered();
    let env = &mut fake_mode.shape_env;

    tracing::debug!(
        tracked_fakes = env.tracked_fakes().len(),
        equalities = source_equalities.len(),
        "producing guards"
    );

    if disable_constraint_solver {
        env.freeze();
    } else {
        let report = env.produce_guards(source_equalities, original_signature)?;
        env.freeze();

        let mut dim_constraints = DimConstraints::new(env, &report.guards, original_signature);
        dim_constraints.solve();
        dim_constraints.remove_redundant_dynamic_results();
        let forced = dim_constraints.forced_specializations();

        let has_violation = !report.violations.is_empty();
        let summary = dim_constraints.prettify_results(has_violation);
        for guard in dim_constraints.residual_guards() {
            tracing::debug!(guard = %guard, "guard not expressible as a dimension range");
        }

        if has_violation {
            return Err(ConstraintViolation::from_violations(&report.violations)
                .with_summary(&summary)
                .into());
        }
        if !forced.is_empty() {
            return Err(ConstraintViolation {
                kind: ViolationKind::ForcedSpecialization,
                message: summary,
            }
            .into());
        }
    }

    let env = &fake_mode.shape_env;
    let mut range_constraints: Vec<RangeConstraint> = Vec::new();
    let mut buckets: Vec<(SymExpr, Vec<InputDim>)> = Vec::new();

    let user_placeholders = graph
        .placeholders()
        .zip(&signature.input_specs)
        .filter(|(_, spec)| spec.kind == InputKind::UserInput)
        .map(|(node, _)| node);

    for node in user_placeholders {
        let Some(meta) = node.meta() else {
            continue;
        };
        for (dim, size) in meta.shape().iter().enumerate() {
            let expr = env.resolve(size);
            if expr.as_value().is_some() {
                continue;
            }
            if !range_constraints.iter().any(|rc| rc.expr == expr) {
                range_constraints.push(RangeConstraint {
                    expr: expr.clone(),
                    range: env.bound_expr(&expr),
                });
            }
            let input_dim = InputDim {
                input_name: node.name().to_string(),
                dim,
            };
            match buckets.iter_mut().find(|(e, _)| *e == expr) {
                Some((_, dims)) => dims.push(input_dim),
                None => buckets.push((expr, vec![input_dim])),
            }
        }
    }

    let mut equality_constraints = Vec::new();
    for (_, dims) in buckets {
        let Some((first, others)) = dims.split_first() else {
            continue;
        };
        for other in others {
            equality_constraints.push((first.clone(), other.clone()));
        }
    }

    tracing::debug!(
        ranges = range_constraints.len(),
        equalities = equality_constraints.len(),
        "collected input constraints"
    );

    Ok(InputConstraints {
        range_constraints,
        equality_constraints,
    })
}
