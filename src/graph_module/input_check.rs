use rten_symbolic::{SymExpr, ValueRange};
use rustc_hash::FxHashMap;

use super::CallError;
use crate::fake::FakeTensor;
use crate::program::RangeConstraint;
use crate::value::Value;

/// Checks the concrete inputs of a call against the shapes recorded at
/// export time.
#[derive(Clone, Debug)]
pub(crate) struct InputCheck {
    /// Name and abstract value of each user input. `None` for opaque inputs.
    inputs: Vec<(String, Option<FakeTensor>)>,

    /// Allowed range of each symbol, keyed by symbol name.
    ranges: FxHashMap<String, ValueRange>,
}

/// Where a symbol was first bound while checking a call.
struct Binding {
    value: usize,
    input: usize,
    dim: usize,
}

impl InputCheck {
    pub fn new(
        inputs: Vec<(String, Option<FakeTensor>)>,
        range_constraints: &[RangeConstraint],
    ) -> InputCheck {
        let ranges = range_constraints
            .iter()
            .filter_map(|rc| {
                rc.expr
                    .as_symbol()
                    .map(|sym| (sym.name.clone(), rc.range))
            })
            .collect();
        InputCheck { inputs, ranges }
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    fn size_name(&self, input: usize, dim: usize) -> String {
        format!("{}.size()[{}]", self.inputs[input].0, dim)
    }

    /// Check `values`, the flattened user inputs of a call.
    pub fn check(&self, values: &[&Value]) -> Result<(), CallError> {
        let mut bindings: FxHashMap<&str, Binding> = FxHashMap::default();
        let mut derived = Vec::new();

        for (input, ((name, meta), value)) in self.inputs.iter().zip(values).enumerate() {
            let Some(meta) = meta else {
                continue;
            };
            let Some(shape) = value.shape() else {
                return Err(CallError::ExpectedTensor {
                    input: name.clone(),
                    kind: value.kind_name(),
                });
            };
            if shape.len() != meta.ndim() {
                return Err(CallError::RankMismatch {
                    input: name.clone(),
                    expected: meta.ndim(),
                    actual: shape.len(),
                });
            }

            for (dim, (expr, &actual)) in meta.shape().iter().zip(shape).enumerate() {
                match expr {
                    SymExpr::Value(expected) => {
                        if *expected != actual as i64 {
                            return Err(CallError::StaticDimMismatch {
                                input: name.clone(),
                                dim,
                                expected: *expected as usize,
                                actual,
                            });
                        }
                    }
                    SymExpr::Var(sym) => {
                        if let Some(prev) = bindings.get(sym.name.as_str()) {
                            if prev.value != actual {
                                return Err(CallError::SymbolMismatch {
                                    input: name.clone(),
                                    dim,
                                    actual,
                                    other: self.size_name(prev.input, prev.dim),
                                    expected: prev.value,
                                });
                            }
                            continue;
                        }
                        if let Some(range) = self.ranges.get(&sym.name) {
                            self.check_range(input, dim, actual, range)?;
                        }
                        bindings.insert(
                            &sym.name,
                            Binding {
                                value: actual,
                                input,
                                dim,
                            },
                        );
                    }
                    _ => derived.push((input, dim, expr, actual)),
                }
            }
        }

        // Sizes computed from other symbols can only be checked once all
        // symbols are bound.
        for (input, dim, expr, actual) in derived {
            let expected = expr.eval(&|name: &str| {
                bindings.get(name).map(|b| b.value as i64)
            });
            if let Ok(expected) = expected {
                if expected != actual as i64 {
                    return Err(CallError::StaticDimMismatch {
                        input: self.inputs[input].0.clone(),
                        dim,
                        expected: expected.max(0) as usize,
                        actual,
                    });
                }
            }
        }

        Ok(())
    }

    fn check_range(
        &self,
        input: usize,
        dim: usize,
        actual: usize,
        range: &ValueRange,
    ) -> Result<(), CallError> {
        let actual_i64 = actual as i64;
        let size = self.size_name(input, dim);

        // A lower bound of 2 comes from specializing sizes 0 and 1 while
        // tracing, so smaller sizes are still accepted at call time.
        let bound = if range.lower > 2 && actual_i64 < range.lower {
            format!("{} >= {}", size, range.lower)
        } else if actual_i64 > range.upper {
            format!("{} <= {}", size, range.upper)
        } else {
            return Ok(());
        };
        Err(CallError::RangeViolation {
            input: self.inputs[input].0.clone(),
            dim,
            actual,
            bound,
        })
    }
}

#[cfg(test)]
mod tests {
    use rten_symbolic::{SymExpr, ValueRange};
    use rten_tensor::Tensor;

    use super::InputCheck;
    use crate::fake::FakeTensor;
    use crate::graph_module::CallError;
    use crate::program::RangeConstraint;
    use crate::value::{OpaqueHandle, Value};

    fn zeros(shape: &[usize]) -> Value {
        Value::Tensor(Tensor::zeros(shape))
    }

    fn make_check() -> InputCheck {
        let s0 = SymExpr::pos_var("s0");
        InputCheck::new(
            vec![
                (
                    "a".into(),
                    Some(FakeTensor::new(vec![s0.clone(), SymExpr::Value(4)])),
                ),
                ("b".into(), Some(FakeTensor::new(vec![s0.clone()]))),
                ("obj".into(), None),
            ],
            &[RangeConstraint {
                expr: s0,
                range: ValueRange::new(2, 1024),
            }],
        )
    }

    #[test]
    fn test_check_ok() {
        let check = make_check();
        assert_eq!(check.num_inputs(), 3);
        let obj = Value::Opaque(OpaqueHandle::new("Tokenizer", 1));
        check
            .check(&[&zeros(&[1024, 4]), &zeros(&[1024]), &obj])
            .unwrap();
    }

    #[test]
    fn test_check_lower_bounds() {
        let s0 = SymExpr::pos_var("s0");
        let s1 = SymExpr::pos_var("s1");
        let check = InputCheck::new(
            vec![("x".into(), Some(FakeTensor::new(vec![s0.clone(), s1.clone()])))],
            &[
                RangeConstraint {
                    expr: s0,
                    range: ValueRange::new(2, 1024),
                },
                RangeConstraint {
                    expr: s1,
                    range: ValueRange::new(4, 8),
                },
            ],
        );

        // Sizes below a lower bound of 2 are allowed.
        check.check(&[&zeros(&[1, 4])]).unwrap();
        check.check(&[&zeros(&[0, 4])]).unwrap();

        let err = check.check(&[&zeros(&[1025, 4])]).unwrap_err();
        assert_eq!(
            err,
            CallError::RangeViolation {
                input: "x".into(),
                dim: 0,
                actual: 1025,
                bound: "x.size()[0] <= 1024".into(),
            }
        );

        // Lower bounds above 2 are declared by the user and enforced.
        let err = check.check(&[&zeros(&[1, 3])]).unwrap_err();
        assert_eq!(
            err,
            CallError::RangeViolation {
                input: "x".into(),
                dim: 1,
                actual: 3,
                bound: "x.size()[1] >= 4".into(),
            }
        );
    }

    #[test]
    fn test_check_errors() {
        let check = make_check();
        let obj = Value::Opaque(OpaqueHandle::new("Tokenizer", 1));

        let err = check
            .check(&[&zeros(&[2000, 4]), &zeros(&[2000]), &obj])
            .unwrap_err();
        assert_eq!(
            err,
            CallError::RangeViolation {
                input: "a".into(),
                dim: 0,
                actual: 2000,
                bound: "a.size()[0] <= 1024".into(),
            }
        );

        let err = check
            .check(&[&zeros(&[10, 5]), &zeros(&[10]), &obj])
            .unwrap_err();
        assert!(matches!(
            err,
            CallError::StaticDimMismatch {
                dim: 1,
                expected: 4,
                actual: 5,
                ..
            }
        ));

        let err = check
            .check(&[&zeros(&[5, 4]), &zeros(&[7]), &obj])
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "b.size()[0] = 7 must equal a.size()[0] = 5"
        );

        let err = check
            .check(&[&zeros(&[5]), &zeros(&[5]), &obj])
            .unwrap_err();
        assert!(matches!(
            err,
            CallError::RankMismatch {
                expected: 2,
                actual: 1,
                ..
            }
        ));

        let err = check
            .check(&[&Value::Int(3), &zeros(&[5]), &obj])
            .unwrap_err();
        assert!(matches!(err, CallError::ExpectedTensor { kind: "int", .. }));
    }
}
