//! Helpers for printing information about the inputs, outputs and state of
//! exported programs.

use std::fmt::{Display, Formatter};
use std::ops::Range;
use std::str::FromStr;

use rten_export::program::ExportedProgram;
use rten_export::signature::InputKind;
use rten_export::Constant;
use rten_symbolic::SymExpr;
use rten_tensor::prelude::*;

/// Format a shape as a `[dim0, dim1, ...]` string, where each dimension is
/// represented by its fixed size or symbolic expression.
pub fn format_shape(shape: &[SymExpr]) -> String {
    let dims = shape
        .iter()
        .map(|dim| dim.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    format!("[{}]", dims)
}

/// Format a list of numbers into comma-separated ranges.
/// e.g. [1, 2, 3, 10, 12, 13, 14] formats as "1-3,10,12-14".
fn format_ranges(numbers: &[i32]) -> String {
    let mut numbers = numbers.to_vec();
    numbers.sort();

    let mut ranges: Vec<Range<i32>> = Vec::new();
    for num in numbers {
        match ranges.last_mut() {
            Some(prev_range) if num == prev_range.end + 1 => prev_range.end += 1,
            _ => ranges.push(num..num),
        }
    }

    ranges
        .iter()
        .map(|r| {
            if r.start == r.end {
                r.start.to_string()
            } else {
                format!("{}-{}", r.start, r.end)
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

pub fn format_param_count(n: usize) -> String {
    if n > 1_000_000 {
        format!("{:.1} M", n as f32 / 1_000_000.)
    } else {
        format!("{:.1} K", n as f32 / 1000.)
    }
}

/// Names for a group of state entries which consist of a prefix, optional
/// number and suffix.
///
/// For example "layers.0.weight" and "layers.1.weight" would be grouped
/// together, but "layers.0.bias" would be a separate group.
#[derive(Debug, PartialEq)]
struct GroupName {
    prefix: String,
    suffix: String,
    numbers: Vec<i32>,
}

impl GroupName {
    /// Parse a name in the form "{prefix}{number}{suffix}" where all parts
    /// are optional.
    fn parse(name: &str) -> Self {
        let unnumbered = || Self {
            prefix: name.to_string(),
            suffix: String::new(),
            numbers: Vec::new(),
        };
        let Some(num_start) = name.find(|ch: char| ch.is_ascii_digit()) else {
            return unnumbered();
        };
        let num_end = name[num_start..]
            .find(|ch: char| !ch.is_ascii_digit())
            .map(|offset| num_start + offset)
            .unwrap_or(name.len());

        match i32::from_str(&name[num_start..num_end]) {
            Ok(number) => Self {
                prefix: name[..num_start].to_string(),
                suffix: name[num_end..].to_string(),
                numbers: [number].into(),
            },
            Err(_) => unnumbered(),
        }
    }

    fn matches(&self, other: &GroupName) -> bool {
        self.prefix == other.prefix && self.suffix == other.suffix
    }

    fn merge(&mut self, other: &GroupName) {
        self.numbers.extend(&other.numbers)
    }
}

impl Display for GroupName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.numbers.as_slice() {
            [] => write!(f, "{}{}", self.prefix, self.suffix),
            [num] => write!(f, "{}{}{}", self.prefix, num, self.suffix),
            numbers => {
                let ranges = format_ranges(numbers);
                // "<prefix>{<range>}<suffix>"
                write!(f, "{}{{{}}}{}", self.prefix, ranges, self.suffix)
            }
        }
    }
}

/// Print the names and abstract shapes of a program's user inputs.
pub fn print_inputs(program: &ExportedProgram) {
    let user_inputs = program
        .graph()
        .placeholders()
        .zip(&program.graph_signature().input_specs)
        .filter(|(_, spec)| spec.kind == InputKind::UserInput);

    for (node, _) in user_inputs {
        let shape = node
            .meta()
            .map(|meta| format_shape(meta.shape()))
            .unwrap_or("(opaque)".to_string());
        println!("  {}: {}", node.name(), shape);
    }
}

pub fn print_outputs(program: &ExportedProgram) {
    let outputs = program
        .graph()
        .outputs()
        .iter()
        .zip(&program.graph_signature().output_specs);

    for (&id, spec) in outputs {
        let shape = program
            .graph()
            .node(id)
            .and_then(|node| node.meta())
            .map(|meta| format_shape(meta.shape()))
            .unwrap_or("(opaque)".to_string());
        match &spec.target {
            Some(target) => println!("  {} ({:?} of {}): {}", spec.name, spec.kind, target, shape),
            None => println!("  {}: {}", spec.name, shape),
        }
    }
}

/// Print a summary of the parameters and buffers of a program, grouping
/// numbered entries with the same shape.
pub fn print_state_summary(program: &ExportedProgram) {
    struct Group {
        name: GroupName,
        shape: Vec<usize>,
    }

    let mut groups: Vec<Group> = Vec::new();

    for (name, tensor) in program.state_dict() {
        let name = GroupName::parse(name);

        if let Some(group) = groups
            .iter_mut()
            .find(|g| g.name.matches(&name) && g.shape == tensor.shape())
        {
            group.name.merge(&name);
        } else {
            groups.push(Group {
                name,
                shape: tensor.shape().to_vec(),
            });
        }
    }

    for Group { name, shape } in groups {
        println!("  {name} {shape:?}");
    }

    for (name, constant) in program.constants() {
        println!("  {name} (constant {})", constant_kind(constant));
    }
}

fn constant_kind(constant: &Constant) -> String {
    match constant {
        Constant::Tensor(t) => format!("tensor {:?}", t.shape()),
        Constant::Object(obj) => obj.type_name.clone(),
    }
}

/// Print the range and equality constraints on a program's inputs.
pub fn print_constraints(program: &ExportedProgram) {
    for rc in program.range_constraints() {
        println!("  {}: {}", rc.expr, rc.range);
    }
    for (a, b) in program.equality_constraints() {
        println!("  {} == {}", a, b);
    }
}

#[cfg(test)]
mod tests {
    use rten_symbolic::SymExpr;

    use super::{format_param_count, format_shape, GroupName};

    #[test]
    fn test_group_name_parse() {
        // Single number
        assert_eq!(
            GroupName::parse("layers.12.weight"),
            GroupName {
                prefix: "layers.".to_string(),
                suffix: ".weight".to_string(),
                numbers: vec![12],
            }
        );

        // No numbers
        assert_eq!(
            GroupName::parse("fc.bias"),
            GroupName {
                prefix: "fc.bias".to_string(),
                suffix: String::new(),
                numbers: Vec::new(),
            }
        );
    }

    #[test]
    fn test_group_name_to_string() {
        let g = GroupName {
            prefix: "layers.".to_string(),
            suffix: ".weight".to_string(),
            numbers: [14, 1, 2, 3, 10, 12, 13].into(),
        };
        assert_eq!(g.to_string(), "layers.{1-3,10,12-14}.weight");
    }

    #[test]
    fn test_format() {
        assert_eq!(
            format_shape(&[SymExpr::pos_var("s0"), SymExpr::Value(4)]),
            "[s0, 4]"
        );
        assert_eq!(format_param_count(2_500_000), "2.5 M");
        assert_eq!(format_param_count(1500), "1.5 K");
    }
}
