//! Calling convention of an exported graph.

use serde::{Deserialize, Serialize};

use crate::tree::TreeSpec;

/// Role of a graph input.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InputKind {
    UserInput,
    Parameter,
    Buffer,
    ConstantTensor,
    CustomObject,
}

impl InputKind {
    /// Return true if inputs of this kind hold program state, which is
    /// passed as an input in lifted graphs and held as an attribute in
    /// unlifted graphs.
    pub fn is_lifted(self) -> bool {
        !matches!(self, InputKind::UserInput)
    }

    /// Prefix of the placeholder name for inputs of this kind.
    pub(crate) fn name_prefix(self) -> &'static str {
        match self {
            InputKind::UserInput => "",
            InputKind::Parameter => "p_",
            InputKind::Buffer => "b_",
            InputKind::ConstantTensor => "c_",
            InputKind::CustomObject => "obj_",
        }
    }
}

/// Description of one graph input.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSpec {
    pub kind: InputKind,

    /// Name of the placeholder node.
    pub name: String,

    /// Fully qualified name of the state, for lifted inputs.
    pub target: Option<String>,
}

/// Role of a graph output.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputKind {
    UserOutput,
    /// New value of a buffer modified in place by the program.
    BufferMutation,
    /// New value of a user input modified in place by the program.
    UserInputMutation,
}

impl OutputKind {
    pub fn is_mutation(self) -> bool {
        !matches!(self, OutputKind::UserOutput)
    }
}

/// Description of one graph output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub kind: OutputKind,

    /// Name of the node producing the value.
    pub name: String,

    /// Buffer name or user input placeholder name, for mutations.
    pub target: Option<String>,
}

/// Ordered descriptions of a graph's inputs and outputs.
///
/// `input_specs[i]` describes the i-th placeholder and `output_specs[i]` the
/// i-th output value.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphSignature {
    pub input_specs: Vec<InputSpec>,
    pub output_specs: Vec<OutputSpec>,
}

impl GraphSignature {
    fn input_names(&self, kind: InputKind) -> Vec<&str> {
        self.input_specs
            .iter()
            .filter(|s| s.kind == kind)
            .filter_map(|s| match kind {
                InputKind::UserInput => Some(s.name.as_str()),
                _ => s.target.as_deref(),
            })
            .collect()
    }

    /// Placeholder names of user inputs.
    pub fn user_inputs(&self) -> Vec<&str> {
        self.input_names(InputKind::UserInput)
    }

    pub fn parameters(&self) -> Vec<&str> {
        self.input_names(InputKind::Parameter)
    }

    pub fn buffers(&self) -> Vec<&str> {
        self.input_names(InputKind::Buffer)
    }

    /// Specs of inputs which hold program state.
    pub fn lifted_inputs(&self) -> impl Iterator<Item = &InputSpec> {
        self.input_specs.iter().filter(|s| s.kind.is_lifted())
    }

    /// Node names of user-visible outputs.
    pub fn user_outputs(&self) -> Vec<&str> {
        self.output_specs
            .iter()
            .filter(|s| s.kind == OutputKind::UserOutput)
            .map(|s| s.name.as_str())
            .collect()
    }

    /// Specs of outputs which write back to buffers or user inputs.
    pub fn mutated_outputs(&self) -> impl Iterator<Item = &OutputSpec> {
        self.output_specs.iter().filter(|s| s.kind.is_mutation())
    }
}

/// Structure of the `(args, kwargs)` a program is called with and of the
/// value it returns.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSpec {
    pub in_spec: TreeSpec,
    pub out_spec: TreeSpec,
}
