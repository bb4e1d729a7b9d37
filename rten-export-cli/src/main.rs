use std::collections::VecDeque;
use std::error::Error;
use std::fs;

use rten_export::archive::{load_with_extra_files, read_version, Container};
use rten_export::program::ExportedProgram;
use rten_export::signature::InputKind;
use rten_export::{OpaqueHandle, Value as InputValue};
use rten_tensor::prelude::*;
use rten_tensor::Tensor;

mod program_info;
mod shape_arg;

use program_info::{
    format_param_count, print_constraints, print_inputs, print_outputs, print_state_summary,
};
use shape_arg::InputShape;

struct Args {
    /// Archive file to load.
    archive: String,

    /// Input shapes to check against the program's constraints.
    shapes: Vec<InputShape>,

    /// Print the archive's extra files.
    extra: bool,

    /// Enable debug logging.
    verbose: bool,
}

fn parse_args() -> Result<Args, lexopt::Error> {
    use lexopt::prelude::*;

    let mut values = VecDeque::new();
    let mut shapes = Vec::new();
    let mut extra = false;
    let mut verbose = false;

    let mut parser = lexopt::Parser::from_env();
    while let Some(arg) = parser.next()? {
        match arg {
            Value(val) => values.push_back(val.string()?),
            Short('s') | Long("shape") => {
                let spec = parser.value()?.string()?;
                let shape = InputShape::parse(&spec)
                    .map_err(|err| lexopt::Error::Custom(err.into()))?;
                shapes.push(shape);
            }
            Short('x') | Long("extra") => extra = true,
            Short('v') | Long("verbose") => verbose = true,
            Short('h') | Long("help") => {
                println!(
                    "Inspect exported program archives.

Usage: {bin_name} [OPTIONS] <archive>

  -s, --shape <name=AxB>  Check that inputs with the given shapes satisfy the
                          program's constraints. Repeat for each input.
  -x, --extra             Print extra files stored in the archive
  -v, --verbose           Enable verbose logging
  -h, --help              Print help
",
                    bin_name = parser.bin_name().unwrap_or("rten-export")
                );
                std::process::exit(0);
            }
            _ => return Err(arg.unexpected()),
        }
    }

    let archive = values.pop_front().ok_or("missing `<archive>` arg")?;
    InputShape::sort_dedup(&mut shapes);

    Ok(Args {
        archive,
        shapes,
        extra,
        verbose,
    })
}

/// Create example user inputs with the shapes given on the command line.
///
/// Inputs which are not tensors are replaced by a placeholder object.
fn make_inputs(
    program: &ExportedProgram,
    shapes: &[InputShape],
) -> Result<Vec<InputValue>, String> {
    let user_inputs = program
        .graph()
        .placeholders()
        .zip(&program.graph_signature().input_specs)
        .filter(|(_, spec)| spec.kind == InputKind::UserInput);

    let mut values = Vec::new();
    for (node, _) in user_inputs {
        if node.meta().is_none() {
            values.push(InputValue::Opaque(OpaqueHandle::new("rten_export_cli::Placeholder", 0)));
            continue;
        }
        let shape = shapes
            .iter()
            .find(|s| s.input_name == node.name())
            .ok_or_else(|| format!("no shape given for input \"{}\"", node.name()))?;
        values.push(InputValue::Tensor(Tensor::zeros(shape.shape.as_slice())));
    }

    if let Some(unknown) = shapes
        .iter()
        .find(|s| !program.graph_signature().user_inputs().contains(&s.input_name.as_str()))
    {
        return Err(format!("program has no input named \"{}\"", unknown.input_name));
    }

    Ok(values)
}

/// Tool for inspecting archives created by `rten_export::save`.
///
/// ```
/// cargo run -p rten-export-cli -- program.rtxa -s x=1024x4
/// ```
fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args()?;

    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let bytes = fs::read(&args.archive)?;
    let version = read_version(&Container::from_buf(&bytes)?)?;
    let (program, extra_files) = load_with_extra_files(&bytes)?;

    let signature = program.graph_signature();
    let num_params: usize = program.state_dict().values().map(|t| t.len()).sum();
    println!(
        "Archive version {}: {} inputs, {} outputs, {} params",
        version,
        signature.user_inputs().len(),
        signature.user_outputs().len(),
        format_param_count(num_params),
    );

    println!("Inputs:");
    print_inputs(&program);
    println!("Outputs:");
    print_outputs(&program);
    println!("State:");
    print_state_summary(&program);
    println!("Constraints:");
    print_constraints(&program);

    if args.extra {
        for (name, content) in &extra_files {
            println!("Extra file \"{}\":", name);
            println!("{}", content);
        }
    }

    if !args.shapes.is_empty() {
        let inputs = make_inputs(&program, &args.shapes)?;
        program.check_inputs(&inputs)?;
        println!("Input shapes satisfy the program's constraints");
    }

    Ok(())
}
