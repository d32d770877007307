// The safepoint-placement driver.

use clap::Parser;
use derive_more::Display;
use safepoints::ir::{self, dump_cfg};
use safepoints::safepoints::{place_safepoints, Config};
use std::str::FromStr;

// Input/output file types
#[derive(Display, Clone, Copy, PartialEq, Eq)]
enum FileType {
    Ir,
    Dot,
    Json,
}

// File names with associated file types.  This is used for determining input
// and output file types from file names.
#[derive(Clone)]
struct File {
    typ: FileType,
    name: String,
}

impl FromStr for File {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use FileType::*;

        let name = String::from(s);
        let typ = s
            .rsplit_once('.')
            .and_then(|(_, extension)| match extension {
                "sir" => Some(Ir),
                "dot" => Some(Dot),
                "json" => Some(Json),
                _ => None,
            })
            .ok_or_else(|| {
                format!("Expected a file name with one of the following extensions: sir, dot, json. Got {s}")
            })?;

        Ok(File { typ, name })
    }
}

// Command-line arguments
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// JSON file holding a full pass configuration; flags below override it.
    #[arg(long)]
    config: Option<File>,
    #[arg(long)]
    verify_level: Option<u8>,
    #[arg(long)]
    all_backedges: bool,
    #[arg(long)]
    base_rewrite_only: bool,
    #[arg(long)]
    all_functions: bool,
    #[arg(long)]
    abstract_state: bool,
    #[arg(long)]
    no_entry: bool,
    #[arg(long)]
    no_backedge: bool,
    #[arg(long)]
    no_call: bool,
    /// Answer liveness queries on demand instead of by whole-function
    /// dataflow.
    #[arg(long)]
    on_demand_liveness: bool,
    input_file: File,
    output_file: File,
}

fn read(input_file: &str) -> String {
    String::from_utf8(
        std::fs::read(input_file)
            .unwrap_or_else(|_| panic!("Could not read the input file {input_file}")),
    )
    .expect("The input file does not contain valid utf-8 text")
}

pub fn main() {
    pretty_env_logger::init();
    let args = Args::parse();

    let mut config: Config = match &args.config {
        Some(file) if file.typ == FileType::Json => serde_json::from_str(&read(&file.name))
            .unwrap_or_else(|e| panic!("Config file is not valid: {e}")),
        Some(_) => panic!("The configuration must be a JSON file"),
        None => Config::default(),
    };
    if let Some(level) = args.verify_level {
        config.verify_level = level;
    }
    config.all_backedges |= args.all_backedges;
    config.base_rewrite_only |= args.base_rewrite_only;
    config.all_functions |= args.all_functions;
    config.use_abstract_state |= args.abstract_state;
    config.no_entry |= args.no_entry;
    config.no_backedge |= args.no_backedge;
    config.no_call |= args.no_call;
    config.dataflow_liveness &= !args.on_demand_liveness;

    if args.input_file.typ != FileType::Ir {
        panic!("The input file must be a .sir program");
    }
    let program: ir::Program = read(&args.input_file.name)
        .parse()
        .unwrap_or_else(|e| panic!("Syntax error: {e}"));
    let program = program
        .validate()
        .unwrap_or_else(|e| panic!("Invalid program: {e}"));

    let transformed = place_safepoints(program, &config)
        .unwrap_or_else(|e| panic!("Safepoint placement failed: {e}"));

    let output = match args.output_file.typ {
        FileType::Ir => transformed.0.to_string().into_bytes(),
        FileType::Dot => dump_cfg::dump_cfg_of_whole_program(&transformed.0).into_bytes(),
        FileType::Json => panic!("Cannot write a program as JSON"),
    };

    std::fs::write(&args.output_file.name, output).unwrap_or_else(|_| {
        panic!(
            "Failed to write the transformed program to the output file: {}",
            args.output_file.name
        )
    });
}
