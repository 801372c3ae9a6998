//! Cot compiler CLI.
//!
//! Consumes checked modules serialized by the frontend (`.cot.json`:
//! the typed AST plus its type registry) and emits Wasm modules. The
//! native path hands the emitted module to the external wasm-to-native
//! translator.

use clap::{CommandFactory, Parser as ClapParser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};
use cotc::{ast::ModuleFile, CompileError, CompileOptions, Target};
use std::io;
use std::path::{Path, PathBuf};
use std::process;

#[derive(ClapParser)]
#[command(name = "cotc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Cot compiler - lower checked modules to WebAssembly", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TargetArg {
    Wasm32,
    Native,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a checked module to a .wasm file
    Build {
        /// Input .cot.json module (typed AST + registry)
        input: PathBuf,

        /// Output path (defaults to the input stem with .wasm)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Code generation target
        #[arg(long, value_enum, default_value = "wasm32")]
        target: TargetArg,
    },

    /// Compile a module in test mode; the emitted module's exit code is
    /// the failed-test count
    Test {
        /// Input .cot.json module
        input: PathBuf,

        /// Output path (defaults to the input stem with .test.wasm)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Only run tests whose name contains this pattern
        #[arg(short, long)]
        filter: Option<String>,

        /// Stop after the first failing test
        #[arg(long)]
        fail_fast: bool,

        /// Code generation target
        #[arg(long, value_enum, default_value = "wasm32")]
        target: TargetArg,
    },

    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Build {
            input,
            output,
            target,
        } => {
            let output = output.unwrap_or_else(|| default_output(&input, "wasm"));
            let opts = CompileOptions {
                target: to_target(target),
                ..CompileOptions::default()
            };
            run_compile(&input, &output, &opts);
        }
        Commands::Test {
            input,
            output,
            filter,
            fail_fast,
            target,
        } => {
            let output = output.unwrap_or_else(|| default_output(&input, "test.wasm"));
            let opts = CompileOptions {
                target: to_target(target),
                test_mode: true,
                fail_fast,
                filter,
                ..CompileOptions::default()
            };
            run_compile(&input, &output, &opts);
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "cotc", &mut io::stdout());
        }
    }
}

fn to_target(t: TargetArg) -> Target {
    match t {
        TargetArg::Wasm32 => Target::Wasm32,
        TargetArg::Native => Target::Native,
    }
}

fn default_output(input: &Path, ext: &str) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "out".to_string());
    // Strip a trailing `.cot` left by the double extension.
    let stem = stem.strip_suffix(".cot").unwrap_or(&stem).to_string();
    PathBuf::from(format!("{}.{}", stem, ext))
}

fn run_compile(input: &Path, output: &Path, opts: &CompileOptions) {
    let text = match std::fs::read_to_string(input) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("error: failed to read {}: {}", input.display(), e);
            process::exit(1);
        }
    };
    let mut file: ModuleFile = match serde_json::from_str(&text) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("error: {} is not a valid module file: {}", input.display(), e);
            process::exit(1);
        }
    };
    file.types.rehydrate();

    match cotc::compile_module(&file.module, &mut file.types, opts) {
        Ok(bytes) => {
            if let Err(e) = std::fs::write(output, &bytes) {
                eprintln!("error: failed to write {}: {}", output.display(), e);
                process::exit(1);
            }
            println!("Compiled {} -> {}", input.display(), output.display());
            if opts.target == Target::Native {
                println!(
                    "note: native object emission is performed by the external \
                     wasm-to-native translator from {}",
                    output.display()
                );
            }
        }
        Err(e) => {
            // Diagnostics are user errors (exit 1); anything else is an
            // internal invariant failure (exit 2).
            match e {
                CompileError::Diagnostics(_) | CompileError::Lower(_) => {
                    eprintln!("error: {}", e);
                    process::exit(1);
                }
                other => {
                    eprintln!("internal error: {}", other);
                    process::exit(2);
                }
            }
        }
    }
}
