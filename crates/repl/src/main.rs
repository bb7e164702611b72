//! koji - command-line runner and REPL for the koji scripting language.
//!
//! Usage:
//!   koji                      # start an interactive REPL
//!   koji script.koji          # run a script file
//!   koji --eval 'debug(1+2)'  # evaluate a source string
//!
//! In the REPL, globals persist across lines (`globals.x = 1` on one line,
//! `debug(globals.x)` on the next); locals are per line. A runtime fault
//! invalidates the state, which is then reset automatically.

use std::path::{Path, PathBuf};
use std::process;

use clap::Parser;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tracing_subscriber::EnvFilter;

use koji_runtime::{stdlib, Koji, KojiError};

#[derive(Parser)]
#[command(name = "koji")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Koji scripting language runner", long_about = None)]
struct Cli {
    /// Script file to run; starts a REPL when omitted
    script: Option<PathBuf>,

    /// Evaluate a source string and exit
    #[arg(short, long, value_name = "SOURCE", conflicts_with = "script")]
    eval: Option<String>,

    /// Print the compiled bytecode before running
    #[arg(long)]
    dump_bytecode: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let exit_code = if let Some(source) = cli.eval.as_deref() {
        run_eval(source, cli.dump_bytecode)
    } else if let Some(script) = cli.script.as_deref() {
        run_script(script, cli.dump_bytecode)
    } else {
        run_repl(cli.dump_bytecode)
    };
    process::exit(exit_code);
}

fn new_state() -> Koji {
    let mut koji = Koji::new();
    if let Err(err) = stdlib::install(&mut koji) {
        eprintln!("Error installing standard functions: {err}");
        process::exit(1);
    }
    koji
}

fn load_and_run(
    koji: &mut Koji,
    load: impl FnOnce(&mut Koji) -> Result<(), KojiError>,
    dump_bytecode: bool,
) -> Result<(), KojiError> {
    load(koji)?;
    if dump_bytecode {
        if let Some(listing) = koji.disassemble_loaded() {
            eprint!("{listing}");
        }
    }
    koji.run()
}

fn run_script(path: &Path, dump_bytecode: bool) -> i32 {
    let mut koji = new_state();
    match load_and_run(&mut koji, |k| k.load_file(path), dump_bytecode) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("Error: {err}");
            1
        }
    }
}

fn run_eval(source: &str, dump_bytecode: bool) -> i32 {
    let mut koji = new_state();
    match load_and_run(&mut koji, |k| k.load_str(source), dump_bytecode) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("Error: {err}");
            1
        }
    }
}

fn history_path() -> Option<PathBuf> {
    home::home_dir().map(|dir| dir.join(".koji_history"))
}

fn run_repl(dump_bytecode: bool) -> i32 {
    println!("koji {} - :quit to exit", env!("CARGO_PKG_VERSION"));

    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(err) => {
            eprintln!("Error: cannot start line editor: {err}");
            return 1;
        }
    };
    let history = history_path();
    if let Some(path) = &history {
        let _ = editor.load_history(path);
    }

    let mut koji = new_state();

    loop {
        match editor.readline("koji> ") {
            Ok(line) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if trimmed == ":quit" || trimmed == ":q" {
                    break;
                }
                let _ = editor.add_history_entry(trimmed);

                match load_and_run(&mut koji, |k| k.load_str(&line), dump_bytecode) {
                    Ok(()) => {}
                    Err(KojiError::Runtime(message)) => {
                        eprintln!("runtime error: {message}");
                        // The state is invalid after a fault; start over.
                        koji = new_state();
                    }
                    Err(KojiError::Compile(message)) => {
                        eprintln!("compile error: {message}");
                        // Drop the diagnostic string left on the stack.
                        koji.pop(1);
                    }
                    Err(err) => eprintln!("error: {err}"),
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("Error: {err}");
                return 1;
            }
        }
    }

    if let Some(path) = &history {
        let _ = editor.save_history(path);
    }
    0
}
