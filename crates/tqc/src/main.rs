use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use tqc::ast::Program;
use tqc::compile::{compile, CompileOptions};
use tqc::placement::{PlacementAnalyzer, NUM_SWITCHES};

#[derive(Parser)]
#[command(name = "tqc")]
#[command(about = "Telemetry query compiler middle-end.", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Compile a program into an assembled pipeline.
    Compile {
        #[arg(long)]
        program: PathBuf,
        #[arg(long, default_value_t = NUM_SWITCHES)]
        switches: u32,
        #[arg(long)]
        report_json: bool,
    },
    /// Analyze and report query placement only.
    Placement {
        #[arg(long)]
        program: PathBuf,
        #[arg(long, default_value_t = NUM_SWITCHES)]
        switches: u32,
        /// Emit Graphviz dot instead of JSON.
        #[arg(long)]
        dot: bool,
    },
}

fn main() -> std::process::ExitCode {
    match try_main() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            std::process::ExitCode::from(2)
        }
    }
}

fn try_main() -> Result<std::process::ExitCode> {
    match Cli::parse().cmd {
        Cmd::Compile {
            program,
            switches,
            report_json,
        } => {
            let prog = load_program(&program)?;
            let out = compile(
                &prog,
                &CompileOptions {
                    switch_count: switches,
                },
            )?;
            if report_json {
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                for stage in &out.stages {
                    println!(
                        "{} {}: reads [{}] sets [{}]",
                        stage.op,
                        stage.name,
                        join(&stage.reads),
                        join(&stage.sets),
                    );
                }
                for (fun, hist) in &out.history.funs {
                    println!(
                        "history {fun}: {} ({} iterations)",
                        hist.bounds
                            .iter()
                            .map(|(id, b)| format!("{id}={b}"))
                            .collect::<Vec<_>>()
                            .join(", "),
                        hist.iterations,
                    );
                }
            }
        }
        Cmd::Placement {
            program,
            switches,
            dot,
        } => {
            let prog = load_program(&program)?;
            let located = PlacementAnalyzer::with_switches(&prog, switches).analyze()?;
            if dot {
                print!("{}", located.dot());
            } else {
                println!("{}", serde_json::to_string_pretty(&located)?);
            }
        }
    }
    Ok(std::process::ExitCode::SUCCESS)
}

fn join(set: &std::collections::BTreeSet<String>) -> String {
    set.iter().cloned().collect::<Vec<_>>().join(", ")
}

fn load_program(path: &Path) -> Result<Program> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("read program: {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("parse program: {}", path.display()))
}
