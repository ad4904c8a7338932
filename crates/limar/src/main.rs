use std::process::ExitCode;

use limar_core::modules::{
    CacheModule, CommandManifestModule, CommandModule, ManifestModule, PhaseModule, ShellModule,
    TrModule, TransactionManifestModule, UrisManifestModule,
};
use limar_core::Orchestrator;
use serde_json::Value;

const APP_NAME: &str = "limar";

fn main() -> ExitCode {
    if let Err(e) = limar_core::logging::init() {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    match run() {
        Ok(output) => {
            print_output(output);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> limar_core::Result<Option<Value>> {
    let mut orchestrator = Orchestrator::new(APP_NAME);

    orchestrator.register(Box::new(CacheModule::new()))?;
    orchestrator.register(Box::new(ManifestModule::new()))?;
    orchestrator.register(Box::new(CommandManifestModule::new()))?;
    orchestrator.register(Box::new(UrisManifestModule::new()))?;
    orchestrator.register(Box::new(TransactionManifestModule::new()))?;
    orchestrator.register(Box::new(PhaseModule::new()))?;
    orchestrator.register(Box::new(ShellModule::new()))?;
    orchestrator.register(Box::new(TrModule::new()))?;
    orchestrator.register(Box::new(CommandModule::new()))?;

    let cli_args: Vec<String> = std::env::args().skip(1).collect();
    orchestrator.run(&cli_args, None)
}

/// Print the last module invocation's output
///
/// Rendered strings go out verbatim; anything else still structured is
/// printed as JSON.
fn print_output(output: Option<Value>) {
    match output {
        None | Some(Value::Null) => {}
        Some(Value::String(text)) => {
            if text.is_empty() {
                return;
            }
            print!("{text}");
            if !text.ends_with('\n') {
                println!();
            }
        }
        Some(other) => match serde_json::to_string_pretty(&other) {
            Ok(rendered) => println!("{rendered}"),
            Err(_) => println!("{other}"),
        },
    }
}
