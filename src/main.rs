//! hostwarden entry point
//!
//! Stable CLI surface of the core:
//!   run --mode once|continuous --autonomy LEVEL [--config PATH]
//!   queue
//!   approve <index>
//!   reject <index>

use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;

use tracing::error;
use tracing_subscriber::EnvFilter;

use hostwarden::config::Config;
use hostwarden::executor::{AutonomyLevel, Executor};
use hostwarden::orchestrator::Orchestrator;

struct RunArgs {
    mode: String,
    autonomy: Option<AutonomyLevel>,
    config_path: PathBuf,
}

fn usage() -> &'static str {
    "usage: hostwarden <command>\n\n\
     commands:\n\
     \x20 run --mode once|continuous [--autonomy observe|suggest|auto-safe|auto-full] [--config PATH]\n\
     \x20 queue            list proposals awaiting approval\n\
     \x20 approve <index>  approve and execute a queued proposal\n\
     \x20 reject <index>   reject a queued proposal\n"
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        eprintln!("{}", usage());
        return ExitCode::from(2);
    };

    match command.as_str() {
        "run" => match parse_run_args(&args[1..]) {
            Ok(run_args) => run(run_args).await,
            Err(e) => {
                eprintln!("{}\n\n{}", e, usage());
                ExitCode::from(2)
            }
        },
        "queue" => show_queue(&args[1..]),
        "approve" => approve(&args[1..]).await,
        "reject" => reject(&args[1..]),
        other => {
            eprintln!("unknown command: {}\n\n{}", other, usage());
            ExitCode::from(2)
        }
    }
}

fn parse_run_args(args: &[String]) -> anyhow::Result<RunArgs> {
    let mut mode = "continuous".to_string();
    let mut autonomy = None;
    let mut config_path = Config::default_path();

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--mode" => {
                let value = iter.next().ok_or_else(|| anyhow::anyhow!("--mode needs a value"))?;
                if value != "once" && value != "continuous" {
                    anyhow::bail!("--mode must be 'once' or 'continuous'");
                }
                mode = value.clone();
            }
            "--autonomy" => {
                let value = iter
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--autonomy needs a value"))?;
                autonomy = Some(AutonomyLevel::from_str(value)?);
            }
            "--config" => {
                let value = iter
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--config needs a value"))?;
                config_path = PathBuf::from(value);
            }
            other => anyhow::bail!("unknown argument: {}", other),
        }
    }

    Ok(RunArgs {
        mode,
        autonomy,
        config_path,
    })
}

async fn run(args: RunArgs) -> ExitCode {
    let mut config = match Config::load(&args.config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("unrecoverable init error: {:#}", e);
            return ExitCode::from(2);
        }
    };
    if let Some(autonomy) = args.autonomy {
        config.autonomy_level = autonomy;
    }

    let mut orchestrator = match Orchestrator::new(config).await {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            error!("unrecoverable init error: {:#}", e);
            return ExitCode::from(2);
        }
    };

    let outcome = if args.mode == "once" {
        orchestrator.run_once().await.map(|result| {
            println!("{}", serde_json::to_string_pretty(&result).unwrap_or_default());
        })
    } else {
        orchestrator.run_continuous().await
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("orchestrator failed: {:#}", e);
            ExitCode::from(2)
        }
    }
}

fn load_executor(args: &[String]) -> anyhow::Result<(Executor, usize)> {
    // Shared parsing for approve/reject: index first, optional --config.
    let index = args
        .first()
        .ok_or_else(|| anyhow::anyhow!("an index is required"))?
        .parse::<usize>()
        .map_err(|_| anyhow::anyhow!("index must be a number"))?;

    let config = config_for_tools(&args[1..])?;
    Ok((
        Executor::new(&config.state_dir, config.autonomy_level)
            .with_protected_units(config.protected_services.clone()),
        index,
    ))
}

fn config_for_tools(args: &[String]) -> anyhow::Result<Config> {
    let mut config_path = Config::default_path();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" {
            if let Some(value) = iter.next() {
                config_path = PathBuf::from(value);
            }
        }
    }
    Config::load(&config_path)
}

fn show_queue(args: &[String]) -> ExitCode {
    let config = match config_for_tools(args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {:#}", e);
            return ExitCode::from(2);
        }
    };
    let executor = Executor::new(&config.state_dir, config.autonomy_level);
    let entries = executor.approval_queue().load();

    if entries.is_empty() {
        println!("No pending actions");
        return ExitCode::SUCCESS;
    }

    println!("{}", "=".repeat(70));
    println!("PENDING ACTIONS: {}", entries.len());
    println!("{}", "=".repeat(70));
    for (i, entry) in entries.iter().enumerate() {
        println!("\n[{}] queued at {}", i, entry.enqueued_at.to_rfc3339());
        println!("{}", "-".repeat(70));
        println!("DIAGNOSIS: {}", entry.proposal.diagnosis);
        println!("PROPOSED ACTION: {}", entry.proposal.proposed_action);
        println!("TYPE: {:?}", entry.proposal.action_type);
        println!("RISK: {:?}", entry.proposal.risk_level);
        if !entry.proposal.commands.is_empty() {
            println!("COMMANDS:");
            for command in &entry.proposal.commands {
                println!("  - {}", command);
            }
        }
        if !entry.proposal.reasoning.is_empty() {
            println!("REASONING: {}", entry.proposal.reasoning);
        }
    }
    println!("\n{}", "=".repeat(70));
    ExitCode::SUCCESS
}

async fn approve(args: &[String]) -> ExitCode {
    let (executor, index) = match load_executor(args) {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("error: {:#}", e);
            return ExitCode::from(1);
        }
    };

    match executor.approve(index).await {
        Ok(Some(result)) => {
            println!("{}", result.output);
            if result.success == Some(true) {
                println!("Approval succeeded");
                ExitCode::SUCCESS
            } else {
                println!("Approval executed but the action failed");
                ExitCode::from(1)
            }
        }
        Ok(None) => {
            eprintln!("no queued action at index {}", index);
            ExitCode::from(1)
        }
        Err(e) => {
            eprintln!("approval failed: {:#}", e);
            ExitCode::from(1)
        }
    }
}

fn reject(args: &[String]) -> ExitCode {
    let (executor, index) = match load_executor(args) {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("error: {:#}", e);
            return ExitCode::from(1);
        }
    };

    match executor.reject(index) {
        Ok(true) => {
            println!("Action rejected and removed from queue");
            ExitCode::SUCCESS
        }
        Ok(false) => {
            eprintln!("no queued action at index {}", index);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("rejection failed: {:#}", e);
            ExitCode::from(1)
        }
    }
}
