//! `curio-cli` – command line driver for the curiosity modules.
//!
//! The binary:
//!
//! 1. Parses the command line and initialises tracing for that command
//!    (console or JSON, optional OTLP export).
//! 2. Loads `~/.curio/config.toml`, falling back to defaults.
//! 3. Runs one command:
//!    - `pretrain [--steps N] [--eval]` – synthetic inverse-model pretraining
//!      with periodic checkpoints, or evaluation of the latest checkpoint.
//!    - `inspect` – list the parameters of the configured module.
//!    - `config [--json]` – print the configuration, writing defaults when
//!      the file does not exist yet.
//! 4. Intercepts **Ctrl-C** so pretraining writes a final checkpoint before
//!    exiting.

mod config;
mod pretrain;
mod synthetic;
mod telemetry;

use colored::Colorize;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

use crate::config::Config;
use crate::pretrain::RunSettings;

/// Held-out batches scored by `pretrain --eval`.
const EVAL_BATCHES: usize = 10;

/// A parsed command line.
#[derive(Debug, Clone, PartialEq)]
enum Command {
    Pretrain { steps: Option<u64>, eval: bool },
    Inspect,
    Config { json: bool },
    Help,
}

impl Command {
    /// Subcommand name, attached to exported spans.
    fn name(&self) -> &'static str {
        match self {
            Command::Pretrain { eval: true, .. } => "evaluate",
            Command::Pretrain { .. } => "pretrain",
            Command::Inspect => "inspect",
            Command::Config { .. } => "config",
            Command::Help => "help",
        }
    }
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = match parse_args(&args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}: {}", "Usage error".red(), e);
            print_usage();
            return ExitCode::from(2);
        }
    };
    let _guard = telemetry::init_tracing(command.name());

    // ── Shared shutdown flag ──────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!(
            "{}",
            "⚠  Ctrl-C received – finishing the current step …".yellow().bold()
        );
        shutdown_clone.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; interrupted runs will not checkpoint");
    }

    // ── Configuration ─────────────────────────────────────────────────────
    let (cfg, found) = match config::load() {
        Ok(Some(cfg)) => (cfg, true),
        Ok(None) => {
            let mut cfg = Config::default();
            config::apply_env_overrides(&mut cfg);
            (cfg, false)
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            (Config::default(), false)
        }
    };

    let result = match command {
        Command::Help => {
            print_usage();
            Ok(())
        }
        Command::Config { json } => cmd_config(&cfg, found, json),
        Command::Inspect => cmd_inspect(&cfg),
        Command::Pretrain { steps, eval } => cmd_pretrain(cfg, steps, eval, &shutdown),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}: {}", "Error".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_config(cfg: &Config, found: bool, json: bool) -> Result<(), String> {
    let path = config::config_path();
    if found {
        println!("  Config loaded from {}", path.display().to_string().bold());
    } else {
        config::save(cfg)?;
        println!(
            "  {} {}",
            "✓ Wrote default configuration to".green(),
            path.display().to_string().bold()
        );
    }
    let rendered = if json {
        serde_json::to_string_pretty(cfg).map_err(|e| format!("Failed to render config: {e}"))?
    } else {
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to render config: {e}"))?
    };
    println!();
    println!("{rendered}");
    Ok(())
}

fn cmd_inspect(cfg: &Config) -> Result<(), String> {
    let settings = RunSettings::from_config(cfg)?;
    println!(
        "  Building {} over {} view(s), {} action(s) …",
        format!("ferev {}", settings.icm.ferev).bold(),
        settings.permutations.view_num(),
        settings.permutations.dimension()
    );
    let (params, backbone) = pretrain::inspect(&settings).map_err(|e| e.to_string())?;

    let mut current_scope = "";
    let mut total = 0usize;
    for p in &params {
        let scope = p.name.split('.').next().unwrap_or_default();
        if scope != current_scope {
            println!();
            println!("  {}", scope.bold().cyan());
            current_scope = scope;
        }
        let count: usize = p.dims.iter().product();
        total += count;
        println!("    {:<48} {}", p.name, format!("{:?}", p.dims).dimmed());
    }
    println!();
    println!(
        "  {} parameter tensors, {} weights",
        params.len().to_string().bold(),
        total.to_string().bold()
    );
    if backbone {
        println!("  Backbone parameters: {}", "exposed".green());
    } else {
        println!("  Backbone parameters: {}", "not exposed".yellow());
    }
    Ok(())
}

fn cmd_pretrain(
    mut cfg: Config,
    steps: Option<u64>,
    eval: bool,
    shutdown: &AtomicBool,
) -> Result<(), String> {
    if let Some(steps) = steps {
        cfg.training.steps = steps;
    }
    let settings = RunSettings::from_config(&cfg)?;
    let store = pretrain::checkpoint_store();
    let dir = settings.checkpoint_dir.display().to_string();

    if eval {
        println!("  Evaluating checkpoint in {} …", dir.bold());
        let report =
            pretrain::evaluate(&settings, &store, EVAL_BATCHES).map_err(|e| e.to_string())?;
        if !report.restored {
            println!("  {}", "No checkpoint restored; scoring an untrained model.".yellow());
        }
        println!(
            "  Inverse-model accuracy over {} batches: {}",
            report.batches,
            format!("{:.1}%", report.accuracy * 100.0).bold()
        );
        return Ok(());
    }

    println!(
        "  Pretraining {} for {} steps (batch {}, lr {}) → {}",
        format!("ferev {}", settings.icm.ferev).bold(),
        settings.steps,
        settings.batch,
        settings.learning_rate,
        dir.bold()
    );
    let report = pretrain::train(&settings, &store, shutdown, |step, loss| {
        println!("  step {:>6}  loss {:.4}", step, loss);
    })
    .map_err(|e| e.to_string())?;

    if report.interrupted {
        println!("  {}", format!("Stopped after {} steps.", report.steps).yellow());
    }
    if report.steps > 0 {
        println!("  Final loss: {}", format!("{:.4}", report.final_loss).bold());
    }
    match report.checkpoint {
        Some(path) => println!(
            "  {} {}",
            "✓ Saved checkpoint".green(),
            path.display().to_string().bold()
        ),
        None => println!("  {}", "No steps ran; nothing saved.".yellow()),
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Argument parsing
// ─────────────────────────────────────────────────────────────────────────────

fn parse_args(args: &[String]) -> Result<Command, String> {
    let Some((command, rest)) = args.split_first() else {
        return Ok(Command::Help);
    };
    match command.as_str() {
        "pretrain" => {
            let mut steps = None;
            let mut eval = false;
            let mut it = rest.iter();
            while let Some(arg) = it.next() {
                match arg.as_str() {
                    "--eval" => eval = true,
                    "--steps" => {
                        let value = it.next().ok_or("--steps needs a value")?;
                        steps = Some(
                            value
                                .parse::<u64>()
                                .map_err(|_| format!("invalid step count '{value}'"))?,
                        );
                    }
                    other => return Err(format!("unknown pretrain option '{other}'")),
                }
            }
            Ok(Command::Pretrain { steps, eval })
        }
        "inspect" if rest.is_empty() => Ok(Command::Inspect),
        "config" => match rest {
            [] => Ok(Command::Config { json: false }),
            [flag] if flag == "--json" => Ok(Command::Config { json: true }),
            _ => Err("config accepts only --json".to_string()),
        },
        "help" | "--help" | "-h" => Ok(Command::Help),
        other => Err(format!("unknown command '{other}'")),
    }
}

fn print_usage() {
    println!();
    println!("  {} {}", "curio".bold(), format!("v{}", env!("CARGO_PKG_VERSION")).dimmed());
    println!("  Multi-view intrinsic curiosity modules");
    println!();
    println!("  {}", "Commands:".bold());
    println!("    pretrain [--steps N] [--eval]   pretrain or evaluate the inverse model");
    println!("    inspect                         list parameters of the configured module");
    println!("    config [--json]                 show (or create) ~/.curio/config.toml");
    println!("    help                            show this message");
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn no_arguments_shows_help() {
        assert_eq!(parse_args(&[]).unwrap(), Command::Help);
    }

    #[test]
    fn pretrain_options_are_parsed() {
        assert_eq!(
            parse_args(&args(&["pretrain", "--steps", "25", "--eval"])).unwrap(),
            Command::Pretrain {
                steps: Some(25),
                eval: true
            }
        );
        assert_eq!(
            parse_args(&args(&["pretrain"])).unwrap(),
            Command::Pretrain {
                steps: None,
                eval: false
            }
        );
    }

    #[test]
    fn bad_step_counts_are_rejected() {
        assert!(parse_args(&args(&["pretrain", "--steps"])).is_err());
        assert!(parse_args(&args(&["pretrain", "--steps", "many"])).is_err());
    }

    #[test]
    fn config_accepts_json_flag_only() {
        assert_eq!(
            parse_args(&args(&["config", "--json"])).unwrap(),
            Command::Config { json: true }
        );
        assert!(parse_args(&args(&["config", "--yaml"])).is_err());
    }

    #[test]
    fn evaluation_runs_are_named_apart() {
        let name = |list: &[&str]| parse_args(&args(list)).unwrap().name();
        assert_eq!(name(&["pretrain"]), "pretrain");
        assert_eq!(name(&["pretrain", "--eval"]), "evaluate");
        assert_eq!(name(&[]), "help");
    }

    #[test]
    fn unknown_commands_are_rejected() {
        assert!(parse_args(&args(&["train"])).is_err());
        assert!(parse_args(&args(&["inspect", "extra"])).is_err());
    }
}
