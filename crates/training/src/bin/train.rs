use std::{io, path::PathBuf, str::FromStr};

use clap::{Parser, Subcommand};
use dialogue_training::{
    launcher::{self, WORKER_SUBCOMMAND},
    TrainingConfig, TrainingError, WorkerRole,
};
use serde_json::{Number, Value};

fn main() {
    if let Err(err) = run() {
        eprintln!("training failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Distributed seq2seq dialogue training", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train, spawning one worker per rank when `training.world_size` > 1.
    Run {
        #[arg(short, long, value_name = "PATH", help = "Path to training config file")]
        config: PathBuf,

        #[arg(
            long = "override",
            value_name = "KEY=VALUE",
            help = "Override configuration value using dot-separated paths"
        )]
        overrides: Vec<OverrideArg>,
    },
    /// Runs a single rank with the configuration read from stdin.
    #[command(name = WORKER_SUBCOMMAND, hide = true)]
    Worker {
        #[arg(long)]
        rank: usize,
        #[arg(long)]
        world_size: usize,
    },
}

#[derive(Debug, Clone)]
struct OverrideArg {
    path: String,
    value: String,
}

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

fn run() -> Result<(), TrainingError> {
    match Args::parse().command {
        Command::Run { config, overrides } => {
            let mut config = TrainingConfig::from_path(&config)?;
            if !overrides.is_empty() {
                config = apply_overrides(config, &overrides)?;
            }
            launcher::launch(&config)
        }
        Command::Worker { rank, world_size } => {
            let config = launcher::read_worker_config(io::stdin().lock())?;
            launcher::run_worker(config, WorkerRole::Distributed { rank, world_size })?;
            Ok(())
        }
    }
}

fn apply_overrides(
    config: TrainingConfig,
    overrides: &[OverrideArg],
) -> Result<TrainingConfig, TrainingError> {
    let mut value = serde_json::to_value(config)?;
    for override_arg in overrides {
        let new_value = parse_override_value(&override_arg.value);
        set_value_at_path(&mut value, &override_arg.path, new_value)?;
    }
    Ok(serde_json::from_value(value)?)
}

fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if trimmed.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(int_val) = trimmed.parse::<u64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Ok(float_val) = trimmed.parse::<f64>() {
        if let Some(number) = Number::from_f64(float_val) {
            return Value::Number(number);
        }
    }
    Value::String(trimmed.to_string())
}

// Missing intermediate tables are created; unknown leaf keys are left for
// `deny_unknown_fields` to reject.
fn set_value_at_path(target: &mut Value, path: &str, new_value: Value) -> Result<(), TrainingError> {
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(TrainingError::validation(vec![format!(
            "override path '{path}' has an empty segment"
        )]));
    }

    let mut current = target;
    for (idx, segment) in segments.iter().enumerate() {
        if current.is_null() {
            *current = Value::Object(serde_json::Map::new());
        }
        let Some(map) = current.as_object_mut() else {
            return Err(TrainingError::validation(vec![format!(
                "override path '{path}' descends into a non-table value at '{segment}'"
            )]));
        };
        let entry = map.entry(segment.to_string()).or_insert(Value::Null);
        if idx + 1 == segments.len() {
            *entry = new_value;
            return Ok(());
        }
        current = entry;
    }
    Ok(())
}
