use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use tracing::info;

use device_model::{load_models_dir, ModelRegistry};
use sync_engine::{load_robot_config, JointCommand, Robot};

#[derive(Parser, Debug)]
#[command(
    name = "regsync",
    version,
    about = "Robot register sync CLI",
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate a robot config against a models directory
    Validate {
        /// Robot YAML file
        #[arg(long)]
        config: PathBuf,
        /// Directory of device model YAML files
        #[arg(long, default_value = "configs/models")]
        models: PathBuf,
    },
    /// Dump the register map of a device model
    Registers {
        /// Directory of device model YAML files
        #[arg(long, default_value = "configs/models")]
        models: PathBuf,
        /// Model name (file stem)
        model: String,
    },
    /// Run a robot on the mock bus for a while and report loop health
    Run {
        #[arg(long)]
        config: PathBuf,
        #[arg(long, default_value = "configs/models")]
        models: PathBuf,
        /// Seconds to run before stopping
        #[arg(long, default_value_t = 5u64)]
        seconds: u64,
        /// Joint position to command through the manager, as NAME=VALUE
        #[arg(long)]
        command: Vec<String>,
    },
}

fn main() -> Result<()> {
    setup_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config, models } => validate(&config, &models),
        Commands::Registers { models, model } => registers(&models, &model),
        Commands::Run {
            config,
            models,
            seconds,
            command,
        } => run(&config, &models, seconds, &command),
    }
}

fn setup_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn load(config: &PathBuf, models: &PathBuf) -> Result<(Robot, ModelRegistry)> {
    let registry = load_models_dir(models)
        .with_context(|| format!("loading models from {}", models.display()))?;
    let cfg = load_robot_config(config)?;
    let robot = Robot::from_config(&cfg, &registry)
        .with_context(|| format!("assembling robot from {}", config.display()))?;
    Ok((robot, registry))
}

fn validate(config: &PathBuf, models: &PathBuf) -> Result<()> {
    let (robot, registry) = load(config, models)?;
    println!(
        "ok: robot '{}' ({} models available)",
        robot.name(),
        registry.models.len()
    );
    Ok(())
}

fn registers(models: &PathBuf, model_name: &str) -> Result<()> {
    let registry = load_models_dir(models)
        .with_context(|| format!("loading models from {}", models.display()))?;
    let model = registry
        .get(model_name)
        .with_context(|| format!("no model named '{model_name}'"))?;

    let mut names: Vec<&String> = model.registers.keys().collect();
    names.sort_by_key(|n| (model.registers[*n].address, (*n).clone()));
    println!("{:<24} {:>6} {:>4} {:>10} {}", "register", "addr", "size", "access", "bounds");
    for name in names {
        let spec = &model.registers[name];
        println!(
            "{:<24} {:>6} {:>4} {:>10?} [{}, {}]{}",
            name,
            spec.address,
            spec.size,
            spec.access,
            spec.minim,
            spec.effective_maxim(),
            spec.clone_of
                .as_ref()
                .map(|b| format!("  clone of {b}"))
                .unwrap_or_default(),
        );
    }
    Ok(())
}

fn run(config: &PathBuf, models: &PathBuf, seconds: u64, commands: &[String]) -> Result<()> {
    let (mut robot, _) = load(config, models)?;
    robot.start().context("starting robot")?;
    info!(robot = %robot.name(), "running for {seconds}s");

    if !commands.is_empty() {
        let sink = robot
            .command_sink()
            .context("config has no joint_manager, cannot command joints")?;
        let mut batch = Vec::new();
        for entry in commands {
            let (joint, value) = entry
                .split_once('=')
                .with_context(|| format!("bad command '{entry}', expected NAME=VALUE"))?;
            let value: f64 = value
                .parse()
                .with_context(|| format!("bad position in '{entry}'"))?;
            batch.push((joint.to_string(), JointCommand::position(value)));
        }
        sink.submit("cli", &batch);
    }

    thread::sleep(Duration::from_secs(seconds));

    for handle in robot.loop_handles() {
        println!(
            "loop {:<20} measured {:>8.2} Hz{}",
            handle.name(),
            handle.measured_hz(),
            if handle.is_warning() { "  (below target)" } else { "" },
        );
    }

    robot.stop();
    Ok(())
}
