//! Berth - delivery pipelines and service topologies as code
//!
//! The `berth` command assembles every topology described by a `berth.toml`.
//!
//! ## Commands
//!
//! - `synth`: Write one template per topology
//! - `validate`: Assemble and report, writing nothing
//! - `plan`: Show pipeline stages, artifacts and build commands
//! - `build`: Run the container build commands against a local checkout

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, Level};

use berth_ci::ShellExecutor;
use berth_core::obs::RunSpan;
use berth_core::pipeline::{Pipeline, PublishTarget};
use berth_core::{Assembly, BerthConfig, CONFIG_ENV_VAR, DEFAULT_CONFIG_FILE};

#[derive(Parser)]
#[command(name = "berth")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Delivery pipelines and service topologies as code", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
struct ConfigArgs {
    /// Path to the configuration file
    #[arg(short, long, env = CONFIG_ENV_VAR, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Synthesize one template per topology
    Synth {
        #[command(flatten)]
        config: ConfigArgs,

        /// Directory to write `<topology>.template.json` files to (default: stdout)
        #[arg(short, long)]
        out_dir: Option<PathBuf>,
    },

    /// Assemble every topology and report, without writing anything
    Validate {
        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Show pipeline stages, artifacts and build commands
    Plan {
        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Run the container build stage's commands in a local checkout
    Build {
        #[command(flatten)]
        config: ConfigArgs,

        /// Checkout to build in
        #[arg(short, long, default_value = ".")]
        workdir: PathBuf,

        /// Per-command timeout in seconds
        #[arg(long, default_value = "1800")]
        timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    berth_core::telemetry::init_tracing(cli.json, level);

    match cli.command {
        Commands::Synth { config, out_dir } => cmd_synth(&config.config, out_dir.as_deref()),
        Commands::Validate { config } => cmd_validate(&config.config),
        Commands::Plan { config } => cmd_plan(&config.config),
        Commands::Build {
            config,
            workdir,
            timeout_secs,
        } => cmd_build(&config.config, &workdir, timeout_secs).await,
    }
}

fn load(path: &Path) -> Result<(BerthConfig, Assembly)> {
    let config = BerthConfig::load(path)
        .with_context(|| format!("Failed to load config {}", path.display()))?;
    let assembly = Assembly::from_config(&config).context("Failed to assemble topologies")?;
    Ok((config, assembly))
}

fn cmd_synth(config_path: &Path, out_dir: Option<&Path>) -> Result<()> {
    let (config, assembly) = load(config_path)?;
    let _span = RunSpan::enter(&format!("synth-{}", config.app.name));

    match out_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
            for topology in assembly.topologies() {
                let path = dir.join(topology.file_name());
                std::fs::write(&path, topology.template.to_json_pretty()?)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                info!(path = %path.display(), "Wrote template");
                println!("Wrote {}", path.display());
            }
        }
        None => {
            for topology in assembly.topologies() {
                println!("{}", topology.template.to_json_pretty()?);
            }
        }
    }
    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    let (config, assembly) = load(config_path)?;

    println!("Configuration: {}", config_path.display());
    println!("App: {} ({} / {})", config.app.name, config.app.account, config.app.region);
    println!();

    for topology in assembly.topologies() {
        let digest = topology.template.digest()?;
        println!(
            "  ✓ {} ({} resources, digest {})",
            topology.name,
            topology.template.resources.len(),
            &digest[..12]
        );
    }

    if !assembly.exports().is_empty() {
        println!();
        println!("Exports:");
        for export in assembly.exports().iter() {
            println!("  - {} = {}", export.name, export.value);
        }
    }

    println!();
    println!("✓ {} topologies valid", assembly.topologies().len());
    Ok(())
}

fn cmd_plan(config_path: &Path) -> Result<()> {
    let (_, assembly) = load(config_path)?;
    print!("{}", render_plan(&assembly));
    Ok(())
}

fn render_plan(assembly: &Assembly) -> String {
    let mut out = String::new();

    render_pipeline(&mut out, assembly.source_build().pipeline());
    if let Some(site) = assembly.static_site() {
        out.push('\n');
        render_pipeline(&mut out, site.pipeline());
    }

    let service = assembly.service();
    let _ = writeln!(out);
    let _ = writeln!(out, "Service:");
    let _ = writeln!(
        out,
        "  listener :{} -> target group :{} -> {}",
        service.listener().port(),
        service.target_group().port(),
        service.service().logical_id()
    );
    let _ = writeln!(
        out,
        "  ingress: {} (any IPv4) -> {} (front group only)",
        service.front_security_group().logical_id(),
        service.back_security_group().logical_id()
    );
    let _ = writeln!(
        out,
        "  zones: {}",
        service.network().availability_zones().join(", ")
    );

    if let Some(serverless) = assembly.serverless() {
        let group = serverless.group();
        let steps: Vec<String> = group
            .policy()
            .schedule()
            .iter()
            .map(|step| format!("{}%", step.percent))
            .collect();
        let _ = writeln!(out);
        let _ = writeln!(out, "Serverless:");
        let _ = writeln!(
            out,
            "  {} alias '{}' on version {}",
            serverless.function().name(),
            group.alias().name,
            group.alias().version
        );
        let _ = writeln!(out, "  rollout {}: {}", group.policy(), steps.join(" -> "));
    }

    out
}

fn render_pipeline(out: &mut String, pipeline: &Pipeline) {
    let _ = writeln!(out, "Pipeline {}:", pipeline.name());
    for stage in pipeline.stages() {
        let _ = writeln!(out, "  Stage {} (reaches {})", stage.name(), stage.reaches());
        for action in stage.actions() {
            let inputs: Vec<&str> = action.inputs().iter().map(|a| a.as_str()).collect();
            let outputs: Vec<&str> = action.outputs().iter().map(|a| a.as_str()).collect();
            let _ = writeln!(
                out,
                "    {} [{}] in: [{}] out: [{}]",
                action.name(),
                action.kind().category(),
                inputs.join(", "),
                outputs.join(", ")
            );
            match action.publishes() {
                Some(PublishTarget::Registry { registry, tag }) => {
                    let _ = writeln!(out, "      publishes image {}", registry.image(tag));
                }
                Some(PublishTarget::ObjectStore { bucket }) => {
                    let _ = writeln!(out, "      publishes to bucket {}", bucket);
                }
                None => {}
            }
            if let Some(project) = action.build_project() {
                for (phase, command) in project.spec().commands() {
                    let _ = writeln!(out, "      {}: {}", phase, command);
                }
            }
        }
    }
}

async fn cmd_build(config_path: &Path, workdir: &Path, timeout_secs: u64) -> Result<()> {
    let (_, assembly) = load(config_path)?;
    let project = assembly
        .source_build()
        .build_project()
        .context("Source pipeline has no build action")?;

    println!("Building {} in {}", project.name(), workdir.display());
    println!();

    let executor = ShellExecutor::new(workdir).with_timeout(Duration::from_secs(timeout_secs));
    let result = executor
        .run_spec(project.name(), project.spec())
        .await
        .context("Build failed to run")?;

    println!("Status: {}", if result.passed() { "✓ PASSED" } else { "✗ FAILED" });
    println!("Duration: {}ms", result.duration_ms);

    if result.passed() {
        Ok(())
    } else {
        if !result.stderr.trim().is_empty() {
            println!();
            println!("{}", result.stderr.trim_end());
        }
        anyhow::bail!("Build exited with code {}", result.exit_code)
    }
}
