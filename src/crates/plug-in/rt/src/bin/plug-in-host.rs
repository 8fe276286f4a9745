//! Command line front end for the plug-in host runtime.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use plug_in_rt::{
    Caller, HostConfig, MemoryTileStore, PlugInManager, Procedure, RecordingProgress,
    TracingConfig, initialize_tracing,
};
use plug_in_types::{ArgType, ParamValue, RunMode};

#[derive(Parser)]
#[command(name = "plug-in-host")]
#[command(about = "Query and run out-of-process plug-ins", long_about = None)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Query plug-in executables and list the procedures they install
    Query {
        #[arg(value_name = "EXECUTABLE", required = true)]
        executables: Vec<PathBuf>,
    },
    /// Query an executable, then run one of its procedures
    Run {
        #[arg(value_name = "EXECUTABLE")]
        executable: PathBuf,

        procedure: String,

        /// Arguments, converted to the declared parameter types
        args: Vec<String>,
    },
    /// Search the configured plug-in path and query everything found
    Scan,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    initialize_tracing(TracingConfig::default());

    let config = match &cli.config {
        Some(path) => HostConfig::from_yaml_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => HostConfig::default(),
    };

    let tiles = Arc::new(MemoryTileStore::new(config.tile_width, config.tile_height));
    let manager = PlugInManager::new(config, tiles);

    let result = match cli.command {
        Commands::Query { executables } => query(&manager, &executables).await,
        Commands::Run {
            executable,
            procedure,
            args,
        } => run(&manager, &executable, &procedure, &args).await,
        Commands::Scan => {
            manager.startup(Vec::new()).await;
            for procedure in manager.pdb().procedures() {
                print_procedure(&procedure);
            }
            Ok(())
        }
    };

    manager.exit().await;
    result
}

async fn query(manager: &Arc<PlugInManager>, executables: &[PathBuf]) -> Result<()> {
    for path in executables {
        let def = manager
            .query(path)
            .await
            .with_context(|| format!("failed to query {}", path.display()))?;

        println!("{}:", def.display_name());
        for procedure in &def.procedures {
            print_procedure(procedure);
        }
        if def.has_init {
            println!("  (has init)");
        }
    }
    Ok(())
}

async fn run(
    manager: &Arc<PlugInManager>,
    executable: &Path,
    name: &str,
    args: &[String],
) -> Result<()> {
    manager
        .query(executable)
        .await
        .with_context(|| format!("failed to query {}", executable.display()))?;

    let Some(procedure) = manager.pdb().lookup(name) else {
        bail!("{} does not install a procedure named {}", executable.display(), name);
    };

    if args.len() != procedure.params.len() {
        bail!(
            "{} takes {} arguments, {} given",
            procedure.name,
            procedure.params.len(),
            args.len()
        );
    }
    let values = procedure
        .params
        .iter()
        .zip(args)
        .map(|(def, arg)| parse_arg(def.arg_type, arg).with_context(|| format!("argument {}", def.name)))
        .collect::<Result<Vec<_>>>()?;

    let progress = Arc::new(RecordingProgress::new());
    let caller = Caller::host().with_progress(progress);
    let result = manager.execute_by_name(caller, &procedure.name, values).await;

    println!("status: {}", result.status());
    for value in result.values() {
        println!("  {:?}", value);
    }
    if !result.is_success() {
        bail!("{} failed", procedure.name);
    }
    Ok(())
}

fn parse_arg(arg_type: ArgType, arg: &str) -> Result<ParamValue> {
    let value = match arg_type {
        ArgType::Int32 => ParamValue::Int32(arg.parse()?),
        ArgType::Int16 => ParamValue::Int16(arg.parse()?),
        ArgType::Int8 => ParamValue::Int8(arg.parse()?),
        ArgType::Float => ParamValue::Float(arg.parse()?),
        ArgType::String => ParamValue::String(arg.to_string()),
        ArgType::File => ParamValue::File(arg.to_string()),
        ArgType::Image => ParamValue::Image(arg.parse()?),
        ArgType::Drawable => ParamValue::Drawable(arg.parse()?),
        ArgType::Layer => ParamValue::Layer(arg.parse()?),
        ArgType::RunMode => ParamValue::RunMode(match arg {
            "interactive" => RunMode::Interactive,
            "noninteractive" => RunMode::NonInteractive,
            "last-vals" => RunMode::WithLastVals,
            other => bail!("unknown run mode {}", other),
        }),
        other => bail!("{} arguments cannot be given on the command line", other),
    };
    Ok(value)
}

fn print_procedure(procedure: &Procedure) {
    let params: Vec<String> = procedure
        .params
        .iter()
        .map(|p| format!("{} {}", p.arg_type, p.name))
        .collect();
    println!("  {} ({})", procedure.name, params.join(", "));
    if let Some(blurb) = &procedure.info.blurb {
        println!("      {}", blurb);
    }
}
