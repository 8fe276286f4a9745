//! Reference plug-in.
//!
//! In query mode it installs `plug-in-test`; when run it reports progress
//! through the host and returns the int32 `42`.

use anyhow::{Context, Result, bail};
use plug_in_protocol::{
    Message, PipeTransport, PlugInArgs, ProcInstall, ProcReturn, ProcRun, connect,
};
use plug_in_rt::{TracingConfig, initialize_tracing};
use plug_in_types::{CallMode, ParamValue, PdbStatus, ProcType, ReturnValues};
use tracing::{debug, warn};

const PROCEDURE: &str = "plug-in-test";

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = match PlugInArgs::parse(std::env::args()) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    initialize_tracing(
        TracingConfig::default()
            .with_log_level("warn,sample_plug_in=debug")
            .with_force_stderr(true),
    );

    let mut transport = connect(&args).context("failed to open the host pipes")?;

    match args.mode {
        CallMode::Query => query(&mut transport).await,
        CallMode::Init => Ok(transport.send(Message::Quit).await?),
        CallMode::Run => run(&mut transport).await,
    }
}

async fn query(transport: &mut PipeTransport) -> Result<()> {
    let mut install = ProcInstall::new(PROCEDURE, ProcType::PlugIn);
    install.blurb = "Return the answer".into();
    install.authors = "Plug-in host developers".into();

    transport.feed(Message::ProcInstall(Box::new(install))).await?;
    transport.send(Message::Quit).await?;
    Ok(())
}

async fn run(transport: &mut PipeTransport) -> Result<()> {
    let config = match transport.recv().await? {
        Message::Config(config) => config,
        other => bail!("expected config, received {}", other.kind()),
    };
    let run = match transport.recv().await? {
        Message::ProcRun(run) => run,
        other => bail!("expected proc-run, received {}", other.kind()),
    };
    debug!(
        procedure = %run.name,
        tile_width = config.tile_width,
        shm_id = config.shm_id,
        "running"
    );

    let values = if run.name == PROCEDURE {
        let progress = call(
            transport,
            "plug-in-progress-init",
            vec![ParamValue::String("Testing".to_string())],
        )
        .await?;
        if !progress.is_success() {
            warn!("progress init failed: {:?}", progress.error_message());
        }
        ReturnValues::success(vec![ParamValue::Int32(42)])
    } else {
        ReturnValues::error(
            PdbStatus::CallingError,
            format!("unknown procedure \"{}\"", run.name),
        )
    };

    transport
        .send(Message::ProcReturn(ProcReturn {
            name: run.name,
            params: values.into_vec(),
        }))
        .await?;
    Ok(())
}

/// Run a procedure in the host and wait for its return
async fn call(
    transport: &mut PipeTransport,
    name: &str,
    params: Vec<ParamValue>,
) -> Result<ReturnValues> {
    let request = Message::ProcRun(ProcRun {
        name: name.to_string(),
        params,
    });

    match transport.request(request).await? {
        Message::ProcReturn(ret) => Ok(ReturnValues::from_wire(ret.params)),
        other => bail!("expected proc-return, received {}", other.kind()),
    }
}
