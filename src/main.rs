//! gadgetd entry point.

use clap::Parser;
use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    sync::{Arc, Mutex},
};
use tracing_subscriber::EnvFilter;

use gadgetd::{
    config::DaemonConfig,
    configfs::GadgetFs,
    core::Daemon,
    dbus,
    ffs::{service, FfsFunctionType},
    probe,
    pump::{self, EventPump},
    registry::FunctionRegistry,
    udc, Error, Result,
};

/// USB gadget daemon.
#[derive(Debug, Parser)]
#[command(name = "gadgetd", about = "Manages USB gadgets over the system bus.")]
struct Cli {
    /// Custom config file location.
    #[arg(short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err}");
            ExitCode::from(err.report_code() as u8)
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn run(cli: Cli) -> Result<()> {
    let config = DaemonConfig::load_or_default(cli.config.as_deref())?;

    let configfs = match &config.configfs_mount_point {
        Some(path) => path.clone(),
        None => gadgetd::configfs_mount()?,
    };
    let gadget_fs = GadgetFs::new(&configfs)?;
    for name in gadget_fs.gadget_names()? {
        tracing::info!("found existing gadget {name} in configfs");
    }

    let udcs = udc::udcs(Path::new("/sys/class"))?;
    for udc in &udcs {
        tracing::info!(
            "found udc {} in state {}",
            udc.name().to_string_lossy(),
            udc.state().unwrap_or_default()
        );
    }

    let mut registry = FunctionRegistry::new();
    probe::register_kernel_functions(&mut registry)?;

    match service::load_service_dir(&config.ffs_service_dir) {
        Ok(services) => {
            for svc in services {
                if let Err(err) = registry.register(Arc::new(FfsFunctionType::new(svc))) {
                    tracing::warn!("unable to register ffs service: {err}");
                }
            }
        }
        Err(Error::FileOpenFailed(_)) => {
            tracing::info!("no ffs service directory at {}", config.ffs_service_dir.display())
        }
        Err(err) => return Err(err),
    }

    tracing::info!("{} function types available", registry.len());

    let daemon = Arc::new(Mutex::new(Daemon::new(config, gadget_fs, registry, udcs)));
    let pump = Arc::new(EventPump::new());
    let ctx = dbus::Ctx { daemon: daemon.clone(), pump };

    let connection = dbus::serve(ctx).await?;

    let reaper = tokio::task::spawn(pump::reap_children(daemon.clone()));

    wait_for_shutdown().await?;
    tracing::info!("shutting down");

    reaper.abort();
    daemon.lock().unwrap().unregister_types();
    drop(connection);
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate()).map_err(Error::from)?;
    let mut int = signal(SignalKind::interrupt()).map_err(Error::from)?;

    tokio::select! {
        _ = term.recv() => (),
        _ = int.recv() => (),
    }

    Ok(())
}
