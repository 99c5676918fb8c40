mod cli;

use crate::cli::PortrelayArguments;
use anyhow::Result;
use clap::Parser;
use log::{error, info, trace};
use portrelay::config::{Config, ConfigStore};
use portrelay::control::start_control_server;
use portrelay::ipc::{self, InstanceInfo};
use portrelay::{LifecycleOrchestrator, logging};
use std::sync::Arc;
use tokio::sync::oneshot;

#[tokio::main]
async fn main() -> Result<()> {
    let args = PortrelayArguments::parse();
    let effective_config_path = Config::resolve_config_path(args.config_path.clone()).await;

    // Logging settings come from the config file, so read it once before the logger exists.
    let logging_config = match Config::read(&effective_config_path).await {
        Ok(Some(config)) => config.get_logging().clone(),
        _ => Default::default(),
    };
    logging::init_logging(&logging_config, args.verbose)?;

    // Handle command line arguments
    args.handle_arguments().await?;

    info!("Starting portrelay");
    trace!("Arguments: {:#?}", args);

    let config = Config::try_load(&effective_config_path).await?;
    let control_addr = config.get_control().socket_addr()?;
    let store = Arc::new(ConfigStore::new(config.clone()));
    let orchestrator = Arc::new(LifecycleOrchestrator::new(config.session_idle_timeout(), store));
    orchestrator.bootstrap().await;
    let started = orchestrator.start_all().await;
    info!("{} listener(s) running", started);

    let _watcher = if args.watch_config { Some(config.watch_config_file(orchestrator.clone())?) } else { None };

    ipc::start_ipc_server(InstanceInfo { config_path: effective_config_path.clone(), control_addr: control_addr.to_string() });

    let (stop_control, control_stopped) = oneshot::channel::<()>();
    let control = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move {
            let shutdown = async {
                let _ = control_stopped.await;
            };
            if let Err(e) = start_control_server(orchestrator, control_addr, shutdown).await {
                error!("{}", e);
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, stopping all listeners");
    let _ = stop_control.send(());
    orchestrator.stop_all().await;
    let _ = control.await;
    info!("Stopped");
    Ok(())
}
