//! Worker entry point.

use std::path::PathBuf;
use std::sync::Arc;

use courier_core::{Dispatcher, Lanes, TracingJobLog};
use courier_worker::stdio::{StdinJobSource, StdoutPublisher};
use courier_worker::{JobLoop, WorkerConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let config_path = match std::env::args().nth(1) {
        Some(path) => PathBuf::from(path),
        None => {
            error!("usage: courier-worker <config.json>");
            std::process::exit(2);
        }
    };
    let config = match WorkerConfig::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "configuration rejected");
            std::process::exit(1);
        }
    };
    let cipher = match config.token_cipher() {
        Ok(cipher) => Arc::new(cipher),
        Err(err) => {
            error!(error = %err, "token cipher rejected");
            std::process::exit(1);
        }
    };

    let lanes = Lanes::start();
    let dispatcher = Dispatcher::new(Arc::clone(&lanes), cipher, Arc::new(TracingJobLog));
    if let Err(err) = dispatcher.setup(config.providers.clone(), config.scripts_dir.as_deref()) {
        error!(error = %err, "provider registry rejected");
        std::process::exit(1);
    }

    let job_loop = JobLoop::new(
        lanes,
        Arc::clone(&dispatcher),
        Arc::new(StdoutPublisher),
        config.tube.clone(),
        config.user_agent.clone(),
    );

    info!(tube = %config.tube, providers = config.providers.len(), "courier worker up");
    let source = Arc::new(StdinJobSource::new());
    tokio::select! {
        () = Arc::clone(&job_loop).run(source) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, draining");
            dispatcher.shutdown();
        }
    }
}
