// SPDX-License-Identifier: GPL-3.0-only

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use octowatch::config::Config;
use octowatch::orchestrator::Orchestrator;
use tracing::{error, info};

fn main() {
    let config = Config::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(config.log_filter))
        .with_target(true)
        .with_level(true)
        .init();

    let orchestrator = match Orchestrator::start(config) {
        Ok(o) => o,
        Err(e) => {
            error!(error = %e, "fatal initialization failure");
            std::process::exit(1);
        }
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_handler = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("received SIGINT, shutting down");
        shutdown_handler.store(true, Ordering::SeqCst);
    }) {
        error!(error = %e, "failed to install SIGINT handler");
        std::process::exit(1);
    }

    while !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
    }

    drop(orchestrator);
    info!("shutdown complete");
    std::process::exit(0);
}
