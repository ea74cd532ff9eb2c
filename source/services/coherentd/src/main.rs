// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: coherentd entrypoint wiring CLI, logging and signals to the service loop

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;

#[derive(Parser)]
#[command(name = "coherentd", version, about = "Coherent memory hotplug and migration daemon")]
struct Cli {
    /// TOML configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Use an in-memory block store and only record migrations
    #[arg(long)]
    dry_run: bool,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    if let Err(err) = ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst)) {
        eprintln!("coherentd: cannot install signal handler: {err}");
        std::process::exit(1);
    }

    let options = coherentd::Options { config: cli.config, dry_run: cli.dry_run };
    let notifier = coherentd::ReadyNotifier::new(|| println!("coherentd: ready"));
    if let Err(err) = coherentd::service_main_loop(options, notifier, shutdown) {
        eprintln!("coherentd: exited with error: {err}");
        std::process::exit(1);
    }
}
