//! Oxidized-Xenon - runtime substrate for recompiled Xbox 360 titles
//!
//! Boots the substrate on its own: reserves the guest address space,
//! loads a flat image if one is configured, builds the dispatch table,
//! and installs the fault handlers. A recompiled title links against
//! the crates and drives dispatch itself; this binary exists to bring
//! the environment up and verify it end to end.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;

use ox_core::config::Config;
use ox_core::diag::DiagnosticCounters;
use ox_dispatch::{Dispatcher, FunctionMapping, FunctionTable};
use ox_faults::{CrashReporter, DemandCommitObserver, FaultChain};
use ox_memory::{load_flat_image, AddressSpace};

fn main() -> anyhow::Result<()> {
    let config = Config::load_or_default(None).context("loading configuration")?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.general.log_filter)),
        )
        .init();

    tracing::info!("Starting Oxidized-Xenon substrate");

    let space = AddressSpace::reserve().context("reserving guest address space")?;

    // A path on the command line overrides the configured image
    let image_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| config.boot.image_path.clone());
    if let Some(path) = &image_path {
        load_flat_image(&space, path)
            .with_context(|| format!("loading image {}", path.display()))?;
    }

    let diag = Arc::new(DiagnosticCounters::new());
    let table = Arc::new(FunctionTable::new(space.clone()));
    // A linked title registers its function list here; standalone, only
    // the dynamic stub goes in.
    table.populate(&[FunctionMapping::END]);
    let _dispatcher = Dispatcher::new(table, space.clone(), diag.clone());

    let _guard = if config.faults.install_handlers {
        let mut chain = FaultChain::new();
        chain.register(
            DemandCommitObserver::PRIORITY,
            Box::new(DemandCommitObserver::new(space.clone(), diag.clone())),
        );
        chain.register(
            CrashReporter::PRIORITY,
            Box::new(CrashReporter::new(config.faults.stack_dump_depth)),
        );
        Some(ox_faults::install(chain).context("installing fault handlers")?)
    } else {
        None
    };

    tracing::info!("Substrate ready; no recompiled title linked, exiting");
    Ok(())
}
