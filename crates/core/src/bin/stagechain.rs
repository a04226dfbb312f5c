use std::sync::Arc;

use clap::Parser;
use stagechain::{
    config::{self, Config, ConfigArgs},
    diagnostics::TracingDiagnostics,
    executor::TokioExecutor,
    simulation::Swarm,
    ChainProcessor,
};

type DynError = Box<dyn std::error::Error + Send + Sync + 'static>;

async fn run(config: Config) -> Result<(), DynError> {
    let swarm = Swarm::new(config.simulation.clone())?;
    let processor = ChainProcessor::new(
        swarm.chain_head(),
        TokioExecutor::new(tokio::runtime::Handle::current()),
    )
    .with_finalizer(swarm.finalizer())
    .with_diagnostics(Arc::new(TracingDiagnostics))
    .with_finalizer_failure_policy(config.finalizer_failure);

    let handles: Vec<_> = (0..swarm.config().transfers)
        .map(|index| processor.submit(swarm.session(index), swarm.listeners()))
        .collect();

    let mut failed = 0;
    for result in futures::future::join_all(handles).await {
        if let Err(error) = result {
            failed += 1;
            tracing::warn!(%error, "transfer failed");
        }
    }

    for summary in swarm.summaries() {
        tracing::debug!(
            session = summary.index,
            peer = %summary.peer,
            phases = ?summary.phases,
            transferred = summary.transferred,
            failure = ?summary.failure,
            "session finished"
        );
    }
    let stats = swarm.stats();
    tracing::info!(
        transfers = swarm.config().transfers,
        failed,
        degraded = stats.degraded,
        finalized = stats.finalized,
        bytes = stats.bytes,
        open_connections = swarm.connections().len(),
        "simulation complete"
    );
    Ok(())
}

fn main() -> Result<(), DynError> {
    let config = ConfigArgs::parse().build()?;
    config::set_logger(Some(config.log_level));
    let rt = config.build_runtime()?;
    rt.block_on(run(config))?;
    Ok(())
}
