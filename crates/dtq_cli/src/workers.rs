use std::sync::Arc;

use anyhow::anyhow;
use dtq_utils::{exit::ExitCode, net_protocol::workers::WorkerId};
use dtq_workers::{
    client::QueueClient,
    executor::ShellCommandExecutor,
    worker::{DistWorker, DistWorkerConfig},
};

use crate::instance::termination_signals;

/// Runs one worker until the queue runs dry, the worker is blocked, or the process is
/// interrupted.
pub async fn start_worker(
    client: QueueClient,
    worker_id: WorkerId,
    command: Vec<String>,
) -> anyhow::Result<ExitCode> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| anyhow!("a command running the tests is required"))?;
    let executor = ShellCommandExecutor::new(program.clone(), args.to_vec());

    tracing::debug!(queue_addr = %client.queue_addr(), %worker_id, "worker attaching to queue");

    let worker = DistWorker::new(client, Arc::new(executor), DistWorkerConfig::new(worker_id));
    let interrupted = termination_signals()?;

    tokio::select! {
        summary = worker.run() => {
            let summary = summary?;
            println!(
                "Ran {} buckets, {} results accepted by the queue.",
                summary.buckets_executed, summary.results_accepted
            );
            Ok(ExitCode::SUCCESS)
        }
        _ = interrupted => {
            tracing::info!("worker interrupted");
            Ok(ExitCode::SUCCESS)
        }
    }
}
