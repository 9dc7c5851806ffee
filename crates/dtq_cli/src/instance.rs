use std::future::Future;

use dtq_queue::{
    queue::QueueConfig,
    runner::{QueueServerRunner, RunOutcome, RunnerError},
};
use dtq_utils::exit::ExitCode;
use futures::StreamExt;
use signal_hook::consts::TERM_SIGNALS;
use signal_hook_tokio::Signals;

/// Resolves once the process receives SIGINT or SIGTERM.
pub(crate) fn termination_signals() -> anyhow::Result<impl Future<Output = ()>> {
    let mut signals = Signals::new(TERM_SIGNALS)?;
    let handle = signals.handle();

    Ok(async move {
        if let Some(signal) = signals.next().await {
            tracing::info!(signal, "received termination signal");
        }
        handle.close();
    })
}

/// Runs a queue in the current process until it terminates or is interrupted.
pub async fn start_queue(config: QueueConfig) -> anyhow::Result<ExitCode> {
    let interrupted = termination_signals()?;
    let runner = QueueServerRunner::start(config).await?;
    let server_addr = runner.server_addr();

    tracing::info!(%server_addr, "queue active");
    println!("Run the following to start a worker attached to the queue:");
    println!("\tdtq work --queue-addr={server_addr} --worker-id=<id> -- <test command>");
    println!("Run the following to schedule tests:");
    println!("\tdtq schedule --queue-addr={server_addr} --job-id=<id> <Class.method>...");

    match runner.run(interrupted).await {
        Ok(RunOutcome::Terminated(reason)) => {
            tracing::info!(?reason, "queue terminated");
            Ok(ExitCode::SUCCESS)
        }
        Ok(RunOutcome::Interrupted) => Ok(ExitCode::SUCCESS),
        Err(RunnerError::Termination(error)) => {
            tracing::error!(%error, "queue gave up");
            eprintln!("{error}");
            Ok(ExitCode::DTQ_ERROR)
        }
        Err(error) => Err(error.into()),
    }
}
