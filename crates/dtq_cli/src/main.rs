mod args;
mod config;
mod instance;
mod submit;
mod workers;

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use dtq_utils::{
    auth::{ClientAuthStrategy, ServerAuthStrategy, Signature},
    exit::ExitCode,
    net_opt::{ClientOptions, ServerOptions},
    net_protocol::{
        queue::Priority,
        workers::{ExecutionConfiguration, WorkerId},
    },
};
use dtq_workers::client::QueueClient;
use tracing_subscriber::EnvFilter;

use args::{Cli, Command, JobCommand, QueueArgs, SignatureCommand};
use config::QueueFileConfig;

fn init_logging() {
    let filter = EnvFilter::try_from_env("DTQ_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("DTQ_LOG_FORMAT").map_or(false, |format| format == "json");

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

fn main() {
    init_logging();

    let cli = Cli::parse();

    let exit_code = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the async runtime")
        .and_then(|runtime| runtime.block_on(run(cli)));

    match exit_code {
        Ok(code) => std::process::exit(code.get()),
        Err(error) => {
            tracing::error!(error = %format!("{error:#}"), "dtq failed");
            eprintln!("dtq: {error:#}");
            std::process::exit(ExitCode::DTQ_ERROR.get());
        }
    }
}

fn client(queue: QueueArgs) -> QueueClient {
    client_with(queue.queue_addr, queue.signature.signature)
}

fn client_with(queue_addr: std::net::SocketAddr, signature: Option<Signature>) -> QueueClient {
    let client = ClientOptions::new(ClientAuthStrategy::from(signature)).build_async();
    QueueClient::new(queue_addr, client)
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.command {
        Command::Start {
            config,
            bind,
            port,
            public_ip,
            signature,
        } => {
            let mut file_config = match config {
                Some(path) => QueueFileConfig::read(&path)?,
                None => QueueFileConfig::default(),
            };
            if let Some(bind) = bind {
                file_config.bind_ip = bind;
            }
            if let Some(port) = port {
                file_config.port = port;
            }
            if public_ip.is_some() {
                file_config.public_ip = public_ip;
            }

            let server_options =
                ServerOptions::new(ServerAuthStrategy::from(signature.signature));
            instance::start_queue(file_config.into_queue_config(server_options)).await
        }
        Command::Work {
            queue,
            worker_id,
            command,
        } => workers::start_worker(client(queue), WorkerId::from(worker_id), command).await,
        Command::Schedule {
            queue,
            job_id,
            priority,
            split,
            bucket_size,
            retries,
            test_timeout,
            environment,
            wait,
            poll_interval,
            tests,
        } => {
            let split_strategy = split
                .into_strategy(bucket_size)
                .context("--bucket-size is required when splitting by fixed size")?;

            let mut execution = ExecutionConfiguration {
                environment: environment.into_iter().collect(),
                number_of_retries: retries,
                ..Default::default()
            };
            if let Some(test_timeout) = test_timeout {
                execution.test_timeout = Duration::try_from_secs_f64(test_timeout)
                    .context("--test-timeout must be a positive number of seconds")?;
            }
            let wait = match wait {
                true => Some(
                    Duration::try_from_secs_f64(poll_interval)
                        .context("--poll-interval must be a positive number of seconds")?,
                ),
                false => None,
            };

            let schedule = submit::Schedule {
                job_id,
                priority: Priority(priority),
                split_strategy,
                execution,
                tests,
                wait,
            };
            submit::schedule(client(queue), schedule).await
        }
        Command::Job(JobCommand::State { queue, job_id }) => {
            submit::job_state(client(queue), job_id).await
        }
        Command::Job(JobCommand::Results { queue, job_id }) => {
            submit::job_results(client(queue), job_id).await
        }
        Command::Job(JobCommand::Delete { queue, job_id }) => {
            submit::delete_job(client(queue), job_id).await
        }
        Command::Version {
            queue_addr,
            signature,
        } => {
            let client = queue_addr.map(|addr| client_with(addr, signature.signature));
            submit::version(client).await
        }
        Command::Signature(SignatureCommand::New) => {
            println!("{}", Signature::new_random());
            Ok(ExitCode::SUCCESS)
        }
    }
}
