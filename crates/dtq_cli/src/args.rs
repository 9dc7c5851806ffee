use std::{
    net::{IpAddr, SocketAddr},
    num::NonZeroUsize,
    path::PathBuf,
};

use clap::{Parser, Subcommand, ValueEnum};
use dtq_utils::{
    auth::Signature,
    net_protocol::{
        queue::{JobId, Priority, SplitStrategy},
        workers::TestEntry,
    },
};

/// Distributed test queue
///
/// Schedules buckets of tests onto a fleet of workers, retrying failed tests and sharing the
/// fleet fairly between jobs.
#[derive(Parser)]
#[clap(version = dtq_utils::VERSION)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Starts a queue server and runs it until its termination policy lets it stop, or it is
    /// interrupted.
    Start {
        /// Path to a TOML file configuring the queue.
        /// Without one, the queue runs with default settings.
        #[clap(long)]
        config: Option<PathBuf>,

        /// IP address to bind the queue to. Overrides the configuration file.
        #[clap(long)]
        bind: Option<IpAddr>,

        /// Port to bind the queue to. Overrides the configuration file.
        #[clap(long)]
        port: Option<u16>,

        /// IP address the queue advertises to workers. Overrides the configuration file.
        #[clap(long)]
        public_ip: Option<IpAddr>,

        #[clap(flatten)]
        signature: SignatureArg,
    },
    /// Starts a worker that runs each test it is handed through a command.
    ///
    /// The command runs once per test, with the test named by the DTQ_TEST_CLASS,
    /// DTQ_TEST_METHOD and DTQ_TEST_CASE_ID environment variables. The worker exits once the
    /// queue has nothing left to hand out.
    Work {
        #[clap(flatten)]
        queue: QueueArgs,

        /// The identity of this worker; the queue must know it.
        #[clap(long, required = true)]
        worker_id: String,

        /// The command running a single test.
        #[clap(required = true, last = true)]
        command: Vec<String>,
    },
    /// Schedules tests as part of a job.
    ///
    /// Tests are given as `Class.method`, optionally suffixed with `#<case id>`.
    Schedule {
        #[clap(flatten)]
        queue: QueueArgs,

        /// The job the tests belong to.
        #[clap(long, required = true)]
        job_id: JobId,

        /// Priority of the job; buckets of higher-priority jobs are handed out first.
        #[clap(long, default_value_t = Priority::default().0)]
        priority: u16,

        /// How the tests are split into buckets.
        #[clap(long, value_enum, default_value_t = SplitArg::EquallyDivided)]
        split: SplitArg,

        /// Maximum number of tests per bucket, when splitting by fixed size.
        #[clap(long, required_if_eq("split", "fixed-size"))]
        bucket_size: Option<NonZeroUsize>,

        /// Retries of each failing test. Defaults to the queue's setting.
        #[clap(long)]
        retries: Option<u32>,

        /// Seconds a single test may run before it is failed.
        #[clap(long)]
        test_timeout: Option<f64>,

        /// Environment for the tests, as `KEY=VALUE`.
        #[clap(long = "env", value_parser = parse_key_value)]
        environment: Vec<(String, String)>,

        /// Wait for the job to finish and print its results.
        #[clap(long)]
        wait: bool,

        /// Seconds between checks on the job, when waiting.
        #[clap(long, default_value_t = 1.0)]
        poll_interval: f64,

        /// The tests to schedule.
        #[clap(required = true, value_parser = parse_test_entry)]
        tests: Vec<TestEntry>,
    },
    /// Inspects or deletes a job.
    #[clap(subcommand)]
    Job(JobCommand),
    /// Prints the version of dtq, and of a queue if one is given.
    Version {
        /// Address of a queue to ask for its version.
        #[clap(long)]
        queue_addr: Option<SocketAddr>,

        #[clap(flatten)]
        signature: SignatureArg,
    },
    /// Manages the signature shared by a queue and its clients.
    #[clap(subcommand)]
    Signature(SignatureCommand),
}

#[derive(Subcommand)]
pub enum JobCommand {
    /// Prints the scheduling state of a job.
    State {
        #[clap(flatten)]
        queue: QueueArgs,
        job_id: JobId,
    },
    /// Prints the final results of a job's tests so far.
    Results {
        #[clap(flatten)]
        queue: QueueArgs,
        job_id: JobId,
    },
    /// Deletes a job; its remaining tests are not run.
    Delete {
        #[clap(flatten)]
        queue: QueueArgs,
        job_id: JobId,
    },
}

#[derive(Subcommand)]
pub enum SignatureCommand {
    /// Generates a new random signature.
    New,
}

#[derive(clap::Args)]
pub struct QueueArgs {
    /// Address of the queue to connect to.
    #[clap(long, required = true)]
    pub queue_addr: SocketAddr,

    #[clap(flatten)]
    pub signature: SignatureArg,
}

#[derive(clap::Args)]
pub struct SignatureArg {
    /// Signature shared by the queue and its clients.
    /// If the queue is started with one, clients must present the same.
    #[clap(long, env = "DTQ_SIGNATURE")]
    pub signature: Option<Signature>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SplitArg {
    /// One test per bucket.
    Individual,
    /// One bucket per worker.
    EquallyDivided,
    /// Buckets of at most `--bucket-size` tests.
    FixedSize,
    /// All tests sharing a configuration in one bucket.
    Unsplit,
}

impl SplitArg {
    pub fn into_strategy(self, bucket_size: Option<NonZeroUsize>) -> Option<SplitStrategy> {
        let strategy = match self {
            SplitArg::Individual => SplitStrategy::Individual,
            SplitArg::EquallyDivided => SplitStrategy::EquallyDivided,
            SplitArg::FixedSize => SplitStrategy::FixedBucketSize { size: bucket_size? },
            SplitArg::Unsplit => SplitStrategy::Unsplit,
        };
        Some(strategy)
    }
}

fn parse_test_entry(test: &str) -> Result<TestEntry, String> {
    let invalid = || format!("`{test}` is not of the form `Class.method` or `Class.method#case`");

    let (test, case_id) = match test.rsplit_once('#') {
        Some((test, case_id)) => (test, Some(case_id.parse::<u64>().map_err(|_| invalid())?)),
        None => (test, None),
    };
    let (class_name, method_name) = test.rsplit_once('.').ok_or_else(invalid)?;
    if class_name.is_empty() || method_name.is_empty() {
        return Err(invalid());
    }

    let entry = TestEntry::new(class_name, method_name);
    Ok(match case_id {
        Some(case_id) => entry.with_case_id(case_id),
        None => entry,
    })
}

fn parse_key_value(pair: &str) -> Result<(String, String), String> {
    match pair.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_owned(), value.to_owned())),
        _ => Err(format!("`{pair}` is not of the form `KEY=VALUE`")),
    }
}
