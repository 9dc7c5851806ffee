//! Commands run on behalf of a job's submitter.

use std::{io, time::Duration};

use anyhow::anyhow;
use dtq_utils::{
    exit::ExitCode,
    net_protocol::{
        queue::{
            JobId, JobResults, PrioritizedJob, Priority, ScheduleTestsRequest, SplitStrategy,
            TestConfiguration,
        },
        workers::{ExecutionConfiguration, RequestId, TestEntry, TestStatus},
    },
};
use dtq_workers::client::QueueClient;

pub struct Schedule {
    pub job_id: JobId,
    pub priority: Priority,
    pub split_strategy: SplitStrategy,
    pub execution: ExecutionConfiguration,
    pub tests: Vec<TestEntry>,
    /// How often to check on the job, if waiting for it.
    pub wait: Option<Duration>,
}

pub async fn schedule(client: QueueClient, schedule: Schedule) -> anyhow::Result<ExitCode> {
    client.check_version().await?;

    let Schedule {
        job_id,
        priority,
        split_strategy,
        execution,
        tests,
        wait,
    } = schedule;

    let request = ScheduleTestsRequest {
        job: PrioritizedJob {
            job_id: job_id.clone(),
            priority,
        },
        request_id: RequestId::unique(),
        split_strategy,
        test_configurations: tests
            .into_iter()
            .map(|test_entry| TestConfiguration {
                test_entry,
                execution: execution.clone(),
            })
            .collect(),
    };
    let test_count = request.test_configurations.len();

    let request_id = client.schedule_tests(request).await?;
    tracing::info!(%job_id, %request_id, test_count, "tests scheduled");
    println!("Scheduled {test_count} tests for job {job_id}.");

    match wait {
        Some(poll_interval) => {
            let results = client.wait_for_job(&job_id, poll_interval).await?;
            print_results(&mut io::stdout(), &results)?;
            Ok(ExitCode::for_results(&results.summary()))
        }
        None => Ok(ExitCode::SUCCESS),
    }
}

pub async fn job_state(client: QueueClient, job_id: JobId) -> anyhow::Result<ExitCode> {
    let state = client.job_state(&job_id).await?;
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(ExitCode::SUCCESS)
}

pub async fn job_results(client: QueueClient, job_id: JobId) -> anyhow::Result<ExitCode> {
    let results = client.job_results(&job_id).await?;
    print_results(&mut io::stdout(), &results)?;
    Ok(ExitCode::for_results(&results.summary()))
}

pub async fn delete_job(client: QueueClient, job_id: JobId) -> anyhow::Result<ExitCode> {
    client.delete_job(&job_id).await?;
    println!("Deleted job {job_id}.");
    Ok(ExitCode::SUCCESS)
}

pub async fn version(client: Option<QueueClient>) -> anyhow::Result<ExitCode> {
    println!("dtq {}", dtq_utils::VERSION);
    if let Some(client) = client {
        let queue_version = client.queue_version().await?;
        println!("queue at {} runs dtq {queue_version}", client.queue_addr());
        if queue_version != dtq_utils::VERSION {
            return Err(anyhow!("queue version differs from this dtq"));
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn print_results(out: &mut impl io::Write, results: &JobResults) -> io::Result<()> {
    for result in results.final_results() {
        let status = match result.status {
            TestStatus::Success => "passed",
            TestStatus::Failure => "FAILED",
            TestStatus::Lost => "LOST",
        };
        writeln!(
            out,
            "{status:>6} {} ({:.3}s)",
            result.test_entry,
            result.duration.as_secs_f64()
        )?;
        for exception in &result.exceptions {
            for line in exception.reason.lines() {
                writeln!(out, "         {line}")?;
            }
        }
    }

    let summary = results.summary();
    writeln!(
        out,
        "\n{} tests, {} passed, {} failed, {} lost",
        summary.total(),
        summary.passed,
        summary.failed,
        summary.lost
    )
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use dtq_utils::{
        exit::ExitCode,
        net_protocol::{
            queue::{JobId, JobResults},
            workers::{BucketId, TestEntry, TestEntryResult, TestException, TestingResult},
        },
    };
    use indoc::indoc;

    use super::print_results;

    fn results(results: Vec<TestEntryResult>) -> JobResults {
        JobResults {
            job_id: JobId::from("J"),
            testing_results: vec![TestingResult {
                bucket_id: BucketId::derive(b"", &[TestEntry::new("A", "a")], &Default::default()),
                results,
            }],
        }
    }

    #[test]
    fn prints_results_and_summary() {
        let results = results(vec![
            TestEntryResult::success(TestEntry::new("A", "a"), Duration::from_millis(1500)),
            TestEntryResult::failure(
                TestEntry::new("A", "b").with_case_id(2),
                vec![TestException::new("expected 1\ngot 2")],
                Duration::ZERO,
            ),
            TestEntryResult::lost(TestEntry::new("B", "c")),
        ]);

        let mut out = Vec::new();
        print_results(&mut out, &results).unwrap();

        assert_eq!(
            String::from_utf8(out).unwrap(),
            indoc! {"
                passed A.a (1.500s)
                FAILED A.b#2 (0.000s)
                         expected 1
                         got 2
                  LOST B.c (0.000s)

                3 tests, 1 passed, 1 failed, 1 lost
            "}
        );
        assert_eq!(ExitCode::for_results(&results.summary()), ExitCode::FAILURE);
    }

    #[test]
    fn empty_results_print_only_summary() {
        let mut out = Vec::new();
        print_results(&mut out, &results(vec![])).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "\n0 tests, 0 passed, 0 failed, 0 lost\n");
    }
}
