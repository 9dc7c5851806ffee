//! Partitioning of requested tests into buckets.
//!
//! Tests are first grouped by their execution configuration, since a bucket runs all of its
//! tests the same way. A group holding the same test more than once is further divided so
//! that no bucket contains a test twice. Each resulting group is then cut into buckets as the
//! [SplitStrategy] says.

use dtq_utils::net_protocol::{
    queue::{SplitStrategy, TestConfiguration},
    workers::{Bucket, ExecutionConfiguration, TestEntry},
};

/// Splits `test_configurations` into buckets, preserving every requested test exactly once.
///
/// `salt` makes the ids of the produced buckets distinct from those of any other call with a
/// different salt, even if the same tests are requested.
pub fn split(
    test_configurations: Vec<TestConfiguration>,
    worker_count: usize,
    strategy: SplitStrategy,
    salt: &[u8],
) -> Vec<Bucket> {
    let worker_count = worker_count.max(1);
    let mut buckets = Vec::new();

    for (execution, entries) in group_by_configuration(test_configurations) {
        for unique_entries in divide_duplicates(entries) {
            let bucket_size = match strategy {
                SplitStrategy::Individual => 1,
                SplitStrategy::EquallyDivided => unique_entries.len().div_ceil(worker_count),
                SplitStrategy::FixedBucketSize { size } => size.get(),
                SplitStrategy::Unsplit => unique_entries.len(),
            };

            for chunk in unique_entries.chunks(bucket_size.max(1)) {
                let mut bucket_salt = salt.to_vec();
                bucket_salt.extend_from_slice(&(buckets.len() as u64).to_le_bytes());
                buckets.push(Bucket::new(&bucket_salt, chunk.to_vec(), execution.clone()));
            }
        }
    }

    buckets
}

/// Groups tests by configuration, keeping groups and the tests within them in request order.
fn group_by_configuration(
    test_configurations: Vec<TestConfiguration>,
) -> Vec<(ExecutionConfiguration, Vec<TestEntry>)> {
    let mut groups: Vec<(ExecutionConfiguration, Vec<TestEntry>)> = Vec::new();
    for TestConfiguration {
        test_entry,
        execution,
    } in test_configurations
    {
        match groups.iter_mut().find(|(config, _)| *config == execution) {
            Some((_, entries)) => entries.push(test_entry),
            None => groups.push((execution, vec![test_entry])),
        }
    }
    groups
}

/// Divides a list of tests into lists without repeated tests: the n-th occurrence of a test
/// goes to the n-th list.
fn divide_duplicates(entries: Vec<TestEntry>) -> Vec<Vec<TestEntry>> {
    let mut divided: Vec<Vec<TestEntry>> = Vec::new();
    for entry in entries {
        match divided.iter_mut().find(|group| !group.contains(&entry)) {
            Some(group) => group.push(entry),
            None => divided.push(vec![entry]),
        }
    }
    divided
}
