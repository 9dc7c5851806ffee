use std::{future::Future, time::Duration};

/// Implements an iterator that forever yields exponentially growing delays, capped at a
/// maximum.
#[derive(Clone, Copy, Debug)]
pub struct ExpDecay {
    duration: Duration,
    multiplier: u32,
    max: Duration,
}

impl ExpDecay {
    pub const fn constant(duration: Duration) -> Self {
        Self {
            duration,
            multiplier: 1,
            max: duration,
        }
    }

    /// Doubles the delay on every step until `max` is reached.
    pub const fn doubling(starting: Duration, max: Duration) -> Self {
        Self {
            duration: starting,
            multiplier: 2,
            max,
        }
    }

    pub fn next_duration(&mut self) -> Duration {
        let duration = self.duration;
        self.duration = std::cmp::min(self.max, self.duration.saturating_mul(self.multiplier));
        duration
    }
}

impl Iterator for ExpDecay {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_duration())
    }
}

/// Runs `operation` until it succeeds or `max_attempts` attempts fail, sleeping for the next
/// `backoff` delay between attempts. The operation is told which attempt (1-indexed) it is.
pub async fn async_retry_n<O, F, R, E>(
    max_attempts: usize,
    mut backoff: ExpDecay,
    mut operation: O,
) -> Result<R, E>
where
    F: Future<Output = Result<R, E>>,
    O: FnMut(usize) -> F,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= max_attempts => return Err(e),
            Err(_) => {
                let delay = backoff.next_duration();
                tracing::debug!(attempt, ?delay, "retrying failed operation");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::{async_retry_n, ExpDecay};

    #[test]
    fn constant() {
        let delays: Vec<_> = ExpDecay::constant(Duration::from_secs(1)).take(10).collect();
        assert!(delays.iter().all(|d| *d == Duration::from_secs(1)));
    }

    #[test]
    fn doubling_is_capped() {
        let secs: Vec<_> = ExpDecay::doubling(Duration::from_secs(1), Duration::from_secs(40))
            .take(8)
            .map(|d| d.as_secs())
            .collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 32, 40, 40]);
    }

    #[tokio::test]
    async fn retry_completes_successfully_first_time() {
        let value: Result<&str, &str> =
            async_retry_n(2, ExpDecay::constant(Duration::from_nanos(1)), |attempt| {
                async move {
                    assert_eq!(attempt, 1);
                    Ok("success")
                }
            })
            .await;

        assert_eq!(value, Ok("success"));
    }

    #[tokio::test]
    async fn retry_completes_successfully_second_time() {
        let value: Result<&str, &str> =
            async_retry_n(2, ExpDecay::constant(Duration::from_nanos(1)), |attempt| {
                async move {
                    match attempt {
                        1 => Err("forced retry"),
                        2 => Ok("success"),
                        _ => panic!("too many retry attempts"),
                    }
                }
            })
            .await;

        assert_eq!(value, Ok("success"));
    }

    #[tokio::test]
    async fn retry_errors_after_attempts_exhausted() {
        let value: Result<&str, &str> =
            async_retry_n(2, ExpDecay::constant(Duration::from_nanos(1)), |attempt| {
                async move {
                    match attempt {
                        1 => Err("forced retry 1"),
                        2 => Err("forced retry 2"),
                        _ => panic!("too many retry attempts"),
                    }
                }
            })
            .await;

        assert_eq!(value, Err("forced retry 2"));
    }
}
