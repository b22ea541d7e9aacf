//! A retry-with-backoff builder, modeled on `mz_ore::retry::Retry` as used
//! by the storage rehydration task to reconnect to a crashed host:
//!
//! ```ignore
//! let retry = Retry::default().clamp_backoff(Duration::from_secs(32)).into_retry_stream();
//! ```

use std::time::Duration;

use futures::Stream;
use rand::Rng;
use tokio::time::sleep;

/// Describes a bounded, jittered exponential backoff sequence.
#[derive(Debug, Clone, Copy)]
pub struct Retry {
    initial_backoff: Duration,
    multiplier: f64,
    max_backoff: Duration,
    max_tries: Option<u32>,
}

impl Default for Retry {
    fn default() -> Retry {
        Retry {
            initial_backoff: Duration::from_millis(125),
            multiplier: 2.0,
            max_backoff: Duration::MAX,
            max_tries: None,
        }
    }
}

impl Retry {
    pub fn initial_backoff(mut self, backoff: Duration) -> Retry {
        self.initial_backoff = backoff;
        self
    }

    pub fn clamp_backoff(mut self, clamp: Duration) -> Retry {
        self.max_backoff = clamp;
        self
    }

    pub fn max_tries(mut self, tries: u32) -> Retry {
        self.max_tries = Some(tries);
        self
    }

    /// Turns the description into a stream of `()` whose consumption
    /// is delayed by the backoff schedule; awaiting `next()` on it is
    /// the unit of "one retry slot elapsed".
    pub fn into_retry_stream(self) -> impl Stream<Item = ()> {
        futures::stream::unfold((self, 0u32), |(retry, attempt)| async move {
            if let Some(max) = retry.max_tries {
                if attempt >= max {
                    return None;
                }
            }
            let backoff = retry.backoff_for_attempt(attempt);
            sleep(backoff).await;
            Some(((), (retry, attempt + 1)))
        })
    }

    fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let scaled = self.initial_backoff.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = scaled.min(self.max_backoff.as_secs_f64());
        let jittered = capped * rand::thread_rng().gen_range(0.5..1.0);
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn retry_stream_respects_max_tries() {
        let retry = Retry::default()
            .initial_backoff(Duration::from_millis(1))
            .max_tries(3)
            .into_retry_stream();
        tokio::pin!(retry);
        let mut count = 0;
        while retry.next().await.is_some() {
            count += 1;
        }
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn backoff_is_clamped() {
        let retry = Retry::default()
            .initial_backoff(Duration::from_secs(1))
            .clamp_backoff(Duration::from_millis(5));
        for attempt in 0..10 {
            assert!(retry.backoff_for_attempt(attempt) <= Duration::from_millis(5));
        }
    }
}
