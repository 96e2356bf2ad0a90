use std::time;

use rand::Rng;

/// Exponential reconnect backoff with additive jitter.
///
/// The first failure waits `floor`, each following failure doubles the wait up to `max`, and
/// a successful connect resets it to `floor`. Every delay gets up to `jitter` added on top so
/// that restarted clients do not reconnect in lockstep.
#[derive(Clone, Debug)]
pub struct ReconnectBackoff {
    /// The wait before the first reconnect attempt.
    floor: time::Duration,
    /// The largest wait before any attempt, jitter excluded.
    max: time::Duration,
    /// Upper bound of the random delay added to each wait.
    jitter: time::Duration,
    /// The wait to use for the next failure.
    current: time::Duration,
}

impl ReconnectBackoff {
    pub fn new(floor: time::Duration, max: time::Duration, jitter: time::Duration) -> Self {
        let max = std::cmp::max(floor, max);
        Self {
            floor,
            max,
            jitter,
            current: floor,
        }
    }

    /// Wait before the next attempt, without jitter, and advance the schedule.
    pub fn next_base_delay(&mut self) -> time::Duration {
        let delay = self.current;
        self.current = std::cmp::min(self.current.saturating_mul(2), self.max);
        delay
    }

    /// Wait before the next attempt including jitter, and advance the schedule.
    pub fn next_delay(&mut self) -> time::Duration {
        let base = self.next_base_delay();
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return base;
        }

        base + time::Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
    }

    /// Back to the floor, after a successful connect.
    pub fn reset(&mut self) {
        self.current = self.floor;
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new(
            time::Duration::from_secs(1),
            time::Duration::from_secs(60),
            time::Duration::from_millis(300),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_double_up_to_the_cap() {
        let mut backoff = ReconnectBackoff::default();

        let delays: Vec<u64> = (0..9)
            .map(|_| backoff.next_base_delay().as_millis() as u64)
            .collect();

        assert_eq!(
            delays,
            vec![1000, 2000, 4000, 8000, 16000, 32000, 60000, 60000, 60000]
        );
    }

    #[test]
    fn test_delay_k_is_floor_times_two_to_the_k() {
        let floor = time::Duration::from_millis(250);
        let max = time::Duration::from_secs(30);
        let mut backoff = ReconnectBackoff::new(floor, max, time::Duration::ZERO);

        for k in 0..12u32 {
            let expected = std::cmp::min(floor * 2u32.pow(k), max);
            assert_eq!(backoff.next_delay(), expected, "attempt {}", k);
        }
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let mut backoff = ReconnectBackoff::default();

        for k in 0..10u32 {
            let base = std::cmp::min(
                time::Duration::from_secs(1) * 2u32.pow(k),
                time::Duration::from_secs(60),
            );
            let delay = backoff.next_delay();
            assert!(delay >= base, "attempt {}: {:?} < {:?}", k, delay, base);
            assert!(
                delay < base + time::Duration::from_millis(300),
                "attempt {}: {:?} outside jitter band",
                k,
                delay
            );
        }
    }

    #[test]
    fn test_reset_returns_to_floor() {
        let mut backoff = ReconnectBackoff::default();
        backoff.next_delay();
        backoff.next_delay();
        backoff.next_delay();

        backoff.reset();

        let delay = backoff.next_delay();
        assert!(delay >= time::Duration::from_millis(1000));
        assert!(delay < time::Duration::from_millis(1300));
    }
}
