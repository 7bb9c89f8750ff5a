//! Reconnection backoff.
//!
//! `min(max_backoff, base * 2^min(attempt, cap) + jitter)` with a
//! sub-second random jitter so a fleet of disconnected clients does not
//! reconnect in lockstep.

use rand::Rng;
use std::time::Duration;

/// First-attempt wait.
pub const BASE_BACKOFF: Duration = Duration::from_secs(1);

/// Ceiling on the computed wait. Kept low for mobile clients.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Exponent ceiling; attempts beyond this stop growing the wait.
pub const ATTEMPT_CAP: u32 = 6;

/// Compute the wait before a client's next reconnect attempt.
#[must_use]
pub fn backoff(attempt: u32) -> Duration {
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..1000));
    backoff_with_jitter(attempt, jitter)
}

/// Deterministic core of [`backoff`]; `jitter` must stay under one second
/// for the monotonicity guarantee to hold.
#[must_use]
pub fn backoff_with_jitter(attempt: u32, jitter: Duration) -> Duration {
    let power = attempt.min(ATTEMPT_CAP);
    MAX_BACKOFF.min(BASE_BACKOFF * 2u32.pow(power) + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_monotone_up_to_the_cap() {
        let jitter = Duration::from_millis(250);
        let mut previous = Duration::ZERO;
        for attempt in 0..=ATTEMPT_CAP {
            let wait = backoff_with_jitter(attempt, jitter);
            assert!(wait > previous, "attempt {attempt} did not grow the wait");
            previous = wait;
        }
    }

    #[test]
    fn test_backoff_never_exceeds_max() {
        for attempt in 0..32 {
            assert!(backoff_with_jitter(attempt, Duration::from_millis(999)) <= MAX_BACKOFF);
        }
    }

    #[test]
    fn test_backoff_plateaus_past_the_cap() {
        let jitter = Duration::from_millis(500);
        assert_eq!(
            backoff_with_jitter(ATTEMPT_CAP, jitter),
            backoff_with_jitter(ATTEMPT_CAP + 1, jitter)
        );
        assert_eq!(backoff_with_jitter(ATTEMPT_CAP, jitter), MAX_BACKOFF);
    }

    #[test]
    fn test_first_attempts_are_exact_powers_plus_jitter() {
        let jitter = Duration::from_millis(100);
        assert_eq!(
            backoff_with_jitter(0, jitter),
            Duration::from_millis(1100)
        );
        assert_eq!(
            backoff_with_jitter(3, jitter),
            Duration::from_millis(8100)
        );
    }

    #[test]
    fn test_randomized_backoff_stays_in_band() {
        for attempt in 0..10 {
            let wait = backoff(attempt);
            let floor = BASE_BACKOFF * 2u32.pow(attempt.min(ATTEMPT_CAP));
            assert!(wait >= floor.min(MAX_BACKOFF));
            assert!(wait <= MAX_BACKOFF);
        }
    }
}
