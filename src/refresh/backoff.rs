use rand::Rng;
use std::time::Duration;

/// `min(base × 2^(failures−1), cap)`; zero failures means no delay.
pub fn backoff_delay(failures: u32, base: Duration, cap: Duration) -> Duration {
    if failures == 0 {
        return Duration::ZERO;
    }
    let exp = (failures - 1).min(31);
    base.checked_mul(1u32 << exp).unwrap_or(cap).min(cap)
}

/// Adds up to 10% random jitter so retries for many games don't align.
pub fn with_jitter(delay: Duration) -> Duration {
    let frac: f64 = rand::thread_rng().gen_range(0.0..=0.1);
    delay + delay.mul_f64(frac)
}

/// Delay before the next attempt: jittered backoff, unless the upstream
/// asked for a longer wait.
pub fn next_delay(
    failures: u32,
    base: Duration,
    cap: Duration,
    retry_after: Option<Duration>,
) -> Duration {
    let delay = with_jitter(backoff_delay(failures, base, cap));
    match retry_after {
        Some(hint) if hint > delay => hint,
        _ => delay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_millis(1_000);
    const CAP: Duration = Duration::from_millis(30_000);

    #[test]
    fn test_backoff_doubles_until_cap() {
        assert_eq!(backoff_delay(0, BASE, CAP), Duration::ZERO);
        assert_eq!(backoff_delay(1, BASE, CAP), Duration::from_secs(1));
        assert_eq!(backoff_delay(2, BASE, CAP), Duration::from_secs(2));
        assert_eq!(backoff_delay(5, BASE, CAP), Duration::from_secs(16));
        assert_eq!(backoff_delay(6, BASE, CAP), CAP);
        assert_eq!(backoff_delay(500, BASE, CAP), CAP);
    }

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        for _ in 0..100 {
            let d = with_jitter(Duration::from_secs(10));
            assert!(d >= Duration::from_secs(10));
            assert!(d <= Duration::from_secs(11));
        }
    }

    #[test]
    fn test_longer_retry_after_wins() {
        let d = next_delay(1, BASE, CAP, Some(Duration::from_secs(20)));
        assert_eq!(d, Duration::from_secs(20));
        let d = next_delay(3, BASE, CAP, Some(Duration::from_millis(10)));
        assert!(d >= Duration::from_secs(4));
    }
}
