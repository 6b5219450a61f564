use std::time::Duration;

/// Resubscribes allowed without a single successful subscription before aborting.
pub const ABORT_AFTER_RESUBSCRIBES: u32 = 10;

/// Delay before the next resubscribe attempt.
pub fn throttle_interval(resubscribes: u32) -> Duration {
    match resubscribes {
        0..=9 => Duration::ZERO,
        10..=99 => Duration::from_secs(1),
        _ => Duration::from_secs(60),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttle_steps() {
        assert_eq!(throttle_interval(0), Duration::ZERO);
        assert_eq!(throttle_interval(9), Duration::ZERO);
        assert_eq!(throttle_interval(10), Duration::from_millis(1_000));
        assert_eq!(throttle_interval(99), Duration::from_millis(1_000));
        assert_eq!(throttle_interval(100), Duration::from_millis(60_000));
        assert_eq!(throttle_interval(u32::MAX), Duration::from_millis(60_000));
    }
}
