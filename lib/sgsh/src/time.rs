use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds elapsed since 1970-01-01, used to stamp ingested data.
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("System clock predates the epoch")
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamps_are_monotonic_enough() {
        let first = timestamp_secs();
        let second = timestamp_secs();
        assert!(second >= first);
    }
}
