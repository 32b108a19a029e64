use std::sync::atomic::{AtomicI64, Ordering};
use time::OffsetDateTime;

/// Wall clock that never hands out the same (or an older) reading twice.
///
/// Used for snapshot timestamps and restart annotations, where two readings
/// taken in the same millisecond must still compare strictly. The last
/// reading is kept in nanoseconds whichever accessor produced it, so both
/// accessors may be mixed on one instance.
#[derive(Debug, Default)]
pub struct StrictClock {
    last_nanos: AtomicI64,
}

const NANOS_PER_MILLI: i64 = 1_000_000;

impl StrictClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Milliseconds since the Unix epoch, strictly greater than the previous call.
    pub fn next_millis(&self) -> i64 {
        let now = now_nanos() / NANOS_PER_MILLI * NANOS_PER_MILLI;
        let nanos = self.advance(|last| {
            now.max((last.div_euclid(NANOS_PER_MILLI) + 1) * NANOS_PER_MILLI)
        });
        nanos / NANOS_PER_MILLI
    }

    /// Nanosecond reading as a UTC datetime, strictly later than the previous call.
    pub fn next_datetime(&self) -> OffsetDateTime {
        let now = now_nanos();
        let nanos = self.advance(|last| now.max(last + 1));
        OffsetDateTime::from_unix_timestamp_nanos(nanos as i128)
            .unwrap_or_else(|_| OffsetDateTime::now_utc())
    }

    fn advance(&self, next_after: impl Fn(i64) -> i64) -> i64 {
        let mut current = self.last_nanos.load(Ordering::Relaxed);
        loop {
            let next = next_after(current);
            match self
                .last_nanos
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(observed) => current = observed,
            }
        }
    }
}

fn now_nanos() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp_nanos() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millis_strictly_increase() {
        let clock = StrictClock::new();
        let mut previous = clock.next_millis();
        for _ in 0..1000 {
            let next = clock.next_millis();
            assert!(next > previous);
            previous = next;
        }
    }

    #[test]
    fn datetimes_strictly_increase() {
        let clock = StrictClock::new();
        let a = clock.next_datetime();
        let b = clock.next_datetime();
        assert!(b > a);
    }

    #[test]
    fn mixed_readings_stay_in_one_unit() {
        let clock = StrictClock::new();
        let first = clock.next_millis();
        let at = clock.next_datetime();
        let second = clock.next_millis();

        let at_millis = (at.unix_timestamp_nanos() / 1_000_000) as i64;
        assert!(at_millis >= first);
        assert!(second > at_millis);
        assert!(second > first);
        // a millisecond reading is a plausible epoch value, not a nanosecond count
        assert!(second < first + 60_000);
    }
}
