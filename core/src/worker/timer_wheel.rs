use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

/// Tracks pending timer expirations for one worker.
///
/// Entries are never removed on cancellation; the owner tags each entry with a generation and
/// discards stale ones when they expire.
pub(crate) struct TimerWheel<K> {
    /// Width of one bucket (in milliseconds).
    period: u64,
    /// Start time of the `TimerWheel`.
    start_ts: Instant,
    /// Index of the next bucket to expire.
    next_bucket: u64,
    /// List of timers with their absolute deadlines (milliseconds since `start_ts`).
    timers: Vec<VecDeque<(u64, K)>>,
    /// Number of pending entries, stale ones included.
    len: usize,
    /// Pending entries per deadline, to find the earliest one.
    deadlines: BTreeMap<u64, usize>,
}

impl<K> TimerWheel<K> {
    /// Creates a new `TimerWheel` with `nb_buckets` buckets of `resolution` milliseconds each.
    pub(crate) fn new(nb_buckets: usize, resolution: u64) -> Self {
        TimerWheel {
            period: resolution.max(1),
            start_ts: Instant::now(),
            next_bucket: 0,
            timers: (0..nb_buckets.max(1)).map(|_| VecDeque::new()).collect(),
            len: 0,
            deadlines: BTreeMap::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Insert a new timer entry that expires at `deadline`.
    #[inline]
    pub(crate) fn insert(&mut self, deadline: Instant, key: K) {
        let expire_time = deadline.saturating_duration_since(self.start_ts).as_millis() as u64;
        // never schedule into a bucket that has already been swept
        let bucket = (expire_time / self.period).max(self.next_bucket);
        let timer_index = (bucket % self.timers.len() as u64) as usize;
        self.timers[timer_index].push_back((expire_time, key));
        self.len += 1;
        *self.deadlines.entry(expire_time).or_insert(0) += 1;
    }

    fn forget_deadline(&mut self, expire_time: u64) {
        if let Some(count) = self.deadlines.get_mut(&expire_time) {
            *count -= 1;
            if *count == 0 {
                self.deadlines.remove(&expire_time);
            }
        }
    }

    /// Time until the earliest pending entry is due, or `None` if no timers are pending.
    pub(crate) fn next_timeout(&self, now: Instant) -> Option<Duration> {
        let (&earliest, _) = self.deadlines.iter().next()?;
        let elapsed = now.saturating_duration_since(self.start_ts).as_millis() as u64;
        Some(Duration::from_millis(earliest.saturating_sub(elapsed)))
    }

    /// Drops every pending entry for which `keep` returns false.
    pub(crate) fn retain(&mut self, mut keep: impl FnMut(&K) -> bool) {
        let mut dropped = vec![];
        for list in self.timers.iter_mut() {
            list.retain(|(expire_time, key)| {
                let kept = keep(key);
                if !kept {
                    dropped.push(*expire_time);
                }
                kept
            });
        }
        self.len -= dropped.len();
        for expire_time in dropped {
            self.forget_deadline(expire_time);
        }
    }

    /// Removes and returns every entry whose deadline is at or before `now`.
    pub(crate) fn expire(&mut self, now: Instant) -> Vec<K> {
        let mut expired: Vec<(u64, K)> = vec![];
        if self.len == 0 {
            return Vec::new();
        }
        let period = self.period;
        let nb_buckets = self.timers.len() as u64;
        let check_time = now.saturating_duration_since(self.start_ts).as_millis() as u64;
        let last_expire_bucket = check_time / period;

        // a full revolution visits every bucket once
        let first_bucket = self
            .next_bucket
            .max(last_expire_bucket.saturating_sub(nb_buckets - 1));
        let mut not_expired: Vec<(u64, K)> = vec![];
        for expire_bucket in first_bucket..=last_expire_bucket {
            let list = &mut self.timers[(expire_bucket % nb_buckets) as usize];
            for (expire_time, key) in list.drain(..) {
                if expire_time <= check_time {
                    expired.push((expire_time, key));
                } else {
                    not_expired.push((expire_time, key));
                }
            }
        }
        self.len -= expired.len();
        for (expire_time, _) in expired.iter() {
            self.forget_deadline(*expire_time);
        }
        self.next_bucket = last_expire_bucket;
        for (expire_time, key) in not_expired.drain(..) {
            let bucket = (expire_time / period).max(self.next_bucket);
            self.timers[(bucket % nb_buckets) as usize].push_back((expire_time, key));
        }
        if !expired.is_empty() {
            log::debug!("expired {} timers, {} pending", expired.len(), self.len);
        }
        expired.into_iter().map(|(_, key)| key).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expires_in_deadline_order() {
        let mut wheel = TimerWheel::new(16, 5);
        let start = Instant::now();
        wheel.insert(start + Duration::from_millis(30), "b");
        wheel.insert(start + Duration::from_millis(10), "a");
        assert_eq!(wheel.len(), 2);

        assert!(wheel.expire(start).is_empty());
        assert_eq!(wheel.expire(start + Duration::from_millis(20)), vec!["a"]);
        assert_eq!(wheel.expire(start + Duration::from_millis(40)), vec!["b"]);
        assert_eq!(wheel.len(), 0);
        assert!(wheel.next_timeout(start).is_none());
    }

    #[test]
    fn long_timers_survive_revolutions() {
        // 4 buckets of 5ms cover 20ms per revolution
        let mut wheel = TimerWheel::new(4, 5);
        let start = Instant::now();
        wheel.insert(start + Duration::from_millis(57), 1u32);
        for step in 1..11 {
            let now = start + Duration::from_millis(step * 5);
            assert!(wheel.expire(now).is_empty(), "fired early at {}ms", step * 5);
        }
        assert_eq!(wheel.expire(start + Duration::from_millis(60)), vec![1]);
    }

    #[test]
    fn past_deadline_fires_on_next_check() {
        let mut wheel = TimerWheel::new(8, 5);
        let start = Instant::now();
        assert_eq!(wheel.expire(start + Duration::from_millis(100)), Vec::<u8>::new());
        wheel.insert(start, 7u8);
        assert_eq!(wheel.expire(start + Duration::from_millis(101)), vec![7]);
    }

    #[test]
    fn next_timeout_tracks_earliest_deadline() {
        let mut wheel = TimerWheel::new(8, 5);
        let now = Instant::now();
        wheel.insert(now + Duration::from_secs(60), 1u8);
        let timeout = wheel.next_timeout(now).unwrap();
        assert!(timeout >= Duration::from_secs(59), "woke after {:?}", timeout);

        wheel.insert(now + Duration::from_millis(20), 2u8);
        assert!(wheel.next_timeout(now).unwrap() <= Duration::from_millis(20));
        assert_eq!(wheel.expire(now + Duration::from_millis(25)), vec![2]);
        assert!(wheel.next_timeout(now).unwrap() >= Duration::from_secs(59));
    }

    #[test]
    fn retain_drops_entries_and_deadlines() {
        let mut wheel = TimerWheel::new(8, 5);
        let now = Instant::now();
        for i in 0..10u32 {
            wheel.insert(now + Duration::from_millis(10 + i as u64), i);
        }
        wheel.retain(|key| *key == 9);
        assert_eq!(wheel.len(), 1);
        assert!(wheel.next_timeout(now).unwrap() >= Duration::from_millis(18));
        assert_eq!(wheel.expire(now + Duration::from_millis(30)), vec![9]);
        assert!(wheel.next_timeout(now).is_none());
    }
}
