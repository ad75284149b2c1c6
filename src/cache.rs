use std::time::{Duration, Instant};

/// A single cached value that goes stale after `ttl`.
#[derive(Debug, Clone)]
pub struct TtlCache<T> {
    ttl: Duration,
    entry: Option<(Instant, T)>,
}

impl<T> TtlCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, entry: None }
    }

    pub fn fresh(&self) -> Option<&T> {
        self.fresh_at(Instant::now())
    }

    fn fresh_at(&self, now: Instant) -> Option<&T> {
        match &self.entry {
            Some((fetched_at, value)) if now.saturating_duration_since(*fetched_at) < self.ttl => {
                Some(value)
            }
            _ => None,
        }
    }

    pub fn store(&mut self, value: T) {
        self.entry = Some((Instant::now(), value));
    }

    pub fn invalidate(&mut self) {
        self.entry = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_is_served_until_it_expires() {
        let mut cache = TtlCache::new(Duration::from_secs(300));
        assert!(cache.fresh().is_none());

        cache.store(vec![1, 2, 3]);
        assert_eq!(cache.fresh(), Some(&vec![1, 2, 3]));

        let later = Instant::now() + Duration::from_secs(301);
        assert!(cache.fresh_at(later).is_none());
    }

    #[test]
    fn zero_ttl_is_always_stale() {
        let mut cache = TtlCache::new(Duration::ZERO);
        cache.store("feed");
        assert!(cache.fresh().is_none());
    }

    #[test]
    fn invalidate_forces_a_refetch() {
        let mut cache = TtlCache::new(Duration::from_secs(10));
        cache.store(5u32);
        cache.invalidate();
        assert!(cache.fresh().is_none());
    }
}
