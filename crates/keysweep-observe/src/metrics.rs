use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.inc_by(1);
    }

    pub fn inc_by(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn add(&self, delta: u64) -> u64 {
        self.0.fetch_add(delta, Ordering::Relaxed).wrapping_add(delta)
    }

    pub fn sub(&self, delta: u64) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(delta))
            });
    }

    /// Raises the gauge to `value` if it is below it.
    pub fn max(&self, value: u64) {
        let mut prev = self.0.load(Ordering::Relaxed);
        while value > prev {
            match self
                .0
                .compare_exchange_weak(prev, value, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(next) => prev = next,
            }
        }
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauge_sub_saturates_at_zero() {
        let g = Gauge::default();
        g.set(3);
        g.sub(5);
        assert_eq!(g.get(), 0);
    }

    #[test]
    fn gauge_max_only_raises() {
        let g = Gauge::default();
        g.max(7);
        g.max(4);
        assert_eq!(g.get(), 7);
    }
}
