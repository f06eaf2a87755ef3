//! Single-pass mean and variance (Welford's algorithm).

/// Running statistics over a stream of values.
///
/// Numerically stable for long windows; `variance` is the sample variance
/// (n - 1 denominator) and is zero until two values have been seen.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
}

impl RunningStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    /// Rebuild from persisted `(count, mean, m2)`.
    pub fn from_parts(count: u64, mean: f64, m2: f64) -> Self {
        if count == 0 {
            return Self::default();
        }
        Self {
            count,
            mean,
            m2: m2.max(0.0),
        }
    }

    pub fn m2(&self) -> f64 {
        self.m2
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        (self.m2 / (self.count - 1) as f64).max(0.0)
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Combine two disjoint runs (Chan et al. parallel update).
    pub fn merge(&mut self, other: &RunningStats) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        let n = self.count + other.count;
        let delta = other.mean - self.mean;
        let mean = self.mean + delta * other.count as f64 / n as f64;
        let m2 = self.m2
            + other.m2
            + delta * delta * (self.count as f64 * other.count as f64) / n as f64;
        self.count = n;
        self.mean = mean;
        self.m2 = m2;
    }
}

impl FromIterator<f64> for RunningStats {
    fn from_iter<I: IntoIterator<Item = f64>>(iter: I) -> Self {
        let mut stats = RunningStats::new();
        for v in iter {
            stats.push(v);
        }
        stats
    }
}
