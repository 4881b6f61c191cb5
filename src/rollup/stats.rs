use serde::{Deserialize, Serialize};

/// Running aggregate of a set of observations
///
/// `m2` is the sum of squared deviations from the mean, which makes two
/// aggregates mergeable without keeping the raw values around. Merging the
/// rollups of two halves gives the same result as aggregating all samples
/// at once (up to float rounding).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RollupStats {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub m2: f64,
}

impl RollupStats {
    pub fn single(value: f64) -> Self {
        Self {
            count: 1,
            sum: value,
            min: value,
            max: value,
            m2: 0.0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    /// Population variance
    pub fn variance(&self) -> Option<f64> {
        (self.count > 0).then(|| (self.m2 / self.count as f64).max(0.0))
    }

    pub fn stddev(&self) -> Option<f64> {
        self.variance().map(f64::sqrt)
    }

    /// Whether this aggregate can be fed into a stage
    pub fn is_valid(&self) -> bool {
        self.count > 0
            && self.sum.is_finite()
            && self.min.is_finite()
            && self.max.is_finite()
            && self.m2.is_finite()
            && self.min <= self.max
            && self.m2 >= -1e-9
    }

    pub fn merge(&mut self, other: &RollupStats) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }

        let n_a = self.count as f64;
        let n_b = other.count as f64;
        let n = n_a + n_b;
        let delta = other.sum / n_b - self.sum / n_a;

        self.m2 += other.m2 + delta * delta * n_a * n_b / n;
        self.count += other.count;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }
}

impl FromIterator<f64> for RollupStats {
    fn from_iter<T: IntoIterator<Item = f64>>(iter: T) -> Self {
        let mut stats = RollupStats::default();
        for value in iter {
            stats.merge(&RollupStats::single(value));
        }
        stats
    }
}
