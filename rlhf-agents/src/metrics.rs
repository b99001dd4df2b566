use std::collections::BTreeMap;

/// Exponentially smoothed diagnostics, `new = (1 - s) * value + s * old`. The first value of
/// a key seeds its average.
#[derive(Debug, Clone)]
pub struct RollingAverage {
    smoothing: f32,
    values: BTreeMap<String, f32>,
}

impl RollingAverage {
    pub fn new(smoothing: f32) -> Self {
        Self {
            smoothing,
            values: BTreeMap::new(),
        }
    }

    pub fn update(&mut self, key: &str, value: f32) -> f32 {
        let s = self.smoothing;
        let avg = self
            .values
            .entry(key.to_owned())
            .and_modify(|old| *old = (1. - s) * value + s * *old)
            .or_insert(value);
        *avg
    }

    pub fn extend<'a>(&mut self, metrics: impl IntoIterator<Item = (&'a str, f32)>) {
        for (key, value) in metrics {
            self.update(key, value);
        }
    }

    pub fn get(&self, key: &str) -> Option<f32> {
        self.values.get(key).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f32)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }
}
