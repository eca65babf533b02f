//! Weather records and the sources producing them.

use std::fmt::{Display, Formatter};

use nanorand::{Rng, WyRand};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default mean of the generated temperatures, in degrees Celsius.
pub const DEFAULT_MEAN: f64 = 20.0;
/// Default standard deviation of the generated temperatures.
pub const DEFAULT_STD_DEV: f64 = 5.0;

/// A calendar month, always in the range `1..=12`.
///
/// This is the group key of the aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Month(u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid month {0}, expected a value between 1 and 12")]
pub struct InvalidMonth(pub u8);

impl Month {
    pub const JANUARY: Month = Month(1);
    pub const DECEMBER: Month = Month(12);

    pub fn new(month: u8) -> Result<Self, InvalidMonth> {
        if (1..=12).contains(&month) {
            Ok(Month(month))
        } else {
            Err(InvalidMonth(month))
        }
    }

    /// The month of the `index`-th record: records cycle through the months starting from January.
    pub fn cycle(index: usize) -> Self {
        Month((index % 12) as u8 + 1)
    }

    #[inline]
    pub fn get(self) -> u8 {
        self.0
    }

    /// All the months, in calendar order.
    pub fn all() -> impl Iterator<Item = Month> {
        (1..=12).map(Month)
    }
}

impl TryFrom<u8> for Month {
    type Error = InvalidMonth;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Month::new(value)
    }
}

impl From<Month> for u8 {
    fn from(month: Month) -> Self {
        month.0
    }
}

impl Display for Month {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}", self.0)
    }
}

/// A single measurement: the month it was taken in and the temperature.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub month: Month,
    pub value: f64,
}

impl Record {
    pub fn new(month: Month, value: f64) -> Self {
        Self { month, value }
    }
}

/// Something that produces the full ordered sequence of records at the coordinator.
pub trait RecordSource {
    /// Produce `n` records.
    fn generate(&mut self, n: usize) -> Vec<Record>;
}

/// Random weather data: the month cycles from January to December and the temperature follows a
/// normal distribution.
#[derive(Debug, Clone)]
pub struct SampleSource {
    rng: WyRand,
    mean: f64,
    std_dev: f64,
}

impl SampleSource {
    /// A source with the default distribution, seeded with `seed` if provided.
    pub fn new(seed: Option<u64>) -> Self {
        Self::with_distribution(seed, DEFAULT_MEAN, DEFAULT_STD_DEV)
    }

    pub fn with_distribution(seed: Option<u64>, mean: f64, std_dev: f64) -> Self {
        let rng = match seed {
            Some(seed) => WyRand::new_seed(seed),
            None => WyRand::new(),
        };
        Self { rng, mean, std_dev }
    }

    /// Draw the next temperature.
    pub fn temperature(&mut self) -> f64 {
        self.mean + self.std_dev * self.standard_normal()
    }

    /// Uniform sample in `[0, 1)` with 53 bits of precision.
    fn uniform(&mut self) -> f64 {
        (self.rng.generate::<u64>() >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
    }

    /// Box-Muller transform.
    fn standard_normal(&mut self) -> f64 {
        // 1 - u is in (0, 1], so the logarithm is finite
        let u1 = 1.0 - self.uniform();
        let u2 = self.uniform();
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
    }
}

impl Default for SampleSource {
    fn default() -> Self {
        Self::new(None)
    }
}

impl RecordSource for SampleSource {
    fn generate(&mut self, n: usize) -> Vec<Record> {
        (0..n)
            .map(|i| Record::new(Month::cycle(i), self.temperature()))
            .collect()
    }
}

/// A source that replays a fixed list of records, mostly useful for testing.
#[derive(Debug, Clone, Default)]
pub struct FixedSource {
    records: Vec<Record>,
}

impl FixedSource {
    pub fn new(records: Vec<Record>) -> Self {
        Self { records }
    }
}

impl From<Vec<Record>> for FixedSource {
    fn from(records: Vec<Record>) -> Self {
        Self::new(records)
    }
}

impl RecordSource for FixedSource {
    /// Returns at most `n` of the stored records, in order.
    fn generate(&mut self, n: usize) -> Vec<Record> {
        self.records.iter().copied().take(n).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn month_range() {
        assert!(Month::new(0).is_err());
        assert!(Month::new(13).is_err());
        assert_eq!(Month::new(1), Ok(Month::JANUARY));
        assert_eq!(Month::new(12), Ok(Month::DECEMBER));
        assert_eq!(Month::all().count(), 12);
    }

    #[test]
    fn month_cycle() {
        assert_eq!(Month::cycle(0), Month::JANUARY);
        assert_eq!(Month::cycle(11), Month::DECEMBER);
        assert_eq!(Month::cycle(12), Month::JANUARY);
        assert_eq!(Month::cycle(25).get(), 2);
    }

    #[test]
    fn month_display_is_zero_padded() {
        assert_eq!(Month::new(3).unwrap().to_string(), "03");
        assert_eq!(Month::DECEMBER.to_string(), "12");
    }

    #[test]
    fn month_rejects_invalid_on_deserialize() {
        assert!(serde_json::from_str::<Month>("7").is_ok());
        assert!(serde_json::from_str::<Month>("13").is_err());
    }

    #[test]
    fn sample_source_shape() {
        let records = SampleSource::new(Some(42)).generate(120);
        assert_eq!(records.len(), 120);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.month, Month::cycle(i));
            assert!(record.value.is_finite());
        }
    }

    #[test]
    fn sample_source_seeded_is_deterministic() {
        let a = SampleSource::new(Some(7)).generate(50);
        let b = SampleSource::new(Some(7)).generate(50);
        assert_eq!(a, b);
    }

    #[test]
    fn sample_source_distribution() {
        let n = 20_000;
        let records = SampleSource::new(Some(1)).generate(n);
        let mean = records.iter().map(|r| r.value).sum::<f64>() / n as f64;
        let var = records.iter().map(|r| (r.value - mean).powi(2)).sum::<f64>() / n as f64;
        assert!((mean - DEFAULT_MEAN).abs() < 0.2, "mean was {mean}");
        assert!((var.sqrt() - DEFAULT_STD_DEV).abs() < 0.2, "std dev was {}", var.sqrt());
    }

    #[test]
    fn fixed_source_takes_prefix() {
        let records = vec![
            Record::new(Month::JANUARY, 1.0),
            Record::new(Month::DECEMBER, 2.0),
        ];
        let mut source = FixedSource::new(records.clone());
        assert_eq!(source.generate(10), records);
        assert_eq!(source.generate(1), records[..1]);
    }
}
