//! Per-month sum/count aggregation: the local step run by every rank and the final merge run by
//! the coordinator.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::num::NonZeroU64;

use serde::{Deserialize, Serialize};

use crate::record::{Month, Record};

/// Running sum and count of the values of a group.
///
/// An accumulator always holds at least one value: it can only be created from a value, so the
/// mean never divides by zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Accumulator {
    sum: f64,
    count: NonZeroU64,
}

impl Accumulator {
    pub fn new(value: f64) -> Self {
        Self {
            sum: value,
            count: NonZeroU64::MIN,
        }
    }

    #[inline]
    pub fn push(&mut self, value: f64) {
        self.sum += value;
        self.count = self.count.saturating_add(1);
    }

    /// Add the values of `other` to this accumulator.
    #[inline]
    pub fn combine(&mut self, other: &Accumulator) {
        self.sum += other.sum;
        self.count = self.count.saturating_add(other.count.get());
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn count(&self) -> u64 {
        self.count.get()
    }

    pub fn mean(&self) -> f64 {
        self.sum / self.count.get() as f64
    }
}

/// The sum/count per month computed by one rank over its own chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartialAggregate {
    groups: BTreeMap<Month, Accumulator>,
}

impl PartialAggregate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: &Record) {
        match self.groups.entry(record.month) {
            Entry::Occupied(mut entry) => entry.get_mut().push(record.value),
            Entry::Vacant(entry) => {
                entry.insert(Accumulator::new(record.value));
            }
        }
    }

    /// Fold the groups of `other` into this aggregate.
    pub fn combine(&mut self, other: &PartialAggregate) {
        for (&month, acc) in other.groups.iter() {
            match self.groups.entry(month) {
                Entry::Occupied(mut entry) => entry.get_mut().combine(acc),
                Entry::Vacant(entry) => {
                    entry.insert(*acc);
                }
            }
        }
    }

    pub fn get(&self, month: Month) -> Option<&Accumulator> {
        self.groups.get(&month)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Month, &Accumulator)> {
        self.groups.iter().map(|(&m, acc)| (m, acc))
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Number of records that contributed to this aggregate.
    pub fn records(&self) -> u64 {
        self.groups.values().map(Accumulator::count).sum()
    }
}

impl<'a> Extend<&'a Record> for PartialAggregate {
    fn extend<I: IntoIterator<Item = &'a Record>>(&mut self, iter: I) {
        for record in iter {
            self.push(record);
        }
    }
}

impl<'a> FromIterator<&'a Record> for PartialAggregate {
    fn from_iter<I: IntoIterator<Item = &'a Record>>(iter: I) -> Self {
        let mut aggregate = PartialAggregate::new();
        aggregate.extend(iter);
        aggregate
    }
}

/// Group the records of a chunk by month, keeping the running sum and count of each month.
///
/// This is a pure function: aggregating the same chunk twice gives the same result.
pub fn aggregate(chunk: &[Record]) -> PartialAggregate {
    chunk.iter().collect()
}

/// The merged totals of every rank, from which the mean of each month is derived.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinalAggregate {
    totals: PartialAggregate,
}

impl FinalAggregate {
    /// Mean of `month`, `None` if no record of that month was seen.
    pub fn mean(&self, month: Month) -> Option<f64> {
        self.totals.get(month).map(Accumulator::mean)
    }

    /// The mean of every month that was seen, in calendar order.
    pub fn means(&self) -> impl Iterator<Item = (Month, f64)> + '_ {
        self.totals.iter().map(|(month, acc)| (month, acc.mean()))
    }

    pub fn to_map(&self) -> BTreeMap<Month, f64> {
        self.means().collect()
    }

    pub fn totals(&self) -> &PartialAggregate {
        &self.totals
    }

    pub fn len(&self) -> usize {
        self.totals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.totals.is_empty()
    }
}

/// Combine the partial aggregates of all the ranks.
///
/// A month is present in the result only if at least one partial contributed a value to it.
pub fn merge<I>(partials: I) -> FinalAggregate
where
    I: IntoIterator<Item = PartialAggregate>,
{
    let mut totals = PartialAggregate::new();
    for partial in partials {
        totals.combine(&partial);
    }
    FinalAggregate { totals }
}

#[cfg(test)]
mod tests {
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::partition::partition;
    use crate::record::{RecordSource, SampleSource};

    fn month(m: u8) -> Month {
        Month::new(m).unwrap()
    }

    #[test]
    fn accumulator_never_empty() {
        let mut acc = Accumulator::new(3.0);
        assert_eq!(acc.count(), 1);
        acc.push(5.0);
        assert_eq!(acc.count(), 2);
        assert_eq!(acc.sum(), 8.0);
        assert_eq!(acc.mean(), 4.0);
    }

    #[test]
    fn accumulator_combine() {
        let mut a = Accumulator::new(1.0);
        a.push(2.0);
        let b = Accumulator::new(6.0);
        a.combine(&b);
        assert_eq!(a.count(), 3);
        assert_eq!(a.mean(), 3.0);
    }

    #[test]
    fn scenario_two_workers() {
        let records = vec![
            Record::new(month(1), 10.0),
            Record::new(month(1), 20.0),
            Record::new(month(2), 5.0),
        ];
        let chunks = partition(records, 2).unwrap();
        let partials: Vec<_> = chunks.iter().map(|c| aggregate(c)).collect();

        assert_eq!(partials[0].len(), 1);
        assert_eq!(partials[0].get(month(1)).unwrap().sum(), 30.0);
        assert_eq!(partials[0].get(month(1)).unwrap().count(), 2);
        assert_eq!(partials[1].len(), 1);
        assert_eq!(partials[1].get(month(2)).unwrap().sum(), 5.0);
        assert_eq!(partials[1].get(month(2)).unwrap().count(), 1);

        let result = merge(partials);
        assert_eq!(result.to_map(), BTreeMap::from([(month(1), 15.0), (month(2), 5.0)]));
    }

    #[test]
    fn empty_input() {
        let partial = aggregate(&[]);
        assert!(partial.is_empty());
        let result = merge(vec![partial.clone(), partial]);
        assert!(result.is_empty());
        assert_eq!(result.means().count(), 0);

        assert!(merge(Vec::new()).is_empty());
    }

    #[test]
    fn aggregate_is_idempotent() {
        let records = SampleSource::new(Some(3)).generate(1000);
        let a = aggregate(&records);
        let b = aggregate(&records);
        assert_eq!(a, b);
    }

    #[test]
    fn merged_keys_have_records() {
        let records = SampleSource::new(Some(5)).generate(30);
        let partials = partition(records, 8)
            .unwrap()
            .iter()
            .map(|c| aggregate(c))
            .collect::<Vec<_>>();
        let result = merge(partials);
        for (_, acc) in result.totals().iter() {
            assert!(acc.count() >= 1);
            assert!(acc.mean().is_finite());
        }
        assert_eq!(result.totals().records(), 30);
    }

    #[test]
    fn merge_equals_single_pass() {
        let mut rng = SmallRng::seed_from_u64(99);
        for _ in 0..100 {
            let len = rng.random_range(0..2000);
            let workers = rng.random_range(1..16);
            let records = SampleSource::new(Some(rng.random())).generate(len);

            let direct = merge([aggregate(&records)]);
            let partials = partition(records, workers)
                .unwrap()
                .iter()
                .map(|c| aggregate(c))
                .collect::<Vec<_>>();
            let distributed = merge(partials);

            assert_eq!(direct.len(), distributed.len());
            for ((m1, a), (m2, b)) in direct.totals().iter().zip(distributed.totals().iter()) {
                assert_eq!(m1, m2);
                assert_eq!(a.count(), b.count());
                let tolerance = 1e-9 * a.sum().abs().max(1.0);
                assert!((a.sum() - b.sum()).abs() <= tolerance);
                assert!((a.mean() - b.mean()).abs() <= 1e-9 * a.mean().abs().max(1.0));
            }
        }
    }
}
