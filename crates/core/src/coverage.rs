use crate::domain::snapshot::{Coverage, DailySnapshot, Dimension};
use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet};

/// Tickers removed from a dimension's eligible set for the current run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExclusionSet {
    by_dimension: BTreeMap<Dimension, BTreeSet<String>>,
}

impl ExclusionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built from the records' `not_found` provenance flags.
    pub fn from_snapshot(snapshot: &DailySnapshot) -> Self {
        let mut out = Self::new();
        for record in snapshot.records.values() {
            for dimension in &record.not_found {
                out.exclude(*dimension, &record.ticker);
            }
        }
        out
    }

    pub fn exclude(&mut self, dimension: Dimension, ticker: &str) {
        self.by_dimension
            .entry(dimension)
            .or_default()
            .insert(ticker.to_string());
    }

    pub fn is_excluded(&self, dimension: Dimension, ticker: &str) -> bool {
        self.by_dimension
            .get(&dimension)
            .is_some_and(|set| set.contains(ticker))
    }

    pub fn len(&self, dimension: Dimension) -> usize {
        self.by_dimension.get(&dimension).map_or(0, BTreeSet::len)
    }
}

/// `round(100 * satisfying / eligible)`, rounding half up; 0 when nothing is eligible.
pub fn percentage(satisfying: usize, eligible: usize) -> u8 {
    if eligible == 0 {
        return 0;
    }
    let satisfying = satisfying.min(eligible) as u64;
    let eligible = eligible as u64;
    ((200 * satisfying + eligible) / (2 * eligible)) as u8
}

pub fn compute(day: NaiveDate, snapshot: &DailySnapshot, exclusions: &ExclusionSet) -> Coverage {
    let mut pct = [0u8; 3];
    for (slot, dimension) in Dimension::ALL.into_iter().enumerate() {
        let mut eligible = 0usize;
        let mut satisfying = 0usize;
        for record in snapshot.records.values() {
            if exclusions.is_excluded(dimension, &record.ticker) {
                continue;
            }
            eligible += 1;
            if record.satisfies(dimension) {
                satisfying += 1;
            }
        }
        pct[slot] = percentage(satisfying, eligible);

        tracing::debug!(
            %day,
            dimension = dimension.as_str(),
            eligible,
            satisfying,
            excluded = exclusions.len(dimension),
            coverage = pct[slot],
            "coverage computed"
        );
    }

    Coverage {
        schedule: pct[0],
        price: pct[1],
        eps_rev: pct[2],
    }
}
