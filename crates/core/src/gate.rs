use crate::domain::snapshot::{Coverage, Dimension};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DqThresholds {
    pub schedule: u8,
    pub price: u8,
    pub eps_rev: u8,
}

impl Default for DqThresholds {
    fn default() -> Self {
        Self::for_environment("development")
    }
}

impl DqThresholds {
    /// Production holds EPS/revenue to 90%; every other environment to 10%.
    pub fn for_environment(app_env: &str) -> Self {
        let eps_rev = if app_env.eq_ignore_ascii_case("production") {
            90
        } else {
            10
        };
        Self {
            schedule: 0,
            price: 98,
            eps_rev,
        }
    }

    pub fn get(&self, dimension: Dimension) -> u8 {
        match dimension {
            Dimension::Schedule => self.schedule,
            Dimension::Price => self.price,
            Dimension::EpsRev => self.eps_rev,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateDecision {
    pub schedule: bool,
    pub price: bool,
    pub eps_rev: bool,
}

impl GateDecision {
    pub fn passed(&self) -> bool {
        self.schedule && self.price && self.eps_rev
    }
}

pub fn evaluate(coverage: &Coverage, thresholds: &DqThresholds) -> GateDecision {
    let meets = |d: Dimension| coverage.get(d) >= thresholds.get(d);
    let decision = GateDecision {
        schedule: meets(Dimension::Schedule),
        price: meets(Dimension::Price),
        eps_rev: meets(Dimension::EpsRev),
    };

    tracing::info!(
        schedule = coverage.schedule,
        schedule_min = thresholds.schedule,
        schedule_ok = decision.schedule,
        price = coverage.price,
        price_min = thresholds.price,
        price_ok = decision.price,
        eps_rev = coverage.eps_rev,
        eps_rev_min = thresholds.eps_rev,
        eps_rev_ok = decision.eps_rev,
        publish = decision.passed(),
        "dq gate evaluated"
    );

    decision
}

pub fn should_publish(coverage: &Coverage, thresholds: &DqThresholds) -> bool {
    evaluate(coverage, thresholds).passed()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cov(schedule: u8, price: u8, eps_rev: u8) -> Coverage {
        Coverage {
            schedule,
            price,
            eps_rev,
        }
    }

    const STRICT: DqThresholds = DqThresholds {
        schedule: 0,
        price: 98,
        eps_rev: 90,
    };

    #[test]
    fn passes_when_all_dimensions_meet_thresholds() {
        assert!(should_publish(&cov(0, 99, 95), &STRICT));
        assert!(should_publish(&cov(0, 98, 90), &STRICT));
    }

    #[test]
    fn single_dimension_below_threshold_fails() {
        assert!(!should_publish(&cov(0, 97, 95), &STRICT));
        assert!(!should_publish(&cov(100, 100, 89), &STRICT));

        let t = DqThresholds {
            schedule: 50,
            price: 50,
            eps_rev: 50,
        };
        assert!(should_publish(&cov(50, 50, 50), &t));
        for d in Dimension::ALL {
            let mut c = cov(100, 100, 100);
            match d {
                Dimension::Schedule => c.schedule = 49,
                Dimension::Price => c.price = 49,
                Dimension::EpsRev => c.eps_rev = 49,
            }
            let decision = evaluate(&c, &t);
            assert!(!decision.passed(), "{d} below threshold must fail");
        }
    }

    #[test]
    fn not_an_average() {
        // Mean is well above every threshold, but price misses.
        assert!(!should_publish(&cov(100, 97, 100), &STRICT));
    }

    #[test]
    fn environment_thresholds() {
        assert_eq!(DqThresholds::for_environment("production").eps_rev, 90);
        assert_eq!(DqThresholds::for_environment("staging").eps_rev, 10);
        assert_eq!(DqThresholds::default().price, 98);
    }
}
