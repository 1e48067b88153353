use crate::models::{FactorCategory, FactorMap, Impact};

/// Monotonic transform from a raw feature value to a 0–1 risk score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Normalizer {
    /// Linear over `[min, max]`; higher raw values mean lower risk.
    InvertedLinear { min: f64, max: f64 },
    /// Counts saturating at `cap`; higher counts mean lower risk.
    InvertedSaturating { cap: f64 },
    /// Counts saturating at `cap`; higher counts mean higher risk.
    DirectSaturating { cap: f64 },
}

impl Normalizer {
    pub fn apply(&self, raw: f64) -> f64 {
        let score = match *self {
            Normalizer::InvertedLinear { min, max } => {
                if max <= min {
                    return 0.0;
                }
                1.0 - (raw - min) / (max - min)
            }
            Normalizer::InvertedSaturating { cap } => {
                if cap <= 0.0 {
                    return 0.0;
                }
                1.0 - raw.max(0.0).min(cap) / cap
            }
            Normalizer::DirectSaturating { cap } => {
                if cap <= 0.0 {
                    return 0.0;
                }
                raw.max(0.0).min(cap) / cap
            }
        };
        score.clamp(0.0, 1.0)
    }

    pub fn impact(&self) -> Impact {
        match self {
            Normalizer::InvertedLinear { .. } | Normalizer::InvertedSaturating { .. } => {
                Impact::Negative
            }
            Normalizer::DirectSaturating { .. } => Impact::Positive,
        }
    }
}

pub type NormalizerSet = FactorMap<Normalizer>;

pub fn default_normalizers() -> NormalizerSet {
    FactorMap::from_fn(|category| match category {
        FactorCategory::FirstSessionSatisfaction => {
            Normalizer::InvertedLinear { min: 1.0, max: 5.0 }
        }
        FactorCategory::SessionsCompleted => Normalizer::InvertedSaturating { cap: 12.0 },
        FactorCategory::FollowUpBookingRate => Normalizer::InvertedLinear { min: 0.0, max: 1.0 },
        FactorCategory::AvgSessionScore => Normalizer::InvertedLinear { min: 0.0, max: 10.0 },
        FactorCategory::TutorConsistency => Normalizer::InvertedLinear { min: 0.0, max: 1.0 },
        FactorCategory::StudentEngagement => Normalizer::InvertedLinear { min: 0.0, max: 10.0 },
        FactorCategory::TutorSwitchFrequency => Normalizer::DirectSaturating { cap: 4.0 },
        FactorCategory::SchedulingFriction => Normalizer::DirectSaturating { cap: 6.0 },
        FactorCategory::ResponseRate => Normalizer::InvertedLinear { min: 0.0, max: 1.0 },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn satisfaction_is_inverted() {
        let normalizers = default_normalizers();
        let satisfaction = normalizers[FactorCategory::FirstSessionSatisfaction];
        assert_eq!(satisfaction.apply(5.0), 0.0);
        assert_eq!(satisfaction.apply(1.0), 1.0);
        assert_eq!(satisfaction.apply(3.0), 0.5);
        assert_eq!(satisfaction.impact(), Impact::Negative);
    }

    #[test]
    fn counts_saturate() {
        let normalizers = default_normalizers();
        let sessions = normalizers[FactorCategory::SessionsCompleted];
        assert_eq!(sessions.apply(0.0), 1.0);
        assert_eq!(sessions.apply(6.0), 0.5);
        assert_eq!(sessions.apply(40.0), 0.0);

        let switches = normalizers[FactorCategory::TutorSwitchFrequency];
        assert_eq!(switches.apply(0.0), 0.0);
        assert_eq!(switches.apply(2.0), 0.5);
        assert_eq!(switches.apply(9.0), 1.0);
        assert_eq!(switches.impact(), Impact::Positive);
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        let rate = Normalizer::InvertedLinear { min: 0.0, max: 1.0 };
        assert_eq!(rate.apply(1.4), 0.0);
        assert_eq!(rate.apply(-0.3), 1.0);
    }

    #[test]
    fn degenerate_ranges_score_zero() {
        assert_eq!(Normalizer::InvertedLinear { min: 2.0, max: 2.0 }.apply(2.0), 0.0);
        assert_eq!(Normalizer::DirectSaturating { cap: 0.0 }.apply(3.0), 0.0);
    }

    #[test]
    fn transforms_are_monotonic() {
        for (category, normalizer) in default_normalizers().iter() {
            let mut previous = normalizer.apply(-1.0);
            for step in 0..=60 {
                let score = normalizer.apply(step as f64 * 0.25);
                match normalizer.impact() {
                    Impact::Negative => assert!(score <= previous, "{category} rose"),
                    Impact::Positive => assert!(score >= previous, "{category} fell"),
                }
                previous = score;
            }
        }
    }
}
