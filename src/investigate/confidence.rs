//! Report confidence: Bayesian log-odds updates and acceptance.

use crate::model::InvestigationReport;

const EPS: f64 = 1e-9;

fn logit(p: f64) -> f64 {
    (p / (1.0 - p)).ln()
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Fold one evidence item into a report's confidence.
///
/// `support` is the probability the item assigns to the hypothesis: 0.5 is
/// neutral, below 0.5 lowers confidence. Missing support counts as neutral.
/// Priors of exactly 0 or 1 are absorbing.
pub fn update(prior: f64, support: Option<f64>) -> f64 {
    let prior = prior.clamp(0.0, 1.0);
    if prior <= 0.0 || prior >= 1.0 {
        return prior;
    }
    let support = match support {
        Some(s) if s.is_finite() => s.clamp(EPS, 1.0 - EPS),
        _ => return prior,
    };
    sigmoid(logit(prior) + logit(support)).clamp(0.0, 1.0)
}

/// The report that drives resolution: highest confidence strictly above
/// `threshold`, earliest `created_at` on ties.
pub fn select_accepted(reports: &[InvestigationReport], threshold: f64) -> Option<&InvestigationReport> {
    reports
        .iter()
        .filter(|r| r.confidence > threshold)
        .min_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| a.created_at.cmp(&b.created_at))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use proptest::prelude::*;
    use uuid::Uuid;

    fn report(confidence: f64, offset_sec: i64) -> InvestigationReport {
        InvestigationReport {
            report_id: Uuid::new_v4(),
            incident_id: Uuid::nil(),
            investigator_id: "tool".into(),
            hypothesis: "h".into(),
            confidence,
            created_at: Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap() + Duration::seconds(offset_sec),
            accepted_at: None,
        }
    }

    #[test]
    fn test_update_direction() {
        assert!(update(0.6, Some(0.8)) > 0.6);
        assert!(update(0.6, Some(0.2)) < 0.6);
        assert!((update(0.6, Some(0.5)) - 0.6).abs() < 1e-12);
        assert_eq!(update(0.6, None), 0.6);
        assert_eq!(update(0.0, Some(0.99)), 0.0);
    }

    #[test]
    fn test_update_is_bayes_rule() {
        // prior odds 1:1, likelihood ratio 3:1 -> posterior 0.75
        assert!((update(0.5, Some(0.75)) - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_selection_threshold_is_strict() {
        let reports = vec![report(0.7, 0), report(0.65, 1)];
        assert!(select_accepted(&reports, 0.7).is_none());
        assert_eq!(select_accepted(&reports, 0.6).unwrap().confidence, 0.7);
    }

    #[test]
    fn test_selection_ties_go_to_earliest() {
        let reports = vec![report(0.9, 5), report(0.9, 1), report(0.8, 0)];
        let chosen = select_accepted(&reports, 0.5).unwrap();
        assert_eq!(chosen.report_id, reports[1].report_id);
    }

    proptest! {
        #[test]
        fn prop_update_stays_in_unit_interval(prior in 0.0f64..=1.0, support in -1.0f64..2.0) {
            let c = update(prior, Some(support));
            prop_assert!((0.0..=1.0).contains(&c));
        }
    }
}
