use chrono::Utc;
use proptest::prelude::*;
use uuid::Uuid;

use vulnscan_core::{aggregate, Finding, Location, Severity, SeveritySummary};

fn finding(severity: Severity, n: usize) -> Finding {
    Finding {
        id: Uuid::new_v4(),
        scan_job_id: Uuid::nil(),
        repository_id: "repo".to_string(),
        unit_id: format!("src/f{}.rs", n),
        severity,
        category: "Injection".to_string(),
        location: Location {
            file: format!("src/f{}.rs", n),
            line: Some(n as u32),
        },
        description: String::new(),
        detected_at: Utc::now(),
        raw_severity: severity.as_str().to_string(),
        needs_review: false,
        cwe: None,
        owasp: None,
        recommendation: None,
        original_code: None,
        fix_code: None,
        compliance_impact: None,
        fingerprint: String::new(),
    }
}

fn findings_strategy() -> impl Strategy<Value = Vec<Finding>> {
    prop::collection::vec(prop::sample::select(Severity::ALL.to_vec()), 0..64).prop_map(
        |severities| {
            severities
                .into_iter()
                .enumerate()
                .map(|(i, s)| finding(s, i))
                .collect()
        },
    )
}

proptest! {
    #[test]
    fn total_is_sum_of_severities(findings in findings_strategy()) {
        let s = aggregate(&findings);
        prop_assert_eq!(s.total, s.critical + s.high + s.medium + s.low);
        prop_assert_eq!(s.total as usize, findings.len());
        for severity in Severity::ALL {
            let expected = findings.iter().filter(|f| f.severity == severity).count() as u64;
            prop_assert_eq!(s.count(severity), expected);
        }
    }

    #[test]
    fn aggregate_is_idempotent_and_order_independent(findings in findings_strategy()) {
        let first = aggregate(&findings);
        prop_assert_eq!(first, aggregate(&findings));

        let mut reversed = findings.clone();
        reversed.reverse();
        prop_assert_eq!(first, aggregate(&reversed));
    }

    #[test]
    fn splitting_and_adding_matches_whole(findings in findings_strategy(), cut in 0usize..64) {
        let cut = cut.min(findings.len());
        let (left, right) = findings.split_at(cut);
        let sum: SeveritySummary = aggregate(left) + aggregate(right);
        prop_assert_eq!(sum, aggregate(&findings));
    }
}
