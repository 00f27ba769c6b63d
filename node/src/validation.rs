//! Admission checks run before any session exists.

use crate::errors::SurveyError;
use crate::models::{SurveyQuery, Thresholds};
use crate::operations::{operation_for, OBFUSCATION_OPERATIONS};
use std::collections::{BTreeMap, BTreeSet};
use survey_zk::proofs::ProofCategory;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub violations: Vec<String>,
}

impl ValidationReport {
    pub fn ok(&self) -> bool {
        self.violations.is_empty()
    }

    fn fail(&mut self, msg: impl Into<String>) {
        self.violations.push(msg.into());
    }

    pub fn into_result(self) -> Result<(), SurveyError> {
        if self.ok() {
            Ok(())
        } else {
            Err(SurveyError::Validation(self.violations))
        }
    }
}

/// Check that the query's declared parameters are mutually consistent.
pub fn validate(survey: &SurveyQuery, diffp_enabled: bool) -> ValidationReport {
    let mut report = ValidationReport::default();
    let q = &survey.query;
    let t = &survey.thresholds;

    let output_width = match operation_for(&q.operation) {
        Ok(op) => {
            if q.selector.len() != op.input_width() {
                report.fail(format!(
                    "selector has {} columns, {} expects {}",
                    q.selector.len(),
                    op.name(),
                    op.input_width()
                ));
            }
            if diffp_enabled && op.zero_test_only() {
                report.fail(format!("differential privacy noise would hide the zero test of {}", op.name()));
            }
            Some(op.output_width())
        }
        Err(e) => {
            report.fail(e.to_string());
            None
        }
    };

    let unique: BTreeSet<_> = q.groups.iter().collect();
    if unique.len() != q.groups.len() {
        report.fail("duplicate group keys");
    }

    if q.proofs.enabled() {
        if q.ranges.is_empty() {
            report.fail("proofs but no range");
        }
        let all_unchecked = q.ranges.iter().all(|r| r.is_unchecked());
        if q.signatures.is_empty() && !all_unchecked {
            report.fail("proofs but no signatures");
        }
        if all_unchecked && !q.signatures.is_empty() {
            report.fail("ranges unchecked but signatures set");
        }
        if let Some(width) = output_width {
            if q.ranges.len() != width || q.signatures.iter().any(|row| row.len() != width) {
                report.fail(format!("ranges or signatures length do not match output width {width}"));
            }
        }
        if q.signatures.iter().flatten().any(|s| hex::decode(s).is_err()) {
            report.fail("signatures must be hex encoded");
        }
        for r in q.ranges.iter().filter(|r| !r.is_unchecked()) {
            if let Err(e) = r.max_value() {
                report.fail(e.to_string());
            }
        }
        if q.verifiers.is_empty() {
            report.fail("proofs but no verifying node roster");
        }
        for c in ProofCategory::ALL {
            if t.get(c) as usize > q.verifiers.len() {
                report.fail(format!("{c} threshold {} exceeds {} verifying nodes", t.get(c), q.verifiers.len()));
            }
        }

        if q.obfuscation {
            if t.obfuscation == 0 {
                report.fail("obfuscation threshold is 0 while obfuscation is requested");
            }
            if !q.ranges.iter().all(|r| r.is_bit()) {
                report.fail("obfuscation with proofs requires single-bit ranges");
            }
        } else if t.obfuscation != 0 {
            report.fail("obfuscation threshold is set without obfuscation");
        }
    } else {
        if !t.all_zero() {
            report.fail("no proofs and one of the thresholds is not 0");
        }
        if !q.ranges.is_empty() || !q.signatures.is_empty() {
            report.fail("no proofs and some ranges or signatures");
        }
        if !q.verifiers.is_empty() {
            report.fail("no proofs but verifying node roster");
        }
    }

    if q.obfuscation && !OBFUSCATION_OPERATIONS.contains(&q.operation.name.as_str()) {
        report.fail(format!("obfuscation not supported for {}", q.operation.name));
    }

    let dp = &q.diffp;
    if diffp_enabled {
        if dp.limit == 0.0 || dp.quanta == 0.0 || dp.scale == 0.0 || dp.noise_list_size == 0 || dp.lap_scale == 0.0 {
            report.fail("differential privacy requires limit, quanta, scale, noise list size and laplace scale");
        }
    } else if dp.enabled() {
        report.fail("no differential privacy but parameters are not 0");
    }

    report
}

/// Number of proofs each category expects for this survey.
pub fn required_proof_counts(survey: &SurveyQuery) -> BTreeMap<ProofCategory, usize> {
    let q = &survey.query;
    let (dps, cns) = if q.proofs.enabled() {
        (survey.data_provider_count(), survey.computing_nodes.len())
    } else {
        (0, 0)
    };

    let checked = q.ranges.iter().any(|r| !r.is_unchecked());

    BTreeMap::from([
        (ProofCategory::Range, if checked { dps } else { 0 }),
        (ProofCategory::Shuffle, if q.diffp.enabled() { cns } else { 0 }),
        (ProofCategory::Aggregation, cns),
        (ProofCategory::Obfuscation, if q.obfuscation { cns } else { 0 }),
        (ProofCategory::KeySwitch, cns),
    ])
}

/// Categories the gate waits on: some proofs expected and a non-zero threshold.
pub fn required_categories(survey: &SurveyQuery) -> Vec<ProofCategory> {
    let thresholds: &Thresholds = &survey.thresholds;
    required_proof_counts(survey)
        .into_iter()
        .filter(|(c, n)| *n > 0 && thresholds.get(*c) > 0)
        .map(|(c, _)| c)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DiffPParams, NodeId, OperationSpec, ProofMode, Query};
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;
    use survey_zk::elgamal::KeyPair;
    use survey_zk::types::RangeBound;
    use uuid::Uuid;

    fn survey(query: Query, thresholds: Thresholds) -> SurveyQuery {
        let mut rng = ChaCha20Rng::seed_from_u64(0);
        let kp = KeyPair::generate(&mut rng);
        let cns = vec![NodeId::new("cn-0"), NodeId::new("cn-1")];
        SurveyQuery {
            session_id: Uuid::nil(),
            query,
            assignment: BTreeMap::from([
                (cns[0].clone(), vec![NodeId::new("dp-0"), NodeId::new("dp-1")]),
                (cns[1].clone(), vec![NodeId::new("dp-2")]),
            ]),
            computing_nodes: cns,
            node_keys: BTreeMap::new(),
            joint_key: kp.public,
            querier_key: kp.public,
            thresholds,
            intra_message: false,
        }
    }

    fn sum_query() -> Query {
        Query::new(OperationSpec::named("sum"), vec!["0".into()])
    }

    fn proved_sum_query() -> Query {
        let mut q = sum_query();
        q.proofs = ProofMode::Plain;
        q.ranges = vec![RangeBound::new(16, 1)];
        q.signatures = vec![vec!["00".into()]];
        q.verifiers = vec![NodeId::new("vn-0"), NodeId::new("vn-1")];
        q
    }

    #[test]
    fn no_proofs_accepts_iff_everything_proof_related_is_empty() {
        assert!(validate(&survey(sum_query(), Thresholds::default()), false).ok());

        let mut q = sum_query();
        q.ranges = vec![RangeBound::BIT];
        assert!(!validate(&survey(q, Thresholds::default()), false).ok());

        let mut q = sum_query();
        q.signatures = vec![vec!["00".into()]];
        assert!(!validate(&survey(q, Thresholds::default()), false).ok());

        let mut q = sum_query();
        q.verifiers = vec![NodeId::new("vn-0")];
        assert!(!validate(&survey(q, Thresholds::default()), false).ok());

        assert!(!validate(&survey(sum_query(), Thresholds::uniform(1)), false).ok());
    }

    #[test]
    fn proofs_need_ranges_signatures_and_reachable_thresholds() {
        assert!(validate(&survey(proved_sum_query(), Thresholds { range: 2, aggregation: 1, ..Default::default() }), false).ok());

        let mut q = proved_sum_query();
        q.signatures.clear();
        assert!(!validate(&survey(q, Thresholds::default()), false).ok());

        let mut q = proved_sum_query();
        q.signatures = vec![vec!["not-hex".into()]];
        assert!(!validate(&survey(q, Thresholds::default()), false).ok());

        // Unchecked ranges must come without signatures.
        let mut q = proved_sum_query();
        q.ranges = vec![RangeBound::UNCHECKED];
        assert!(!validate(&survey(q.clone(), Thresholds::default()), false).ok());
        q.signatures.clear();
        assert!(validate(&survey(q, Thresholds::default()), false).ok());

        let report = validate(&survey(proved_sum_query(), Thresholds::uniform(3)), false);
        assert!(report.violations.iter().any(|v| v.contains("exceeds")));
    }

    #[test]
    fn obfuscation_rules() {
        let mut q = proved_sum_query();
        q.obfuscation = true;
        let report = validate(&survey(q, Thresholds { obfuscation: 1, ..Default::default() }), false);
        assert!(!report.ok());

        let mut q = proved_sum_query();
        q.operation = OperationSpec::named("bool_OR");
        q.ranges = vec![RangeBound::BIT];
        q.obfuscation = true;
        assert!(!validate(&survey(q.clone(), Thresholds::default()), false).ok());
        assert!(validate(&survey(q, Thresholds { obfuscation: 1, ..Default::default() }), false).ok());

        let q = proved_sum_query();
        assert!(!validate(&survey(q, Thresholds { obfuscation: 1, ..Default::default() }), false).ok());
    }

    #[test]
    fn diffp_is_all_or_nothing() {
        let full = DiffPParams {
            lap_mean: 0.0,
            lap_scale: 15.0,
            noise_list_size: 10,
            quanta: 1.0,
            scale: 1.0,
            limit: 60.0,
        };
        let mut q = sum_query();
        q.diffp = full.clone();
        assert!(validate(&survey(q.clone(), Thresholds::default()), true).ok());
        assert!(!validate(&survey(q, Thresholds::default()), false).ok());

        let knock_outs: [fn(&mut DiffPParams); 5] = [
            |d| d.limit = 0.0,
            |d| d.quanta = 0.0,
            |d| d.scale = 0.0,
            |d| d.noise_list_size = 0,
            |d| d.lap_scale = 0.0,
        ];
        for knock_out in knock_outs {
            let mut q = sum_query();
            q.diffp = full.clone();
            knock_out(&mut q.diffp);
            assert!(!validate(&survey(q, Thresholds::default()), true).ok());
        }
    }

    #[test]
    fn selector_must_match_input_width() {
        let mut q = sum_query();
        q.selector.push("1".into());
        assert!(!validate(&survey(q, Thresholds::default()), false).ok());
    }

    #[test]
    fn proof_counts_follow_topology() {
        let mut q = proved_sum_query();
        q.diffp.noise_list_size = 4;
        let counts = required_proof_counts(&survey(q, Thresholds::default()));
        assert_eq!(counts[&ProofCategory::Range], 3);
        assert_eq!(counts[&ProofCategory::Shuffle], 2);
        assert_eq!(counts[&ProofCategory::Aggregation], 2);
        assert_eq!(counts[&ProofCategory::Obfuscation], 0);
        assert_eq!(counts[&ProofCategory::KeySwitch], 2);

        let none = required_proof_counts(&survey(sum_query(), Thresholds::default()));
        assert!(none.values().all(|n| *n == 0));

        let mut q = proved_sum_query();
        q.ranges = vec![RangeBound::UNCHECKED];
        q.signatures.clear();
        let counts = required_proof_counts(&survey(q, Thresholds::default()));
        assert_eq!(counts[&ProofCategory::Range], 0);
        assert_eq!(counts[&ProofCategory::Aggregation], 2);
    }

    #[test]
    fn oversized_histograms_are_violations() {
        for (min, max) in [(0, i64::MAX), (0, 1 << 20)] {
            let q = Query::new(OperationSpec::named("frequencyCount").with_range(min, max), vec!["0".into()]);
            let report = validate(&survey(q, Thresholds::default()), false);
            assert!(report.violations.iter().any(|v| v.contains("wider than")), "{report:?}");
        }
    }

    #[test]
    fn diffp_is_refused_for_zero_test_operators() {
        let diffp = DiffPParams {
            lap_mean: 0.0,
            lap_scale: 1.0,
            noise_list_size: 4,
            quanta: 1.0,
            scale: 1.0,
            limit: 3.0,
        };
        for name in ["bool_OR", "bool_AND", "min", "max", "union", "inter"] {
            let mut q = Query::new(OperationSpec::named(name).with_range(0, 3), vec!["0".into()]);
            q.selector = vec!["0".into(); operation_for(&q.operation).unwrap().input_width()];
            q.diffp = diffp.clone();
            let report = validate(&survey(q, Thresholds::default()), true);
            assert!(report.violations.iter().any(|v| v.contains("zero test")), "{name}: {report:?}");
        }

        let mut q = sum_query();
        q.diffp = diffp;
        assert!(validate(&survey(q, Thresholds::default()), true).ok());
    }
}
