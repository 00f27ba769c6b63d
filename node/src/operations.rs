//! Statistical operators.
//!
//! An operator encodes a data provider's columns into a fixed-width integer vector whose
//! slot-wise sum across providers is enough to compute the statistic, and decodes that sum on
//! the client. Encoding happens in the clear; the caller encrypts the result.

use crate::errors::SurveyError;
use crate::models::OperationSpec;

/// Column-major input: one vector per selected column.
pub type Columns = Vec<Vec<i64>>;

pub trait Operation: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    fn input_width(&self) -> usize;

    fn output_width(&self) -> usize;

    fn encode(&self, columns: &[Vec<i64>]) -> Result<Vec<i64>, SurveyError>;

    fn decode(&self, aggregate: &[i64]) -> Result<Vec<f64>, SurveyError>;

    /// Decoding only needs to know whether each slot is zero, so results survive obfuscation.
    fn zero_test_only(&self) -> bool {
        false
    }

    fn encode_local(&self, columns: &[Vec<i64>]) -> Result<Vec<i64>, SurveyError> {
        if columns.len() != self.input_width() {
            return Err(SurveyError::ShapeMismatch(format!(
                "{} expects {} columns, got {}",
                self.name(),
                self.input_width(),
                columns.len()
            )));
        }
        if columns.windows(2).any(|w| w[0].len() != w[1].len()) {
            return Err(SurveyError::ShapeMismatch(format!("{}: ragged columns", self.name())));
        }
        let out = self.encode(columns)?;
        debug_assert_eq!(out.len(), self.output_width());
        Ok(out)
    }

    fn decode_aggregate(&self, aggregate: &[i64]) -> Result<Vec<f64>, SurveyError> {
        if aggregate.len() != self.output_width() {
            return Err(SurveyError::ShapeMismatch(format!(
                "{} expects {} aggregated values, got {}",
                self.name(),
                self.output_width(),
                aggregate.len()
            )));
        }
        self.decode(aggregate)
    }
}

/// Widest histogram a range-based operator may produce.
pub const MAX_HISTOGRAM_WIDTH: usize = 4096;

/// Operators that may be combined with obfuscation.
pub const OBFUSCATION_OPERATIONS: [&str; 6] = ["bool_AND", "bool_OR", "min", "max", "union", "inter"];

pub fn operation_for(spec: &OperationSpec) -> Result<Box<dyn Operation>, SurveyError> {
    let histogram = || ValueRange::new(&spec.name, spec.min, spec.max);

    let op: Box<dyn Operation> = match spec.name.as_str() {
        "sum" => Box::new(Sum),
        "mean" => Box::new(Mean),
        "variance" => Box::new(Variance),
        "cosim" => Box::new(CosineSimilarity),
        "frequencyCount" => Box::new(FrequencyCount(histogram()?)),
        "min" => Box::new(Extremum { range: histogram()?, max: false }),
        "max" => Box::new(Extremum { range: histogram()?, max: true }),
        "union" => Box::new(SetPresence { range: histogram()?, intersection: false }),
        "inter" => Box::new(SetPresence { range: histogram()?, intersection: true }),
        "bool_OR" => Box::new(Boolean { and: false }),
        "bool_AND" => Box::new(Boolean { and: true }),
        "lin_reg" => {
            if spec.dimension == 0 {
                return Err(SurveyError::ShapeMismatch("lin_reg needs at least one regressor".into()));
            }
            Box::new(LinearRegression { d: spec.dimension })
        }
        other => return Err(SurveyError::UnknownOperation(other.to_string())),
    };
    Ok(op)
}

fn sum_squares(col: &[i64]) -> i64 {
    col.iter().map(|x| x * x).sum()
}

#[derive(Debug)]
pub struct Sum;

impl Operation for Sum {
    fn name(&self) -> &'static str {
        "sum"
    }
    fn input_width(&self) -> usize {
        1
    }
    fn output_width(&self) -> usize {
        1
    }
    fn encode(&self, columns: &[Vec<i64>]) -> Result<Vec<i64>, SurveyError> {
        Ok(vec![columns[0].iter().sum()])
    }
    fn decode(&self, aggregate: &[i64]) -> Result<Vec<f64>, SurveyError> {
        Ok(vec![aggregate[0] as f64])
    }
}

/// `[Σx, N]`.
#[derive(Debug)]
pub struct Mean;

impl Operation for Mean {
    fn name(&self) -> &'static str {
        "mean"
    }
    fn input_width(&self) -> usize {
        1
    }
    fn output_width(&self) -> usize {
        2
    }
    fn encode(&self, columns: &[Vec<i64>]) -> Result<Vec<i64>, SurveyError> {
        let col = &columns[0];
        Ok(vec![col.iter().sum(), col.len() as i64])
    }
    fn decode(&self, aggregate: &[i64]) -> Result<Vec<f64>, SurveyError> {
        let (sum, n) = (aggregate[0] as f64, aggregate[1] as f64);
        Ok(vec![if n == 0.0 { 0.0 } else { sum / n }])
    }
}

/// `[Σx, N, Σx²]`.
#[derive(Debug)]
pub struct Variance;

impl Operation for Variance {
    fn name(&self) -> &'static str {
        "variance"
    }
    fn input_width(&self) -> usize {
        1
    }
    fn output_width(&self) -> usize {
        3
    }
    fn encode(&self, columns: &[Vec<i64>]) -> Result<Vec<i64>, SurveyError> {
        let col = &columns[0];
        Ok(vec![col.iter().sum(), col.len() as i64, sum_squares(col)])
    }
    fn decode(&self, aggregate: &[i64]) -> Result<Vec<f64>, SurveyError> {
        let (sum, n, sq) = (aggregate[0] as f64, aggregate[1] as f64, aggregate[2] as f64);
        if n == 0.0 {
            return Ok(vec![0.0]);
        }
        let mean = sum / n;
        Ok(vec![sq / n - mean * mean])
    }
}

/// `[Σx, Σy, Σx², Σy², Σxy]`.
#[derive(Debug)]
pub struct CosineSimilarity;

impl Operation for CosineSimilarity {
    fn name(&self) -> &'static str {
        "cosim"
    }
    fn input_width(&self) -> usize {
        2
    }
    fn output_width(&self) -> usize {
        5
    }
    fn encode(&self, columns: &[Vec<i64>]) -> Result<Vec<i64>, SurveyError> {
        let (x, y) = (&columns[0], &columns[1]);
        let xy = x.iter().zip(y).map(|(a, b)| a * b).sum();
        Ok(vec![x.iter().sum(), y.iter().sum(), sum_squares(x), sum_squares(y), xy])
    }
    fn decode(&self, aggregate: &[i64]) -> Result<Vec<f64>, SurveyError> {
        let denom = (aggregate[2] as f64).sqrt() * (aggregate[3] as f64).sqrt();
        Ok(vec![aggregate[4] as f64 / denom])
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ValueRange {
    min: i64,
    max: i64,
    width: usize,
}

impl ValueRange {
    /// `[min, max]` with at most [`MAX_HISTOGRAM_WIDTH`] slots.
    pub fn new(name: &str, min: i64, max: i64) -> Result<Self, SurveyError> {
        if max < min {
            return Err(SurveyError::ShapeMismatch(format!("{name}: empty value range [{min}, {max}]")));
        }
        let width = max
            .checked_sub(min)
            .and_then(|d| d.checked_add(1))
            .and_then(|w| usize::try_from(w).ok())
            .filter(|w| *w <= MAX_HISTOGRAM_WIDTH)
            .ok_or_else(|| {
                SurveyError::ShapeMismatch(format!(
                    "{name}: value range [{min}, {max}] is wider than {MAX_HISTOGRAM_WIDTH} slots"
                ))
            })?;
        Ok(Self { min, max, width })
    }

    fn width(&self) -> usize {
        self.width
    }

    fn slot(&self, v: i64) -> Result<usize, SurveyError> {
        if v < self.min || v > self.max {
            return Err(SurveyError::ShapeMismatch(format!(
                "value {v} outside [{}, {}]",
                self.min, self.max
            )));
        }
        Ok((v - self.min) as usize)
    }

    fn counts(&self, col: &[i64]) -> Result<Vec<i64>, SurveyError> {
        let mut out = vec![0i64; self.width()];
        for v in col {
            out[self.slot(*v)?] += 1;
        }
        Ok(out)
    }
}

/// Histogram over `[min, max]`.
#[derive(Debug)]
pub struct FrequencyCount(pub ValueRange);

impl Operation for FrequencyCount {
    fn name(&self) -> &'static str {
        "frequencyCount"
    }
    fn input_width(&self) -> usize {
        1
    }
    fn output_width(&self) -> usize {
        self.0.width()
    }
    fn encode(&self, columns: &[Vec<i64>]) -> Result<Vec<i64>, SurveyError> {
        self.0.counts(&columns[0])
    }
    fn decode(&self, aggregate: &[i64]) -> Result<Vec<f64>, SurveyError> {
        Ok(aggregate.iter().map(|v| *v as f64).collect())
    }
}

/// Presence bits over `[min, max]`; the smallest (largest) non-zero slot is the answer.
#[derive(Debug)]
pub struct Extremum {
    pub range: ValueRange,
    pub max: bool,
}

impl Operation for Extremum {
    fn name(&self) -> &'static str {
        if self.max { "max" } else { "min" }
    }
    fn input_width(&self) -> usize {
        1
    }
    fn output_width(&self) -> usize {
        self.range.width()
    }
    fn zero_test_only(&self) -> bool {
        true
    }
    fn encode(&self, columns: &[Vec<i64>]) -> Result<Vec<i64>, SurveyError> {
        Ok(self.range.counts(&columns[0])?.into_iter().map(|c| (c > 0) as i64).collect())
    }
    fn decode(&self, aggregate: &[i64]) -> Result<Vec<f64>, SurveyError> {
        let present = aggregate.iter().enumerate().filter(|(_, v)| **v != 0).map(|(i, _)| i);
        let idx = if self.max { present.last() } else { present.min() };
        Ok(idx
            .map(|i| vec![(self.range.min + i as i64) as f64])
            .unwrap_or_default())
    }
}

/// Union or intersection of the providers' value sets, as one indicator per value.
///
/// Intersection encodes absence, so a zero slot means "present everywhere".
#[derive(Debug)]
pub struct SetPresence {
    pub range: ValueRange,
    pub intersection: bool,
}

impl Operation for SetPresence {
    fn name(&self) -> &'static str {
        if self.intersection { "inter" } else { "union" }
    }
    fn input_width(&self) -> usize {
        1
    }
    fn output_width(&self) -> usize {
        self.range.width()
    }
    fn zero_test_only(&self) -> bool {
        true
    }
    fn encode(&self, columns: &[Vec<i64>]) -> Result<Vec<i64>, SurveyError> {
        let counts = self.range.counts(&columns[0])?;
        Ok(counts
            .into_iter()
            .map(|c| ((c > 0) != self.intersection) as i64)
            .collect())
    }
    fn decode(&self, aggregate: &[i64]) -> Result<Vec<f64>, SurveyError> {
        Ok(aggregate
            .iter()
            .map(|v| if (*v != 0) != self.intersection { 1.0 } else { 0.0 })
            .collect())
    }
}

/// OR of the providers' local booleans; AND is encoded as the OR of the negation.
#[derive(Debug)]
pub struct Boolean {
    pub and: bool,
}

impl Operation for Boolean {
    fn name(&self) -> &'static str {
        if self.and { "bool_AND" } else { "bool_OR" }
    }
    fn input_width(&self) -> usize {
        1
    }
    fn output_width(&self) -> usize {
        1
    }
    fn zero_test_only(&self) -> bool {
        true
    }
    fn encode(&self, columns: &[Vec<i64>]) -> Result<Vec<i64>, SurveyError> {
        let col = &columns[0];
        let bit = if self.and {
            !col.iter().all(|v| *v != 0)
        } else {
            col.iter().any(|v| *v != 0)
        };
        Ok(vec![bit as i64])
    }
    fn decode(&self, aggregate: &[i64]) -> Result<Vec<f64>, SurveyError> {
        let nonzero = aggregate[0] != 0;
        Ok(vec![if nonzero != self.and { 1.0 } else { 0.0 }])
    }
}

/// Sufficient statistics for least squares with `d` regressors; the last column is `y`.
///
/// Layout: `N, Σx_j (j<d), Σx_j·x_k (j<=k<d), Σy, Σx_j·y (j<d)`.
#[derive(Debug)]
pub struct LinearRegression {
    pub d: usize,
}

impl Operation for LinearRegression {
    fn name(&self) -> &'static str {
        "lin_reg"
    }
    fn input_width(&self) -> usize {
        self.d + 1
    }
    fn output_width(&self) -> usize {
        let d = self.d;
        (d * d + 5 * d + 4) / 2
    }
    fn encode(&self, columns: &[Vec<i64>]) -> Result<Vec<i64>, SurveyError> {
        let d = self.d;
        let (xs, y) = (&columns[..d], &columns[d]);
        let dot = |a: &[i64], b: &[i64]| -> i64 { a.iter().zip(b).map(|(p, q)| p * q).sum() };

        let mut out = Vec::with_capacity(self.output_width());
        out.push(y.len() as i64);
        out.extend(xs.iter().map(|x| x.iter().sum::<i64>()));
        for j in 0..d {
            for k in j..d {
                out.push(dot(&xs[j], &xs[k]));
            }
        }
        out.push(y.iter().sum());
        out.extend(xs.iter().map(|x| dot(x, y)));
        Ok(out)
    }
    fn decode(&self, aggregate: &[i64]) -> Result<Vec<f64>, SurveyError> {
        let d = self.d;
        let n = d + 1;

        // Normal equations over the design matrix [1, x_0 .. x_{d-1}].
        let mut m = vec![vec![0f64; n + 1]; n];
        let mut idx = 0;
        for i in 0..n {
            for j in i..n {
                let v = aggregate[idx] as f64;
                m[i][j] = v;
                m[j][i] = v;
                idx += 1;
            }
        }
        for row in m.iter_mut() {
            row[n] = aggregate[idx] as f64;
            idx += 1;
        }

        solve_gaussian(m).ok_or_else(|| SurveyError::ShapeMismatch("singular regression system".into()))
    }
}

/// Solve an augmented `n × (n+1)` system with partial pivoting.
fn solve_gaussian(mut m: Vec<Vec<f64>>) -> Option<Vec<f64>> {
    let n = m.len();
    for col in 0..n {
        let pivot = (col..n).max_by(|a, b| m[*a][col].abs().total_cmp(&m[*b][col].abs()))?;
        if m[pivot][col].abs() < 1e-12 {
            return None;
        }
        m.swap(col, pivot);
        for row in 0..n {
            if row != col {
                let factor = m[row][col] / m[col][col];
                for k in col..=n {
                    m[row][k] -= factor * m[col][k];
                }
            }
        }
    }
    Some((0..n).map(|i| m[i][n] / m[i][i]).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(name: &str) -> Box<dyn Operation> {
        operation_for(&OperationSpec::named(name).with_range(0, 3).with_dimension(1)).unwrap()
    }

    fn add(a: &[i64], b: &[i64]) -> Vec<i64> {
        a.iter().zip(b).map(|(x, y)| x + y).collect()
    }

    #[test]
    fn sum_round_trips_a_single_party() {
        let sum = op("sum");
        let encoded = sum.encode_local(&[vec![3, 4, 5]]).unwrap();
        assert_eq!(sum.decode_aggregate(&encoded).unwrap(), vec![12.0]);
    }

    #[test]
    fn sum_and_mean_are_additive() {
        let (a, b) = (vec![1, 2, 3], vec![10, 20]);
        let joined: Vec<i64> = a.iter().chain(&b).copied().collect();
        for name in ["sum", "mean", "variance"] {
            let o = op(name);
            let split = add(&o.encode_local(&[a.clone()]).unwrap(), &o.encode_local(&[b.clone()]).unwrap());
            assert_eq!(
                o.decode_aggregate(&split).unwrap(),
                o.decode_aggregate(&o.encode_local(&[joined.clone()]).unwrap()).unwrap(),
                "{name}"
            );
        }
    }

    #[test]
    fn widths_are_enforced() {
        let mean = op("mean");
        assert!(matches!(mean.encode_local(&[vec![1], vec![2]]), Err(SurveyError::ShapeMismatch(_))));
        assert!(matches!(mean.decode_aggregate(&[1]), Err(SurveyError::ShapeMismatch(_))));
        assert!(matches!(
            operation_for(&OperationSpec::named("median")),
            Err(SurveyError::UnknownOperation(_))
        ));
    }

    #[test]
    fn frequency_count_histogram() {
        let fc = op("frequencyCount");
        let total = [0, 1, 1, 3]
            .iter()
            .map(|v| fc.encode_local(&[vec![*v]]).unwrap())
            .fold(vec![0; 4], |acc, e| add(&acc, &e));
        assert_eq!(fc.decode_aggregate(&total).unwrap(), vec![1.0, 2.0, 0.0, 1.0]);
        assert!(fc.encode_local(&[vec![4]]).is_err());
    }

    #[test]
    fn presence_operators_decode_from_zero_tests() {
        let a = [vec![1, 2]];
        let b = [vec![2, 3]];
        for (name, expected) in [
            ("min", vec![1.0]),
            ("max", vec![3.0]),
            ("union", vec![0.0, 1.0, 1.0, 1.0]),
            ("inter", vec![0.0, 0.0, 1.0, 0.0]),
        ] {
            let o = op(name);
            assert!(o.zero_test_only());
            let agg = add(&o.encode_local(&a).unwrap(), &o.encode_local(&b).unwrap());
            assert_eq!(o.decode_aggregate(&agg).unwrap(), expected, "{name}");
        }
    }

    #[test]
    fn boolean_operators() {
        let or = op("bool_OR");
        let and = op("bool_AND");
        let t = [vec![1, 1]];
        let f = [vec![1, 0]];
        let or_agg = add(&or.encode_local(&t).unwrap(), &or.encode_local(&f).unwrap());
        let and_agg = add(&and.encode_local(&t).unwrap(), &and.encode_local(&f).unwrap());
        assert_eq!(or.decode_aggregate(&or_agg).unwrap(), vec![1.0]);
        assert_eq!(and.decode_aggregate(&and_agg).unwrap(), vec![0.0]);
        let both = add(&and.encode_local(&t).unwrap(), &and.encode_local(&t).unwrap());
        assert_eq!(and.decode_aggregate(&both).unwrap(), vec![1.0]);
    }

    #[test]
    fn cosine_similarity_of_parallel_vectors_is_one() {
        let cs = op("cosim");
        let enc = cs.encode_local(&[vec![1, 2, 3], vec![2, 4, 6]]).unwrap();
        let v = cs.decode_aggregate(&enc).unwrap()[0];
        assert!((v - 1.0).abs() < 1e-9);
    }

    #[test]
    fn linear_regression_recovers_exact_line() {
        // y = 2 + 3x
        let lr = operation_for(&OperationSpec::named("lin_reg").with_dimension(1)).unwrap();
        assert_eq!(lr.output_width(), 5);
        let a = lr.encode_local(&[vec![0, 1], vec![2, 5]]).unwrap();
        let b = lr.encode_local(&[vec![2, 3], vec![8, 11]]).unwrap();
        let coeffs = lr.decode_aggregate(&add(&a, &b)).unwrap();
        assert!((coeffs[0] - 2.0).abs() < 1e-9);
        assert!((coeffs[1] - 3.0).abs() < 1e-9);
    }

    #[test]
    fn histogram_ranges_are_bounded() {
        for (min, max) in [(0, i64::MAX), (i64::MIN, i64::MAX), (i64::MIN, 0), (0, 1 << 40)] {
            let spec = OperationSpec::named("frequencyCount").with_range(min, max);
            assert!(matches!(operation_for(&spec), Err(SurveyError::ShapeMismatch(_))), "[{min}, {max}]");
        }

        let widest = (MAX_HISTOGRAM_WIDTH - 1) as i64;
        let ok = operation_for(&OperationSpec::named("union").with_range(-1, widest - 1)).unwrap();
        assert_eq!(ok.output_width(), MAX_HISTOGRAM_WIDTH);
        assert!(operation_for(&OperationSpec::named("min").with_range(0, widest + 1)).is_err());
    }
}
