use thiserror::Error;

/// InputValueError is used if some simulation option or parameter does not fulfill the posed
/// requirements, e.g., a segment with a negative length or a vehicle without mass.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("Invalid input value for {field}: {reason}")]
pub struct InputValueError {
    pub field: String,
    pub reason: String,
}

impl InputValueError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        InputValueError {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// argsort returns the indices that would sort an array. The sort is stable, i.e. equal values
/// keep their original order. Incomparable values (NaN) are treated as equal.
pub fn argsort<T: PartialOrd>(x: &[T], order: SortOrder) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..x.len()).collect();
    match order {
        SortOrder::Ascending => indices.sort_by(|&a, &b| {
            x[a].partial_cmp(&x[b])
                .unwrap_or(std::cmp::Ordering::Equal)
        }),
        SortOrder::Descending => indices.sort_by(|&a, &b| {
            x[b].partial_cmp(&x[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        }),
    }
    indices
}

/// clamp_or returns x clamped to [min, max], or `fallback` if x is not finite.
pub fn clamp_or(x: f64, min: f64, max: f64, fallback: f64) -> f64 {
    if x.is_finite() {
        x.clamp(min, max)
    } else {
        fallback
    }
}

/// clamp_unit clamps x to [0.0, 1.0]; non-finite values become 0.0.
pub fn clamp_unit(x: f64) -> f64 {
    clamp_or(x, 0.0, 1.0, 0.0)
}

/// lin_interp returns the linearly interpolated value at x for given discrete data points xp, fp.
/// xp must be increasing and both slices must have the same non-zero length. Inspired by
/// numpy.interp.
pub fn lin_interp(x: f64, xp: &[f64], fp: &[f64]) -> f64 {
    debug_assert_eq!(xp.len(), fp.len(), "Number of items in xp and fp must be equal!");

    match (xp.first(), fp.first()) {
        (Some(&x0), Some(&f0)) if x <= x0 => return f0,
        (None, _) | (_, None) => return 0.0,
        _ => {}
    }

    for i in 1..xp.len().min(fp.len()) {
        if x <= xp[i] {
            return fp[i - 1] + (x - xp[i - 1]) * (fp[i] - fp[i - 1]) / (xp[i] - xp[i - 1]);
        }
    }

    fp.last().copied().unwrap_or(0.0)
}
