use std::iter::Sum;
use std::ops::{Add, AddAssign};

/// What a worker did across all the targets it processed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyResult {
    /// At least one target differed from its desired schema.
    pub differences: bool,
    /// Operations not performed because of an error, a lint failure or an
    /// earlier failed statement.
    pub skip_count: usize,
    /// Objects whose DDL could not be generated.
    pub unsupported_count: usize,
}

impl Add for ApplyResult {
    type Output = ApplyResult;

    fn add(self, other: ApplyResult) -> ApplyResult {
        ApplyResult {
            differences: self.differences || other.differences,
            skip_count: self.skip_count + other.skip_count,
            unsupported_count: self.unsupported_count + other.unsupported_count,
        }
    }
}

impl AddAssign for ApplyResult {
    fn add_assign(&mut self, other: ApplyResult) {
        *self = *self + other;
    }
}

impl Sum for ApplyResult {
    fn sum<I: Iterator<Item = ApplyResult>>(iter: I) -> ApplyResult {
        iter.fold(ApplyResult::default(), Add::add)
    }
}

/// Combine the results of several workers.
pub fn sum_results(results: &[ApplyResult]) -> ApplyResult {
    results.iter().copied().sum()
}
