//! Jain's fairness index.

/// `(Σx)² / (n·Σx²)` over the non-zero entries of `served`
///
/// Returns 1.0 when fewer than two entries are non-zero. The result lies in
/// `[1/n, 1]`: 1 means service was shared evenly, `1/n` means one contender
/// received all of it.
#[must_use]
pub fn jains_index<I>(served: I) -> f64
where
    I: IntoIterator<Item = u64>,
{
    let (n, sum, sum_sq) = served
        .into_iter()
        .filter(|x| *x > 0)
        .fold((0u64, 0.0f64, 0.0f64), |(n, sum, sum_sq), x| {
            let x = x as f64;
            (n + 1, sum + x, sum_sq + x * x)
        });

    if n <= 1 || sum_sq == 0.0 {
        return 1.0;
    }
    let n = n as f64;
    let index = (sum * sum) / (n * sum_sq);
    index.clamp(1.0 / n, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trivial_cases() {
        assert!((jains_index(Vec::<u64>::new()) - 1.0).abs() < f64::EPSILON);
        assert!((jains_index([42]) - 1.0).abs() < f64::EPSILON);
        assert!((jains_index([0, 0, 7]) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_equal_service_is_fair() {
        assert!((jains_index([10, 10, 10, 10]) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_monopoly_approaches_one_over_n() {
        let index = jains_index([1_000_000, 1, 1, 1]);
        assert!((index - 0.25).abs() < 1e-3);
        assert!(index >= 0.25);
    }

    #[test]
    fn test_bounds_hold() {
        let samples: [&[u64]; 4] = [&[1, 2], &[5, 1, 9, 3], &[100, 1], &[3, 3, 4, 1, 8, 2]];
        for served in samples {
            let n = served.len() as f64;
            let index = jains_index(served.iter().copied());
            assert!(index >= 1.0 / n - 1e-12 && index <= 1.0 + 1e-12, "{served:?} -> {index}");
        }
    }
}
