//! Integer helpers shared by the planner and the lookup-table builder.

use crate::errors::RenderError;

/// Divisors of `n` within `[ge, le]`, ascending.
pub fn factorize(n: u32, ge: u32, le: u32) -> Vec<u32> {
    let mut divisors = Vec::new();
    for i in ge.max(1)..=le {
        if n % i == 0 {
            divisors.push(i);
        }
    }
    divisors
}

/// Clamp `x` into `domain`, then rescale into `range` with truncating
/// float arithmetic. The float path is deliberate: the substitution box is
/// defined in terms of this exact rounding behavior, so two builds from the
/// same secret stay byte-identical.
pub fn normalize_integer(x: i64, domain: (i64, i64), range: (i64, i64)) -> i64 {
    let n = x.clamp(domain.0, domain.1);
    let scaled =
        range.0 as f32 + n as f32 / (domain.1 - domain.0) as f32 * (range.1 - range.0) as f32;
    scaled as i64
}

/// Invert a permutation given as a value sequence.
///
/// Pairs each value with its position, orders the pairs ascending by value
/// (position breaks ties, giving a stable total order), and returns the
/// positions. For a true permutation of `0..len` the result is the exact
/// inverse mapping.
pub fn invert_sequence(values: &[u32]) -> Vec<u32> {
    let mut pairs: Vec<(u32, u32)> = values
        .iter()
        .copied()
        .enumerate()
        .map(|(position, value)| (value, position as u32))
        .collect();
    pairs.sort_unstable();
    pairs.into_iter().map(|(_, position)| position).collect()
}

/// Reorder `elements` so that element `i` lands at the slot named by the
/// rank of `indexes[i]`.
pub fn reorder_by_indices<T: Clone>(elements: &[T], indexes: &[u32]) -> Result<Vec<T>, RenderError> {
    if elements.len() != indexes.len() {
        return Err(RenderError::LengthMismatch {
            expected: elements.len(),
            actual: indexes.len(),
        });
    }
    let order = invert_sequence(indexes);
    Ok(order
        .into_iter()
        .map(|position| elements[position as usize].clone())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factorize_returns_divisors_in_range_ascending() {
        assert_eq!(factorize(16, 1, 15), vec![1, 2, 4, 8]);
        assert_eq!(factorize(256, 1, 64), vec![1, 2, 4, 8, 16, 32, 64]);
        assert_eq!(factorize(12, 2, 12), vec![2, 3, 4, 6, 12]);
    }

    #[test]
    fn factorize_of_prime_above_byte_range_is_empty() {
        // 257 is prime, so nothing in [2, 64] divides it.
        assert_eq!(factorize(257, 2, 64), Vec::<u32>::new());
    }

    #[test]
    fn factorize_handles_degenerate_bounds() {
        assert_eq!(factorize(16, 9, 8), Vec::<u32>::new());
        assert_eq!(factorize(7, 1, 6), vec![1]);
    }

    #[test]
    fn normalize_integer_clamps_into_domain() {
        assert_eq!(normalize_integer(-40, (0, 255), (0, 255)), 0);
        assert_eq!(normalize_integer(999, (0, 255), (0, 255)), 255);
    }

    #[test]
    fn invert_sequence_inverts_a_permutation() {
        let forward = [3_u32, 0, 2, 1];
        let inverse = invert_sequence(&forward);
        assert_eq!(inverse, vec![1, 3, 2, 0]);
        for (i, &value) in forward.iter().enumerate() {
            assert_eq!(inverse[value as usize] as usize, i);
        }
    }

    #[test]
    fn invert_sequence_breaks_ties_by_position() {
        assert_eq!(invert_sequence(&[5, 5, 1]), vec![2, 0, 1]);
    }

    #[test]
    fn reorder_by_indices_rejects_mismatched_lengths() {
        let err = reorder_by_indices(&['a', 'b'], &[0]).unwrap_err();
        assert_eq!(
            err,
            RenderError::LengthMismatch {
                expected: 2,
                actual: 1
            }
        );
    }

    #[test]
    fn reorder_by_indices_places_elements_by_rank() {
        let out = reorder_by_indices(&['a', 'b', 'c'], &[2, 0, 1]).unwrap();
        assert_eq!(out, vec!['b', 'c', 'a']);
    }
}
