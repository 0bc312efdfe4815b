/// Splits `total` classes over `slots` weekly slots: every slot gets
/// `total / slots` and the first `total % slots` get one more.
pub fn distribute(total: u32, slots: usize) -> Vec<u32> {
    if slots == 0 {
        return Vec::new();
    }
    let n = slots as u32;
    let base = total / n;
    let extra = (total % n) as usize;
    (0..slots)
        .map(|i| if i < extra { base + 1 } else { base })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn twelve_over_two_is_even() {
        assert_eq!(distribute(12, 2), vec![6, 6]);
    }

    #[test]
    fn remainder_goes_to_lowest_indices() {
        assert_eq!(distribute(10, 3), vec![4, 3, 3]);
        assert_eq!(distribute(11, 3), vec![4, 4, 3]);
        assert_eq!(distribute(2, 4), vec![1, 1, 0, 0]);
    }

    #[test]
    fn zero_slots_is_empty() {
        assert!(distribute(8, 0).is_empty());
    }

    #[test]
    fn shape_holds_for_all_small_inputs() {
        for total in 0..60u32 {
            for n in 1..9usize {
                let out = distribute(total, n);
                assert_eq!(out.len(), n);
                assert_eq!(out.iter().sum::<u32>(), total);
                let base = total / n as u32;
                let extra = (total % n as u32) as usize;
                for (i, v) in out.iter().enumerate() {
                    let expected = if i < extra { base + 1 } else { base };
                    assert_eq!(*v, expected, "total={} n={} i={}", total, n, i);
                }
            }
        }
    }
}
