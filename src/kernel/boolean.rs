use crate::bitmap::live_set::LiveSet;

/// Boolean kernels over packed bitsets. When neither operand carries
/// nulls these are bulk word operations; the null-aware path falls back
/// to lane-wise evaluation with null propagation.

pub fn and(a: &LiveSet, a_nulls: &LiveSet, b: &LiveSet, b_nulls: &LiveSet) -> (LiveSet, LiveSet) {
    binary_words(a, a_nulls, b, b_nulls, |x, y| x & y)
}

pub fn or(a: &LiveSet, a_nulls: &LiveSet, b: &LiveSet, b_nulls: &LiveSet) -> (LiveSet, LiveSet) {
    binary_words(a, a_nulls, b, b_nulls, |x, y| x | y)
}

pub fn xor(a: &LiveSet, a_nulls: &LiveSet, b: &LiveSet, b_nulls: &LiveSet) -> (LiveSet, LiveSet) {
    binary_words(a, a_nulls, b, b_nulls, |x, y| x ^ y)
}

fn binary_words(
    a: &LiveSet,
    a_nulls: &LiveSet,
    b: &LiveSet,
    b_nulls: &LiveSet,
    word_op: fn(u64, u64) -> u64,
) -> (LiveSet, LiveSet) {
    let len = a.len().max(b.len());
    let mut out = LiveSet::new();
    out.resize_len(len);
    let mut nulls = LiveSet::new();
    nulls.resize_len(len);

    if a_nulls.is_empty() && b_nulls.is_empty() {
        let words = out.words_mut();
        for i in 0..words.len() {
            let x = a.words().get(i).copied().unwrap_or(0);
            let y = b.words().get(i).copied().unwrap_or(0);
            words[i] = word_op(x, y);
        }
        out.refresh_cardinality();
        return (out, nulls);
    }

    for i in 0..len {
        if a_nulls.test(i) || b_nulls.test(i) {
            nulls.set(i);
        } else if word_op(a.test(i) as u64, b.test(i) as u64) != 0 {
            out.set(i);
        }
    }
    (out, nulls)
}

/// Complement over the logical length; the partial last word's high bits
/// are masked off. Null lanes stay null.
pub fn not(a: &LiveSet, a_nulls: &LiveSet) -> (LiveSet, LiveSet) {
    let mut out = a.clone();
    out.not_inplace();
    if !a_nulls.is_empty() {
        // Null lanes must not read as true after complementing.
        for i in a_nulls.iter() {
            if i < out.len() {
                out.clear(i);
            }
        }
    }
    (out, a_nulls.clone())
}

/// Population count with the count-lowest-set-bit loop.
pub fn popcount(words: &[u64]) -> u64 {
    let mut count = 0u64;
    for &word in words {
        let mut w = word;
        while w != 0 {
            w &= w - 1;
            count += 1;
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bits(indices: &[usize], len: usize) -> LiveSet {
        let mut set = LiveSet::new();
        set.resize_len(len);
        for &i in indices {
            set.set(i);
        }
        set
    }

    fn empty(len: usize) -> LiveSet {
        let mut set = LiveSet::new();
        set.resize_len(len);
        set
    }

    #[test]
    fn test_word_ops_without_nulls() {
        let a = bits(&[0, 5, 70], 128);
        let b = bits(&[5, 70, 100], 128);
        let (and_out, _) = and(&a, &empty(128), &b, &empty(128));
        assert_eq!(and_out.iter().collect::<Vec<_>>(), vec![5, 70]);
        let (or_out, _) = or(&a, &empty(128), &b, &empty(128));
        assert_eq!(or_out.cardinality(), 4);
        let (xor_out, _) = xor(&a, &empty(128), &b, &empty(128));
        assert_eq!(xor_out.iter().collect::<Vec<_>>(), vec![0, 100]);
    }

    #[test]
    fn test_null_propagation() {
        let a = bits(&[0, 1], 4);
        let b = bits(&[1], 4);
        let a_nulls = bits(&[2], 4);
        let (out, nulls) = and(&a, &a_nulls, &b, &empty(4));
        assert!(out.test(1));
        assert!(!out.test(0));
        assert!(nulls.test(2));
        assert!(!nulls.test(1));
    }

    #[test]
    fn test_not_with_partial_word_and_nulls() {
        let a = bits(&[0], 10);
        let a_nulls = bits(&[9], 10);
        let (out, nulls) = not(&a, &a_nulls);
        assert!(!out.test(0));
        assert!(out.test(1));
        assert!(!out.test(9)); // null lane does not read true
        assert!(nulls.test(9));
        assert_eq!(out.len(), 10);
    }

    #[test]
    fn test_popcount_loop() {
        assert_eq!(popcount(&[0]), 0);
        assert_eq!(popcount(&[0b1011, u64::MAX]), 3 + 64);
    }
}
