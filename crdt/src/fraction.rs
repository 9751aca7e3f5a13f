use anyhow::Result;
use core::fmt;
use smallvec::SmallVec;

/// A fractional sort key: a base-256 fraction in `[0, 1)` with as much
/// precision as ordering demands.
///
/// Digits are plain bytes with trailing zeros trimmed, so the canonical
/// byte string compares lexicographically exactly like the value it
/// denotes, and a key stored as a hex scalar in a record sorts
/// correctly as a string. Keys are only ever produced by the
/// constructors here, which all return canonical keys; a gap between
/// two keys can always be split again, so reordering elements never
/// renumbers their neighbours.
#[derive(Clone, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SortKey(SmallVec<[u8; 8]>);

impl SortKey {
    /// The smallest key. Only useful as a lower bound; the constructors
    /// never hand it out as an element's key.
    pub fn zero() -> Self {
        Self(SmallVec::new())
    }

    /// The canonical first key handed to a fresh document (one half).
    pub fn half() -> Self {
        let mut digits = SmallVec::new();
        digits.push(0x80);
        Self(digits)
    }

    /// The digit at a position, with the implied all-zero tail.
    fn digit(&self, i: usize) -> u16 {
        self.0.get(i).copied().unwrap_or(0) as u16
    }

    fn canonical(mut digits: SmallVec<[u8; 8]>) -> Self {
        while digits.last() == Some(&0) {
            digits.pop();
        }
        Self(digits)
    }

    /// A key strictly greater than this one.
    ///
    /// Bumps the final digit when there is room and grows the fraction
    /// by one digit otherwise, so appending to the tail of a list stays
    /// cheap no matter how often it happens.
    pub fn succ(&self) -> Self {
        let mut digits = self.0.clone();
        match digits.last_mut() {
            Some(last) if *last < u8::MAX => *last += 1,
            _ => digits.push(0x80),
        }
        Self(digits)
    }

    /// A key strictly between two distinct keys, in either argument
    /// order; equal keys yield that key back. The result is not the
    /// arithmetic midpoint, just a canonical key inside the gap.
    ///
    /// Works by walking the shared digit prefix: at the first digit
    /// where the keys disagree the gap is either wide enough to split,
    /// or the digits are adjacent and the lower key's digit is kept
    /// while a suffix is grown that outranks its tail.
    pub fn midpoint(&self, that: &SortKey) -> SortKey {
        let (lo, hi) = if self <= that {
            (self, that)
        } else {
            (that, self)
        };
        if lo == hi {
            return lo.clone();
        }
        let mut digits = SmallVec::new();
        let mut i = 0;
        loop {
            let a = lo.digit(i);
            let b = hi.digit(i);
            if b > a + 1 {
                // wide gap: split it at this digit and stop
                digits.push((a + (b - a) / 2) as u8);
                return Self::canonical(digits);
            }
            if b == a + 1 {
                // adjacent digits: everything prefixed by `a` here stays
                // below `hi`, so it only has to outrank lo's tail
                digits.push(a as u8);
                let mut j = i + 1;
                while lo.digit(j) == u8::MAX as u16 {
                    digits.push(u8::MAX);
                    j += 1;
                }
                digits.push(((lo.digit(j) + 0x100) / 2) as u8);
                return Self::canonical(digits);
            }
            digits.push(a as u8);
            i += 1;
        }
    }

    /// Picks a key inside the open interval described by two optional
    /// bounds: after `lo`, before `hi`, or both.
    pub fn between(lo: Option<&SortKey>, hi: Option<&SortKey>) -> SortKey {
        match (lo, hi) {
            (None, None) => SortKey::half(),
            (Some(lo), None) => lo.succ(),
            (None, Some(hi)) => SortKey::zero().midpoint(hi),
            (Some(lo), Some(hi)) => lo.midpoint(hi),
        }
    }
}

impl fmt::Debug for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SortKey({})", self)
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

impl std::str::FromStr for SortKey {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)?;
        Ok(Self::canonical(bytes.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn smoke() {
        let lo = SortKey::zero();
        let hi = SortKey::half();
        let mid = lo.midpoint(&hi);
        assert!(lo < mid && mid < hi);
        assert!(hi < hi.succ());
        assert_eq!(hi.midpoint(&hi), hi);
    }

    #[test]
    fn between_bounds() {
        let a = SortKey::half();
        let b = a.succ();
        let m = SortKey::between(Some(&a), Some(&b));
        assert!(a < m && m < b);
        assert!(SortKey::between(Some(&b), None) > b);
        assert!(SortKey::between(None, Some(&a)) < a);
        assert!(SortKey::between(None, Some(&a)) > SortKey::zero());
    }

    #[test]
    fn gaps_survive_repeated_splitting() {
        // squeeze toward the lower bound, then toward the upper one;
        // every split must stay strictly inside the shrinking interval
        let mut lo = SortKey::zero();
        let hi = SortKey::half();
        for _ in 0..64 {
            let mid = lo.midpoint(&hi);
            assert!(lo < mid && mid < hi);
            lo = mid;
        }
        let lo = SortKey::half();
        let mut hi = lo.succ();
        for _ in 0..64 {
            let mid = lo.midpoint(&hi);
            assert!(lo < mid && mid < hi);
            hi = mid;
        }
    }

    #[test]
    fn string_round_trip() {
        let key = SortKey::half().succ().midpoint(&SortKey::half());
        let parsed: SortKey = key.to_string().parse().unwrap();
        assert_eq!(parsed, key);
        assert_eq!("".parse::<SortKey>().unwrap(), SortKey::zero());
    }

    fn arb_key() -> impl Strategy<Value = SortKey> {
        any::<Vec<u8>>().prop_map(|digits| SortKey::canonical(digits.into()))
    }

    proptest! {
        #[test]
        fn midpoint_is_strictly_inside(a in arb_key(), b in arb_key()) {
            let m = a.midpoint(&b);
            if a == b {
                prop_assert!(m == a);
            } else {
                let (lo, hi) = if a < b { (&a, &b) } else { (&b, &a) };
                prop_assert!(*lo < m);
                prop_assert!(m < *hi);
            }
        }

        #[test]
        fn succ_grows(a in arb_key()) {
            prop_assert!(a.succ() > a);
        }

        // the hex form orders exactly like the key, so a sort key stored
        // as a record scalar sorts correctly as a plain string
        #[test]
        fn string_order_matches_key_order(a in arb_key(), b in arb_key()) {
            let string_order = a.to_string().cmp(&b.to_string());
            prop_assert_eq!(string_order, a.cmp(&b));
        }

        #[test]
        fn hex_round_trip(a in arb_key()) {
            let parsed: SortKey = a.to_string().parse().unwrap();
            prop_assert_eq!(parsed, a);
        }
    }
}
