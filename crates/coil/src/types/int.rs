//! Multi-precision integers.
//!
//! Python has one `int` type; the runtime keeps values that fit in a machine word as
//! `Value::Int(i64)` and promotes to heap-allocated digit strings on overflow.
//! [`Int`] is the arithmetic view over both forms: `Native(i64)` or `Big(digits)`, where
//! digits are little-endian 16-bit words in two's complement (the top bit of the last
//! digit is the sign). Every operation ends in [`Int::reduce`], so a value that fits
//! in a word is always `Native`, and the two forms never compare equal.
//!
//! Add, subtract, multiply, compare and the bitwise operators work on the digits
//! directly. Floor division, modulo, power, shifts and decimal conversion of big
//! values go through `num_bigint`.

use std::{cmp::Ordering, fmt};

use num_bigint::BigInt;
use num_integer::Integer;
use num_traits::{Pow, Signed, ToPrimitive};

use crate::{
    exception_private::{ExcType, RunError, RunResult, SimpleException},
    heap::{Heap, HeapData},
    resource::{LARGE_RESULT_THRESHOLD, ResourceError, ResourceTracker},
    value::Value,
};

type Digit = u16;
const DIGIT_BITS: u32 = 16;
const DIGIT_MASK: u32 = 0xFFFF;
/// Digits needed to hold any `i64`.
const NATIVE_DIGITS: usize = 4;

/// Heap payload for integers outside the `i64` range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LongInt {
    digits: Vec<Digit>,
}

impl LongInt {
    #[must_use]
    pub fn digits(&self) -> &[Digit] {
        &self.digits
    }

    #[must_use]
    pub fn estimate_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.digits.len() * 2
    }
}

/// Arithmetic view of an integer value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Int {
    Native(i64),
    Big(Vec<Digit>),
}

impl From<i64> for Int {
    fn from(v: i64) -> Self {
        Self::Native(v)
    }
}

// ============================================================================
// Digit helpers
// ============================================================================

#[inline]
fn is_negative(digits: &[Digit]) -> bool {
    digits.last().is_some_and(|d| d & 0x8000 != 0)
}

/// Digit `i`, sign-extending past the end.
#[inline]
fn digit_at(digits: &[Digit], i: usize) -> Digit {
    match digits.get(i) {
        Some(&d) => d,
        None if is_negative(digits) => 0xFFFF,
        None => 0,
    }
}

fn native_digits(v: i64) -> Vec<Digit> {
    let bits = v as u64;
    (0..NATIVE_DIGITS)
        .map(|i| ((bits >> (i as u32 * DIGIT_BITS)) & u64::from(DIGIT_MASK)) as Digit)
        .collect()
}

fn add_digits(a: &[Digit], b: &[Digit]) -> Vec<Digit> {
    let n = a.len().max(b.len()) + 1;
    let mut out = Vec::with_capacity(n);
    let mut carry = 0u32;
    for i in 0..n {
        let sum = u32::from(digit_at(a, i)) + u32::from(digit_at(b, i)) + carry;
        out.push((sum & DIGIT_MASK) as Digit);
        carry = sum >> DIGIT_BITS;
    }
    out
}

fn sub_digits(a: &[Digit], b: &[Digit]) -> Vec<Digit> {
    // a + !b + 1
    let n = a.len().max(b.len()) + 1;
    let mut out = Vec::with_capacity(n);
    let mut carry = 1u32;
    for i in 0..n {
        let sum = u32::from(digit_at(a, i)) + u32::from(!digit_at(b, i)) + carry;
        out.push((sum & DIGIT_MASK) as Digit);
        carry = sum >> DIGIT_BITS;
    }
    out
}

/// Subtracts `value << (16 * shift)` from `acc` in place, modulo `2^(16 * acc.len())`.
fn sub_shifted_in_place(acc: &mut [Digit], value: &[Digit], shift: usize) {
    let mut borrow = 0i64;
    for i in shift..acc.len() {
        let sub = value.get(i - shift).map_or(0, |&d| i64::from(d));
        let mut diff = i64::from(acc[i]) - sub - borrow;
        if diff < 0 {
            diff += 1 << DIGIT_BITS;
            borrow = 1;
        } else {
            borrow = 0;
        }
        acc[i] = diff as Digit;
    }
}

/// Schoolbook multiply of the raw digit strings, then two's-complement corrections.
fn mul_digits(a: &[Digit], b: &[Digit]) -> Vec<Digit> {
    let n = a.len() + b.len();
    let mut out = vec![0 as Digit; n];
    for (i, &da) in a.iter().enumerate() {
        let mut carry = 0u32;
        for (j, &db) in b.iter().enumerate() {
            let cur = u32::from(da) * u32::from(db) + u32::from(out[i + j]) + carry;
            out[i + j] = (cur & DIGIT_MASK) as Digit;
            carry = cur >> DIGIT_BITS;
        }
        let mut k = i + b.len();
        while carry != 0 && k < n {
            let cur = u32::from(out[k]) + carry;
            out[k] = (cur & DIGIT_MASK) as Digit;
            carry = cur >> DIGIT_BITS;
            k += 1;
        }
    }
    if is_negative(a) {
        sub_shifted_in_place(&mut out, b, a.len());
    }
    if is_negative(b) {
        sub_shifted_in_place(&mut out, a, b.len());
    }
    out
}

fn bitwise(a: &[Digit], b: &[Digit], op: impl Fn(Digit, Digit) -> Digit) -> Vec<Digit> {
    let n = a.len().max(b.len());
    (0..n).map(|i| op(digit_at(a, i), digit_at(b, i))).collect()
}

fn to_bigint(digits: &[Digit]) -> BigInt {
    let bytes: Vec<u8> = digits.iter().flat_map(|d| d.to_le_bytes()).collect();
    BigInt::from_signed_bytes_le(&bytes)
}

pub(crate) fn from_bigint(value: &BigInt) -> Int {
    if let Some(v) = value.to_i64() {
        return Int::Native(v);
    }
    let mut bytes = value.to_signed_bytes_le();
    if bytes.len() % 2 == 1 {
        let fill = if value.is_negative() { 0xFF } else { 0 };
        bytes.push(fill);
    }
    let digits = bytes.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
    Int::Big(digits).reduce()
}

// ============================================================================
// Int
// ============================================================================

impl Int {
    /// Reads an integer out of a value (`bool` counts as `int`).
    #[must_use]
    pub fn from_value(value: &Value, heap: &Heap<impl ResourceTracker>) -> Option<Self> {
        match value {
            Value::Int(v) => Some(Self::Native(*v)),
            Value::Bool(b) => Some(Self::Native(i64::from(*b))),
            Value::Ref(id) => match heap.get(*id) {
                HeapData::LongInt(li) => Some(Self::Big(li.digits.clone())),
                _ => None,
            },
            _ => None,
        }
    }

    /// Converts into a value, allocating a `LongInt` when the value needs digits.
    pub fn into_value(self, heap: &mut Heap<impl ResourceTracker>) -> Result<Value, ResourceError> {
        match self.reduce() {
            Self::Native(v) => Ok(Value::Int(v)),
            Self::Big(digits) => Ok(Value::Ref(heap.allocate(HeapData::LongInt(LongInt { digits }))?)),
        }
    }

    fn digits(&self) -> Vec<Digit> {
        match self {
            Self::Native(v) => native_digits(*v),
            Self::Big(d) => d.clone(),
        }
    }

    /// Trims redundant sign-extension digits and converts to `Native` when it fits.
    #[must_use]
    pub fn reduce(self) -> Self {
        let Self::Big(mut digits) = self else {
            return self;
        };
        while digits.len() > 1 {
            let top = digits[digits.len() - 1];
            let next_negative = digits[digits.len() - 2] & 0x8000 != 0;
            if (top == 0 && !next_negative) || (top == 0xFFFF && next_negative) {
                digits.pop();
            } else {
                break;
            }
        }
        if digits.len() <= NATIVE_DIGITS {
            let negative = is_negative(&digits);
            let mut bits: u64 = if negative { u64::MAX } else { 0 };
            for (i, &d) in digits.iter().enumerate() {
                let shift = i as u32 * DIGIT_BITS;
                bits &= !(u64::from(DIGIT_MASK) << shift);
                bits |= u64::from(d) << shift;
            }
            Self::Native(bits as i64)
        } else {
            Self::Big(digits)
        }
    }

    #[must_use]
    pub fn is_negative(&self) -> bool {
        match self {
            Self::Native(v) => *v < 0,
            Self::Big(d) => is_negative(d),
        }
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        matches!(self, Self::Native(0))
    }

    #[must_use]
    pub fn add(&self, other: &Self) -> Self {
        if let (Self::Native(a), Self::Native(b)) = (self, other) {
            let r = a.wrapping_add(*b);
            // overflow iff both operands share a sign the result does not
            if (a ^ r) & (b ^ r) >= 0 {
                return Self::Native(r);
            }
        }
        Self::Big(add_digits(&self.digits(), &other.digits())).reduce()
    }

    #[must_use]
    pub fn sub(&self, other: &Self) -> Self {
        if let (Self::Native(a), Self::Native(b)) = (self, other) {
            let r = a.wrapping_sub(*b);
            if (a ^ b) & (a ^ r) >= 0 {
                return Self::Native(r);
            }
        }
        Self::Big(sub_digits(&self.digits(), &other.digits())).reduce()
    }

    #[must_use]
    pub fn mul(&self, other: &Self) -> Self {
        if let (Self::Native(a), Self::Native(b)) = (self, other)
            && let Ok(r) = i64::try_from(i128::from(*a) * i128::from(*b))
        {
            return Self::Native(r);
        }
        Self::Big(mul_digits(&self.digits(), &other.digits())).reduce()
    }

    #[must_use]
    pub fn neg(&self) -> Self {
        Self::Native(0).sub(self)
    }

    #[must_use]
    pub fn abs(&self) -> Self {
        if self.is_negative() { self.neg() } else { self.clone() }
    }

    /// `~x`, i.e. `-x - 1`.
    #[must_use]
    pub fn invert(&self) -> Self {
        match self {
            Self::Native(v) => Self::Native(!v),
            Self::Big(d) => Self::Big(d.iter().map(|x| !x).collect()).reduce(),
        }
    }

    #[must_use]
    pub fn and(&self, other: &Self) -> Self {
        match (self, other) {
            (Self::Native(a), Self::Native(b)) => Self::Native(a & b),
            _ => Self::Big(bitwise(&self.digits(), &other.digits(), |x, y| x & y)).reduce(),
        }
    }

    #[must_use]
    pub fn or(&self, other: &Self) -> Self {
        match (self, other) {
            (Self::Native(a), Self::Native(b)) => Self::Native(a | b),
            _ => Self::Big(bitwise(&self.digits(), &other.digits(), |x, y| x | y)).reduce(),
        }
    }

    #[must_use]
    pub fn xor(&self, other: &Self) -> Self {
        match (self, other) {
            (Self::Native(a), Self::Native(b)) => Self::Native(a ^ b),
            _ => Self::Big(bitwise(&self.digits(), &other.digits(), |x, y| x ^ y)).reduce(),
        }
    }

    pub(crate) fn to_big(&self) -> BigInt {
        match self {
            Self::Native(v) => BigInt::from(*v),
            Self::Big(d) => to_bigint(d),
        }
    }

    /// Floor division.
    pub fn floordiv(&self, other: &Self) -> RunResult<Self> {
        if other.is_zero() {
            return Err(ExcType::zero_division());
        }
        if let (Self::Native(a), Self::Native(b)) = (self, other)
            && !(*a == i64::MIN && *b == -1)
        {
            return Ok(Self::Native(a.div_floor(b)));
        }
        Ok(from_bigint(&self.to_big().div_floor(&other.to_big())))
    }

    /// Modulo with the sign of the divisor.
    pub fn modulo(&self, other: &Self) -> RunResult<Self> {
        if other.is_zero() {
            return Err(ExcType::zero_division());
        }
        if let (Self::Native(a), Self::Native(b)) = (self, other) {
            if *b == -1 {
                return Ok(Self::Native(0));
            }
            return Ok(Self::Native(a.mod_floor(b)));
        }
        Ok(from_bigint(&self.to_big().mod_floor(&other.to_big())))
    }

    /// `self ** exponent` for a non-negative exponent.
    ///
    /// The tracker is asked before building results above `LARGE_RESULT_THRESHOLD`.
    pub fn pow(&self, exponent: &Self, tracker: &impl ResourceTracker) -> RunResult<Self> {
        if exponent.is_negative() {
            return Err(ExcType::value_error(
                "negative exponent not supported for integers",
            ));
        }
        let Self::Native(exp) = exponent else {
            return match self {
                Self::Native(0 | 1) => Ok(self.clone()),
                Self::Native(-1) => Ok(if exponent.and(&Self::Native(1)).is_zero() {
                    Self::Native(1)
                } else {
                    Self::Native(-1)
                }),
                _ => Err(too_large()),
            };
        };
        if let Self::Native(base) = self
            && let Ok(e) = u32::try_from(*exp)
            && let Some(r) = base.checked_pow(e)
        {
            return Ok(Self::Native(r));
        }
        let estimated = (self.bit_length() as u128 * *exp as u128 / 8) as usize;
        if estimated > LARGE_RESULT_THRESHOLD {
            tracker.check_large_result(estimated)?;
        }
        let exp = u64::try_from(*exp).map_err(|_| too_large())?;
        Ok(from_bigint(&self.to_big().pow(exp)))
    }

    pub fn lshift(&self, count: &Self, tracker: &impl ResourceTracker) -> RunResult<Self> {
        let count = shift_count(count)?;
        if let Self::Native(v) = self {
            if *v == 0 {
                return Ok(Self::Native(0));
            }
            if count < 63 {
                let shifted = v << count;
                if shifted >> count == *v {
                    return Ok(Self::Native(shifted));
                }
            }
        }
        let estimated = (self.bit_length() + count) / 8;
        if estimated > LARGE_RESULT_THRESHOLD {
            tracker.check_large_result(estimated)?;
        }
        Ok(from_bigint(&(self.to_big() << count)))
    }

    pub fn rshift(&self, count: &Self) -> RunResult<Self> {
        let count = shift_count(count)?;
        match self {
            Self::Native(v) => Ok(Self::Native(if count >= 64 { v >> 63 } else { v >> count })),
            Self::Big(_) => Ok(from_bigint(&(self.to_big() >> count))),
        }
    }

    /// Number of significant bits of the magnitude.
    #[must_use]
    pub fn bit_length(&self) -> usize {
        match self {
            Self::Native(v) => 64 - v.unsigned_abs().leading_zeros() as usize,
            Self::Big(d) => to_bigint(d).bits() as usize,
        }
    }

    /// Parses a base-10 literal (optional sign, surrounding whitespace allowed).
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let trimmed = text.trim();
        if let Ok(v) = trimmed.parse::<i64>() {
            return Some(Self::Native(v));
        }
        if trimmed.is_empty() || trimmed.contains('_') {
            return None;
        }
        trimmed.parse::<BigInt>().ok().map(|b| from_bigint(&b))
    }

    /// Parses a literal in `radix` (2 to 36), as `int(text, radix)` does: optional sign,
    /// surrounding whitespace, and a `0x`/`0o`/`0b` prefix matching the radix.
    #[must_use]
    pub fn parse_radix(text: &str, radix: u32) -> Option<Self> {
        let trimmed = text.trim();
        let (negative, digits) = match trimmed.as_bytes().first() {
            Some(b'-') => (true, &trimmed[1..]),
            Some(b'+') => (false, &trimmed[1..]),
            _ => (false, trimmed),
        };
        let lower = digits.to_ascii_lowercase();
        let prefix = match radix {
            16 => Some("0x"),
            8 => Some("0o"),
            2 => Some("0b"),
            _ => None,
        };
        let digits = prefix.and_then(|p| lower.strip_prefix(p)).unwrap_or(&lower);
        if digits.is_empty() || digits.contains('_') {
            return None;
        }
        let magnitude = BigInt::parse_bytes(digits.as_bytes(), radix)?;
        let value = if negative { -magnitude } else { magnitude };
        Some(from_bigint(&value))
    }

    /// Hash: the value itself for native ints, a fold of the digits otherwise.
    /// `-1` maps to `-2` in both cases.
    #[must_use]
    pub fn hash(&self) -> i64 {
        let h = match self {
            Self::Native(v) => *v,
            Self::Big(digits) => digits
                .iter()
                .rev()
                .fold(0i64, |acc, &d| acc.rotate_left(DIGIT_BITS).wrapping_add(i64::from(d))),
        };
        if h == -1 { -2 } else { h }
    }

    /// Clamps to an index-like `i64`, saturating for big values.
    #[must_use]
    pub fn saturating_i64(&self) -> i64 {
        match self {
            Self::Native(v) => *v,
            Self::Big(d) if is_negative(d) => i64::MIN,
            Self::Big(_) => i64::MAX,
        }
    }
}

fn shift_count(count: &Int) -> RunResult<usize> {
    if count.is_negative() {
        return Err(ExcType::value_error("negative shift count"));
    }
    match count {
        Int::Native(c) => usize::try_from(*c).map_err(|_| too_large()),
        Int::Big(_) => Err(too_large()),
    }
}

/// Results too large to represent are reported as `MemoryError`.
fn too_large() -> RunError {
    SimpleException::new_none(ExcType::MemoryError).into()
}

impl PartialOrd for Int {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Int {
    /// Sign first, then length, then a digit scan from the most significant digit.
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Native(a), Self::Native(b)) => a.cmp(b),
            _ => {
                let (a, b) = (self.digits(), other.digits());
                let (na, nb) = (is_negative(&a), is_negative(&b));
                if na != nb {
                    return if na { Ordering::Less } else { Ordering::Greater };
                }
                if a.len() != b.len() {
                    let longer_is_bigger = !na;
                    return match (a.len() > b.len(), longer_is_bigger) {
                        (true, true) | (false, false) => Ordering::Greater,
                        _ => Ordering::Less,
                    };
                }
                a.iter().rev().cmp(b.iter().rev())
            }
        }
    }
}

impl fmt::Display for Int {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native(v) => write!(f, "{v}"),
            Self::Big(d) => write!(f, "{}", to_bigint(d)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::NoLimitTracker;

    fn big(s: &str) -> Int {
        Int::parse(s).expect("valid literal")
    }

    #[test]
    fn small_sums_stay_native() {
        assert_eq!(Int::Native(2).add(&Int::Native(2)), Int::Native(4));
    }

    #[test]
    fn overflow_promotes_and_demotes() {
        let max = Int::Native(i64::MAX);
        let promoted = max.add(&Int::Native(1));
        assert!(matches!(promoted, Int::Big(_)));
        assert_eq!(promoted.to_string(), "9223372036854775808");
        assert_eq!(promoted.sub(&Int::Native(1)), Int::Native(i64::MAX));
        let min = Int::Native(i64::MIN);
        let below = min.sub(&Int::Native(1));
        assert_eq!(below.to_string(), "-9223372036854775809");
        assert_eq!(below.add(&Int::Native(1)), Int::Native(i64::MIN));
    }

    #[test]
    fn multiply_matches_bigint() {
        let cases = [
            ("123456789012345678901234567890", "-987654321098765432109876543210"),
            ("-4294967296", "-4294967296"),
            ("9223372036854775807", "9223372036854775807"),
            ("-1", "340282366920938463463374607431768211456"),
        ];
        for (a, b) in cases {
            let expected = a.parse::<BigInt>().expect("a") * b.parse::<BigInt>().expect("b");
            assert_eq!(big(a).mul(&big(b)).to_string(), expected.to_string(), "{a} * {b}");
        }
        assert_eq!(Int::Native(i64::MIN).mul(&Int::Native(-1)).to_string(), "9223372036854775808");
    }

    #[test]
    fn comparison_orders_by_sign_then_magnitude() {
        let huge = big("100000000000000000000000");
        let neg_huge = big("-100000000000000000000000");
        assert!(huge > Int::Native(i64::MAX));
        assert!(neg_huge < Int::Native(i64::MIN));
        assert!(neg_huge < huge);
        assert!(big("-100000000000000000000001") < neg_huge);
        assert_eq!(huge.cmp(&big("100000000000000000000000")), Ordering::Equal);
    }

    #[test]
    fn floor_division_and_modulo_follow_python() {
        assert_eq!(Int::Native(-7).floordiv(&Int::Native(2)).ok(), Some(Int::Native(-4)));
        assert_eq!(Int::Native(-7).modulo(&Int::Native(2)).ok(), Some(Int::Native(1)));
        assert_eq!(Int::Native(7).modulo(&Int::Native(-2)).ok(), Some(Int::Native(-1)));
        assert!(Int::Native(1).floordiv(&Int::Native(0)).is_err());
        assert_eq!(
            Int::Native(i64::MIN).floordiv(&Int::Native(-1)).ok().map(|v| v.to_string()),
            Some("9223372036854775808".to_owned())
        );
    }

    #[test]
    fn power_and_shifts() {
        let t = NoLimitTracker;
        assert_eq!(
            Int::Native(2).pow(&Int::Native(100), &t).ok().map(|v| v.to_string()),
            Some("1267650600228229401496703205376".to_owned())
        );
        assert!(Int::Native(2).pow(&Int::Native(-1), &t).is_err());
        let shifted = Int::Native(1).lshift(&Int::Native(64), &t).ok();
        assert_eq!(shifted.as_ref().map(ToString::to_string), Some("18446744073709551616".to_owned()));
        assert_eq!(shifted.map(|s| s.rshift(&Int::Native(64)).ok()), Some(Some(Int::Native(1))));
        assert!(Int::Native(1).lshift(&Int::Native(-1), &t).is_err());
        assert_eq!(Int::Native(-5).rshift(&Int::Native(100)).ok(), Some(Int::Native(-1)));
    }

    #[test]
    fn bitwise_on_big_values() {
        let a = big("-18446744073709551616");
        assert_eq!(a.and(&Int::Native(0xFF)), Int::Native(0));
        assert_eq!(a.invert().to_string(), "18446744073709551615");
        assert_eq!(a.xor(&a), Int::Native(0));
        assert_eq!(a.or(&Int::Native(1)).to_string(), "-18446744073709551615");
    }

    #[test]
    fn radix_literals() {
        assert_eq!(Int::parse_radix("ff", 16), Some(Int::Native(255)));
        assert_eq!(Int::parse_radix(" -0x10 ", 16), Some(Int::Native(-16)));
        assert_eq!(Int::parse_radix("101", 2), Some(Int::Native(5)));
        assert_eq!(Int::parse_radix("z", 36), Some(Int::Native(35)));
        assert_eq!(Int::parse_radix("12", 2), None);
        assert_eq!(Int::parse_radix("", 10), None);
        assert_eq!(
            Int::parse_radix("10000000000000000", 16).map(|v| v.to_string()),
            Some("18446744073709551616".to_owned())
        );
    }

    #[test]
    fn hash_avoids_minus_one() {
        assert_eq!(Int::Native(-1).hash(), -2);
        assert_eq!(Int::Native(42).hash(), 42);
    }
}
