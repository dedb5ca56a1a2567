//! Concrete fixed-width bit-vectors.
//!
//! Values are at most 64 bits wide and always kept masked to their width;
//! signedness is a property of the operation, never of the value.

use std::cmp::Ordering;
use std::fmt;

pub const MAX_BITS: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BitVec {
    bits: u32,
    value: u64,
}

impl fmt::Display for BitVec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}:{}", self.value, self.bits)
    }
}

impl fmt::LowerHex for BitVec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.value, f)
    }
}

fn mask(bits: u32) -> u64 {
    if bits >= MAX_BITS {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

impl BitVec {
    pub fn new(value: u64, bits: u32) -> Self {
        assert!(bits > 0 && bits <= MAX_BITS, "unsupported bit-vector width {}", bits);
        Self {
            bits,
            value: value & mask(bits),
        }
    }

    pub fn from_i64(value: i64, bits: u32) -> Self {
        Self::new(value as u64, bits)
    }

    pub fn from_bool(value: bool) -> Self {
        Self::new(value as u64, 1)
    }

    pub fn zero(bits: u32) -> Self {
        Self::new(0, bits)
    }

    pub fn one(bits: u32) -> Self {
        Self::new(1, bits)
    }

    pub fn ones(bits: u32) -> Self {
        Self::new(u64::MAX, bits)
    }

    /// Interpret `bytes` as a little-endian integer.
    pub fn from_le_bytes(bytes: &[u8]) -> Self {
        assert!(!bytes.is_empty() && bytes.len() <= 8);
        let value = bytes
            .iter()
            .rev()
            .fold(0u64, |acc, b| (acc << 8) | *b as u64);
        Self::new(value, bytes.len() as u32 * 8)
    }

    pub fn to_le_bytes(&self) -> Vec<u8> {
        assert!(self.bits % 8 == 0, "{} is not byte-sized", self);
        self.value.to_le_bytes()[..(self.bits / 8) as usize].to_vec()
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn to_u64(&self) -> u64 {
        self.value
    }

    pub fn to_i64(&self) -> i64 {
        let shift = MAX_BITS - self.bits;
        ((self.value << shift) as i64) >> shift
    }

    pub fn is_zero(&self) -> bool {
        self.value == 0
    }

    pub fn is_one(&self) -> bool {
        self.value == 1
    }

    pub fn is_ones(&self) -> bool {
        self.value == mask(self.bits)
    }

    pub fn is_negative(&self) -> bool {
        (self.value >> (self.bits - 1)) & 1 == 1
    }

    fn same(&self, other: &Self) {
        assert_eq!(self.bits, other.bits, "width mismatch: {} and {}", self, other);
    }

    pub fn not(&self) -> Self {
        Self::new(!self.value, self.bits)
    }

    pub fn neg(&self) -> Self {
        Self::new(self.value.wrapping_neg(), self.bits)
    }

    pub fn and(&self, other: &Self) -> Self {
        self.same(other);
        Self::new(self.value & other.value, self.bits)
    }

    pub fn or(&self, other: &Self) -> Self {
        self.same(other);
        Self::new(self.value | other.value, self.bits)
    }

    pub fn xor(&self, other: &Self) -> Self {
        self.same(other);
        Self::new(self.value ^ other.value, self.bits)
    }

    pub fn add(&self, other: &Self) -> Self {
        self.same(other);
        Self::new(self.value.wrapping_add(other.value), self.bits)
    }

    pub fn sub(&self, other: &Self) -> Self {
        self.same(other);
        Self::new(self.value.wrapping_sub(other.value), self.bits)
    }

    pub fn mul(&self, other: &Self) -> Self {
        self.same(other);
        Self::new(self.value.wrapping_mul(other.value), self.bits)
    }

    // x / 0 = all ones (SMT-LIB bvudiv)
    pub fn udiv(&self, other: &Self) -> Self {
        self.same(other);
        if other.is_zero() {
            Self::ones(self.bits)
        } else {
            Self::new(self.value / other.value, self.bits)
        }
    }

    // x % 0 = x (SMT-LIB bvurem)
    pub fn urem(&self, other: &Self) -> Self {
        self.same(other);
        if other.is_zero() {
            *self
        } else {
            Self::new(self.value % other.value, self.bits)
        }
    }

    pub fn sdiv(&self, other: &Self) -> Self {
        self.same(other);
        if other.is_zero() {
            if self.is_negative() {
                Self::one(self.bits)
            } else {
                Self::ones(self.bits)
            }
        } else {
            Self::from_i64(self.to_i64().wrapping_div(other.to_i64()), self.bits)
        }
    }

    pub fn srem(&self, other: &Self) -> Self {
        self.same(other);
        if other.is_zero() {
            *self
        } else {
            Self::from_i64(self.to_i64().wrapping_rem(other.to_i64()), self.bits)
        }
    }

    fn shift_amount(&self, other: &Self) -> Option<u32> {
        if other.value >= self.bits as u64 {
            None
        } else {
            Some(other.value as u32)
        }
    }

    pub fn shl(&self, other: &Self) -> Self {
        self.same(other);
        match self.shift_amount(other) {
            Some(n) => Self::new(self.value << n, self.bits),
            None => Self::zero(self.bits),
        }
    }

    pub fn lshr(&self, other: &Self) -> Self {
        self.same(other);
        match self.shift_amount(other) {
            Some(n) => Self::new(self.value >> n, self.bits),
            None => Self::zero(self.bits),
        }
    }

    pub fn ashr(&self, other: &Self) -> Self {
        self.same(other);
        match self.shift_amount(other) {
            Some(n) => Self::from_i64(self.to_i64() >> n, self.bits),
            None if self.is_negative() => Self::ones(self.bits),
            None => Self::zero(self.bits),
        }
    }

    pub fn ucmp(&self, other: &Self) -> Ordering {
        self.same(other);
        self.value.cmp(&other.value)
    }

    pub fn scmp(&self, other: &Self) -> Ordering {
        self.same(other);
        self.to_i64().cmp(&other.to_i64())
    }

    pub fn zero_extend(&self, bits: u32) -> Self {
        assert!(bits >= self.bits);
        Self::new(self.value, bits)
    }

    pub fn sign_extend(&self, bits: u32) -> Self {
        assert!(bits >= self.bits);
        Self::from_i64(self.to_i64(), bits)
    }

    /// Bits `[lsb, msb)`.
    pub fn extract(&self, lsb: u32, msb: u32) -> Self {
        assert!(msb > lsb && msb <= self.bits);
        Self::new(self.value >> lsb, msb - lsb)
    }

    /// `self` becomes the high part.
    pub fn concat(&self, low: &Self) -> Self {
        let bits = self.bits + low.bits;
        assert!(bits <= MAX_BITS, "concatenation exceeds {} bits", MAX_BITS);
        Self::new((self.value << low.bits) | low.value, bits)
    }

    /// Truncate or zero-extend to `bits`.
    pub fn resize(&self, bits: u32) -> Self {
        Self::new(self.value, bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_to_width() {
        let bv = BitVec::new(0x1ff, 8);
        assert_eq!(bv.to_u64(), 0xff);
        assert!(bv.is_ones());
        assert_eq!(bv.to_i64(), -1);
    }

    #[test]
    fn division_by_zero_follows_smt_semantics() {
        let x = BitVec::new(7, 32);
        let z = BitVec::zero(32);
        assert!(x.udiv(&z).is_ones());
        assert_eq!(x.urem(&z), x);
        assert_eq!(BitVec::from_i64(-7, 32).sdiv(&z), BitVec::one(32));
        assert!(x.sdiv(&z).is_ones());
    }

    #[test]
    fn signed_operations() {
        let a = BitVec::from_i64(-8, 16);
        let b = BitVec::new(3, 16);
        assert_eq!(a.sdiv(&b).to_i64(), -2);
        assert_eq!(a.srem(&b).to_i64(), -2);
        assert_eq!(a.ashr(&BitVec::new(1, 16)).to_i64(), -4);
        assert_eq!(a.ashr(&BitVec::new(40, 16)), BitVec::ones(16));
        assert_eq!(a.scmp(&b), Ordering::Less);
        assert_eq!(a.ucmp(&b), Ordering::Greater);
    }

    #[test]
    fn little_endian_bytes() {
        let bv = BitVec::from_le_bytes(b"GOOD");
        assert_eq!(bv.bits(), 32);
        assert_eq!(bv.to_u64(), u32::from_le_bytes(*b"GOOD") as u64);
        assert_eq!(bv.to_le_bytes(), b"GOOD".to_vec());
    }

    #[test]
    fn extract_and_concat() {
        let bv = BitVec::new(0xdead_beef, 32);
        let hi = bv.extract(16, 32);
        let lo = bv.extract(0, 16);
        assert_eq!(hi.to_u64(), 0xdead);
        assert_eq!(hi.concat(&lo), bv);
        assert_eq!(BitVec::new(0x80, 8).sign_extend(16).to_u64(), 0xff80);
    }
}
