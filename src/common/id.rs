//! Overlay node Id or a lookup target, with modular ring distance.

use std::fmt::{self, Debug, Display, Formatter};

use bytes::Bytes;
use rand::Rng;

use crate::{Error, Result};

/// The default size of identifiers in bytes (160 bit space).
pub const DEFAULT_ID_SIZE: usize = 20;

/// Fixed-size big-endian identifier in a `2^(8·size)` ring.
///
/// The size is configured per deployment; two identifiers of different
/// declared size are never equal.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id(Bytes);

impl Id {
    /// Create a new Id from raw big-endian bytes.
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Id {
        Id(Bytes::copy_from_slice(bytes.as_ref()))
    }

    /// Create a new Id from raw bytes, checking the length against the
    /// deployment's configured id size.
    pub fn from_bytes_sized<T: AsRef<[u8]>>(bytes: T, size: usize) -> Result<Id> {
        let bytes = bytes.as_ref();
        if bytes.len() != size {
            return Err(Error::InvalidIdSize {
                expected: size,
                got: bytes.len(),
            });
        }
        Ok(Id::from_bytes(bytes))
    }

    /// Create an Id by hashing arbitrary bytes (truncated SHA-1).
    ///
    /// For sizes beyond a single digest the hash is re-keyed with a counter
    /// until enough bytes accumulate.
    pub fn from_hash<T: AsRef<[u8]>>(data: T, size: usize) -> Id {
        let mut out = Vec::with_capacity(size);
        let mut counter = 0u8;

        while out.len() < size {
            let mut sha = sha1_smol::Sha1::new();
            sha.update(data.as_ref());
            if counter > 0 {
                sha.update(&[counter]);
            }
            out.extend_from_slice(&sha.digest().bytes());
            counter = counter.wrapping_add(1);
        }

        out.truncate(size);
        Id(out.into())
    }

    /// Create an Id from an unsigned integer value, reduced mod `2^(8·size)`.
    pub fn from_uint(value: u128, size: usize) -> Id {
        let be = value.to_be_bytes();
        let mut out = vec![0u8; size];
        let n = size.min(be.len());
        out[size - n..].copy_from_slice(&be[be.len() - n..]);
        Id(out.into())
    }

    /// Parse an Id from a hex string; the size is implied by the string length.
    pub fn from_hex(hex: &str) -> Result<Id> {
        if hex.len() % 2 != 0 {
            return Err(Error::FieldDecode("odd hex string length"));
        }

        let mut out = Vec::with_capacity(hex.len() / 2);
        for i in (0..hex.len()).step_by(2) {
            let byte = u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|_| Error::FieldDecode("invalid hex digit"))?;
            out.push(byte);
        }
        Ok(Id(out.into()))
    }

    /// A uniformly random Id of the given size.
    pub fn random(size: usize) -> Id {
        let mut rng = rand::thread_rng();
        let mut bytes = vec![0u8; size];
        rng.fill(&mut bytes[..]);
        Id(bytes.into())
    }

    // === Getters ===

    /// The declared size of this Id in bytes.
    pub fn size(&self) -> usize {
        self.0.len()
    }

    /// The size of this Id's space in bits.
    pub fn bits(&self) -> usize {
        self.0.len() * 8
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    // === Public Methods ===

    /// Ring distance `(self − from) mod 2^(8·size)`, normalized into
    /// `[1, 2^(8·size)]`. Self-distance counts as the full ring size,
    /// never zero, so the result is a total order usable as a comparator.
    ///
    /// Identifiers of different declared sizes live in different rings and
    /// count as maximally distant, the full ring of the wider space.
    pub fn distance(&self, from: &Id) -> Distance {
        if self.size() != from.size() {
            return Distance::full(self.size().max(from.size()));
        }

        let size = self.size();
        let mut out = vec![0u8; size + 1];

        let mut borrow = 0u16;
        for i in (0..size).rev() {
            let a = self.0[i] as i32;
            let b = from.0[i] as i32 + borrow as i32;
            if a >= b {
                out[i + 1] = (a - b) as u8;
                borrow = 0;
            } else {
                out[i + 1] = (a + 256 - b) as u8;
                borrow = 1;
            }
        }

        if borrow == 0 && out[1..].iter().all(|b| *b == 0) {
            // Wrapped all the way around: full ring size.
            out[0] = 1;
        }

        Distance(out.into_boxed_slice())
    }

    /// Read `len` bits (≤ 32) starting `offset` bits from the least
    /// significant end. Used by prefix-routing algorithms to pick a
    /// routing-table row or column.
    pub fn get_bits(&self, offset: usize, len: usize) -> u32 {
        debug_assert!(len <= 32);

        let mut out = 0u32;
        for i in (0..len).rev() {
            out <<= 1;
            if self.bit(offset + i) {
                out |= 1;
            }
        }
        out
    }

    /// Read a single bit, indexed from the least significant end.
    pub fn bit(&self, index: usize) -> bool {
        if index >= self.bits() {
            return false;
        }
        let byte = self.0[self.size() - 1 - index / 8];
        byte >> (index % 8) & 1 == 1
    }

    /// Return a copy with the bit at `index` (from the LSB) set to `value`.
    pub fn with_bit(&self, index: usize, value: bool) -> Id {
        let mut bytes = self.to_vec();
        let pos = self.size() - 1 - index / 8;
        let mask = 1u8 << (index % 8);
        if value {
            bytes[pos] |= mask;
        } else {
            bytes[pos] &= !mask;
        }
        Id(bytes.into())
    }

    /// Logical shift left by `n` bits, dropping overflow.
    pub fn shift_left(&self, n: usize) -> Id {
        let mut bits: Vec<bool> = (0..self.bits()).map(|i| self.bit(i)).collect();
        let shift = n.min(bits.len());
        bits.rotate_right(shift);
        for b in bits.iter_mut().take(shift) {
            *b = false;
        }
        Id::from_lsb_bits(&bits)
    }

    /// Logical shift right by `n` bits.
    pub fn shift_right(&self, n: usize) -> Id {
        let total = self.bits();
        let bits: Vec<bool> = (0..total)
            .map(|i| i + n < total && self.bit(i + n))
            .collect();
        Id::from_lsb_bits(&bits)
    }

    /// `self + 2^exp mod 2^(8·size)`. Finger slot `i` targets
    /// `self + 2^(i-1)`.
    pub fn add_pow2(&self, exp: usize) -> Id {
        let mut bytes = self.to_vec();
        let size = bytes.len();
        let mut pos = size - 1 - exp / 8;
        let mut carry = 1u8 << (exp % 8);

        loop {
            let (sum, overflow) = bytes[pos].overflowing_add(carry);
            bytes[pos] = sum;
            if !overflow || pos == 0 {
                break;
            }
            carry = 1;
            pos -= 1;
        }

        Id(bytes.into())
    }

    /// `self − 2^exp mod 2^(8·size)`.
    pub fn sub_pow2(&self, exp: usize) -> Id {
        let mut bytes = self.to_vec();
        let size = bytes.len();
        let mut pos = size - 1 - exp / 8;
        let mut borrow = 1u8 << (exp % 8);

        loop {
            let (diff, underflow) = bytes[pos].overflowing_sub(borrow);
            bytes[pos] = diff;
            if !underflow || pos == 0 {
                break;
            }
            borrow = 1;
            pos -= 1;
        }

        Id(bytes.into())
    }

    // === Private Methods ===

    fn from_lsb_bits(bits: &[bool]) -> Id {
        let size = bits.len() / 8;
        let mut bytes = vec![0u8; size];
        for (i, bit) in bits.iter().enumerate() {
            if *bit {
                bytes[size - 1 - i / 8] |= 1 << (i % 8);
            }
        }
        Id(bytes.into())
    }
}

/// Ring distance between two identifiers of the same size.
///
/// One byte wider than the identifiers so that the full ring size
/// `2^(8·size)` (the normalized self-distance) is representable. Distances
/// of equal-sized identifiers compare numerically.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Distance(Box<[u8]>);

impl Distance {
    /// The full ring size `2^(8·size)`, the maximum distance.
    pub fn full(size: usize) -> Distance {
        let mut out = vec![0u8; size + 1];
        out[0] = 1;
        Distance(out.into_boxed_slice())
    }

    /// The distance `2^exp` in a `size`-byte ring.
    pub fn pow2(exp: usize, size: usize) -> Distance {
        let mut out = vec![0u8; size + 1];
        out[size - exp / 8] |= 1 << (exp % 8);
        Distance(out.into_boxed_slice())
    }

    pub fn is_full(&self) -> bool {
        self.0[0] == 1
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({self})")
    }
}

impl Debug for Distance {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Distance({:x?})", &self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn self_distance_is_full_ring() {
        for size in [1, 2, 20] {
            let a = Id::random(size);
            assert_eq!(a.distance(&a), Distance::full(size));
            assert!(a.distance(&a).is_full());
        }
    }

    #[test]
    fn distance_is_never_zero() {
        let zero = |size: usize| Distance(vec![0u8; size + 1].into_boxed_slice());

        for _ in 0..100 {
            let a = Id::random(2);
            let b = Id::random(2);

            let d = a.distance(&b);
            assert!(d > zero(2));
            assert!(d <= Distance::full(2));
        }
    }

    #[test]
    fn distance_matches_modular_arithmetic() {
        for (to, from, expected) in [
            (5u128, 3u128, 2u128),
            (3, 5, 65534),
            (0, 1, 65535),
            (65535, 0, 65535),
            (0, 65535, 1),
        ] {
            let to = Id::from_uint(to, 2);
            let from = Id::from_uint(from, 2);

            let mut want = vec![0u8; 3];
            want[1] = (expected >> 8) as u8;
            want[2] = expected as u8;

            assert_eq!(to.distance(&from).as_bytes(), &want[..]);
        }
    }

    #[test]
    fn distance_across_sizes_is_maximal() {
        let short = Id::from_uint(5, 2);
        let long = Id::from_uint(5, 4);

        assert_eq!(short.distance(&long), Distance::full(4));
        assert_eq!(long.distance(&short), Distance::full(4));
        assert!(short.distance(&long).is_full());
    }

    #[test]
    fn constructors_agree() {
        let id = Id::from_uint(0xabcd, 2);

        assert_eq!(id, Id::from_bytes([0xab, 0xcd]));
        assert_eq!(id, Id::from_hex("abcd").unwrap());
        assert_eq!(id.to_string(), "abcd");
        assert_eq!(Id::from_hex(&id.to_string()).unwrap(), id);
    }

    #[test]
    fn hash_construction_is_deterministic_and_sized() {
        let a = Id::from_hash("203.0.113.7:4000", 20);
        let b = Id::from_hash("203.0.113.7:4000", 20);
        assert_eq!(a, b);
        assert_eq!(a.size(), 20);

        // Truncation keeps the digest prefix.
        let short = Id::from_hash("203.0.113.7:4000", 4);
        assert_eq!(short.as_bytes(), &a.as_bytes()[..4]);

        // Sizes beyond one digest still fill every byte deterministically.
        let long = Id::from_hash("203.0.113.7:4000", 32);
        assert_eq!(long.size(), 32);
        assert_eq!(&long.as_bytes()[..20], a.as_bytes());
    }

    #[test]
    fn different_sizes_never_equal() {
        let a = Id::from_bytes([0, 1]);
        let b = Id::from_bytes([0, 0, 1]);
        assert_ne!(a, b);
    }

    #[test]
    fn bits_and_shifts() {
        let id = Id::from_uint(0b1011_0000_0000_0001, 2);

        assert!(id.bit(0));
        assert!(!id.bit(1));
        assert!(id.bit(15));
        assert_eq!(id.get_bits(12, 4), 0b1011);
        assert_eq!(id.get_bits(0, 4), 0b0001);

        assert_eq!(id.shift_left(1), Id::from_uint(0b0110_0000_0000_0010, 2));
        assert_eq!(id.shift_right(1), Id::from_uint(0b0101_1000_0000_0000, 2));

        // Shifting past the identifier width clears it.
        assert_eq!(id.shift_left(17), Id::from_uint(0, 2));
        assert_eq!(id.shift_right(17), Id::from_uint(0, 2));

        assert_eq!(id.with_bit(1, true), Id::from_uint(0b1011_0000_0000_0011, 2));
        assert_eq!(id.with_bit(0, false), Id::from_uint(0b1011_0000_0000_0000, 2));
    }

    #[test]
    fn pow2_arithmetic_wraps() {
        let id = Id::from_uint(0xffff, 2);
        assert_eq!(id.add_pow2(0), Id::from_uint(0, 2));
        assert_eq!(id.add_pow2(8), Id::from_uint(0x00ff, 2));

        let id = Id::from_uint(0, 2);
        assert_eq!(id.sub_pow2(0), Id::from_uint(0xffff, 2));
        assert_eq!(id.sub_pow2(15), Id::from_uint(0x8000, 2));
    }

    #[test]
    fn ordering_is_numeric() {
        let mut ids: Vec<Id> = (0..50).map(|_| Id::random(4)).collect();
        ids.sort();

        for pair in ids.windows(2) {
            let a = u32::from_be_bytes(pair[0].as_bytes().try_into().unwrap());
            let b = u32::from_be_bytes(pair[1].as_bytes().try_into().unwrap());
            assert!(a <= b);
        }
    }
}
