//! Modular arithmetic seam for the key exchange
//!
//! The handshake only needs a handful of operations on non-negative integers;
//! [`ModularInteger`] names them and is implemented for
//! [`num_bigint::BigUint`].

use num_bigint::BigUint;
use num_traits::{One, Zero};

pub trait ModularInteger: Sized + Clone + Ord {
    /// Parse an unsigned big-endian magnitude
    fn from_be(bytes: &[u8]) -> Self;

    /// Minimal big-endian magnitude; zero encodes as a single `0` byte
    fn to_be(&self) -> Vec<u8>;

    /// `self ^ exponent mod modulus`
    fn pow_mod(&self, exponent: &Self, modulus: &Self) -> Self;

    /// Width of the minimal big-endian encoding
    fn byte_len(&self) -> usize;

    /// Whether `1 < self < modulus - 1`
    fn within_open_range(&self, modulus: &Self) -> bool;

    /// Overwrite the backing storage with zeros and leave the value at zero
    fn wipe(&mut self);
}

impl ModularInteger for BigUint {
    fn from_be(bytes: &[u8]) -> Self {
        BigUint::from_bytes_be(bytes)
    }

    fn to_be(&self) -> Vec<u8> {
        self.to_bytes_be()
    }

    fn pow_mod(&self, exponent: &Self, modulus: &Self) -> Self {
        self.modpow(exponent, modulus)
    }

    fn byte_len(&self) -> usize {
        self.bits().div_ceil(8) as usize
    }

    fn within_open_range(&self, modulus: &Self) -> bool {
        let one = BigUint::one();
        if *modulus <= one {
            return false;
        }
        let upper = modulus - &one;
        *self > one && *self < upper
    }

    fn wipe(&mut self) {
        // Rewriting in place reuses the allocation, so the old digits are
        // overwritten before the buffer is released.
        let words = (self.bits() / 32 + 2) as usize;
        self.assign_from_slice(&vec![0u32; words]);
        debug_assert!(self.is_zero());
    }
}
