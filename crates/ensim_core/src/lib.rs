#![forbid(unsafe_code)]

use std::ops::{Add, AddAssign, Mul, Neg, Sub, SubAssign};

use blake3::Hasher;

/// Signed fixed-point scalar with 15 fractional bits (s16.15).
///
/// All neural state and on-wire signal values use this representation.
/// Arithmetic wraps on overflow; payload conversion is bit-preserving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct Value(i32);

pub const FRAC_BITS: u32 = 15;

impl Value {
    pub const ZERO: Value = Value(0);
    pub const ONE: Value = Value(1 << FRAC_BITS);

    pub fn from_bits(bits: i32) -> Self {
        Value(bits)
    }

    pub fn to_bits(self) -> i32 {
        self.0
    }

    /// Reinterpret a raw packet payload word as a value.
    pub fn from_payload(payload: u32) -> Self {
        Value(payload as i32)
    }

    pub fn to_payload(self) -> u32 {
        self.0 as u32
    }

    pub fn from_f32(value: f32) -> Self {
        Value((value * (1 << FRAC_BITS) as f32).round() as i64 as i32)
    }

    pub fn to_f32(self) -> f32 {
        self.0 as f32 / (1 << FRAC_BITS) as f32
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub fn max(self, other: Value) -> Value {
        Value(self.0.max(other.0))
    }

    /// Fixed-point square root. Callers must pass a non-negative value.
    pub fn sqrt(self) -> Value {
        debug_assert!(self.0 >= 0, "sqrt of negative value");
        if self.0 <= 0 {
            return Value::ZERO;
        }
        // sqrt(bits / 2^15) * 2^15 == isqrt(bits << 15)
        Value(isqrt((self.0 as u64) << FRAC_BITS) as i32)
    }
}

impl Add for Value {
    type Output = Value;

    fn add(self, rhs: Value) -> Value {
        Value(self.0.wrapping_add(rhs.0))
    }
}

impl AddAssign for Value {
    fn add_assign(&mut self, rhs: Value) {
        *self = *self + rhs;
    }
}

impl Sub for Value {
    type Output = Value;

    fn sub(self, rhs: Value) -> Value {
        Value(self.0.wrapping_sub(rhs.0))
    }
}

impl SubAssign for Value {
    fn sub_assign(&mut self, rhs: Value) {
        *self = *self - rhs;
    }
}

impl Neg for Value {
    type Output = Value;

    fn neg(self) -> Value {
        Value(self.0.wrapping_neg())
    }
}

impl Mul for Value {
    type Output = Value;

    fn mul(self, rhs: Value) -> Value {
        // Full i64 product, arithmetic shift (truncates toward negative
        // infinity), then wrap to 32 bits.
        Value(((self.0 as i64 * rhs.0 as i64) >> FRAC_BITS) as i32)
    }
}

fn isqrt(value: u64) -> u64 {
    if value == 0 {
        return 0;
    }
    let mut x = value;
    let mut next = (x + 1) / 2;
    while next < x {
        x = next;
        next = (x + value / x) / 2;
    }
    x
}

/// Packed per-neuron state: bits 3..0 hold the refractory counter, bits
/// 31..4 hold the low 28 bits of the membrane voltage. The layout matches
/// the off-chip memory image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NeuronStatus(u32);

const REFRACTORY_MASK: u32 = 0x0000_000f;
const VOLTAGE_MASK: u32 = 0x0fff_ffff;

impl NeuronStatus {
    pub fn from_word(word: u32) -> Self {
        NeuronStatus(word)
    }

    pub fn to_word(self) -> u32 {
        self.0
    }

    pub fn refractory_time(self) -> u8 {
        (self.0 & REFRACTORY_MASK) as u8
    }

    pub fn set_refractory(&mut self, t_ref: u8) {
        debug_assert!(u32::from(t_ref) <= REFRACTORY_MASK);
        self.0 = (self.0 & !REFRACTORY_MASK) | (u32::from(t_ref) & REFRACTORY_MASK);
    }

    pub fn decrement_refractory(&mut self) {
        let remaining = self.0 & REFRACTORY_MASK;
        debug_assert!(remaining > 0, "refractory counter underflow");
        self.0 = (self.0 & !REFRACTORY_MASK) | (remaining.saturating_sub(1));
    }

    pub fn voltage(self) -> Value {
        Value::from_bits(((self.0 >> 4) & VOLTAGE_MASK) as i32)
    }

    pub fn set_voltage(&mut self, voltage: Value) {
        let bits = (voltage.to_bits() as u32) & VOLTAGE_MASK;
        self.0 = (self.0 & REFRACTORY_MASK) | (bits << 4);
    }
}

/// Spike-timing perturbation LFSR: shift right, then fold the inverted
/// state back in through taps 0xB400. Consumers read the low 15 bits as
/// a value in [0, 1); from the reference seed of 1 those bits are never
/// all zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lfsr(u16);

const LFSR_TAPS: u16 = 0xb400;
const LFSR_VALUE_MASK: u16 = 0x7fff;

impl Lfsr {
    pub fn new(seed: u16) -> Self {
        Lfsr(seed)
    }

    /// Low 15 bits of the state as a value in [0, 1).
    pub fn value(self) -> Value {
        Value::from_bits(i32::from(self.0 & LFSR_VALUE_MASK))
    }

    pub fn step(&mut self) {
        self.0 = (self.0 >> 1) ^ (!self.0 & LFSR_TAPS);
    }
}

impl Default for Lfsr {
    fn default() -> Self {
        Lfsr::new(1)
    }
}

pub fn digest_meta(domain: &str, bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Hasher::new();
    hasher.update(domain.as_bytes());
    hasher.update(bytes);
    *hasher.finalize().as_bytes()
}
