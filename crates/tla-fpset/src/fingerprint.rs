//! TLC-compatible polynomial rolling hash (Rabin fingerprints)
//!
//! Fingerprints are computed incrementally: a hasher is seeded from one of
//! the irreducible polynomials in [`POLYS`] and extended one byte, char,
//! integer or string at a time. Extension never re-reads earlier input, so
//! callers can cache a prefix and keep extending it.
//!
//! # Algorithm
//!
//! Each lane is a polynomial rolling hash over GF(2^64). The irreducible
//! polynomial of the selected family is both the modulus and the initial
//! value. A 256-entry table per polynomial allows byte-at-a-time extension:
//!
//! ```text
//! fp = (fp >> 8) ^ table[(b ^ fp) & 0xFF]
//! ```
//!
//! 128-bit fingerprints run two independent lanes in lock-step over the same
//! input, the low lane with family `i` and the high lane with family
//! `(i + 1) mod NUM_POLYS`.
//!
//! # Families
//!
//! The family index picks the polynomial. Distinct families give
//! uncorrelated hash functions, which lets independent fingerprint sets (or
//! repeated runs) use unrelated fingerprints for the same states.

use std::fmt;
use std::hash::Hash;
use std::sync::OnceLock;

use num_bigint::BigInt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Irreducible polynomials of degree 64, one per hash family.
/// Family `i` uses `POLYS[i]`; the values match TLC's table.
pub const POLYS: [u64; 131] = [
    0x911498AE0E66BAD6, 0xDA8A0BA66DAE0181, 0xC02F176B8F268D9F, 0xD617BB1220FC7812,
    0xC6FD951AD34F9F74, 0xDD1897BD991704D4, 0xF5394C541CBFD343, 0xB1DDED37B5C7B8F7,
    0xB713FF61039DC632, 0xDFB340CB2FB03D43, 0xBC3E7E4C5ECB76A3, 0xDBB4B1349CD7058A,
    0xF53E9DCB9E915CDF, 0xCA5F58E90DD01848, 0x80E7FF4406891AA1, 0xAB541BF881FA8571,
    0xBF274E07AC5499D5, 0x939B1EA933040A4E, 0xB791A595448D75B1, 0x8BF88D6EF85563A2,
    0xECB33EC339513A53, 0xFA2D3E722DB5208A, 0xB4E2058AAC479D24, 0xAFBD6474E7213B82,
    0x98C1694D14FFAEEF, 0xE188FB5C0A125E24, 0xFA71CC3865487D80, 0x891135F7C1C94569,
    0xCF77CDD16D22E3E6, 0xEB5E3A1D2E2BB4B5, 0x92F7F5B69CD00C55, 0xA9FBBE40CA3B9AE9,
    0x84A7B33D85295BDE, 0xEBD4680DBB6FDEE2, 0xA31FC46A0583B4D0, 0xA792C94F15DE3E49,
    0xD9D60A9FEFF4521A, 0x9227BA31DFDDA04B, 0xFB4C89C607CE162D, 0xA89B3B2E01479CC0,
    0xB35A0C2A28B89F7D, 0x91D0B700B99D9EC2, 0xF0646BBDA05020B0, 0xCB5D5F63CE043056,
    0xD276B6A04F42A1B8, 0xBC1A7A7DBFEB47A3, 0xE138ACFF7A963036, 0xED860223C1557EE7,
    0x9B2491E980150AB6, 0xE7E03DD8A5B4E59E, 0xAAA3F5EAC516783C, 0xFE78CC267A724180,
    0xC22519A21EDFAC64, 0xCDB2941933FEC60F, 0xC5F485551EF38AA1, 0xA19293D250BD3335,
    0xA4D4C215A50B7AFE, 0xC1155176406A5070, 0xECADAA8200E123EC, 0xBACFE629D58B2F08,
    0xDED991082148CB42, 0x9A0CCBE5DEAA88DB, 0x9A83246F342061BB, 0xB71482842297AB05,
    0xF2407EEB997592BD, 0xB7B43D4B5C4C4BCC, 0xB339A2568221FFE7, 0xDB4B6B379446EF9E,
    0xE43C205BB5C0B2B6, 0xE8E1D141F19D6DB0, 0xD19E8710A4EA1C86, 0x9704CECFA8D6D07B,
    0xB0A35716162C3F26, 0xA2A68C0CF56390AC, 0xE4A74BC601C95B46, 0xE668FFF675595E56,
    0xE0EA77EBE06FABBB, 0xA8BB94F585279523, 0xBEB667B42B684F21, 0xD7B65410189E28AF,
    0x85722037BEFFC5B9, 0xE7E7C5F773426204, 0xA5FD0CC8E060C6F4, 0xB8F91EE9065DCF95,
    0xB4047008040F8B50, 0xECB9AB6291C8CFCC, 0xE08BB9B70CAAD6DF, 0xD6E086A301D95D56,
    0xF6A808F5F3FB9DA3, 0xFA74B8A8EF86FBC5, 0xA0B6B33BA9E6381C, 0x8C78703427873DBB,
    0xC5516EA423011021, 0xB075CCE8528AE7E2, 0x92E4A37979E2B13B, 0xAFC9AB000ED81026,
    0xF1873F2A861A518A, 0xF885D6B35770192C, 0xD2A82F27F71F5F7E, 0xD5E7A4DD8BEB2D9F,
    0xBAB9E7E65DC23E0F, 0xD5FC877C0BDF5B85, 0xAB428169B9F31C02, 0xB7B1351F9266D3EA,
    0xFAD564914328F635, 0x9623ECB1000DB9BD, 0x88D371EC6644C892, 0xD0A71270573E271C,
    0xBD200D763F9D81B4, 0x8484FD96374BF2EA, 0xE0D0810749432294, 0x8EBE9DADC88658BA,
    0xF6268C58993AE542, 0xD6CC88FED0D359C9, 0xBCADDB8D40A16690, 0x92817C6DB421CBF6,
    0xAC63721120A371B5, 0xD6CC137FDCED0820, 0xF1C5FBAEBB617BD7, 0xAC35D78C765237A5,
    0xBD0A471FA9A23116, 0x943A7031B946A5AE, 0xE4E83520CB1AAEBB, 0xE92A4B73246DD124,
    0xAFC1E070787C4C86, 0xDFE84D42CF06286B, 0x8B29EC962E4B964B, 0x807EB5DE812EDE0F,
    0xA3CD71299C8B3BFD, 0x845B8031EF886F35, 0x91F5A5FA9C5515A5,
];

/// Number of available hash families.
pub const NUM_POLYS: usize = POLYS.len();

/// Initial value of a family-0 fingerprint (Polys[0] in TLC).
pub const FP64_INIT: u64 = POLYS[0];

/// Internal constants for table computation
const ONE: u64 = 0x8000000000000000;
const X63: u64 = 0x1;

/// One ByteModTable_7 per polynomial, computed together on first use.
static BYTE_MOD_TABLES: OnceLock<Box<[[u64; 256]]>> = OnceLock::new();

#[inline]
fn byte_mod_tables() -> &'static [[u64; 256]] {
    BYTE_MOD_TABLES.get_or_init(|| POLYS.iter().map(|&p| compute_byte_mod_table(p)).collect())
}

/// The byte reduction table of `family`.
#[inline]
pub fn byte_mod_table(family: FpFamily) -> &'static [u64; 256] {
    &byte_mod_tables()[family.index()]
}

/// Byte reduction table for `irred_poly`.
/// This precomputes the polynomial contributions for all 256 byte values.
fn compute_byte_mod_table(irred_poly: u64) -> [u64; 256] {
    // Maximum power needed: 127 - 7*8 = 71, so we need 72 entries
    const PLENGTH: usize = 72;
    let mut power_table = [0u64; PLENGTH];

    // power_table[i] = x^i mod irred_poly
    let mut t = ONE;
    for entry in power_table.iter_mut() {
        *entry = t;
        let mask = if (t & X63) != 0 { irred_poly } else { 0 };
        t = (t >> 1) ^ mask;
    }

    let mut table = [0u64; 256];
    for (j, entry) in table.iter_mut().enumerate() {
        let mut v = 0u64;
        for k in 0..=7 {
            if (j & (1usize << k)) != 0 {
                v ^= power_table[127 - 7 * 8 - k];
            }
        }
        *entry = v;
    }
    table
}

/// Extend a single 64-bit lane by one byte.
///
/// This is the core operation every other extension reduces to.
#[inline]
pub fn fp64_extend_byte(table: &[u64; 256], fp: u64, b: u8) -> u64 {
    let idx = ((b as u64) ^ fp) as usize & 0xFF;
    (fp >> 8) ^ table[idx]
}

/// Index of the irreducible polynomial a hasher is seeded with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "usize", into = "usize")]
pub struct FpFamily(usize);

impl FpFamily {
    /// Returns `None` when `index` is not below [`NUM_POLYS`].
    pub fn new(index: usize) -> Option<Self> {
        (index < NUM_POLYS).then_some(FpFamily(index))
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0
    }

    /// The family of the high lane of a 128-bit fingerprint.
    #[inline]
    pub const fn next(self) -> Self {
        FpFamily((self.0 + 1) % NUM_POLYS)
    }

    /// Initial lane value for this family.
    #[inline]
    pub const fn seed(self) -> u64 {
        POLYS[self.0]
    }
}

impl TryFrom<usize> for FpFamily {
    type Error = String;

    fn try_from(index: usize) -> Result<Self, Self::Error> {
        FpFamily::new(index)
            .ok_or_else(|| format!("fingerprint family {index} out of range 0..{NUM_POLYS}"))
    }
}

impl From<FpFamily> for usize {
    fn from(family: FpFamily) -> usize {
        family.0
    }
}

/// A fixed-width fingerprint value as stored by the fingerprint sets.
///
/// Ordering is the numeric order of the underlying W-bit integer. The
/// address word is the most significant 64 bits; bucket and shard routing
/// only ever look at it, so ordering by address word first keeps buckets
/// in ascending value order.
pub trait Fingerprint:
    Copy
    + Ord
    + Eq
    + Hash
    + fmt::Debug
    + fmt::Display
    + Send
    + Sync
    + Serialize
    + DeserializeOwned
    + 'static
{
    /// Width in bits (64 or 128).
    const WIDTH_BITS: u32;
    /// Number of 64-bit words in the storage representation.
    const WORDS: usize;
    /// Number of bytes in the on-disk representation.
    const BYTES: usize = Self::WORDS * 8;

    type Hasher: FingerprintHasher<Output = Self>;

    /// A fresh hasher seeded from `family`.
    fn hasher(family: FpFamily) -> Self::Hasher;

    /// The most significant 64 bits, used for bucket and shard addressing.
    fn address_word(&self) -> u64;

    /// Two hash lanes for the bloom filter's double hashing.
    fn probe_lanes(&self) -> (u64, u64);

    /// Write the value into `out[..Self::WORDS]`.
    fn store_words(&self, out: &mut [u64]);

    /// Read a value previously written by [`Fingerprint::store_words`].
    fn load_words(words: &[u64]) -> Self;

    /// Big-endian encoding into `out[..Self::BYTES]`; byte order equals value order.
    fn encode(&self, out: &mut [u8]);

    /// Inverse of [`Fingerprint::encode`].
    fn decode(bytes: &[u8]) -> Self;
}

/// Incremental fingerprint computation.
///
/// Every `extend_*` call consumes the hasher and returns it advanced by the
/// given input, so extension chains read left to right.
pub trait FingerprintHasher: Clone + Send {
    type Output: Fingerprint;

    /// Extend by one byte.
    fn extend_byte(self, b: u8) -> Self;

    /// The fingerprint of everything fed so far.
    fn finish(&self) -> Self::Output;

    /// Extend by a byte slice.
    fn extend_bytes(self, bytes: &[u8]) -> Self {
        bytes.iter().fold(self, |h, &b| h.extend_byte(b))
    }

    /// Extend by a character.
    ///
    /// Feeds the low byte of each UTF-16 code unit, so characters outside
    /// the BMP contribute both surrogates.
    fn extend_char(self, c: char) -> Self {
        let mut units = [0u16; 2];
        c.encode_utf16(&mut units)
            .iter()
            .fold(self, |h, &u| h.extend_byte((u & 0xFF) as u8))
    }

    /// Extend by an i32 (4 bytes, little-endian).
    /// Corresponds to TLC's `FP64.Extend(fp, int)`.
    fn extend_i32(self, x: i32) -> Self {
        self.extend_bytes(&x.to_le_bytes())
    }

    /// Extend by an i64 (8 bytes, little-endian).
    fn extend_i64(self, x: i64) -> Self {
        self.extend_bytes(&x.to_le_bytes())
    }

    /// Extend by a string, one UTF-16 code unit at a time (low byte only).
    fn extend_str(self, s: &str) -> Self {
        s.encode_utf16()
            .fold(self, |h, u| h.extend_byte((u & 0xFF) as u8))
    }

    /// Extend by an arbitrary-precision integer.
    ///
    /// Uses the i32 encoding when the value fits (matching TLC's IntValue),
    /// then i64, then the signed little-endian bytes.
    fn extend_bigint(self, n: &BigInt) -> Self {
        if let Ok(i) = i32::try_from(n) {
            return self.extend_i32(i);
        }
        if let Ok(i) = i64::try_from(n) {
            return self.extend_i64(i);
        }
        self.extend_bytes(&n.to_signed_bytes_le())
    }
}

#[inline]
fn be_word(bytes: &[u8], at: usize) -> u64 {
    let mut w = [0u8; 8];
    w.copy_from_slice(&bytes[at..at + 8]);
    u64::from_be_bytes(w)
}

/// MurmurHash3 finalizer, used to derive a second probe lane from 64 bits.
#[inline]
fn fmix64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xFF51AFD7ED558CCD);
    k ^= k >> 33;
    k = k.wrapping_mul(0xC4CEB9FE1A85EC53);
    k ^ (k >> 33)
}

// ============================================================================
// 64-bit fingerprints
// ============================================================================

/// A 64-bit fingerprint.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fp64(pub u64);

impl Fp64 {
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for Fp64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FP({:016x})", self.0)
    }
}

impl fmt::Display for Fp64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl Fingerprint for Fp64 {
    const WIDTH_BITS: u32 = 64;
    const WORDS: usize = 1;

    type Hasher = Fp64Hasher;

    fn hasher(family: FpFamily) -> Fp64Hasher {
        Fp64Hasher::new(family)
    }

    #[inline]
    fn address_word(&self) -> u64 {
        self.0
    }

    #[inline]
    fn probe_lanes(&self) -> (u64, u64) {
        (self.0, fmix64(self.0))
    }

    #[inline]
    fn store_words(&self, out: &mut [u64]) {
        out[0] = self.0;
    }

    #[inline]
    fn load_words(words: &[u64]) -> Self {
        Fp64(words[0])
    }

    #[inline]
    fn encode(&self, out: &mut [u8]) {
        out[..8].copy_from_slice(&self.0.to_be_bytes());
    }

    #[inline]
    fn decode(bytes: &[u8]) -> Self {
        Fp64(be_word(bytes, 0))
    }
}

/// Incremental builder for [`Fp64`] fingerprints.
#[derive(Clone, Copy)]
pub struct Fp64Hasher {
    state: u64,
    family: FpFamily,
    table: &'static [u64; 256],
}

impl Fp64Hasher {
    pub fn new(family: FpFamily) -> Self {
        Fp64Hasher {
            state: family.seed(),
            family,
            table: byte_mod_table(family),
        }
    }

    pub fn family(&self) -> FpFamily {
        self.family
    }
}

impl fmt::Debug for Fp64Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fp64Hasher")
            .field("state", &format_args!("{:016x}", self.state))
            .field("family", &self.family.index())
            .finish()
    }
}

impl FingerprintHasher for Fp64Hasher {
    type Output = Fp64;

    #[inline]
    fn extend_byte(mut self, b: u8) -> Self {
        self.state = fp64_extend_byte(self.table, self.state, b);
        self
    }

    #[inline]
    fn finish(&self) -> Fp64 {
        Fp64(self.state)
    }
}

// ============================================================================
// 128-bit fingerprints
// ============================================================================

/// A 128-bit fingerprint made of two independent 64-bit polynomial lanes.
///
/// Ordered as the integer `higher << 64 | lower`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Fp128 {
    // Field order matters: derived Ord compares `higher` first.
    higher: u64,
    lower: u64,
}

impl Fp128 {
    pub const fn from_parts(lower: u64, higher: u64) -> Self {
        Fp128 { higher, lower }
    }

    #[inline]
    pub const fn lower(self) -> u64 {
        self.lower
    }

    #[inline]
    pub const fn higher(self) -> u64 {
        self.higher
    }

    #[inline]
    pub const fn as_u128(self) -> u128 {
        ((self.higher as u128) << 64) | self.lower as u128
    }
}

impl fmt::Debug for Fp128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FP128({:016x}{:016x})", self.higher, self.lower)
    }
}

impl fmt::Display for Fp128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:016x}", self.higher, self.lower)
    }
}

impl Fingerprint for Fp128 {
    const WIDTH_BITS: u32 = 128;
    const WORDS: usize = 2;

    type Hasher = Fp128Hasher;

    fn hasher(family: FpFamily) -> Fp128Hasher {
        Fp128Hasher::new(family)
    }

    #[inline]
    fn address_word(&self) -> u64 {
        self.higher
    }

    #[inline]
    fn probe_lanes(&self) -> (u64, u64) {
        (self.lower, self.higher)
    }

    #[inline]
    fn store_words(&self, out: &mut [u64]) {
        out[0] = self.higher;
        out[1] = self.lower;
    }

    #[inline]
    fn load_words(words: &[u64]) -> Self {
        Fp128 {
            higher: words[0],
            lower: words[1],
        }
    }

    #[inline]
    fn encode(&self, out: &mut [u8]) {
        out[..8].copy_from_slice(&self.higher.to_be_bytes());
        out[8..16].copy_from_slice(&self.lower.to_be_bytes());
    }

    #[inline]
    fn decode(bytes: &[u8]) -> Self {
        Fp128 {
            higher: be_word(bytes, 0),
            lower: be_word(bytes, 8),
        }
    }
}

/// Incremental builder for [`Fp128`] fingerprints.
#[derive(Clone, Copy)]
pub struct Fp128Hasher {
    lower: u64,
    higher: u64,
    family: FpFamily,
    lower_table: &'static [u64; 256],
    higher_table: &'static [u64; 256],
}

impl Fp128Hasher {
    pub fn new(family: FpFamily) -> Self {
        let high_family = family.next();
        Fp128Hasher {
            lower: family.seed(),
            higher: high_family.seed(),
            family,
            lower_table: byte_mod_table(family),
            higher_table: byte_mod_table(high_family),
        }
    }

    pub fn family(&self) -> FpFamily {
        self.family
    }
}

impl fmt::Debug for Fp128Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fp128Hasher")
            .field("lower", &format_args!("{:016x}", self.lower))
            .field("higher", &format_args!("{:016x}", self.higher))
            .field("family", &self.family.index())
            .finish()
    }
}

impl FingerprintHasher for Fp128Hasher {
    type Output = Fp128;

    #[inline]
    fn extend_byte(mut self, b: u8) -> Self {
        self.lower = fp64_extend_byte(self.lower_table, self.lower, b);
        self.higher = fp64_extend_byte(self.higher_table, self.higher, b);
        self
    }

    #[inline]
    fn finish(&self) -> Fp128 {
        Fp128::from_parts(self.lower, self.higher)
    }
}
