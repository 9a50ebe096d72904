//! Tagged hash keys and their type-specific hash functions.

const HASH_BITS: u32 = 61;
const HASH_MODULUS: u64 = (1 << HASH_BITS) - 1;

/// Owned key stored inside a [`HashTable`](crate::HashTable).
///
/// Keys of different variants never compare equal, even when they carry the
/// same numeric value.
#[derive(Debug, Clone, PartialEq)]
pub enum HashKey {
    Str(String),
    U32(u32),
    U64(u64),
    F64(f64),
}

/// Borrowed form of [`HashKey`], used for lookups so string keys don't need
/// to be allocated just to be found.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KeyRef<'a> {
    Str(&'a str),
    U32(u32),
    U64(u64),
    F64(f64),
}

impl HashKey {
    pub fn as_key_ref(&self) -> KeyRef<'_> {
        match self {
            Self::Str(s) => KeyRef::Str(s),
            Self::U32(v) => KeyRef::U32(*v),
            Self::U64(v) => KeyRef::U64(*v),
            Self::F64(v) => KeyRef::F64(*v),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl KeyRef<'_> {
    pub fn hash(self) -> u32 {
        match self {
            Self::Str(s) => hash_str(s),
            Self::U32(v) => hash_u32(v),
            Self::U64(v) => hash_u64(v),
            Self::F64(v) => hash_f64(v),
        }
    }

    pub fn to_owned_key(self) -> HashKey {
        match self {
            Self::Str(s) => HashKey::Str(s.to_owned()),
            Self::U32(v) => HashKey::U32(v),
            Self::U64(v) => HashKey::U64(v),
            Self::F64(v) => HashKey::F64(v),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Conversions
// ─────────────────────────────────────────────────────────────────────────────

impl From<String> for HashKey {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<&str> for HashKey {
    fn from(s: &str) -> Self {
        Self::Str(s.to_owned())
    }
}

impl From<u32> for HashKey {
    fn from(v: u32) -> Self {
        Self::U32(v)
    }
}

impl From<u64> for HashKey {
    fn from(v: u64) -> Self {
        Self::U64(v)
    }
}

impl From<f64> for HashKey {
    fn from(v: f64) -> Self {
        Self::F64(v)
    }
}

impl<'a> From<&'a HashKey> for KeyRef<'a> {
    fn from(key: &'a HashKey) -> Self {
        key.as_key_ref()
    }
}

impl<'a> From<&'a str> for KeyRef<'a> {
    fn from(s: &'a str) -> Self {
        Self::Str(s)
    }
}

impl<'a> From<&'a String> for KeyRef<'a> {
    fn from(s: &'a String) -> Self {
        Self::Str(s)
    }
}

impl From<u32> for KeyRef<'_> {
    fn from(v: u32) -> Self {
        Self::U32(v)
    }
}

impl From<u64> for KeyRef<'_> {
    fn from(v: u64) -> Self {
        Self::U64(v)
    }
}

impl From<f64> for KeyRef<'_> {
    fn from(v: f64) -> Self {
        Self::F64(v)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Hash functions
// ─────────────────────────────────────────────────────────────────────────────

/// Multiplicative string hash. Short keys feed every byte; keys of 16 bytes
/// or more feed roughly eight evenly spaced samples.
pub fn hash_str(key: &str) -> u32 {
    let bytes = key.as_bytes();
    let mut h: u32 = 0;
    if bytes.len() < 16 {
        for &b in bytes {
            h = h.wrapping_mul(37).wrapping_add(b as i8 as u32);
        }
    } else {
        let skip = bytes.len() / 8;
        for &b in bytes.iter().step_by(skip) {
            h = h.wrapping_mul(39).wrapping_add(b as i8 as u32);
        }
    }
    h
}

pub fn hash_u32(key: u32) -> u32 {
    let mut key = (!key).wrapping_add(key << 15);
    key ^= key >> 12;
    key = key.wrapping_add(key << 2);
    key ^= key >> 4;
    key = key.wrapping_mul(2057);
    key ^= key >> 16;
    key
}

pub fn hash_u64(key: u64) -> u32 {
    let mut key = (!key).wrapping_add(key << 18);
    key ^= key >> 31;
    key = key.wrapping_mul(21);
    key ^= key >> 11;
    key = key.wrapping_add(key << 6);
    key ^= key >> 22;
    key as u32
}

/// Mantissa/exponent hash for doubles.
///
/// The mantissa is folded in 28-bit chunks modulo `2^61 - 1`, then rotated
/// by the exponent. Equal values hash equally, so `0.0` and `-0.0` collide
/// as they must. `u32::MAX` is reserved and never returned.
pub fn hash_f64(v: f64) -> u32 {
    if v.is_nan() {
        return 0;
    }
    if v.is_infinite() {
        return if v > 0.0 { 314_159 } else { 314_159u32.wrapping_neg() };
    }

    let (mut m, mut e) = libm::frexp(v);
    let negative = m < 0.0;
    if negative {
        m = -m;
    }

    let mut x: u64 = 0;
    while m != 0.0 {
        x = ((x << 28) & HASH_MODULUS) | x >> (HASH_BITS - 28);
        m *= 268_435_456.0;
        e -= 28;
        let y = m as u64;
        m -= y as f64;
        x += y;
        if x >= HASH_MODULUS {
            x -= HASH_MODULUS;
        }
    }

    let e = if e >= 0 {
        e as u32 % HASH_BITS
    } else {
        HASH_BITS - 1 - ((-1 - e) as u32 % HASH_BITS)
    };
    x = ((x << e) & HASH_MODULUS) | x >> (HASH_BITS - e);
    if negative {
        x = x.wrapping_neg();
    }

    match x as u32 {
        u32::MAX => u32::MAX - 1,
        h => h,
    }
}
