//! Session code generation and parsing
//!
//! Codes are short strings of uppercase letters that humans read aloud and
//! type. The generator walks the code space as an additive (Weyl) sequence:
//!
//! ```text
//! current = (current + increment) mod 26^N
//! ```
//!
//! With an increment coprime to `26^N` this visits every code exactly once
//! before repeating, so consecutive codes never collide without any
//! bookkeeping. The increment is a random prime one bit longer than the
//! modulus, which puts it above 13 and therefore coprime to `26^N`; the
//! starting point is uniformly random.

use tracing::debug;

use crate::error::CodeError;

/// Longest supported code; keeps `26^N` and the increment inside a u64
pub const MAX_CODE_LENGTH: usize = 12;

const ALPHABET_SIZE: u64 = 26;

/// Miller-Rabin witnesses; deterministic for every u64
const WITNESSES: [u64; 12] = [2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37];

/// Full-period generator of fixed-length letter codes
#[derive(Debug, Clone)]
pub struct CodeGenerator {
    length: usize,
    modulus: u64,
    increment: u64,
    current: u64,
}

impl CodeGenerator {
    /// Create a generator with a random prime increment and random start
    pub fn new(length: usize) -> Result<Self, CodeError> {
        let modulus = code_space(length)?;
        let bits = ceil_log2(modulus) + 1;
        let increment = random_prime(bits)?;
        let start = random_below(modulus)?;

        debug!(
            "Code generator ready: length={} modulus={} increment_bits={}",
            length, modulus, bits
        );

        Ok(Self {
            length,
            modulus,
            increment,
            current: start,
        })
    }

    /// Create a generator with explicit state
    pub fn with_state(length: usize, increment: u64, start: u64) -> Result<Self, CodeError> {
        let modulus = code_space(length)?;
        Ok(Self {
            length,
            modulus,
            increment,
            current: start % modulus,
        })
    }

    /// Advance the sequence and render the next code
    pub fn generate(&mut self) -> String {
        let next = (u128::from(self.current) + u128::from(self.increment)) % u128::from(self.modulus);
        self.current = next as u64;
        self.render(self.current)
    }

    /// Render a value as letters, least-significant digit first
    pub fn render(&self, mut value: u64) -> String {
        let mut code = String::with_capacity(self.length);
        for _ in 0..self.length {
            code.push(char::from(b'A' + (value % ALPHABET_SIZE) as u8));
            value /= ALPHABET_SIZE;
        }
        code
    }

    /// Size of the code space (`26^length`)
    pub fn modulus(&self) -> u64 {
        self.modulus
    }

    /// Step added on every call
    pub fn increment(&self) -> u64 {
        self.increment
    }
}

/// Normalize user input (trim, uppercase)
pub fn normalize_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

/// Validate a normalized code: exact length, letters A-Z only
pub fn validate_code(code: &str, length: usize) -> bool {
    code.len() == length && code.bytes().all(|b| b.is_ascii_uppercase())
}

/// `26^length`, rejecting lengths the generator cannot represent
pub fn code_space(length: usize) -> Result<u64, CodeError> {
    if length == 0 || length > MAX_CODE_LENGTH {
        return Err(CodeError::InvalidLength {
            length,
            max: MAX_CODE_LENGTH,
        });
    }
    Ok(ALPHABET_SIZE.pow(length as u32))
}

fn ceil_log2(n: u64) -> u32 {
    if n <= 1 {
        0
    } else {
        64 - (n - 1).leading_zeros()
    }
}

fn random_u64() -> Result<u64, CodeError> {
    let mut bytes = [0u8; 8];
    getrandom::getrandom(&mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}

/// Uniform value in `[0, bound)`
fn random_below(bound: u64) -> Result<u64, CodeError> {
    // Reject the tail of the u64 range so every residue is equally likely.
    let span = 1u128 << 64;
    let zone = span - span % u128::from(bound);
    loop {
        let value = random_u64()?;
        if u128::from(value) < zone {
            return Ok(value % bound);
        }
    }
}

/// Random prime with exactly `bits` significant bits
fn random_prime(bits: u32) -> Result<u64, CodeError> {
    debug_assert!((2..=64).contains(&bits));
    let top = 1u64 << (bits - 1);
    let mask = if bits == 64 { u64::MAX } else { (1u64 << bits) - 1 };
    loop {
        let candidate = (random_u64()? & mask) | top | 1;
        if is_probable_prime(candidate) {
            return Ok(candidate);
        }
    }
}

fn mul_mod(a: u64, b: u64, m: u64) -> u64 {
    ((u128::from(a) * u128::from(b)) % u128::from(m)) as u64
}

fn pow_mod(mut base: u64, mut exp: u64, m: u64) -> u64 {
    let mut result = 1 % m;
    base %= m;
    while exp > 0 {
        if exp & 1 == 1 {
            result = mul_mod(result, base, m);
        }
        base = mul_mod(base, base, m);
        exp >>= 1;
    }
    result
}

/// Miller-Rabin primality test
pub fn is_probable_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    for &p in &WITNESSES {
        if n % p == 0 {
            return n == p;
        }
    }

    let mut d = n - 1;
    let mut s = 0;
    while d % 2 == 0 {
        d /= 2;
        s += 1;
    }

    'witness: for &a in &WITNESSES {
        let mut x = pow_mod(a, d, n);
        if x == 1 || x == n - 1 {
            continue;
        }
        for _ in 1..s {
            x = mul_mod(x, x, n);
            if x == n - 1 {
                continue 'witness;
            }
        }
        return false;
    }
    true
}
