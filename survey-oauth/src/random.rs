//! Random identifiers and the encodings built on them.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

const ALPHANUMERIC: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const UNRESERVED: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-._~";
const TID_ALPHABET: &[u8] = b"234567abcdefghijklmnopqrstuvwxyz";

const VERIFIER_LEN: usize = 64;
const TOKEN_LEN: usize = 32;
const TID_LEN: usize = 13;

fn random_from(charset: &[u8], len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| {
            let idx = rng.gen_range(0..charset.len());
            charset[idx] as char
        })
        .collect()
}

/// PKCE code verifier: 64 characters from the RFC 7636 unreserved set.
pub fn generate_code_verifier() -> String {
    random_from(UNRESERVED, VERIFIER_LEN)
}

/// S256 code challenge for a verifier.
pub fn code_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// 32 alphanumeric characters. Used for OAuth state, JWT ids and session ids.
pub fn generate_token() -> String {
    random_from(ALPHANUMERIC, TOKEN_LEN)
}

pub fn generate_state() -> String {
    generate_token()
}

pub fn generate_jti() -> String {
    generate_token()
}

pub fn generate_session_id() -> String {
    generate_token()
}

/// Timestamp identifier used as a record key.
///
/// The 64-bit value is the microsecond Unix timestamp shifted left by ten bits
/// with a clock id in the low bits, rendered as 13 base32-sortable characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tid(u64);

static LAST_TID: AtomicU64 = AtomicU64::new(0);

impl Tid {
    pub fn from_micros(micros: u64, clock_id: u16) -> Self {
        let value = ((micros & 0x1F_FFFF_FFFF_FFFF) << 10) | u64::from(clock_id & 0x3FF);
        Tid(value)
    }

    /// Next identifier from this process. Strictly increasing across calls.
    pub fn now() -> Self {
        let micros = chrono::Utc::now().timestamp_micros().max(0) as u64;
        let candidate = Tid::from_micros(micros, 0).0;
        let mut last = LAST_TID.load(Ordering::Relaxed);
        loop {
            let next = candidate.max(last + 1);
            match LAST_TID.compare_exchange_weak(last, next, Ordering::SeqCst, Ordering::Relaxed)
            {
                Ok(_) => return Tid(next),
                Err(seen) => last = seen,
            }
        }
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut buf = [0u8; TID_LEN];
        let mut value = self.0;
        for slot in buf.iter_mut().rev() {
            *slot = TID_ALPHABET[(value & 0x1F) as usize];
            value >>= 5;
        }
        // alphabet is ASCII
        f.write_str(std::str::from_utf8(&buf).map_err(|_| fmt::Error)?)
    }
}
