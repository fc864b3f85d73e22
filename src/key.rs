//! Tunnel keys.
//!
//! A key is the base-36 rendering of a 97-byte blob:
//! `0x01 || nonce[32] || mac_key[32] || hmac_sha256(mac_key, nonce)[32]`.
//! The leading marker byte keeps leading zero bytes of the nonce from being
//! lost in the big-integer rendering and bounds the value below `36^149`,
//! so every key is exactly [`KEY_LEN`] characters after left zero padding.

use std::{fmt, str};

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Length of a rendered tunnel key in bytes.
pub const KEY_LEN: usize = 149;

const PART_LEN: usize = 32;
const BLOB_LEN: usize = 1 + 3 * PART_LEN;
const BLOB_MARKER: u8 = 0x01;
const ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Opaque, fixed-length tunnel identifier carrying its own integrity tag.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct TunnelKey(String);

impl TunnelKey {
    /// Generates a fresh random key.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut nonce = [0u8; PART_LEN];
        let mut mac_key = [0u8; PART_LEN];
        rng.fill_bytes(&mut nonce);
        rng.fill_bytes(&mut mac_key);

        let mut blob = Vec::with_capacity(BLOB_LEN);
        blob.push(BLOB_MARKER);
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&mac_key);
        blob.extend_from_slice(&tag(&mac_key, &nonce));
        Self(encode_base36(&blob, KEY_LEN))
    }

    /// Parses the first [`KEY_LEN`] bytes of `bytes` as a key.
    ///
    /// Returns `None` unless the key is legitimate, i.e. it decodes to a
    /// 97-byte blob whose embedded HMAC verifies.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let raw = bytes.get(..KEY_LEN)?;
        let blob = decode_base36(raw)?;
        if blob.len() != BLOB_LEN || blob[0] != BLOB_MARKER {
            return None;
        }
        let nonce = &blob[1..1 + PART_LEN];
        let mac_key = &blob[1 + PART_LEN..1 + 2 * PART_LEN];
        let expected = &blob[1 + 2 * PART_LEN..];
        let mut mac = HmacSha256::new_from_slice(mac_key).ok()?;
        mac.update(nonce);
        mac.verify_slice(expected).ok()?;
        // decode_base36 only accepts the alphabet, so this is valid ASCII.
        let s = str::from_utf8(raw).ok()?;
        Some(Self(s.to_string()))
    }

    /// Returns true if `bytes` starts with a legitimate key.
    pub fn is_legit(bytes: &[u8]) -> bool {
        Self::parse(bytes).is_some()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Returns a short suffix suitable for logs.
    pub fn fmt_short(&self) -> &str {
        // Leading digits are padding and marker, the tail is random.
        &self.0[self.0.len() - 8..]
    }
}

impl fmt::Display for TunnelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for TunnelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TunnelKey({})", self.fmt_short())
    }
}

fn tag(mac_key: &[u8], nonce: &[u8]) -> [u8; PART_LEN] {
    let mut mac = HmacSha256::new_from_slice(mac_key).expect("hmac accepts any key length");
    mac.update(nonce);
    let mut out = [0u8; PART_LEN];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// Renders a big-endian unsigned integer in base 36, left padded with `0`
/// to at least `width` digits.
fn encode_base36(bytes: &[u8], width: usize) -> String {
    let mut num: Vec<u8> = bytes.iter().copied().skip_while(|b| *b == 0).collect();
    let mut digits = Vec::with_capacity(width);
    while !num.is_empty() {
        let mut rem = 0u32;
        for byte in num.iter_mut() {
            let acc = (rem << 8) | u32::from(*byte);
            *byte = (acc / 36) as u8;
            rem = acc % 36;
        }
        digits.push(ALPHABET[rem as usize]);
        let zeros = num.iter().take_while(|b| **b == 0).count();
        num.drain(..zeros);
    }
    while digits.len() < width {
        digits.push(b'0');
    }
    digits.iter().rev().map(|&d| char::from(d)).collect()
}

/// Parses base-36 digits into a minimal big-endian unsigned integer.
fn decode_base36(digits: &[u8]) -> Option<Vec<u8>> {
    let mut num: Vec<u8> = Vec::with_capacity(BLOB_LEN);
    for &c in digits {
        let digit = match c {
            b'0'..=b'9' => c - b'0',
            b'a'..=b'z' => c - b'a' + 10,
            _ => return None,
        };
        let mut carry = u32::from(digit);
        for byte in num.iter_mut().rev() {
            let acc = u32::from(*byte) * 36 + carry;
            *byte = acc as u8;
            carry = acc >> 8;
        }
        while carry > 0 {
            num.insert(0, carry as u8);
            carry >>= 8;
        }
    }
    Some(num)
}
