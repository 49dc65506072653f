//! Legacy wire obfuscation.
//!
//! The transform hides casual plaintext on the wire. It is not encryption:
//! anyone holding a capture can recover the key stream, and zero bytes stay
//! visible in place.

use std::fmt;

/// Reversible, position-dependent byte transform applied to every frame.
///
/// `apply` must be its own inverse for a fixed `offset`, so the same call
/// restores what it produced. `offset` is the position of `buf[0]` within
/// the frame being transformed.
pub trait Obfuscation: Send + Sync + fmt::Debug {
    fn apply(&self, buf: &mut [u8], offset: u64);
}

/// Keyed byte substitution inherited from the first protocol revision.
#[derive(Clone)]
pub struct LegacyObfuscation {
    key: Vec<u8>,
}

impl LegacyObfuscation {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            key: secret.as_ref().to_vec(),
        }
    }

    fn shift(&self, position: u64) -> u64 {
        let key_byte = if self.key.is_empty() {
            0
        } else {
            self.key[(position % self.key.len() as u64) as usize] as u64
        };
        (key_byte + (position % 255) * 7) % 255
    }
}

impl fmt::Debug for LegacyObfuscation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LegacyObfuscation")
            .field("key_len", &self.key.len())
            .finish()
    }
}

impl Obfuscation for LegacyObfuscation {
    fn apply(&self, buf: &mut [u8], offset: u64) {
        for (i, byte) in buf.iter_mut().enumerate() {
            if *byte == 0 {
                continue;
            }
            // Reflection over the 255 non-zero values: 255 stands in for 0 mod 255.
            let x = (*byte as u64) % 255;
            let y = (self.shift(offset + i as u64) + 255 - x) % 255;
            *byte = if y == 0 { 255 } else { y as u8 };
        }
    }
}

/// Leaves every byte untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl Obfuscation for Passthrough {
    fn apply(&self, _buf: &mut [u8], _offset: u64) {}
}

/// Applies the legacy transform to a standalone buffer.
pub fn transform(buffer: &[u8], secret: &[u8]) -> Vec<u8> {
    let mut out = buffer.to_vec();
    LegacyObfuscation::new(secret).apply(&mut out, 0);
    out
}
