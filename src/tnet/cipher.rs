//! Per-packet AEAD sealing
//!
//! The KCP and UDP transports encrypt every datagram independently with
//! AES-GCM: a fresh random nonce is prepended to each ciphertext. Packets
//! that fail authentication are dropped silently, which makes active
//! probing of the endpoint indistinguishable from packet loss.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes128Gcm, Aes256Gcm};

use crate::error::PaqetError;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Per-datagram overhead added by [`PacketCipher::seal`].
pub const OVERHEAD: usize = NONCE_LEN + TAG_LEN;

enum Aead256Or128 {
    Aes256(Aes256Gcm),
    Aes128(Aes128Gcm),
}

/// AES-GCM packet cipher. Key length picks the variant: 16 bytes for
/// AES-128, anything longer is truncated or zero-padded to 32 bytes for
/// AES-256.
pub struct PacketCipher {
    aead: Aead256Or128,
}

impl PacketCipher {
    /// Create a cipher, or `None` for an empty key (no encryption).
    pub fn new(key: &[u8]) -> Result<Option<Self>, PaqetError> {
        if key.is_empty() {
            return Ok(None);
        }
        let aead = if key.len() <= 16 {
            let mut k = [0u8; 16];
            k[..key.len()].copy_from_slice(key);
            Aead256Or128::Aes128(
                Aes128Gcm::new_from_slice(&k)
                    .map_err(|_| PaqetError::Config("bad AES-128 key".into()))?,
            )
        } else {
            let mut k = [0u8; 32];
            let n = key.len().min(32);
            k[..n].copy_from_slice(&key[..n]);
            Aead256Or128::Aes256(
                Aes256Gcm::new_from_slice(&k)
                    .map_err(|_| PaqetError::Config("bad AES-256 key".into()))?,
            )
        };
        Ok(Some(PacketCipher { aead }))
    }

    /// Encrypt a packet; the nonce is prepended to the ciphertext.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, PaqetError> {
        let mut out = Vec::with_capacity(plaintext.len() + OVERHEAD);
        match &self.aead {
            Aead256Or128::Aes256(aead) => {
                let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
                out.extend_from_slice(&nonce);
                let ct = aead
                    .encrypt(&nonce, plaintext)
                    .map_err(|_| PaqetError::Transport("packet encryption failed".into()))?;
                out.extend_from_slice(&ct);
            }
            Aead256Or128::Aes128(aead) => {
                let nonce = Aes128Gcm::generate_nonce(&mut OsRng);
                out.extend_from_slice(&nonce);
                let ct = aead
                    .encrypt(&nonce, plaintext)
                    .map_err(|_| PaqetError::Transport("packet encryption failed".into()))?;
                out.extend_from_slice(&ct);
            }
        }
        Ok(out)
    }

    /// Decrypt a packet sealed by [`seal`](Self::seal). Returns `None` on
    /// any authentication or framing failure.
    pub fn open(&self, packet: &[u8]) -> Option<Vec<u8>> {
        if packet.len() < OVERHEAD {
            return None;
        }
        let (nonce, ct) = packet.split_at(NONCE_LEN);
        let nonce = aes_gcm::aead::generic_array::GenericArray::from_slice(nonce);
        match &self.aead {
            Aead256Or128::Aes256(aead) => aead.decrypt(nonce, ct).ok(),
            Aead256Or128::Aes128(aead) => aead.decrypt(nonce, ct).ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_key_means_no_cipher() {
        assert!(PacketCipher::new(&[]).unwrap().is_none());
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let cipher = PacketCipher::new(&[7u8; 32]).unwrap().unwrap();
        let msg = b"datagram payload";
        let sealed = cipher.seal(msg).unwrap();
        assert_eq!(sealed.len(), msg.len() + OVERHEAD);
        assert_eq!(cipher.open(&sealed).unwrap(), msg);
    }

    #[test]
    fn test_aes128_roundtrip() {
        let cipher = PacketCipher::new(&[9u8; 16]).unwrap().unwrap();
        let sealed = cipher.seal(b"x").unwrap();
        assert_eq!(cipher.open(&sealed).unwrap(), b"x");
    }

    #[test]
    fn test_tampered_packet_dropped() {
        let cipher = PacketCipher::new(&[7u8; 32]).unwrap().unwrap();
        let mut sealed = cipher.seal(b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(cipher.open(&sealed).is_none());
    }

    #[test]
    fn test_short_packet_dropped() {
        let cipher = PacketCipher::new(&[7u8; 32]).unwrap().unwrap();
        assert!(cipher.open(&[0u8; 10]).is_none());
    }

    #[test]
    fn test_wrong_key_dropped() {
        let a = PacketCipher::new(&[1u8; 32]).unwrap().unwrap();
        let b = PacketCipher::new(&[2u8; 32]).unwrap().unwrap();
        let sealed = a.seal(b"secret").unwrap();
        assert!(b.open(&sealed).is_none());
    }

    #[test]
    fn test_nonces_are_unique() {
        let cipher = PacketCipher::new(&[7u8; 32]).unwrap().unwrap();
        let a = cipher.seal(b"same").unwrap();
        let b = cipher.seal(b"same").unwrap();
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
    }
}
