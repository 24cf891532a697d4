//! Key derivation and block cipher selection
//!
//! Both the KCP and UDP transports derive their packet keys from a
//! passphrase with PBKDF2-SHA256. The derived key is trimmed to the size
//! required by the configured block cipher.

use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;

/// Fixed PBKDF2 salt. Changing it breaks compatibility between peers.
const KDF_SALT: &[u8] = b"paqet";
/// PBKDF2 iteration count.
const KDF_ROUNDS: u32 = 100_000;
/// Derived key length before trimming.
const KDF_LEN: usize = 32;

/// All block cipher names accepted by configuration.
pub const VALID_BLOCKS: &[&str] = &[
    "aes", "aes-128", "aes-128-gcm", "aes-192", "salsa20", "blowfish", "twofish", "cast5", "3des",
    "tea", "xtea", "xor", "sm4", "none", "null",
];

/// Derive a 32-byte key from a passphrase.
pub fn derive_key(passphrase: &str) -> [u8; KDF_LEN] {
    let mut key = [0u8; KDF_LEN];
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), KDF_SALT, KDF_ROUNDS, &mut key);
    key
}

/// Required key size for a block cipher name.
///
/// Returns `Some(0)` when the full derived key is used, `Some(n)` for a
/// fixed size, and `None` for unknown names.
pub fn block_key_size(block: &str) -> Option<usize> {
    match block {
        "aes" | "salsa20" | "blowfish" | "twofish" | "xor" | "none" | "null" => Some(0),
        "aes-128" | "aes-128-gcm" | "cast5" | "tea" | "xtea" | "sm4" => Some(16),
        "aes-192" | "3des" => Some(24),
        _ => None,
    }
}

/// Trim a derived key to the size required by the block cipher.
pub fn trim_key(dkey: &[u8], block: &str) -> Vec<u8> {
    match block_key_size(block) {
        Some(size) if size > 0 && dkey.len() >= size => dkey[..size].to_vec(),
        _ => dkey.to_vec(),
    }
}

/// Whether the block cipher name means "no encryption".
pub fn is_null_block(block: &str) -> bool {
    block == "none" || block == "null"
}

/// Validate a block cipher name and its key requirement.
pub fn validate_block_and_key(block: &str, key: &str) -> Result<(), String> {
    if block_key_size(block).is_none() {
        return Err(format!(
            "unsupported encryption block: {} (valid: {})",
            block,
            VALID_BLOCKS.join(", ")
        ));
    }
    if !is_null_block(block) && key.is_empty() {
        return Err(format!("encryption key is required for block '{}'", block));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_key_length() {
        assert_eq!(derive_key("test-passphrase").len(), 32);
    }

    #[test]
    fn test_derive_key_deterministic() {
        assert_eq!(derive_key("same-key"), derive_key("same-key"));
    }

    #[test]
    fn test_derive_key_different_input() {
        assert_ne!(derive_key("key-a"), derive_key("key-b"));
    }

    #[test]
    fn test_block_key_size_known() {
        assert_eq!(block_key_size("aes"), Some(0));
        assert_eq!(block_key_size("aes-128"), Some(16));
        assert_eq!(block_key_size("aes-128-gcm"), Some(16));
        assert_eq!(block_key_size("aes-192"), Some(24));
        assert_eq!(block_key_size("salsa20"), Some(0));
        assert_eq!(block_key_size("cast5"), Some(16));
        assert_eq!(block_key_size("3des"), Some(24));
        assert_eq!(block_key_size("none"), Some(0));
        assert_eq!(block_key_size("null"), Some(0));
    }

    #[test]
    fn test_block_key_size_unknown() {
        assert_eq!(block_key_size("invalid-cipher"), None);
    }

    #[test]
    fn test_trim_key_sizes() {
        let dkey = derive_key("k");
        assert_eq!(trim_key(&dkey, "aes-128").len(), 16);
        assert_eq!(trim_key(&dkey, "aes-192").len(), 24);
        assert_eq!(trim_key(&dkey, "aes").len(), 32);
        assert_eq!(trim_key(&dkey, "none").len(), 32);
    }

    #[test]
    fn test_validate_block_and_key() {
        assert!(validate_block_and_key("aes", "secret").is_ok());
        assert!(validate_block_and_key("none", "").is_ok());
        assert!(validate_block_and_key("aes", "").is_err());
        assert!(validate_block_and_key("rot13", "secret").is_err());
    }
}
