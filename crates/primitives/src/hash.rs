use ripemd::{Digest as RipemdDigest, Ripemd160};
use sha2::Sha256;

pub type Hash256 = [u8; 32];

pub fn sha256(data: &[u8]) -> Hash256 {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(data));
    out
}

pub fn sha256d(data: &[u8]) -> Hash256 {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(Sha256::digest(data)));
    out
}

pub fn hash160(data: &[u8]) -> [u8; 20] {
    let mut out = [0u8; 20];
    out.copy_from_slice(&Ripemd160::digest(Sha256::digest(data)));
    out
}

/// Display form: byte-reversed hex, as block explorers print hashes.
pub fn hash256_to_hex(hash: &Hash256) -> String {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        out.push(DIGITS[usize::from(byte >> 4)] as char);
        out.push(DIGITS[usize::from(byte & 0x0f)] as char);
    }
    out
}

pub fn hash256_from_hex(hex: &str) -> Option<Hash256> {
    let hex = hex.trim();
    if hex.len() != 64 {
        return None;
    }
    let mut out = [0u8; 32];
    for (idx, chunk) in hex.as_bytes().chunks(2).enumerate() {
        let high = (chunk[0] as char).to_digit(16)?;
        let low = (chunk[1] as char).to_digit(16)?;
        out[31 - idx] = ((high << 4) | low) as u8;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256d_of_empty_input() {
        assert_eq!(
            hash256_to_hex(&sha256d(b"")),
            "56944c5d3f98413ef45cf54545538103cc9f298e0575820ad3591376e2e0f65d"
        );
    }

    #[test]
    fn hex_roundtrip_is_byte_reversed() {
        let mut hash = [0u8; 32];
        hash[0] = 0x01;
        hash[31] = 0xab;
        let hex = hash256_to_hex(&hash);
        assert!(hex.starts_with("ab"));
        assert!(hex.ends_with("01"));
        assert_eq!(hash256_from_hex(&hex), Some(hash));
        assert_eq!(hash256_from_hex("zz"), None);
    }
}
