//! Canonical address keys ("scraddr") derived from output scripts.
//!
//! A scraddr is one kind byte followed by the hash the script commits to.
//! Pay-to-pubkey outputs fold into the pay-to-pubkey-hash key of the same
//! key so both forms share one history.

use std::fmt;

use smallvec::SmallVec;

use crate::hash::{hash160, sha256};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[repr(u8)]
pub enum ScrAddrKind {
    P2pkh = 0x00,
    P2sh = 0x05,
    P2wpkh = 0x90,
    P2wsh = 0x91,
    P2tr = 0x92,
    Multisig = 0xfe,
    NonStandard = 0xff,
}

impl ScrAddrKind {
    pub fn from_u8(raw: u8) -> Option<Self> {
        let kind = match raw {
            0x00 => Self::P2pkh,
            0x05 => Self::P2sh,
            0x90 => Self::P2wpkh,
            0x91 => Self::P2wsh,
            0x92 => Self::P2tr,
            0xfe => Self::Multisig,
            0xff => Self::NonStandard,
            _ => return None,
        };
        Some(kind)
    }

    pub fn hash_len(self) -> usize {
        match self {
            Self::P2pkh | Self::P2sh | Self::P2wpkh | Self::Multisig => 20,
            Self::P2wsh | Self::P2tr | Self::NonStandard => 32,
        }
    }
}

#[derive(Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ScrAddr(SmallVec<[u8; 33]>);

impl ScrAddr {
    pub fn new(kind: ScrAddrKind, hash: &[u8]) -> Option<Self> {
        if hash.len() != kind.hash_len() {
            return None;
        }
        let mut bytes = SmallVec::with_capacity(1 + hash.len());
        bytes.push(kind as u8);
        bytes.extend_from_slice(hash);
        Some(Self(bytes))
    }

    pub fn from_script(script: &[u8]) -> Self {
        let (kind, hash): (ScrAddrKind, SmallVec<[u8; 32]>) = match script {
            [0x76, 0xa9, 0x14, hash @ .., 0x88, 0xac] if hash.len() == 20 => {
                (ScrAddrKind::P2pkh, SmallVec::from_slice(hash))
            }
            [0xa9, 0x14, hash @ .., 0x87] if hash.len() == 20 => {
                (ScrAddrKind::P2sh, SmallVec::from_slice(hash))
            }
            [0x00, 0x14, hash @ ..] if hash.len() == 20 => {
                (ScrAddrKind::P2wpkh, SmallVec::from_slice(hash))
            }
            [0x00, 0x20, hash @ ..] if hash.len() == 32 => {
                (ScrAddrKind::P2wsh, SmallVec::from_slice(hash))
            }
            [0x51, 0x20, key @ ..] if key.len() == 32 => {
                (ScrAddrKind::P2tr, SmallVec::from_slice(key))
            }
            [push, pubkey @ .., 0xac]
                if (*push == 0x21 && pubkey.len() == 33) || (*push == 0x41 && pubkey.len() == 65) =>
            {
                (ScrAddrKind::P2pkh, SmallVec::from_slice(&hash160(pubkey)))
            }
            [m, .., n, 0xae] if is_small_int(*m) && is_small_int(*n) => {
                (ScrAddrKind::Multisig, SmallVec::from_slice(&hash160(script)))
            }
            _ => (ScrAddrKind::NonStandard, SmallVec::from_slice(&sha256(script))),
        };
        let mut bytes = SmallVec::with_capacity(1 + hash.len());
        bytes.push(kind as u8);
        bytes.extend_from_slice(&hash);
        Self(bytes)
    }

    /// Parses a stored scraddr, checking the kind byte and hash length.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let kind = ScrAddrKind::from_u8(*bytes.first()?)?;
        if bytes.len() != 1 + kind.hash_len() {
            return None;
        }
        Some(Self(SmallVec::from_slice(bytes)))
    }

    /// Reads a scraddr from the front of `bytes`, returning it and the rest.
    pub fn split_prefix(bytes: &[u8]) -> Option<(Self, &[u8])> {
        let kind = ScrAddrKind::from_u8(*bytes.first()?)?;
        let len = 1 + kind.hash_len();
        if bytes.len() < len {
            return None;
        }
        Some((Self(SmallVec::from_slice(&bytes[..len])), &bytes[len..]))
    }

    pub fn kind(&self) -> ScrAddrKind {
        ScrAddrKind::from_u8(self.0[0]).unwrap_or(ScrAddrKind::NonStandard)
    }

    pub fn hash(&self) -> &[u8] {
        &self.0[1..]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_multisig(&self) -> bool {
        self.kind() == ScrAddrKind::Multisig
    }
}

fn is_small_int(opcode: u8) -> bool {
    (0x51..=0x60).contains(&opcode)
}

impl fmt::Debug for ScrAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ScrAddr({self})")
    }
}

impl fmt::Display for ScrAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p2pkh(hash: [u8; 20]) -> Vec<u8> {
        let mut script = vec![0x76, 0xa9, 0x14];
        script.extend_from_slice(&hash);
        script.extend_from_slice(&[0x88, 0xac]);
        script
    }

    #[test]
    fn standard_scripts_map_to_their_hash() {
        let addr = ScrAddr::from_script(&p2pkh([7u8; 20]));
        assert_eq!(addr.kind(), ScrAddrKind::P2pkh);
        assert_eq!(addr.hash(), &[7u8; 20]);

        let mut p2sh = vec![0xa9, 0x14];
        p2sh.extend_from_slice(&[9u8; 20]);
        p2sh.push(0x87);
        assert_eq!(ScrAddr::from_script(&p2sh).kind(), ScrAddrKind::P2sh);

        let mut p2wsh = vec![0x00, 0x20];
        p2wsh.extend_from_slice(&[3u8; 32]);
        let addr = ScrAddr::from_script(&p2wsh);
        assert_eq!(addr.kind(), ScrAddrKind::P2wsh);
        assert_eq!(addr.as_bytes().len(), 33);
    }

    #[test]
    fn pay_to_pubkey_shares_the_pubkey_hash_history() {
        let pubkey = [0x02u8; 33];
        let mut p2pk = vec![0x21];
        p2pk.extend_from_slice(&pubkey);
        p2pk.push(0xac);
        assert_eq!(
            ScrAddr::from_script(&p2pk),
            ScrAddr::from_script(&p2pkh(hash160(&pubkey)))
        );
    }

    #[test]
    fn multisig_and_nonstandard() {
        let mut multisig = vec![0x51, 0x21];
        multisig.extend_from_slice(&[0x03u8; 33]);
        multisig.extend_from_slice(&[0x51, 0xae]);
        assert!(ScrAddr::from_script(&multisig).is_multisig());

        let op_return = ScrAddr::from_script(&[0x6a, 0x04, 1, 2, 3, 4]);
        assert_eq!(op_return.kind(), ScrAddrKind::NonStandard);
        assert_eq!(op_return.hash().len(), 32);
    }

    #[test]
    fn stored_bytes_roundtrip_and_prefix_split() {
        let addr = ScrAddr::from_script(&p2pkh([1u8; 20]));
        assert_eq!(ScrAddr::from_bytes(addr.as_bytes()), Some(addr.clone()));
        assert_eq!(ScrAddr::from_bytes(&addr.as_bytes()[..10]), None);

        let mut key = addr.as_bytes().to_vec();
        key.extend_from_slice(&[0, 0, 5, 0]);
        let (parsed, rest) = ScrAddr::split_prefix(&key).expect("split");
        assert_eq!(parsed, addr);
        assert_eq!(rest, &[0, 0, 5, 0]);
    }
}
