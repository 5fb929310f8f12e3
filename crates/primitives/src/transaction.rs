//! Bitcoin transactions, legacy and segwit serialization.

use crate::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::{sha256d, Hash256};
use crate::outpoint::OutPoint;

/// Inputs with a sequence below this value opt in to replacement.
pub const RBF_SEQUENCE_THRESHOLD: u32 = 0xffff_fffe;
pub const MAX_MONEY: i64 = 21_000_000 * 100_000_000;

const SEGWIT_MARKER: u8 = 0x00;
const SEGWIT_FLAG: u8 = 0x01;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
    pub witness: Vec<Vec<u8>>,
}

impl TxIn {
    pub fn new(prevout: OutPoint, script_sig: Vec<u8>, sequence: u32) -> Self {
        Self {
            prevout,
            script_sig,
            sequence,
            witness: Vec::new(),
        }
    }

    pub fn signals_rbf(&self) -> bool {
        self.sequence < RBF_SEQUENCE_THRESHOLD
    }
}

impl Encodable for TxIn {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.prevout.consensus_encode(encoder);
        encoder.write_var_bytes(&self.script_sig);
        encoder.write_u32_le(self.sequence);
    }
}

impl Decodable for TxIn {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let prevout = OutPoint::consensus_decode(decoder)?;
        let script_sig = decoder.read_var_bytes()?;
        let sequence = decoder.read_u32_le()?;
        Ok(Self::new(prevout, script_sig, sequence))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxOut {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
}

impl Encodable for TxOut {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
    }
}

impl Decodable for TxOut {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        Ok(Self {
            value,
            script_pubkey,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub version: i32,
    pub vin: Vec<TxIn>,
    pub vout: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn has_witness(&self) -> bool {
        self.vin.iter().any(|input| !input.witness.is_empty())
    }

    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].prevout.is_null()
    }

    pub fn signals_rbf(&self) -> bool {
        self.vin.iter().any(TxIn::signals_rbf)
    }

    /// Full serialization, including witness data when present.
    pub fn consensus_encode(&self) -> Vec<u8> {
        self.encode_with_witness(self.has_witness())
    }

    pub fn encode_without_witness(&self) -> Vec<u8> {
        self.encode_with_witness(false)
    }

    pub fn txid(&self) -> Hash256 {
        sha256d(&self.encode_without_witness())
    }

    pub fn wtxid(&self) -> Hash256 {
        sha256d(&self.consensus_encode())
    }

    fn encode_with_witness(&self, witness: bool) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(16 + self.vin.len() * 48 + self.vout.len() * 34);
        encoder.write_i32_le(self.version);
        if witness {
            encoder.write_u8(SEGWIT_MARKER);
            encoder.write_u8(SEGWIT_FLAG);
        }
        encoder.write_varint(self.vin.len() as u64);
        for input in &self.vin {
            input.consensus_encode(&mut encoder);
        }
        encoder.write_varint(self.vout.len() as u64);
        for output in &self.vout {
            output.consensus_encode(&mut encoder);
        }
        if witness {
            for input in &self.vin {
                encoder.write_varint(input.witness.len() as u64);
                for item in &input.witness {
                    encoder.write_var_bytes(item);
                }
            }
        }
        encoder.write_u32_le(self.lock_time);
        encoder.into_inner()
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, TransactionDecodeError> {
        let mut decoder = Decoder::new(bytes);
        let tx = Self::decode_from(&mut decoder)?;
        decoder.finish()?;
        Ok(tx)
    }

    pub fn decode_from(decoder: &mut Decoder) -> Result<Self, TransactionDecodeError> {
        let version = decoder.read_i32_le()?;
        let segwit = decoder.peek_u8() == Some(SEGWIT_MARKER);
        if segwit {
            decoder.read_u8()?;
            if decoder.read_u8()? != SEGWIT_FLAG {
                return Err(TransactionDecodeError::InvalidFormat("unknown segwit flag"));
            }
        }

        let input_count = decoder.read_len()?;
        let mut vin = Vec::with_capacity(input_count.min(4096));
        for _ in 0..input_count {
            vin.push(TxIn::consensus_decode(decoder)?);
        }
        let output_count = decoder.read_len()?;
        let mut vout = Vec::with_capacity(output_count.min(4096));
        for _ in 0..output_count {
            let output = TxOut::consensus_decode(decoder)?;
            if !(0..=MAX_MONEY).contains(&output.value) {
                return Err(TransactionDecodeError::ValueOutOfRange(output.value));
            }
            vout.push(output);
        }

        if segwit {
            for input in vin.iter_mut() {
                let items = decoder.read_len()?;
                let mut witness = Vec::with_capacity(items.min(256));
                for _ in 0..items {
                    witness.push(decoder.read_var_bytes()?);
                }
                input.witness = witness;
            }
            if !vin.iter().any(|input| !input.witness.is_empty()) {
                return Err(TransactionDecodeError::InvalidFormat(
                    "segwit marker without witness data",
                ));
            }
        }
        if vin.is_empty() {
            return Err(TransactionDecodeError::InvalidFormat("transaction has no inputs"));
        }

        let lock_time = decoder.read_u32_le()?;
        Ok(Self {
            version,
            vin,
            vout,
            lock_time,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionDecodeError {
    Decode(DecodeError),
    InvalidFormat(&'static str),
    ValueOutOfRange(i64),
}

impl From<DecodeError> for TransactionDecodeError {
    fn from(err: DecodeError) -> Self {
        TransactionDecodeError::Decode(err)
    }
}

impl std::fmt::Display for TransactionDecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionDecodeError::Decode(err) => write!(f, "{err}"),
            TransactionDecodeError::InvalidFormat(message) => write!(f, "{message}"),
            TransactionDecodeError::ValueOutOfRange(value) => {
                write!(f, "output value {value} out of range")
            }
        }
    }
}

impl std::error::Error for TransactionDecodeError {}
