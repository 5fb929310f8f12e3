//! Per-address history segments and their folded summaries.
//!
//! A subhistory row holds every txio of one address inside one block
//! bucket, keyed by the funding output's [`IoKey`]. The funding half is
//! written in the output's bucket; the spending half is written in the
//! spender's bucket. When both land in the same bucket they merge into one
//! entry carrying both keys.

use std::collections::BTreeMap;

use chainscan_chainstate::keys::HGTX_LEN;
use chainscan_chainstate::{BlockKey, IoKey};
use chainscan_primitives::encoding::{Decoder, Encoder};
use chainscan_primitives::ScrAddr;

const FLAG_HAS_INPUT: u8 = 1 << 0;
const FLAG_COINBASE: u8 = 1 << 1;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TxIoEntry {
    pub output: IoKey,
    pub value: i64,
    pub input: Option<IoKey>,
    pub from_coinbase: bool,
}

impl TxIoEntry {
    pub fn funding(output: IoKey, value: i64, from_coinbase: bool) -> Self {
        Self {
            output,
            value,
            input: None,
            from_coinbase,
        }
    }

    pub fn spending(output: IoKey, value: i64, input: IoKey, from_coinbase: bool) -> Self {
        Self {
            output,
            value,
            input: Some(input),
            from_coinbase,
        }
    }

    pub fn has_txin(&self) -> bool {
        self.input.is_some()
    }

    /// Union of two halves of the same output. The lowest input wins so the
    /// result does not depend on merge order.
    pub fn merge(&mut self, other: &TxIoEntry) {
        self.input = match (self.input, other.input) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.from_coinbase |= other.from_coinbase;
    }
}

/// All txios of one address inside one block bucket.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SubHistory {
    entries: BTreeMap<IoKey, TxIoEntry>,
}

impl SubHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: TxIoEntry) {
        self.entries
            .entry(entry.output)
            .and_modify(|existing| existing.merge(&entry))
            .or_insert(entry);
    }

    pub fn merge(&mut self, other: &SubHistory) {
        for entry in other.entries.values() {
            self.insert(*entry);
        }
    }

    pub fn get(&self, output: &IoKey) -> Option<&TxIoEntry> {
        self.entries.get(output)
    }

    pub fn entries(&self) -> impl Iterator<Item = &TxIoEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(1 + self.entries.len() * 25);
        encoder.write_varint(self.entries.len() as u64);
        for entry in self.entries.values() {
            encoder.write_bytes(&entry.output.to_bytes());
            encoder.write_i64_le(entry.value);
            let mut flags = 0;
            if entry.input.is_some() {
                flags |= FLAG_HAS_INPUT;
            }
            if entry.from_coinbase {
                flags |= FLAG_COINBASE;
            }
            encoder.write_u8(flags);
            if let Some(input) = entry.input {
                encoder.write_bytes(&input.to_bytes());
            }
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let mut decoder = Decoder::new(bytes);
        let count = decoder.read_len().ok()?;
        let mut history = SubHistory::new();
        for _ in 0..count {
            let output = IoKey::from_slice(decoder.read_slice(8).ok()?)?;
            let value = decoder.read_i64_le().ok()?;
            let flags = decoder.read_u8().ok()?;
            let input = if flags & FLAG_HAS_INPUT != 0 {
                Some(IoKey::from_slice(decoder.read_slice(8).ok()?)?)
            } else {
                None
            };
            history.entries.insert(
                output,
                TxIoEntry {
                    output,
                    value,
                    input,
                    from_coinbase: flags & FLAG_COINBASE != 0,
                },
            );
        }
        decoder.finish().ok()?;
        Some(history)
    }

    /// Value and txio contribution of this bucket.
    pub fn fold(&self, bucket: BlockKey) -> BucketSummary {
        let mut summary = BucketSummary {
            dup: bucket.dup,
            value: 0,
            txio_count: 0,
        };
        for entry in self.entries.values() {
            let funded_here = entry.output.block() == Some(bucket);
            match entry.input {
                None => {
                    summary.value += entry.value;
                    summary.txio_count += 1;
                }
                Some(input) if funded_here && input.block() == Some(bucket) => {
                    summary.txio_count += 2;
                }
                Some(_) if funded_here => {
                    summary.value += entry.value;
                    summary.txio_count += 1;
                }
                Some(_) => {
                    summary.value -= entry.value;
                    summary.txio_count += 1;
                }
            }
        }
        summary
    }
}

/// Address and bucket a subhistory row belongs to.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct HistoryKey {
    pub scraddr: ScrAddr,
    pub block: BlockKey,
}

impl HistoryKey {
    pub fn new(scraddr: ScrAddr, block: BlockKey) -> Self {
        Self { scraddr, block }
    }

    pub fn row_key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.scraddr.as_bytes().len() + HGTX_LEN);
        key.extend_from_slice(self.scraddr.as_bytes());
        key.extend_from_slice(&self.block.hgtx());
        key
    }

    pub fn from_row_key(bytes: &[u8]) -> Option<Self> {
        let (scraddr, rest) = ScrAddr::split_prefix(bytes)?;
        if rest.len() != HGTX_LEN {
            return None;
        }
        Some(Self {
            scraddr,
            block: BlockKey::from_slice(rest)?,
        })
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BucketSummary {
    pub dup: u8,
    pub value: i64,
    pub txio_count: u64,
}

/// Folded per-address totals plus the per-height buckets they came from.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AddressSummary {
    pub balance: i64,
    pub txio_count: u64,
    pub buckets: BTreeMap<u32, BucketSummary>,
}

impl AddressSummary {
    pub fn set_bucket(&mut self, height: u32, bucket: BucketSummary) {
        self.buckets.insert(height, bucket);
    }

    pub fn refold(&mut self) {
        self.balance = self.buckets.values().map(|bucket| bucket.value).sum();
        self.txio_count = self.buckets.values().map(|bucket| bucket.txio_count).sum();
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(20 + self.buckets.len() * 21);
        encoder.write_i64_le(self.balance);
        encoder.write_u64_le(self.txio_count);
        encoder.write_varint(self.buckets.len() as u64);
        for (height, bucket) in &self.buckets {
            encoder.write_u32_le(*height);
            encoder.write_u8(bucket.dup);
            encoder.write_i64_le(bucket.value);
            encoder.write_u64_le(bucket.txio_count);
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let mut decoder = Decoder::new(bytes);
        let balance = decoder.read_i64_le().ok()?;
        let txio_count = decoder.read_u64_le().ok()?;
        let count = decoder.read_len().ok()?;
        let mut buckets = BTreeMap::new();
        for _ in 0..count {
            let height = decoder.read_u32_le().ok()?;
            let bucket = BucketSummary {
                dup: decoder.read_u8().ok()?,
                value: decoder.read_i64_le().ok()?,
                txio_count: decoder.read_u64_le().ok()?,
            };
            buckets.insert(height, bucket);
        }
        decoder.finish().ok()?;
        Some(Self {
            balance,
            txio_count,
            buckets,
        })
    }
}
