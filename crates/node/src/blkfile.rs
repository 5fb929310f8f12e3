//! Block source over a directory of `blkNNNNN.dat` files.
//!
//! Each record is the network magic, a little-endian u32 length and the
//! serialized block. Files are preallocated, so a zeroed magic marks the
//! end of the written part.

use std::collections::HashMap;
use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use chainscan_chainstate::{BlockLocation, BlockSource, HeaderRecord, SourceError};
use chainscan_primitives::{hash256_to_hex, BlockHeader, Hash256, HEADER_SIZE};

const RECORD_PREFIX_LEN: u64 = 8;

pub struct BlkFileSource {
    dir: PathBuf,
    magic: [u8; 4],
    blocks: RwLock<HashMap<Hash256, BlockLocation>>,
}

impl BlkFileSource {
    pub fn new(dir: impl Into<PathBuf>, magic: [u8; 4]) -> Self {
        Self {
            dir: dir.into(),
            magic,
            blocks: RwLock::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.blocks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads every block file in number order and returns the headers found,
    /// remembering where each block lives. Blocks already known are skipped.
    pub fn import(&self) -> Result<Vec<HeaderRecord>, SourceError> {
        let mut records = Vec::new();
        for (number, path) in self.block_files()? {
            let found = self.import_file(number, &path)?;
            chainscan_log::log_debug!("{}: {} new blocks", path.display(), found.len());
            records.extend(found);
        }
        if !records.is_empty() {
            chainscan_log::log_info!(
                "imported {} block headers from {}",
                records.len(),
                self.dir.display()
            );
        }
        Ok(records)
    }

    fn block_files(&self) -> Result<Vec<(u32, PathBuf)>, SourceError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                chainscan_log::log_warn!("blocks dir {} does not exist", self.dir.display());
                return Ok(Vec::new());
            }
            Err(err) => return Err(err.into()),
        };
        let mut files = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            if let Some(number) = name.to_str().and_then(parse_blk_name) {
                files.push((number, entry.path()));
            }
        }
        files.sort_by_key(|(number, _)| *number);
        Ok(files)
    }

    fn import_file(&self, number: u32, path: &Path) -> Result<Vec<HeaderRecord>, SourceError> {
        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut records = Vec::new();
        let mut offset = 0u64;
        let mut blocks = self.blocks.write().unwrap_or_else(PoisonError::into_inner);
        while offset + RECORD_PREFIX_LEN <= file_len {
            let mut prefix = [0u8; RECORD_PREFIX_LEN as usize];
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut prefix)?;
            let magic = &prefix[..4];
            if magic == [0u8; 4] {
                break;
            }
            if magic != self.magic {
                return Err(SourceError::Io(format!(
                    "{}: bad magic at offset {offset}",
                    path.display()
                )));
            }
            let size = u32::from_le_bytes([prefix[4], prefix[5], prefix[6], prefix[7]]);
            let start = offset + RECORD_PREFIX_LEN;
            if (size as usize) < HEADER_SIZE || start + u64::from(size) > file_len {
                chainscan_log::log_warn!(
                    "{}: truncated block record at offset {offset}",
                    path.display()
                );
                break;
            }
            let mut raw_header = [0u8; HEADER_SIZE];
            file.read_exact(&mut raw_header)?;
            let header = BlockHeader::from_bytes(&raw_header).map_err(|err| {
                SourceError::Io(format!(
                    "{}: bad header at offset {start}: {err}",
                    path.display()
                ))
            })?;
            let location = BlockLocation {
                file: number,
                offset: start,
                size,
            };
            if blocks.insert(header.hash(), location).is_none() {
                records.push(HeaderRecord { header, location });
            }
            offset = start + u64::from(size);
        }
        Ok(records)
    }

    fn read_at(&self, location: BlockLocation) -> Result<Vec<u8>, SourceError> {
        let mut file = File::open(self.dir.join(blk_name(location.file)))?;
        file.seek(SeekFrom::Start(location.offset))?;
        let mut raw = vec![0u8; location.size as usize];
        file.read_exact(&mut raw)?;
        Ok(raw)
    }
}

impl BlockSource for BlkFileSource {
    fn get_block(&self, height: u32, hash: &Hash256) -> Result<Vec<u8>, SourceError> {
        let location = self
            .blocks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(hash)
            .copied()
            .ok_or(SourceError::Missing {
                height,
                hash: *hash,
            })?;
        let raw = self.read_at(location)?;
        let stored = raw
            .get(..HEADER_SIZE)
            .and_then(|bytes| BlockHeader::from_bytes(bytes).ok())
            .map(|header| header.hash());
        if stored != Some(*hash) {
            return Err(SourceError::Io(format!(
                "block {} moved in {}",
                hash256_to_hex(hash),
                blk_name(location.file)
            )));
        }
        Ok(raw)
    }
}

pub fn blk_name(number: u32) -> String {
    format!("blk{number:05}.dat")
}

fn parse_blk_name(name: &str) -> Option<u32> {
    let digits = name.strip_prefix("blk")?.strip_suffix(".dat")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MAGIC: [u8; 4] = [0xfa, 0xbf, 0xb5, 0xda];

    fn fake_block(nonce: u32) -> (Hash256, Vec<u8>) {
        let header = BlockHeader {
            version: 1,
            prev_block: [0u8; 32],
            merkle_root: [0u8; 32],
            time: nonce,
            bits: 0x207f_ffff,
            nonce,
        };
        let mut raw = header.to_bytes().to_vec();
        raw.extend_from_slice(&[0u8; 5]);
        (header.hash(), raw)
    }

    fn record(raw: &[u8]) -> Vec<u8> {
        let mut out = MAGIC.to_vec();
        out.extend_from_slice(&(raw.len() as u32).to_le_bytes());
        out.extend_from_slice(raw);
        out
    }

    #[test]
    fn parses_block_file_names() {
        assert_eq!(parse_blk_name("blk00000.dat"), Some(0));
        assert_eq!(parse_blk_name("blk00012.dat"), Some(12));
        assert_eq!(parse_blk_name("rev00000.dat"), None);
        assert_eq!(parse_blk_name("blk.dat"), None);
        assert_eq!(blk_name(3), "blk00003.dat");
    }

    #[test]
    fn imports_records_and_stops_at_zeroed_tail() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (first_hash, first) = fake_block(1);
        let (second_hash, second) = fake_block(2);
        let mut file = File::create(dir.path().join(blk_name(0))).expect("create");
        file.write_all(&record(&first)).expect("write");
        file.write_all(&record(&second)).expect("write");
        file.write_all(&[0u8; 64]).expect("write");
        drop(file);

        let source = BlkFileSource::new(dir.path(), MAGIC);
        let records = source.import().expect("import");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].location.offset, RECORD_PREFIX_LEN);
        assert_eq!(records[1].header.hash(), second_hash);
        assert_eq!(source.get_block(0, &first_hash).expect("first"), first);
        assert_eq!(source.get_block(1, &second_hash).expect("second"), second);

        // A second import finds nothing new.
        assert!(source.import().expect("reimport").is_empty());
        assert_eq!(source.len(), 2);
    }

    #[test]
    fn truncated_record_ends_the_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_, first) = fake_block(1);
        let (_, second) = fake_block(2);
        let mut bytes = record(&first);
        let partial = record(&second);
        bytes.extend_from_slice(&partial[..partial.len() - 3]);
        std::fs::write(dir.path().join(blk_name(0)), bytes).expect("write");

        let source = BlkFileSource::new(dir.path(), MAGIC);
        assert_eq!(source.import().expect("import").len(), 1);
    }

    #[test]
    fn wrong_magic_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_, first) = fake_block(1);
        let mut bytes = record(&first);
        bytes[0] = 0x01;
        std::fs::write(dir.path().join(blk_name(0)), bytes).expect("write");

        let source = BlkFileSource::new(dir.path(), MAGIC);
        assert!(matches!(source.import(), Err(SourceError::Io(_))));
    }

    #[test]
    fn unknown_block_is_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = BlkFileSource::new(dir.path(), MAGIC);
        let (hash, _) = fake_block(9);
        assert!(matches!(
            source.get_block(4, &hash),
            Err(SourceError::Missing { height: 4, .. })
        ));
    }
}
