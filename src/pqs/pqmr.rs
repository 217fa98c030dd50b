use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use bytes::{Buf, BufMut};
use memmap2::Mmap;
use parking_lot::RwLock;
use tempfile::NamedTempFile;
use crate::bitset::MatchBitset;
use crate::core::error::{Error, Result};
use crate::core::types::BlockNum;

/// Per-block match bitsets of one segment for one query.
#[derive(Debug, Default)]
pub struct SegmentPqmrResults {
    blocks: RwLock<BTreeMap<BlockNum, MatchBitset>>,
}

impl SegmentPqmrResults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(blocks: BTreeMap<BlockNum, MatchBitset>) -> Self {
        SegmentPqmrResults { blocks: RwLock::new(blocks) }
    }

    pub fn set_block_results(&self, block: BlockNum, bits: MatchBitset) {
        self.blocks.write().insert(block, bits);
    }

    pub fn get_block_results(&self, block: BlockNum) -> Option<MatchBitset> {
        self.blocks.read().get(&block).cloned()
    }

    pub fn contains_block(&self, block: BlockNum) -> bool {
        self.blocks.read().contains_key(&block)
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn block_nums(&self) -> Vec<BlockNum> {
        self.blocks.read().keys().copied().collect()
    }

    pub fn total_matched(&self) -> u64 {
        self.blocks.read().values().map(|b| b.count() as u64).sum()
    }

    pub fn to_map(&self) -> BTreeMap<BlockNum, MatchBitset> {
        self.blocks.read().clone()
    }

    /// Serializes as repeated `[block u16 LE][len u16 LE][bitset bytes]` records.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let blocks = self.blocks.read();
        let mut buf = Vec::with_capacity(blocks.values().map(|b| 4 + b.encoded_len()).sum());
        for (block, bits) in blocks.iter() {
            let len = u16::try_from(bits.encoded_len())
                .map_err(|_| Error::invalid_argument(format!("bitset of block {} too large for pqmr record", block)))?;
            buf.put_u16_le(*block);
            buf.put_u16_le(len);
            bits.encode_into(&mut buf);
        }
        Ok(buf)
    }

    /// Parses pqmr records. A record cut short by the end of the data ends the read.
    pub fn decode(mut data: &[u8]) -> Result<Self> {
        let mut blocks = BTreeMap::new();
        while data.remaining() >= 4 {
            let block = data.get_u16_le();
            let len = data.get_u16_le() as usize;
            if data.remaining() < len {
                break;
            }
            let bits = MatchBitset::decode(&data[..len])?;
            data.advance(len);
            blocks.insert(block, bits);
        }
        Ok(SegmentPqmrResults::from_map(blocks))
    }
}

/// Writes to a uniquely named temporary sibling and renames, so readers never see a partial
/// file and concurrent writers of the same file never share a temporary.
pub fn write_pqmr_file(path: &Path, results: &SegmentPqmrResults) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let data = results.encode()?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(&data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

pub fn read_pqmr_file(path: &Path) -> Result<SegmentPqmrResults> {
    let file = File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Ok(SegmentPqmrResults::new());
    }
    let mmap = unsafe { Mmap::map(&file)? };
    SegmentPqmrResults::decode(&mmap)
}
