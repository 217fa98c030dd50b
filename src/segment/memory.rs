use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use parking_lot::RwLock;
use crate::aggregation::number::Number;
use crate::aggregation::rollup::RollupGranularity;
use crate::bitset::MatchBitset;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{BlockNum, ColumnValue, RecordNum};
use crate::microindex::bloom::BlockBloom;
use crate::microindex::ranges::NumericRange;
use crate::segment::metadata::{BlockMetadataProvider, BlockMicroIndex, BlockSummary, SegmentMicroIndex};
use crate::segment::reader::{BlockDictionary, ColumnReader, RollupBuckets};

/// One log line: a timestamp plus named fields.
#[derive(Debug, Clone, Default)]
pub struct LogRecord {
    pub timestamp: u64,
    pub fields: HashMap<String, ColumnValue>,
}

impl LogRecord {
    pub fn new(timestamp: u64) -> Self {
        LogRecord { timestamp, fields: HashMap::new() }
    }

    pub fn with_field(mut self, name: &str, value: impl Into<ColumnValue>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }
}

struct MemBlock {
    timestamps: Vec<u64>,
    columns: HashMap<String, Vec<ColumnValue>>,
    dictionaries: HashMap<String, Arc<BlockDictionary>>,
    rollups: HashMap<RollupGranularity, Arc<RollupBuckets>>,
}

/// Builds an immutable in-memory segment, computing the micro-index as blocks are cut.
pub struct SegmentBuilder {
    table_name: String,
    segment_key: String,
    timestamp_key: String,
    block_size: usize,
    dict_threshold: usize,
    bloom_fp_rate: f64,
    rollups: bool,
    records: Vec<LogRecord>,
}

impl SegmentBuilder {
    pub fn new(table_name: &str, segment_key: &str) -> Self {
        SegmentBuilder {
            table_name: table_name.to_string(),
            segment_key: segment_key.to_string(),
            timestamp_key: "timestamp".to_string(),
            block_size: 1024,
            dict_threshold: 0,
            bloom_fp_rate: 0.01,
            rollups: true,
            records: Vec::new(),
        }
    }

    pub fn block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size.clamp(1, u16::MAX as usize);
        self
    }

    /// Columns with at most this many distinct values in a block are dictionary-encoded there.
    pub fn dict_threshold(mut self, dict_threshold: usize) -> Self {
        self.dict_threshold = dict_threshold;
        self
    }

    pub fn bloom_fp_rate(mut self, rate: f64) -> Self {
        self.bloom_fp_rate = rate.clamp(1e-9, 0.5);
        self
    }

    pub fn timestamp_key(mut self, key: &str) -> Self {
        self.timestamp_key = key.to_string();
        self
    }

    pub fn without_rollups(mut self) -> Self {
        self.rollups = false;
        self
    }

    pub fn add(mut self, record: LogRecord) -> Self {
        self.records.push(record);
        self
    }

    pub fn extend(mut self, records: impl IntoIterator<Item = LogRecord>) -> Self {
        self.records.extend(records);
        self
    }

    pub fn build(self) -> InMemorySegment {
        let mut all_columns = BTreeSet::new();
        for r in &self.records {
            all_columns.extend(r.fields.keys().cloned());
        }

        let mut summaries = Vec::new();
        let mut indices = HashMap::new();
        let mut blocks = Vec::new();

        for (blk, chunk) in self.records.chunks(self.block_size).enumerate() {
            let blk = blk as BlockNum;
            let timestamps: Vec<u64> = chunk.iter().map(|r| r.timestamp).collect();
            summaries.push(BlockSummary {
                low_ts: timestamps.iter().copied().min().unwrap_or(0),
                high_ts: timestamps.iter().copied().max().unwrap_or(0),
                record_count: chunk.len() as u16,
            });

            let mut micro = BlockMicroIndex::default();
            let mut tokens = BTreeSet::new();
            let mut columns = HashMap::new();
            let mut dictionaries = HashMap::new();

            for col in &all_columns {
                let values: Vec<ColumnValue> = chunk
                    .iter()
                    .map(|r| r.fields.get(col).cloned().unwrap_or(ColumnValue::Null))
                    .collect();
                if values.iter().all(|v| matches!(v, ColumnValue::Null)) {
                    continue;
                }
                micro.columns.insert(col.clone());

                let mut range: Option<NumericRange> = None;
                let mut all_numeric = true;
                for v in &values {
                    match v {
                        ColumnValue::Null => {}
                        v if v.is_numeric() => {
                            if let Some(n) = Number::from_column_value(v) {
                                match range.as_mut() {
                                    Some(r) => r.extend(n),
                                    None => range = Some(NumericRange::single(n)),
                                }
                            }
                        }
                        _ => all_numeric = false,
                    }
                    if !matches!(v, ColumnValue::Null) {
                        let text = v.to_string();
                        tokens.extend(
                            text.split(|c: char| !c.is_alphanumeric())
                                .filter(|t| !t.is_empty())
                                .map(str::to_string),
                        );
                        tokens.insert(text);
                    }
                }
                if let (true, Some(r)) = (all_numeric, range) {
                    micro.ranges.insert(col.clone(), r);
                }

                if let Some(dict) = Self::dictionary_for(&values, self.dict_threshold) {
                    micro.dict_encoded.insert(col.clone());
                    dictionaries.insert(col.clone(), Arc::new(dict));
                }
                columns.insert(col.clone(), values);
            }

            let mut bloom = BlockBloom::new(tokens.len(), self.bloom_fp_rate);
            for t in &tokens {
                bloom.insert(t);
            }
            micro.bloom = Some(bloom);
            indices.insert(blk, micro);

            let mut rollups = HashMap::new();
            if self.rollups {
                for granularity in RollupGranularity::all() {
                    let mut buckets = RollupBuckets::new();
                    for (i, ts) in timestamps.iter().enumerate() {
                        buckets
                            .entry(granularity.bucket_start(*ts))
                            .or_insert_with(|| MatchBitset::new(timestamps.len()))
                            .add_matched_record(i);
                    }
                    rollups.insert(granularity, Arc::new(buckets));
                }
            }

            blocks.push(MemBlock { timestamps, columns, dictionaries, rollups });
        }

        let micro_index = SegmentMicroIndex {
            segment_key: self.segment_key.clone(),
            table_name: self.table_name.clone(),
            block_summaries: summaries,
            block_indices: indices,
            columns: all_columns.clone(),
        };

        InMemorySegment {
            micro_index: Arc::new(micro_index),
            blocks,
            timestamp_key: self.timestamp_key,
            columns: all_columns,
            failing_columns: HashSet::new(),
        }
    }

    fn dictionary_for(values: &[ColumnValue], threshold: usize) -> Option<BlockDictionary> {
        if threshold == 0 {
            return None;
        }
        let mut distinct: Vec<ColumnValue> = Vec::new();
        let mut lookup: HashMap<Vec<u8>, u32> = HashMap::new();
        let mut codes = Vec::with_capacity(values.len());
        for v in values {
            let mut key = Vec::new();
            v.write_key_bytes(&mut key);
            let code = match lookup.get(&key) {
                Some(c) => *c,
                None => {
                    if distinct.len() >= threshold {
                        return None;
                    }
                    let c = distinct.len() as u32;
                    distinct.push(v.clone());
                    lookup.insert(key, c);
                    c
                }
            };
            codes.push(code);
        }
        Some(BlockDictionary { values: distinct, codes })
    }
}

/// Segment held entirely in memory; implements the reader and backs the metadata provider.
pub struct InMemorySegment {
    micro_index: Arc<SegmentMicroIndex>,
    blocks: Vec<MemBlock>,
    timestamp_key: String,
    columns: BTreeSet<String>,
    failing_columns: HashSet<String>,
}

impl InMemorySegment {
    pub fn micro_index(&self) -> Arc<SegmentMicroIndex> {
        self.micro_index.clone()
    }

    pub fn segment_key(&self) -> &str {
        &self.micro_index.segment_key
    }

    pub fn table_name(&self) -> &str {
        &self.micro_index.table_name
    }

    /// Every read of `column` fails from now on.
    pub fn with_failing_column(mut self, column: &str) -> Self {
        self.failing_columns.insert(column.to_string());
        self
    }

    fn block(&self, block: BlockNum) -> Result<&MemBlock> {
        self.blocks
            .get(block as usize)
            .ok_or_else(|| Error::not_found(format!("block {} not in {}", block, self.segment_key())))
    }
}

impl ColumnReader for InMemorySegment {
    fn segment_key(&self) -> &str {
        &self.micro_index.segment_key
    }

    fn has_column(&self, column: &str) -> bool {
        column == self.timestamp_key || self.columns.contains(column)
    }

    fn read_value(&self, column: &str, block: BlockNum, record: RecordNum) -> Result<ColumnValue> {
        if self.failing_columns.contains(column) {
            return Err(Error::new(ErrorKind::Io, format!("failed to decode column {}", column)));
        }
        if column == self.timestamp_key {
            return self.read_timestamp(block, record).map(ColumnValue::Unsigned);
        }
        let blk = self.block(block)?;
        match blk.columns.get(column) {
            Some(values) => values
                .get(record as usize)
                .cloned()
                .ok_or_else(|| Error::not_found(format!("record {} not in block {}", record, block))),
            None => Ok(ColumnValue::Null),
        }
    }

    fn read_timestamp(&self, block: BlockNum, record: RecordNum) -> Result<u64> {
        self.block(block)?
            .timestamps
            .get(record as usize)
            .copied()
            .ok_or_else(|| Error::not_found(format!("record {} not in block {}", record, block)))
    }

    fn dictionary(&self, column: &str, block: BlockNum) -> Option<Arc<BlockDictionary>> {
        if self.failing_columns.contains(column) {
            return None;
        }
        self.blocks.get(block as usize)?.dictionaries.get(column).cloned()
    }

    fn rollups(&self, block: BlockNum, granularity: RollupGranularity) -> Result<Option<Arc<RollupBuckets>>> {
        Ok(self.block(block)?.rollups.get(&granularity).cloned())
    }
}

/// Metadata provider over registered in-memory segments.
#[derive(Default)]
pub struct InMemoryMetadata {
    segments: RwLock<HashMap<(String, String), Arc<SegmentMicroIndex>>>,
}

impl InMemoryMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, micro_index: Arc<SegmentMicroIndex>) {
        let key = (micro_index.table_name.clone(), micro_index.segment_key.clone());
        self.segments.write().insert(key, micro_index);
    }

    pub fn remove(&self, table: &str, segment_key: &str) {
        self.segments.write().remove(&(table.to_string(), segment_key.to_string()));
    }
}

impl BlockMetadataProvider for InMemoryMetadata {
    fn segment_micro_index(&self, table: &str, segment_key: &str) -> Result<Arc<SegmentMicroIndex>> {
        self.segments
            .read()
            .get(&(table.to_string(), segment_key.to_string()))
            .cloned()
            .ok_or_else(|| Error::not_found(format!("no metadata for {}/{}", table, segment_key)))
    }
}
