//! Dictionary encoding of the per-series label sets of a chunk.
//!
//! ```text
//! labelsMeta   6 × u32 LE: compressedValsSize keysSize valsSize
//!                          keysDictSize valsDictSize pairsSize
//! keys dict    raw, u16-length-prefixed strings
//! values dict  LZ4 block, u16-length-prefixed strings
//! pairs        per series: u8 count, then count × (u8 keyIdx, u24 LE valIdx)
//! ```

use std::collections::HashMap;
use std::io::Read;

use crate::constants::CHUNK_MAX_LABEL_VALUES;
use crate::error::{ChunkError, ChunkResult};
use crate::model::{Labels, MetricValues};

const META_SIZE: usize = 6 * 4;
const MAX_KEYS: usize = 256;
const MAX_PAIRS: usize = 255;
const MAX_STRING_LEN: usize = 1 << 16;

/// Interns strings in first-seen order.
#[derive(Default)]
struct Dict {
    index: HashMap<String, usize>,
    items: Vec<String>,
    encoded: Vec<u8>,
}

impl Dict {
    fn intern(&mut self, s: &str) -> ChunkResult<usize> {
        if let Some(&idx) = self.index.get(s) {
            return Ok(idx);
        }
        if s.len() > MAX_STRING_LEN {
            return Err(ChunkError::invalid_labels(format!(
                "label string is too long: {} bytes",
                s.len()
            )));
        }
        // A zero length prefix stands for 65536; empty strings never get here.
        self.encoded
            .extend_from_slice(&((s.len() % MAX_STRING_LEN) as u16).to_le_bytes());
        self.encoded.extend_from_slice(s.as_bytes());
        let idx = self.items.len();
        self.items.push(s.to_string());
        self.index.insert(s.to_string(), idx);
        Ok(idx)
    }
}

/// Serializes the labels of `metrics` in order.
pub(crate) fn encode(metrics: &[MetricValues]) -> ChunkResult<Vec<u8>> {
    let mut keys = Dict::default();
    let mut values = Dict::default();
    let mut pairs = Vec::with_capacity(metrics.len() * 16);

    for m in metrics {
        let non_empty: Vec<(&String, &String)> = m.labels.iter().filter(|(_, v)| !v.is_empty()).collect();
        if non_empty.len() > MAX_PAIRS {
            return Err(ChunkError::invalid_labels(format!(
                "too many labels in a series: {}",
                non_empty.len()
            )));
        }
        pairs.push(non_empty.len() as u8);
        for (k, v) in non_empty {
            if k.is_empty() {
                return Err(ChunkError::invalid_labels("empty label name"));
            }
            let ki = keys.intern(k)?;
            if ki >= MAX_KEYS {
                return Err(ChunkError::invalid_labels(format!(
                    "too many distinct label names: {}",
                    ki + 1
                )));
            }
            let vi = values.intern(v)?;
            if vi >= CHUNK_MAX_LABEL_VALUES {
                return Err(ChunkError::Programming {
                    message: "valIdx value exceeds 24-bit limit".to_string(),
                });
            }
            pairs.push(ki as u8);
            pairs.extend_from_slice(&(vi as u32).to_le_bytes()[..3]);
        }
    }

    let compressed_vals = lz4_flex::block::compress(&values.encoded);

    let mut out = Vec::with_capacity(
        META_SIZE + keys.encoded.len() + compressed_vals.len() + pairs.len(),
    );
    for v in [
        compressed_vals.len(),
        keys.encoded.len(),
        values.encoded.len(),
        keys.items.len(),
        values.items.len(),
        pairs.len(),
    ] {
        out.extend_from_slice(&(v as u32).to_le_bytes());
    }
    out.extend_from_slice(&keys.encoded);
    out.extend_from_slice(&compressed_vals);
    out.extend_from_slice(&pairs);
    Ok(out)
}

/// Decoded labels section; series labels are pulled sequentially.
#[derive(Debug)]
pub(crate) struct LabelsSection {
    keys: Vec<String>,
    values: Vec<String>,
    pairs: Vec<u8>,
    cursor: usize,
}

impl LabelsSection {
    pub(crate) fn read<R: Read>(r: &mut R) -> ChunkResult<Self> {
        let mut meta = [0u8; META_SIZE];
        r.read_exact(&mut meta)?;
        let field = |i: usize| u32::from_le_bytes([meta[i * 4], meta[i * 4 + 1], meta[i * 4 + 2], meta[i * 4 + 3]]) as usize;
        let (compressed_vals_size, keys_size, vals_size) = (field(0), field(1), field(2));
        let (keys_count, vals_count, pairs_size) = (field(3), field(4), field(5));

        let mut keys_raw = vec![0u8; keys_size];
        r.read_exact(&mut keys_raw)?;
        let mut vals_compressed = vec![0u8; compressed_vals_size];
        r.read_exact(&mut vals_compressed)?;
        let vals_raw = lz4_flex::block::decompress(&vals_compressed, vals_size)
            .map_err(|e| ChunkError::corruption(format!("labels values: {e}")))?;
        if vals_raw.len() != vals_size {
            return Err(ChunkError::corruption("labels values size mismatch"));
        }
        let mut pairs = vec![0u8; pairs_size];
        r.read_exact(&mut pairs)?;

        Ok(Self {
            keys: decode_dict(&keys_raw, keys_count)?,
            values: decode_dict(&vals_raw, vals_count)?,
            pairs,
            cursor: 0,
        })
    }

    /// Labels of the next series; `decode = false` only advances the cursor.
    pub(crate) fn next_series(&mut self, decode: bool) -> ChunkResult<Option<Labels>> {
        let count = *self
            .pairs
            .get(self.cursor)
            .ok_or_else(|| ChunkError::corruption("labels pairs are truncated"))? as usize;
        let start = self.cursor + 1;
        let end = start + count * 4;
        if end > self.pairs.len() {
            return Err(ChunkError::corruption("labels pairs are truncated"));
        }
        self.cursor = end;
        if !decode {
            return Ok(None);
        }
        let mut labels = Labels::new();
        for p in self.pairs[start..end].chunks_exact(4) {
            let ki = p[0] as usize;
            let vi = u32::from_le_bytes([p[1], p[2], p[3], 0]) as usize;
            let key = self
                .keys
                .get(ki)
                .ok_or_else(|| ChunkError::corruption(format!("keyIdx {ki} out of range")))?;
            let value = self
                .values
                .get(vi)
                .ok_or_else(|| ChunkError::corruption(format!("valIdx {vi} out of range")))?;
            labels.insert(key.clone(), value.clone());
        }
        Ok(Some(labels))
    }
}

fn decode_dict(raw: &[u8], count: usize) -> ChunkResult<Vec<String>> {
    let mut res = Vec::with_capacity(count.min(raw.len() / 2 + 1));
    let mut pos = 0;
    for _ in 0..count {
        if pos + 2 > raw.len() {
            return Err(ChunkError::corruption("labels dictionary is truncated"));
        }
        let mut len = u16::from_le_bytes([raw[pos], raw[pos + 1]]) as usize;
        if len == 0 {
            len = MAX_STRING_LEN;
        }
        pos += 2;
        let bytes = raw
            .get(pos..pos + len)
            .ok_or_else(|| ChunkError::corruption("labels dictionary is truncated"))?;
        let s = std::str::from_utf8(bytes)
            .map_err(|e| ChunkError::corruption(format!("labels dictionary: {e}")))?;
        res.push(s.to_string());
        pos += len;
    }
    Ok(res)
}
