//! Read-only decoders of chunk versions 1 to 3.
//!
//! They share the version 4 header; its last field holds the size of the
//! compressed values section (v1) or the number of series (v2, v3). Each
//! series starts with a 16-byte entry: labels hash `u64`, then offset and
//! size (`u32` each) of its labels inside the labels section.
//!
//! ```text
//! v1: { len u32, lz4 block }  entries, each followed by an f64 row
//!     { len u32, lz4 block }  labels as concatenated JSON objects
//! v2: LZ4 stream of entries with f64 rows, then NUL separated labels
//! v3: same as v2 with f32 rows
//! ```
//!
//! The stream is a sequence of `{ compressed size u32, lz4 block }` where a
//! block may reference the previous 64 KiB of decoded data.

use std::collections::HashMap;
use std::io::{self, Read};

use super::{FillFn, Header};
use crate::constants::CHUNK_MAX_BLOCK_SIZE;
use crate::error::{ChunkError, ChunkResult};
use crate::model::{Labels, MetricValues};
use crate::timeseries::{Duration, Time};

const ENTRY_SIZE: usize = 16;
const STREAM_WINDOW: usize = 64 * 1024;

#[derive(Clone, Copy, Debug)]
struct Entry {
    hash: u64,
    offset: u32,
    size: u32,
}

impl Entry {
    fn parse(b: &[u8]) -> Self {
        let mut hash = [0u8; 8];
        hash.copy_from_slice(&b[..8]);
        Self {
            hash: u64::from_le_bytes(hash),
            offset: u32::from_le_bytes([b[8], b[9], b[10], b[11]]),
            size: u32::from_le_bytes([b[12], b[13], b[14], b[15]]),
        }
    }
}

fn decode_row(raw: &[u8], value_size: usize, row: &mut [f32]) {
    for (v, b) in row.iter_mut().zip(raw.chunks_exact(value_size)) {
        *v = if value_size == 8 {
            let mut x = [0u8; 8];
            x.copy_from_slice(b);
            f64::from_le_bytes(x) as f32
        } else {
            f32::from_le_bytes([b[0], b[1], b[2], b[3]])
        };
    }
}

/// Merges one decoded row into `dest`; returns the entry if its labels are
/// still needed.
#[allow(clippy::too_many_arguments)]
fn merge_row(
    entry: Entry,
    header: &Header,
    row: &[f32],
    from: Time,
    points_count: usize,
    step: Duration,
    dest: &mut HashMap<u64, MetricValues>,
    fill: FillFn,
) -> Option<Entry> {
    match dest.get_mut(&entry.hash) {
        Some(mv) => {
            fill(&mut mv.values, header.from, header.step, row);
            None
        }
        None => {
            let mut mv = MetricValues::with_hash(entry.hash, from, points_count, step);
            if !fill(&mut mv.values, header.from, header.step, row) {
                return None;
            }
            dest.insert(entry.hash, mv);
            Some(entry)
        }
    }
}

/// `{ decompressed len u32, lz4 block }`; a zero length means empty.
fn decompress_section(src: &[u8]) -> ChunkResult<Vec<u8>> {
    if src.len() < 4 {
        return Err(ChunkError::corruption("truncated section"));
    }
    let len = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
    if len == 0 {
        return Ok(Vec::new());
    }
    // LZ4 cannot expand input by more than 255x.
    if len > (src.len() - 4).saturating_mul(255) + 16 {
        return Err(ChunkError::corruption(format!("implausible section size: {len}")));
    }
    let out = lz4_flex::block::decompress(&src[4..], len).map_err(|e| ChunkError::corruption(format!("lz4 section: {e}")))?;
    if out.len() != len {
        return Err(ChunkError::corruption("lz4 section size mismatch"));
    }
    Ok(out)
}

pub(super) fn read_v1<R: Read>(
    r: &mut R,
    header: &Header,
    from: Time,
    points_count: usize,
    step: Duration,
    dest: &mut HashMap<u64, MetricValues>,
    fill: FillFn,
) -> ChunkResult<()> {
    let mut compressed = Vec::new();
    r.by_ref().take(header.metrics_count as u64).read_to_end(&mut compressed)?;
    if compressed.len() != header.metrics_count as usize {
        return Err(ChunkError::corruption("truncated values section"));
    }
    let values = decompress_section(&compressed)?;

    let record = ENTRY_SIZE + 8 * header.points_count as usize;
    if values.len() % record != 0 {
        return Err(ChunkError::corruption("values section is not a whole number of rows"));
    }
    let mut row = vec![f32::NAN; header.points_count as usize];
    let mut to_label = Vec::new();
    for rec in values.chunks_exact(record) {
        decode_row(&rec[ENTRY_SIZE..], 8, &mut row);
        let entry = Entry::parse(rec);
        to_label.extend(merge_row(entry, header, &row, from, points_count, step, dest, fill));
    }
    if to_label.is_empty() {
        return Ok(());
    }

    let mut rest = Vec::new();
    r.read_to_end(&mut rest)?;
    let labels = decompress_section(&rest)?;
    for e in to_label {
        let (start, end) = (e.offset as usize, e.offset as usize + e.size as usize);
        let raw = labels
            .get(start..end)
            .ok_or_else(|| ChunkError::corruption(format!("labels out of range: {start}..{end}")))?;
        let parsed: Labels =
            serde_json::from_slice(raw).map_err(|err| ChunkError::corruption(format!("labels: {err}")))?;
        if let Some(mv) = dest.get_mut(&e.hash) {
            mv.set_labels(parsed);
        }
    }
    Ok(())
}

pub(super) fn read_stream<R: Read>(
    r: &mut R,
    header: &Header,
    from: Time,
    points_count: usize,
    step: Duration,
    dest: &mut HashMap<u64, MetricValues>,
    fill: FillFn,
) -> ChunkResult<()> {
    let value_size = if header.version == 2 { 8 } else { 4 };
    let mut s = StreamReader::new(r);
    let mut raw = vec![0u8; ENTRY_SIZE + value_size * header.points_count as usize];
    let mut row = vec![f32::NAN; header.points_count as usize];
    let mut to_label = Vec::new();
    for _ in 0..header.metrics_count {
        s.read_exact(&mut raw).map_err(stream_error)?;
        decode_row(&raw[ENTRY_SIZE..], value_size, &mut row);
        let entry = Entry::parse(&raw);
        to_label.extend(merge_row(entry, header, &row, from, points_count, step, dest, fill));
    }
    if to_label.is_empty() {
        return Ok(());
    }

    to_label.sort_by_key(|e| e.offset);
    let mut offset = 0u64;
    let mut buf = Vec::new();
    for e in to_label {
        let start = e.offset as u64;
        if start < offset {
            return Err(ChunkError::corruption("overlapping labels"));
        }
        let skipped = io::copy(&mut s.by_ref().take(start - offset), &mut io::sink()).map_err(stream_error)?;
        buf.clear();
        s.by_ref().take(e.size as u64).read_to_end(&mut buf).map_err(stream_error)?;
        if skipped != start - offset || buf.len() != e.size as usize {
            return Err(ChunkError::corruption("truncated labels section"));
        }
        offset = start + e.size as u64;
        if let Some(mv) = dest.get_mut(&e.hash) {
            mv.set_labels(parse_nul_labels(&buf));
        }
    }
    Ok(())
}

/// `key\0value\0key\0value\0...`
fn parse_nul_labels(src: &[u8]) -> Labels {
    let mut labels = Labels::new();
    let mut parts = src.split(|&b| b == 0);
    while let (Some(k), Some(v)) = (parts.next(), parts.next()) {
        if k.is_empty() && v.is_empty() {
            break;
        }
        labels.insert(String::from_utf8_lossy(k).into_owned(), String::from_utf8_lossy(v).into_owned());
    }
    labels
}

fn stream_error(e: io::Error) -> ChunkError {
    if e.kind() == io::ErrorKind::InvalidData {
        ChunkError::corruption(e.to_string())
    } else {
        ChunkError::from(e)
    }
}

/// Decodes the chained LZ4 blocks of versions 2 and 3.
struct StreamReader<'a, R: Read> {
    inner: &'a mut R,
    compressed: Vec<u8>,
    out: Vec<u8>,
    window: Vec<u8>,
    pos: usize,
}

impl<'a, R: Read> StreamReader<'a, R> {
    fn new(inner: &'a mut R) -> Self {
        Self {
            inner,
            compressed: Vec::new(),
            out: Vec::new(),
            window: Vec::with_capacity(2 * STREAM_WINDOW),
            pos: 0,
        }
    }

    /// Returns false at the end of the stream.
    fn next_block(&mut self) -> io::Result<bool> {
        self.window.extend_from_slice(&self.out);
        if self.window.len() > STREAM_WINDOW {
            self.window.drain(..self.window.len() - STREAM_WINDOW);
        }

        let mut size = [0u8; 4];
        let mut filled = 0;
        while filled < size.len() {
            match self.inner.read(&mut size[filled..])? {
                0 if filled == 0 => return Ok(false),
                0 => return Err(io::ErrorKind::UnexpectedEof.into()),
                n => filled += n,
            }
        }
        let n = u32::from_le_bytes(size) as usize;
        if n > lz4_flex::block::get_maximum_output_size(CHUNK_MAX_BLOCK_SIZE) {
            return Err(io::Error::new(io::ErrorKind::InvalidData, format!("invalid stream block size: {n}")));
        }
        self.compressed.resize(n, 0);
        self.inner.read_exact(&mut self.compressed)?;

        self.out.resize(CHUNK_MAX_BLOCK_SIZE, 0);
        let written = lz4_flex::block::decompress_into_with_dict(&self.compressed, &mut self.out, &self.window)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("lz4 stream: {e}")))?;
        self.out.truncate(written);
        self.pos = 0;
        Ok(true)
    }
}

impl<R: Read> Read for StreamReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos == self.out.len() {
            if !self.next_block()? {
                return Ok(0);
            }
        }
        let n = buf.len().min(self.out.len() - self.pos);
        buf[..n].copy_from_slice(&self.out[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
