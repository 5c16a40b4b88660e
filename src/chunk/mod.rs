//! On-disk chunk codec.
//!
//! A chunk stores a fixed-shape matrix of float32 samples (one row of
//! `points_count` values per series) plus the label sets of the series.
//!
//! ```text
//! ┌──────────────────────── header (26 bytes, LE) ─────────────────────────┐
//! │ version u8 │ from i64 │ pointsCount u32 │ step i64 │ finalized u8 │ n u32│
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │ hashes: n × u64                                                         │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │ blocks: { decompressed u32, compressed u32, lz4 block } ...             │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │ labels section (see `labels`)                                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Versions 1 to 3 are still readable (see `legacy`); only version 4 is
//! written.

mod labels;
mod legacy;

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::constants::{CHUNK_HEADER_SIZE, CHUNK_MAX_BLOCK_SIZE, CHUNK_MAX_DURATION, CHUNK_VERSION};
use crate::error::{ChunkError, ChunkResult};
use crate::model::MetricValues;
use crate::pool::{self, PooledBuf};
use crate::timeseries::{Duration, Time, TimeSeries};

/// Copies chunk samples into a destination series and reports whether
/// anything was written.
pub type FillFn = fn(&mut TimeSeries, Time, Duration, &[f32]) -> bool;

/// Takes every defined sample of the chunk; later chunks overwrite earlier ones.
pub fn fill_any(dest: &mut TimeSeries, from: Time, step: Duration, data: &[f32]) -> bool {
    dest.fill(from, step, data)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkMeta {
    pub path: PathBuf,
    pub from: Time,
    pub points_count: u32,
    pub step: Duration,
    pub finalized: bool,
    pub metrics_count: u32,
    pub created: Time,
}

impl ChunkMeta {
    /// Timestamp of the last point.
    pub fn to(&self) -> Time {
        self.from + self.step * (self.points_count as i64 - 1)
    }

    pub fn duration(&self) -> Duration {
        self.step * self.points_count as i64
    }

    pub fn intersects(&self, from: Time, to: Time) -> bool {
        self.from <= to && self.to() >= from
    }
}

#[derive(Debug, Clone, Copy)]
struct Header {
    version: u8,
    from: Time,
    points_count: u32,
    step: Duration,
    finalized: bool,
    /// Number of series, or the size of the values section in version 1.
    metrics_count: u32,
}

impl Header {
    fn encode(&self) -> [u8; CHUNK_HEADER_SIZE] {
        let mut buf = [0u8; CHUNK_HEADER_SIZE];
        buf[0] = self.version;
        buf[1..9].copy_from_slice(&self.from.0.to_le_bytes());
        buf[9..13].copy_from_slice(&self.points_count.to_le_bytes());
        buf[13..21].copy_from_slice(&self.step.0.to_le_bytes());
        buf[21] = self.finalized as u8;
        buf[22..26].copy_from_slice(&self.metrics_count.to_le_bytes());
        buf
    }

    fn read<R: Read>(r: &mut R) -> ChunkResult<Self> {
        let mut buf = [0u8; CHUNK_HEADER_SIZE];
        r.read_exact(&mut buf)?;
        let version = buf[0];
        if !(1..=CHUNK_VERSION).contains(&version) {
            return Err(ChunkError::UnsupportedVersion(version));
        }
        let i64_at = |o: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[o..o + 8]);
            i64::from_le_bytes(b)
        };
        let u32_at = |o: usize| u32::from_le_bytes([buf[o], buf[o + 1], buf[o + 2], buf[o + 3]]);
        let header = Header {
            version,
            from: Time(i64_at(1)),
            points_count: u32_at(9),
            step: Duration(i64_at(13)),
            finalized: buf[21] != 0,
            metrics_count: u32_at(22),
        };
        if header.step.0 <= 0 {
            return Err(ChunkError::corruption(format!("invalid step: {}", header.step.0)));
        }
        // Row buffers are sized from the header, so it must stay plausible.
        if header.points_count as i64 > CHUNK_MAX_DURATION / header.step {
            return Err(ChunkError::corruption(format!(
                "{} points of {} exceed the maximum chunk duration",
                header.points_count, header.step
            )));
        }
        Ok(header)
    }

    fn series_count(&self) -> u32 {
        if self.version == 1 {
            0
        } else {
            self.metrics_count
        }
    }
}

// ----------------------------------------------------------------------------
// Write
// ----------------------------------------------------------------------------

/// Writes a chunk atomically: temp file in the same directory, fsync, rename.
pub fn write(
    path: &Path,
    from: Time,
    points_count: usize,
    step: Duration,
    finalized: bool,
    metrics: &[MetricValues],
) -> ChunkResult<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("chunk");
    let tmp = dir.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4().simple()));

    let res = write_file(&tmp, from, points_count, step, finalized, metrics)
        .and_then(|_| fs::rename(&tmp, path).map_err(ChunkError::from));
    if res.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    res
}

fn write_file(
    tmp: &Path,
    from: Time,
    points_count: usize,
    step: Duration,
    finalized: bool,
    metrics: &[MetricValues],
) -> ChunkResult<()> {
    if step.0 <= 0 {
        return Err(ChunkError::Programming {
            message: format!("invalid step: {}", step.0),
        });
    }
    let file = File::create(tmp)?;
    let mut w = BufWriter::new(file);

    let header = Header {
        version: CHUNK_VERSION,
        from,
        points_count: points_count as u32,
        step,
        finalized,
        metrics_count: metrics.len() as u32,
    };
    w.write_all(&header.encode())?;
    for m in metrics {
        w.write_all(&m.labels_hash.to_le_bytes())?;
    }

    let pool = pool::global();
    let mut block = pool.acquire(CHUNK_MAX_BLOCK_SIZE);
    let mut compressed = pool.acquire(lz4_flex::block::get_maximum_output_size(CHUNK_MAX_BLOCK_SIZE));
    let mut row = vec![f32::NAN; points_count];
    let last = from + step * (points_count as i64 - 1);
    for m in metrics {
        row.fill(f32::NAN);
        for (t, v) in m.values.iter() {
            if t < from || t > last {
                continue;
            }
            row[((t - from) / step) as usize] = v;
        }
        for v in &row {
            if block.len() + 4 > CHUNK_MAX_BLOCK_SIZE {
                flush_block(&mut w, &mut block, &mut compressed)?;
            }
            block.extend_from_slice(&v.to_le_bytes());
        }
    }
    if !block.is_empty() {
        flush_block(&mut w, &mut block, &mut compressed)?;
    }

    w.write_all(&labels::encode(metrics)?)?;
    let file = w.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(())
}

fn flush_block<W: Write>(w: &mut W, block: &mut PooledBuf<'_>, compressed: &mut PooledBuf<'_>) -> ChunkResult<()> {
    let max = lz4_flex::block::get_maximum_output_size(block.len());
    compressed.clear();
    compressed.resize(max, 0);
    let n = lz4_flex::block::compress_into(&block[..], &mut compressed[..]).map_err(|e| ChunkError::Programming {
        message: format!("lz4 compression failed: {e}"),
    })?;
    w.write_all(&(block.len() as u32).to_le_bytes())?;
    w.write_all(&(n as u32).to_le_bytes())?;
    w.write_all(&compressed[..n])?;
    block.clear();
    Ok(())
}

// ----------------------------------------------------------------------------
// Read
// ----------------------------------------------------------------------------

/// Reads only the header. The series count of version 1 chunks is not
/// stored in the header and is reported as zero.
pub fn read_meta(path: &Path) -> ChunkResult<ChunkMeta> {
    let mut f = File::open(path)?;
    let header = Header::read(&mut f)?;
    let created = f
        .metadata()
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| Time(d.as_secs() as i64))
        .unwrap_or_default();
    Ok(ChunkMeta {
        path: path.to_path_buf(),
        from: header.from,
        points_count: header.points_count,
        step: header.step,
        finalized: header.finalized,
        metrics_count: header.series_count(),
        created,
    })
}

/// Decodes raw float rows block by block.
struct BlockReader<'a, R: Read> {
    r: &'a mut R,
    block: PooledBuf<'static>,
    compressed: PooledBuf<'static>,
    pos: usize,
}

impl<'a, R: Read> BlockReader<'a, R> {
    fn new(r: &'a mut R) -> Self {
        let pool = pool::global();
        Self {
            r,
            block: pool.acquire(CHUNK_MAX_BLOCK_SIZE),
            compressed: pool.acquire(CHUNK_MAX_BLOCK_SIZE),
            pos: 0,
        }
    }

    fn next_block(&mut self) -> ChunkResult<()> {
        let mut sizes = [0u8; 8];
        self.r.read_exact(&mut sizes)?;
        let decompressed = u32::from_le_bytes([sizes[0], sizes[1], sizes[2], sizes[3]]) as usize;
        let compressed = u32::from_le_bytes([sizes[4], sizes[5], sizes[6], sizes[7]]) as usize;
        if decompressed > CHUNK_MAX_BLOCK_SIZE || decompressed % 4 != 0 || decompressed == 0 {
            return Err(ChunkError::corruption(format!("invalid block size: {decompressed}")));
        }
        self.compressed.clear();
        self.compressed.resize(compressed, 0);
        self.r.read_exact(&mut self.compressed)?;
        self.block.clear();
        self.block.resize(decompressed, 0);
        let n = lz4_flex::block::decompress_into(&self.compressed[..], &mut self.block[..])
            .map_err(|e| ChunkError::corruption(format!("lz4 block: {e}")))?;
        if n != decompressed {
            return Err(ChunkError::corruption("lz4 block size mismatch"));
        }
        self.pos = 0;
        Ok(())
    }

    fn read_row(&mut self, row: &mut [f32]) -> ChunkResult<()> {
        for v in row.iter_mut() {
            if self.pos + 4 > self.block.len() {
                self.next_block()?;
            }
            let b = &self.block[self.pos..self.pos + 4];
            *v = f32::from_le_bytes([b[0], b[1], b[2], b[3]]);
            self.pos += 4;
        }
        Ok(())
    }
}

/// Merges a chunk into `dest`, shaped as `(from, points_count, step)`.
///
/// Series new to `dest` are kept only if `fill` wrote something; labels are
/// decoded only for them.
pub fn read(
    path: &Path,
    from: Time,
    points_count: usize,
    step: Duration,
    dest: &mut HashMap<u64, MetricValues>,
    fill: FillFn,
) -> ChunkResult<()> {
    let f = File::open(path)?;
    let mut r = BufReader::new(f);
    let header = Header::read(&mut r)?;
    match header.version {
        1 => return legacy::read_v1(&mut r, &header, from, points_count, step, dest, fill),
        2 | 3 => return legacy::read_stream(&mut r, &header, from, points_count, step, dest, fill),
        _ => {}
    }

    let n = header.metrics_count as usize;
    let mut hashes = Vec::with_capacity(n.min(1 << 20));
    let mut hash_buf = [0u8; 8];
    for _ in 0..n {
        r.read_exact(&mut hash_buf)?;
        hashes.push(u64::from_le_bytes(hash_buf));
    }

    let mut need_labels = vec![false; n];
    {
        let mut blocks = BlockReader::new(&mut r);
        let mut row = vec![f32::NAN; header.points_count as usize];
        for (i, &hash) in hashes.iter().enumerate() {
            blocks.read_row(&mut row)?;
            match dest.get_mut(&hash) {
                Some(mv) => {
                    fill(&mut mv.values, header.from, header.step, &row);
                }
                None => {
                    let mut mv = MetricValues::with_hash(hash, from, points_count, step);
                    if fill(&mut mv.values, header.from, header.step, &row) {
                        dest.insert(hash, mv);
                        need_labels[i] = true;
                    }
                }
            }
        }
        // Trailing bytes of the last block are not expected.
        if blocks.pos != blocks.block.len() {
            return Err(ChunkError::corruption("unexpected data after the last row"));
        }
    }

    if !need_labels.iter().any(|&b| b) {
        return Ok(());
    }
    let mut section = labels::LabelsSection::read(&mut r)?;
    for (i, hash) in hashes.iter().enumerate() {
        if let Some(labels) = section.next_series(need_labels[i])? {
            if let Some(mv) = dest.get_mut(hash) {
                mv.set_labels(labels);
            }
        }
    }
    Ok(())
}

/// Human-readable header summary used by the `chunk-info` command.
pub fn describe(meta: &ChunkMeta) -> String {
    format!(
        "from={} to={} points={} step={} finalized={} series={}",
        meta.from.to_datetime().to_rfc3339(),
        meta.to().to_datetime().to_rfc3339(),
        meta.points_count,
        meta.step,
        meta.finalized,
        meta.metrics_count
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Labels;
    use crate::timeseries::NAN;
    use pretty_assertions::assert_eq;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn series(hash: u64, labels: Labels, ts: TimeSeries) -> MetricValues {
        let mut mv = MetricValues::new(labels, ts);
        mv.labels_hash = hash;
        mv
    }

    #[test]
    fn test_write_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1.db");
        let data = vec![NAN, 1.0, NAN, NAN, NAN, NAN, NAN, NAN, 2.0, NAN];
        let ts = TimeSeries::with_data(Time(0), Duration(30), data);
        let metrics = vec![
            series(123, labels(&[("a", "b")]), ts.clone()),
            series(321, labels(&[("a", "c")]), ts),
        ];
        write(&path, Time(0), 10, Duration(30), false, &metrics).unwrap();

        let meta = read_meta(&path).unwrap();
        assert_eq!(meta.from, Time(0));
        assert_eq!(meta.points_count, 10);
        assert_eq!(meta.step, Duration(30));
        assert!(!meta.finalized);
        assert_eq!(meta.metrics_count, 2);

        let mut dest = HashMap::new();
        read(&path, Time(60), 10, Duration(30), &mut dest, fill_any).unwrap();
        assert_eq!(dest.len(), 2);
        let m = &dest[&123];
        assert_eq!(m.labels, labels(&[("a", "b")]));
        assert_eq!(m.values.to_string(), "TimeSeries(60, 10, 30, [. . . . . . 2 . . .])");
        assert_eq!(dest[&321].labels, labels(&[("a", "c")]));

        // No temp files are left behind.
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_union_of_overlapping_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.db");
        let b = dir.path().join("b.db");
        let l = labels(&[("job", "x")]);
        let ts_a = TimeSeries::with_data(Time(0), Duration(60), vec![NAN, 1.0, NAN, NAN, 2.0]);
        let ts_b = TimeSeries::with_data(Time(300), Duration(60), vec![NAN, 7.0, NAN, NAN, 9.0]);
        write(&a, Time(0), 5, Duration(60), true, &[series(111, l.clone(), ts_a)]).unwrap();
        write(&b, Time(300), 5, Duration(60), true, &[series(111, l.clone(), ts_b)]).unwrap();

        let mut dest = HashMap::new();
        read(&a, Time(0), 20, Duration(30), &mut dest, fill_any).unwrap();
        read(&b, Time(0), 20, Duration(30), &mut dest, fill_any).unwrap();
        assert_eq!(dest.len(), 1);
        let m = &dest[&111];
        assert_eq!(m.labels, l);
        assert_eq!(
            m.values.to_string(),
            "TimeSeries(0, 20, 30, [. . 1 . . . . . 2 . . . 7 . . . . . 9 .])"
        );
    }

    #[test]
    fn test_series_outside_window_are_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.db");
        let ts = TimeSeries::with_data(Time(0), Duration(30), vec![1.0, 2.0]);
        write(&path, Time(0), 2, Duration(30), true, &[series(1, labels(&[("a", "b")]), ts)]).unwrap();
        let mut dest = HashMap::new();
        read(&path, Time(600), 10, Duration(30), &mut dest, fill_any).unwrap();
        assert!(dest.is_empty());
    }

    #[test]
    fn test_many_series_span_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.db");
        let points = 120;
        let metrics: Vec<MetricValues> = (0..3000u64)
            .map(|i| {
                let ts = TimeSeries::with_value(Time(0), points, Duration(30), i as f32);
                series(i, labels(&[("i", &i.to_string())]), ts)
            })
            .collect();
        write(&path, Time(0), points, Duration(30), true, &metrics).unwrap();
        let mut dest = HashMap::new();
        read(&path, Time(0), points, Duration(30), &mut dest, fill_any).unwrap();
        assert_eq!(dest.len(), 3000);
        assert_eq!(dest[&2999].values.last(), 2999.0);
        assert_eq!(dest[&1500].labels.get("i").map(String::as_str), Some("1500"));
    }

    #[test]
    fn test_unknown_versions_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.db");
        for version in [0u8, 5] {
            let mut header = [0u8; CHUNK_HEADER_SIZE];
            header[0] = version;
            fs::write(&path, header).unwrap();
            let err = read_meta(&path).unwrap_err();
            assert!(matches!(err, ChunkError::UnsupportedVersion(v) if v == version));
            assert!(err.is_corruption());
        }
    }

    #[test]
    fn test_oversized_header_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huge.db");
        let header = Header {
            version: CHUNK_VERSION,
            from: Time(0),
            points_count: u32::MAX,
            step: Duration(30),
            finalized: true,
            metrics_count: 1,
        };
        let mut bytes = header.encode().to_vec();
        bytes.extend_from_slice(&42u64.to_le_bytes());
        fs::write(&path, &bytes).unwrap();

        assert!(read_meta(&path).unwrap_err().is_corruption());
        let mut dest = HashMap::new();
        let err = read(&path, Time(0), 10, Duration(30), &mut dest, fill_any).unwrap_err();
        assert!(matches!(err, ChunkError::Corruption { .. }));
        assert!(dest.is_empty());
    }

    #[test]
    fn test_truncated_chunk_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db");
        let ts = TimeSeries::with_data(Time(0), Duration(30), vec![1.0, 2.0]);
        write(&path, Time(0), 2, Duration(30), true, &[series(1, labels(&[("a", "b")]), ts)]).unwrap();
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();
        let mut dest = HashMap::new();
        let err = read(&path, Time(0), 2, Duration(30), &mut dest, fill_any).unwrap_err();
        assert!(err.is_corruption());
    }
}
