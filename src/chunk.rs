use crate::{Cell, Error, Result, Schema, Tube};

use lz4_flex::frame::{FrameDecoder, FrameEncoder};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Codec applied to a chunk's cell stream, selected by file extension.
///
/// `Lz4` is the compressed point-native codec; `Binary` writes the raw cell
/// stream for extended-schema chunks.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataIo {
    Lz4,
    Binary,
}

impl DataIo {
    pub fn extension(self) -> &'static str {
        match self {
            DataIo::Lz4 => "lz4",
            DataIo::Binary => "bin",
        }
    }

    pub fn from_extension(ext: &str) -> Result<Self> {
        match ext {
            "lz4" => Ok(DataIo::Lz4),
            "bin" => Ok(DataIo::Binary),
            other => Err(Error::InvalidChunk(format!("unknown codec: {other}"))),
        }
    }
}

/// Identity of one tube within a chunk.
///
/// Chunks spanning several depth levels (the base chunk in particular) key
/// their columns by depth as well as by the in-level (x, y).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ColumnKey {
    pub depth: u64,
    pub x: u64,
    pub y: u64,
}

/// In-memory contents of one chunk: a column map of tubes.
///
/// Columns are created on first touch under a read-mostly lock; the column
/// and tick maps are ordered so encoding the same cell set always produces
/// the same bytes.
pub struct ChunkData {
    columns: RwLock<BTreeMap<ColumnKey, Arc<Tube>>>,
    num_points: AtomicU64,
}

impl Default for ChunkData {
    fn default() -> Self {
        Self {
            columns: RwLock::new(BTreeMap::new()),
            num_points: AtomicU64::new(0),
        }
    }
}

impl ChunkData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_points(&self) -> u64 {
        self.num_points.load(Ordering::Relaxed)
    }

    pub fn add_points(&self, delta: u64) {
        self.num_points.fetch_add(delta, Ordering::Relaxed);
    }

    /// The tube for a column, created on first touch.
    pub fn tube(&self, key: ColumnKey) -> Arc<Tube> {
        if let Some(tube) = self.columns.read().get(&key) {
            return tube.clone();
        }
        self.columns
            .write()
            .entry(key)
            .or_insert_with(|| Arc::new(Tube::default()))
            .clone()
    }

    /// Snapshot of the column map, in key order.
    pub fn columns(&self) -> Vec<(ColumnKey, Arc<Tube>)> {
        self.columns
            .read()
            .iter()
            .map(|(k, t)| (*k, t.clone()))
            .collect()
    }

    /// Visits every payload record in canonical order: columns by key,
    /// ticks ascending, stacked payloads sorted. This is the order the
    /// codec writes, so a record's ordinal is stable across sessions and
    /// indexes appended per-chunk payloads.
    pub fn for_each_record<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(u64, ColumnKey, u64, &[u8]) -> Result<()>,
    {
        let mut ordinal: u64 = 0;
        for (col, tube) in self.columns() {
            let cells = tube.cells();
            for (z, cell) in cells.iter() {
                let mut stack: Vec<&[u8]> = cell.payloads().collect();
                if stack.len() > 1 {
                    stack.sort_unstable();
                }
                for payload in stack {
                    f(ordinal, col, *z, payload)?;
                    ordinal += 1;
                }
            }
        }
        Ok(())
    }

    /// Serializes the cell stream: a point-count header, a column count,
    /// then per column `(depth, x, y, num_records)` and that column's
    /// `(z_tick, payload)` records. Stacked duplicates repeat their tick,
    /// payloads in sorted order so builds are byte-deterministic.
    pub fn encode(&self, point_size: usize) -> Vec<u8> {
        let columns = self.columns.read();
        let mut out = Vec::new();
        out.extend_from_slice(&0u64.to_le_bytes()); // patched below
        out.extend_from_slice(&(columns.len() as u64).to_le_bytes());

        let mut total: u64 = 0;
        for (key, tube) in columns.iter() {
            let cells = tube.cells();
            out.extend_from_slice(&key.depth.to_le_bytes());
            out.extend_from_slice(&key.x.to_le_bytes());
            out.extend_from_slice(&key.y.to_le_bytes());

            let records: u64 = cells.values().map(|c| c.stack_size()).sum();
            out.extend_from_slice(&records.to_le_bytes());
            total += records;

            for (z, cell) in cells.iter() {
                let mut stack: Vec<&[u8]> = cell.payloads().collect();
                stack.sort_unstable();
                for payload in stack {
                    debug_assert_eq!(payload.len(), point_size);
                    out.extend_from_slice(&z.to_le_bytes());
                    out.extend_from_slice(payload);
                }
            }
        }
        out[..8].copy_from_slice(&total.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8], schema: &Schema) -> Result<Self> {
        let mut rd = bytes;
        let num_points = read_u64(&mut rd)?;
        let num_columns = read_u64(&mut rd)?;
        let point_size = schema.point_size();

        let data = ChunkData::new();
        let mut seen: u64 = 0;
        for _ in 0..num_columns {
            let key = ColumnKey {
                depth: read_u64(&mut rd)?,
                x: read_u64(&mut rd)?,
                y: read_u64(&mut rd)?,
            };
            let records = read_u64(&mut rd)?;
            let tube = data.tube(key);
            for _ in 0..records {
                let z = read_u64(&mut rd)?;
                if rd.len() < point_size {
                    return Err(Error::InvalidChunk("truncated cell record".to_string()));
                }
                let (payload, rest) = rd.split_at(point_size);
                rd = rest;
                let point = schema.point_of(payload)?;
                tube.restore(z, Box::new(Cell::new(point, payload.to_vec())))?;
            }
            seen += records;
        }

        if seen != num_points || !rd.is_empty() {
            return Err(Error::InvalidChunk(format!(
                "count mismatch: header {num_points}, read {seen}, {} trailing bytes",
                rd.len()
            )));
        }
        data.num_points.store(num_points, Ordering::Relaxed);
        Ok(data)
    }

    pub fn to_bytes(&self, io: DataIo, point_size: usize) -> Result<Vec<u8>> {
        let raw = self.encode(point_size);
        match io {
            DataIo::Binary => Ok(raw),
            DataIo::Lz4 => {
                let mut encoder = FrameEncoder::new(Vec::new());
                encoder.write_all(&raw)?;
                encoder
                    .finish()
                    .map_err(|e| Error::InvalidChunk(format!("lz4 encode: {e}")))
            }
        }
    }

    pub fn from_bytes(io: DataIo, bytes: &[u8], schema: &Schema) -> Result<Self> {
        match io {
            DataIo::Binary => Self::decode(bytes, schema),
            DataIo::Lz4 => {
                let mut raw = Vec::new();
                FrameDecoder::new(bytes)
                    .read_to_end(&mut raw)
                    .map_err(|e| Error::InvalidChunk(format!("lz4 decode: {e}")))?;
                Self::decode(&raw, schema)
            }
        }
    }
}

fn read_u64(rd: &mut &[u8]) -> Result<u64> {
    if rd.len() < 8 {
        return Err(Error::InvalidChunk("truncated header".to_string()));
    }
    let (head, rest) = rd.split_at(8);
    *rd = rest;
    Ok(u64::from_le_bytes(head.try_into().unwrap()))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{Bounds, Climber, Point};

    fn schema() -> Schema {
        Schema::xyz_with([])
    }

    fn record(s: &Schema, p: Point) -> Vec<u8> {
        let mut rec = vec![0u8; s.point_size()];
        s.find("X").unwrap().set(&mut rec, p.x);
        s.find("Y").unwrap().set(&mut rec, p.y);
        s.find("Z").unwrap().set(&mut rec, p.z);
        rec
    }

    fn populated() -> (Schema, ChunkData) {
        let s = schema();
        let data = ChunkData::new();
        let root = Bounds::new(Point::splat(-2.0), Point::splat(2.0));

        for p in [
            Point::new(0.5, 0.5, 0.5),
            Point::new(0.5, 0.5, 0.5),
            Point::new(-1.5, 0.5, 1.5),
        ] {
            let mut climber = Climber::new(root);
            climber.step(p);
            let key = climber.key();
            let col = ColumnKey {
                depth: key.depth,
                x: key.position.x,
                y: key.position.y,
            };
            let attempt = data
                .tube(col)
                .insert(key, Box::new(Cell::new(p, record(&s, p))));
            assert!(attempt.done());
            data.add_points(attempt.delta as u64);
        }
        (s, data)
    }

    #[test]
    fn codec_roundtrip() {
        let (s, data) = populated();
        assert_eq!(data.num_points(), 3);

        for io in [DataIo::Binary, DataIo::Lz4] {
            let bytes = data.to_bytes(io, s.point_size()).unwrap();
            let back = ChunkData::from_bytes(io, &bytes, &s).unwrap();
            assert_eq!(back.num_points(), 3);
            assert_eq!(back.columns().len(), data.columns().len());
            assert_eq!(
                back.encode(s.point_size()),
                data.encode(s.point_size()),
                "decode must preserve the byte form"
            );
        }
    }

    #[test]
    fn truncated_chunks_are_rejected() {
        let (s, data) = populated();
        let bytes = data.to_bytes(DataIo::Binary, s.point_size()).unwrap();
        assert!(matches!(
            ChunkData::decode(&bytes[..bytes.len() - 3], &s),
            Err(Error::InvalidChunk(_))
        ));
    }

    #[test]
    fn encoding_is_insertion_order_independent() {
        let s = schema();
        let root = Bounds::new(Point::splat(-2.0), Point::splat(2.0));
        let points = [
            Point::new(0.25, 0.25, 0.25),
            Point::new(1.25, 1.25, 0.25),
            Point::new(-0.75, 0.25, 0.25),
        ];

        let build = |order: &[usize]| {
            let data = ChunkData::new();
            for &i in order {
                let p = points[i];
                let mut climber = Climber::new(root);
                climber.step(p);
                climber.step(p);
                let key = climber.key();
                let col = ColumnKey {
                    depth: key.depth,
                    x: key.position.x,
                    y: key.position.y,
                };
                data.tube(col).insert(key, Box::new(Cell::new(p, record(&s, p))));
            }
            data.encode(s.point_size())
        };

        assert_eq!(build(&[0, 1, 2]), build(&[2, 0, 1]));
    }
}
