//! Snapshot serialization and the static-description debug report.
//!
//! The snapshot is a tagged chunk stream: magic, version, a geometry
//! fingerprint, then the packed byte buffers, each chunk LZ4-compressed with
//! its uncompressed length up front. A snapshot only loads back over the
//! exact geometry it was taken from; the fingerprint makes a mismatch a loud
//! [`TissueError::Format`] instead of silently misinterpreted bytes.

use std::io::{self, Read, Write};
use std::sync::Arc;

use crate::geometry::{StaticTissue, TissueError};
use crate::state::DynamicTissue;

pub const MAGIC: &[u8; 8] = b"TISSUE01";
pub const VERSION: u32 = 1;

fn compress_lz4(input: &[u8]) -> Vec<u8> {
    lz4_flex::compress(input)
}

fn decompress_lz4(input: &[u8], expected_size: usize) -> Result<Vec<u8>, TissueError> {
    // Strict format: raw LZ4 block with external expected size.
    lz4_flex::decompress(input, expected_size)
        .map_err(|_| TissueError::Format("lz4 decompression failed".into()))
}

fn write_u32_le<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn read_exact<const N: usize, R: Read>(r: &mut R) -> io::Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_u32_le<R: Read>(r: &mut R) -> io::Result<u32> {
    Ok(u32::from_le_bytes(read_exact::<4, _>(r)?))
}

/// Write one chunk: tag, total length, uncompressed length, LZ4 payload.
fn write_chunk_lz4<W: Write>(w: &mut W, tag: [u8; 4], payload: &[u8]) -> Result<(), TissueError> {
    let compressed = compress_lz4(payload);
    let uncompressed_len = u32::try_from(payload.len())
        .map_err(|_| TissueError::Format("chunk too large".into()))?;
    let total_len = 4u32.saturating_add(
        u32::try_from(compressed.len())
            .map_err(|_| TissueError::Format("chunk too large".into()))?,
    );

    w.write_all(&tag)?;
    write_u32_le(w, total_len)?;
    write_u32_le(w, uncompressed_len)?;
    w.write_all(&compressed)?;
    Ok(())
}

/// Read one chunk, insisting on the expected tag.
fn read_chunk_lz4<R: Read>(r: &mut R, expected_tag: [u8; 4]) -> Result<Vec<u8>, TissueError> {
    let tag = read_exact::<4, _>(r)?;
    if tag != expected_tag {
        return Err(TissueError::Format(format!(
            "expected chunk {:?}, found {:?}",
            String::from_utf8_lossy(&expected_tag),
            String::from_utf8_lossy(&tag)
        )));
    }
    let total_len = read_u32_le(r)? as usize;
    if total_len < 4 {
        return Err(TissueError::Format("truncated chunk header".into()));
    }
    let uncompressed_len = read_u32_le(r)? as usize;
    let mut compressed = vec![0u8; total_len - 4];
    r.read_exact(&mut compressed)?;
    decompress_lz4(&compressed, uncompressed_len)
}

/// Geometry identity baked into every snapshot: grid dimensions, toroidal
/// flags, per-kind counts and capacities, boundary-cell counts.
fn fingerprint(geometry: &StaticTissue) -> Vec<u8> {
    let config = geometry.config();
    let mut out = Vec::new();
    out.extend_from_slice(&config.cells_along_x.to_le_bytes());
    out.extend_from_slice(&config.cells_along_y.to_le_bytes());
    out.push(config.toroidal_x as u8);
    out.push(config.toroidal_y as u8);
    out.push(config.toroidal_columnar as u8);
    out.extend_from_slice(&(config.tissue_kinds.len() as u32).to_le_bytes());
    for kind in &config.tissue_kinds {
        out.extend_from_slice(&kind.cells_along_columnar.to_le_bytes());
        out.extend_from_slice(&kind.territory_capacity.to_le_bytes());
    }
    out.extend_from_slice(&(config.sensory_kinds.len() as u32).to_le_bytes());
    for kind in &config.sensory_kinds {
        out.extend_from_slice(&kind.num_cells.to_le_bytes());
    }
    out.extend_from_slice(&config.num_muscle_cells.to_le_bytes());
    out.extend_from_slice(&config.synapses_per_muscle.to_le_bytes());
    out
}

/// Serialize the packed dynamic state.
pub fn save_state_to<W: Write>(tissue: &DynamicTissue, w: &mut W) -> Result<(), TissueError> {
    let geometry = tissue.geometry();
    w.write_all(MAGIC)?;
    write_u32_le(w, VERSION)?;
    write_chunk_lz4(w, *b"GEOM", &fingerprint(geometry))?;

    let mut cells = Vec::new();
    let mut territories = Vec::new();
    for kind in 0..geometry.num_tissue_kinds() {
        let bytes = tissue.cells_array(kind).as_bytes();
        cells.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        cells.extend_from_slice(bytes);
        let bytes = tissue.territory_array(kind).as_bytes();
        territories.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        territories.extend_from_slice(bytes);
    }
    write_chunk_lz4(w, *b"CELL", &cells)?;
    write_chunk_lz4(w, *b"TERR", &territories)?;
    write_chunk_lz4(w, *b"SENS", tissue.sensory_array().as_bytes())?;
    write_chunk_lz4(w, *b"MUSC", tissue.muscles_array().as_bytes())?;
    write_chunk_lz4(w, *b"SYNM", tissue.synapses_to_muscles_array().as_bytes())?;
    Ok(())
}

fn take_prefixed<'a>(payload: &'a [u8], expected_len: usize, what: &str) -> Result<(&'a [u8], &'a [u8]), TissueError> {
    if payload.len() < 4 {
        return Err(TissueError::Format(format!("truncated {what} chunk")));
    }
    let len = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
    if len != expected_len || payload.len() < 4 + len {
        return Err(TissueError::Format(format!(
            "{what} byte length {len} does not match this geometry ({expected_len})"
        )));
    }
    Ok((&payload[4..4 + len], &payload[4 + len..]))
}

/// Rebuild a dynamic state from a snapshot taken over the same geometry.
pub fn load_state_from<R: Read>(
    geometry: &Arc<StaticTissue>,
    r: &mut R,
) -> Result<DynamicTissue, TissueError> {
    let magic = read_exact::<8, _>(r)?;
    if &magic != MAGIC {
        return Err(TissueError::Format("not a tissue snapshot".into()));
    }
    let version = read_u32_le(r)?;
    if version != VERSION {
        return Err(TissueError::Format(format!(
            "unsupported snapshot version {version}"
        )));
    }
    let stored = read_chunk_lz4(r, *b"GEOM")?;
    if stored != fingerprint(geometry) {
        return Err(TissueError::Format(
            "snapshot geometry does not match this static description".into(),
        ));
    }

    let mut tissue = DynamicTissue::new(Arc::clone(geometry));

    let cells = read_chunk_lz4(r, *b"CELL")?;
    let mut rest: &[u8] = &cells;
    for kind in 0..geometry.num_tissue_kinds() {
        let expected = tissue.cells_array(kind).num_bytes();
        let (bytes, tail) = take_prefixed(rest, expected, "cell")?;
        tissue.cells_array_mut(kind).as_bytes_mut().copy_from_slice(bytes);
        rest = tail;
    }

    let territories = read_chunk_lz4(r, *b"TERR")?;
    let mut rest: &[u8] = &territories;
    for kind in 0..geometry.num_tissue_kinds() {
        let expected = tissue.territory_array(kind).num_bytes();
        let (bytes, tail) = take_prefixed(rest, expected, "territory")?;
        tissue
            .territory_array_mut(kind)
            .as_bytes_mut()
            .copy_from_slice(bytes);
        rest = tail;
    }

    let sensory = read_chunk_lz4(r, *b"SENS")?;
    if sensory.len() != tissue.sensory_array().num_bytes() {
        return Err(TissueError::Format("sensory byte length mismatch".into()));
    }
    tissue.sensory_array_mut().as_bytes_mut().copy_from_slice(&sensory);

    let muscles = read_chunk_lz4(r, *b"MUSC")?;
    if muscles.len() != tissue.muscles_array().num_bytes() {
        return Err(TissueError::Format("muscle byte length mismatch".into()));
    }
    tissue.muscles_array_mut().as_bytes_mut().copy_from_slice(&muscles);

    let synapses = read_chunk_lz4(r, *b"SYNM")?;
    if synapses.len() != tissue.synapses_to_muscles_array().num_bytes() {
        return Err(TissueError::Format(
            "synapse-to-muscle byte length mismatch".into(),
        ));
    }
    tissue
        .synapses_to_muscles_array_mut()
        .as_bytes_mut()
        .copy_from_slice(&synapses);

    Ok(tissue)
}

/// Human-readable report of a static description, for external rendering and
/// debug tooling (which only ever holds a read-only handle).
pub fn describe_static_tissue(geometry: &StaticTissue) -> String {
    use std::fmt::Write as _;

    let config = geometry.config();
    let mut out = String::new();
    let _ = writeln!(
        out,
        "tissue grid: {} x {} x {} (x, y, columnar)",
        config.cells_along_x,
        config.cells_along_y,
        geometry.cells_along_columnar()
    );
    let _ = writeln!(
        out,
        "toroidal axes: x={} y={} columnar={}",
        config.toroidal_x, config.toroidal_y, config.toroidal_columnar
    );
    let _ = writeln!(out, "tissue kinds: {}", geometry.num_tissue_kinds());
    for kind in 0..geometry.num_tissue_kinds() {
        let segment = geometry.columnar_segment(kind);
        let _ = writeln!(
            out,
            "  kind {kind}: columnar {}..{}, {} cells, territory capacity {}",
            segment.start,
            segment.end,
            geometry.num_cells_of_kind(kind),
            geometry.territory_capacity(kind)
        );
    }
    let _ = writeln!(
        out,
        "sensory kinds: {} ({} cells)",
        geometry.num_sensory_kinds(),
        geometry.num_sensory_cells()
    );
    let _ = writeln!(
        out,
        "muscles: {} cells, {} synapses each",
        geometry.num_muscle_cells(),
        geometry.synapses_per_muscle()
    );
    let _ = writeln!(
        out,
        "record bits: cell {}, synapse {}, slot index {}, source ref {}",
        geometry.bits_per_cell_record(),
        geometry.bits_per_synapse_record(),
        geometry.bits_per_slot(),
        geometry.bits_per_source_ref()
    );
    out
}
