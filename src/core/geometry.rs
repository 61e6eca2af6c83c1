//! Static tissue description.
//!
//! [`TissueConfig`] is the caller-provided configuration; [`StaticTissue`] is
//! the validated, immutable geometry built from it once and shared read-only
//! by every worker thread for the lifetime of the dynamic state. All derived
//! constants (columnar segments, record bit widths, field offsets) are
//! computed here exactly once.

use core::ops::Range;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use thiserror::Error;
use tracing::info;

/// Errors surfaced by this crate.
///
/// Precondition violations (out-of-range indices, mismatched matrix
/// dimensions) are *not* errors: they are programmer mistakes and fail a
/// fatal assertion instead. The variants here cover configurations the
/// engine deliberately rejects and snapshot I/O.
#[derive(Debug, Error)]
pub enum TissueError {
    /// Configuration is syntactically valid but not implemented by this
    /// engine. Loud and distinct so tests can assert rejection.
    #[error("unsupported tissue configuration: {0}")]
    Unsupported(String),

    /// Configuration is malformed (empty axes, no kinds, unreadable JSON).
    #[error("invalid tissue configuration: {0}")]
    InvalidConfig(String),

    /// Snapshot stream could not be read or written.
    #[error("snapshot io: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot bytes do not describe this tissue.
    #[error("snapshot format: {0}")]
    Format(String),
}

/// One of the three grid axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
    Columnar,
}

/// Position of a cell in the tissue grid.
///
/// `columnar` indexes the stacked cells at one `(x, y)` position; the tissue
/// kind of a cell is a function of its columnar coordinate alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellCoords {
    pub x: u32,
    pub y: u32,
    pub columnar: u32,
}

impl CellCoords {
    pub fn new(x: u32, y: u32, columnar: u32) -> Self {
        Self { x, y, columnar }
    }
}

/// Signed 3-component displacement with 8-bit-range components.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CoordShift {
    pub dx: i8,
    pub dy: i8,
    pub dc: i8,
}

/// Order of per-cell operations inside one transition round.
///
/// The round ordering is deliberately a policy, not a constant; both orders
/// are supported and tested.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum UpdateOrder {
    /// Decay the stored potential, then add the delivered signal undecayed.
    #[default]
    DecayThenDeliver,
    /// Add the delivered signal first, then decay the combined potential.
    DeliverThenDecay,
}

/// Per-round transition parameters.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TransitionConfig {
    /// Fraction of potential lost per round, clamped to [0, 1].
    pub decay: f32,
    /// Gain applied to the summed synaptic input.
    pub integration_gain: f32,
    pub order: UpdateOrder,
}

impl Default for TransitionConfig {
    fn default() -> Self {
        Self {
            decay: 0.1,
            integration_gain: 1.0,
            order: UpdateOrder::DecayThenDeliver,
        }
    }
}

/// Configuration of one tissue-cell kind.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TissueKindConfig {
    /// Cells of this kind stacked at each `(x, y)` position.
    pub cells_along_columnar: u32,
    /// Maximum synapses resident in one cell's territory. Storage always
    /// reserves this many slots, which is what allows in-place migration
    /// without reallocation.
    pub territory_capacity: u32,
}

/// Configuration of one sensory-cell kind.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SensoryKindConfig {
    pub num_cells: u32,
}

/// Caller-provided tissue configuration.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TissueConfig {
    pub cells_along_x: u32,
    pub cells_along_y: u32,
    pub toroidal_x: bool,
    pub toroidal_y: bool,
    pub toroidal_columnar: bool,
    pub tissue_kinds: Vec<TissueKindConfig>,
    pub sensory_kinds: Vec<SensoryKindConfig>,
    pub num_muscle_cells: u32,
    pub synapses_per_muscle: u32,
    pub transition: TransitionConfig,
}

impl TissueConfig {
    /// Load a configuration from JSON.
    #[cfg(feature = "serde")]
    pub fn from_json_reader<R: std::io::Read>(reader: R) -> Result<Self, TissueError> {
        serde_json::from_reader(reader).map_err(|e| TissueError::InvalidConfig(e.to_string()))
    }
}

/// Minimum bits needed to store any value in `0..n` (at least 1).
pub fn num_bits_to_index(n: u64) -> usize {
    if n <= 1 {
        1
    } else {
        (64 - (n - 1).leading_zeros()) as usize
    }
}

#[inline]
fn round_to_bytes(bits: usize) -> usize {
    bits.div_ceil(8) * 8
}

/// Validated, immutable tissue geometry.
///
/// Shared by `&` (usually inside an `Arc`) across all worker threads; never
/// mutated after construction.
#[derive(Debug, Clone)]
pub struct StaticTissue {
    config: TissueConfig,

    columnar_len: u32,
    /// Columnar coordinate range occupied by each tissue kind.
    segments: Vec<Range<u32>>,
    /// Sensory-cell index range of each sensory kind.
    sensory_ranges: Vec<Range<u32>>,
    num_sensory_cells: u32,
    max_capacity: u32,

    /// Flat-index base of each kind in a kind-major enumeration of all cells.
    kind_base: Vec<usize>,
    num_cells_total: usize,

    bits_per_x: usize,
    bits_per_y: usize,
    bits_per_source_ref: usize,
    bits_per_kind: usize,
    bits_per_slot: usize,
    /// Whole cell record, rounded up to a byte boundary so distinct cells
    /// occupy disjoint byte ranges.
    bits_per_cell_record: usize,
    /// One synapse record, unrounded; synapses pack back to back inside a
    /// cell's territory block.
    bits_per_synapse_record: usize,
    /// Whole territory block per kind, rounded up to a byte boundary.
    bits_per_territory_block: Vec<usize>,
    /// One synapse-to-muscle record, rounded up to a byte boundary.
    bits_per_muscle_synapse_record: usize,
}

impl StaticTissue {
    pub fn new(mut config: TissueConfig) -> Result<Self, TissueError> {
        if config.cells_along_x == 0 || config.cells_along_y == 0 {
            return Err(TissueError::InvalidConfig(
                "lateral axes must have at least one cell".into(),
            ));
        }
        if config.tissue_kinds.is_empty() {
            return Err(TissueError::InvalidConfig(
                "at least one tissue-cell kind is required".into(),
            ));
        }

        config.transition.decay = config.transition.decay.clamp(0.0, 1.0);

        let mut segments = Vec::with_capacity(config.tissue_kinds.len());
        let mut columnar_len: u64 = 0;
        for kind in &config.tissue_kinds {
            let start = columnar_len;
            columnar_len += kind.cells_along_columnar as u64;
            segments.push(start as u32..columnar_len.min(u32::MAX as u64) as u32);
        }
        if columnar_len == 0 {
            return Err(TissueError::InvalidConfig(
                "the columnar axis must have at least one cell".into(),
            ));
        }
        if columnar_len > u32::MAX as u64 {
            return Err(TissueError::Unsupported(
                "columnar axis does not fit a 32-bit coordinate".into(),
            ));
        }
        let columnar_len = columnar_len as u32;

        let mut sensory_ranges = Vec::with_capacity(config.sensory_kinds.len());
        let mut num_sensory: u64 = 0;
        for kind in &config.sensory_kinds {
            let start = num_sensory;
            num_sensory += kind.num_cells as u64;
            sensory_ranges.push(start as u32..num_sensory.min(u32::MAX as u64) as u32);
        }
        if columnar_len as u64 + num_sensory > u32::MAX as u64 {
            return Err(TissueError::Unsupported(
                "source reference space does not fit 32 bits".into(),
            ));
        }
        let num_sensory_cells = num_sensory as u32;

        let max_capacity = config
            .tissue_kinds
            .iter()
            .map(|k| k.territory_capacity)
            .max()
            .unwrap_or(0);

        let bits_per_x = num_bits_to_index(config.cells_along_x as u64);
        let bits_per_y = num_bits_to_index(config.cells_along_y as u64);
        let bits_per_source_ref =
            num_bits_to_index(columnar_len as u64 + num_sensory_cells as u64);
        let bits_per_kind = num_bits_to_index(config.tissue_kinds.len() as u64);
        let bits_per_slot = num_bits_to_index(max_capacity as u64 + 1);

        let bits_per_cell_record =
            round_to_bytes(bits_per_kind + 32 + NUM_DELIMITERS * bits_per_slot);
        let bits_per_synapse_record = bits_per_x + bits_per_y + bits_per_source_ref + 3 + 32;
        let bits_per_muscle_synapse_record =
            round_to_bytes(bits_per_x + bits_per_y + bits_per_source_ref + 32);

        let cells_per_column = config.cells_along_x as u64 * config.cells_along_y as u64;
        let mut kind_base = Vec::with_capacity(config.tissue_kinds.len());
        let mut num_cells_total: u64 = 0;
        let mut bits_per_territory_block = Vec::with_capacity(config.tissue_kinds.len());
        let mut total_bits: u64 = 0;
        for kind in &config.tissue_kinds {
            kind_base.push(num_cells_total as usize);
            let cells = cells_per_column * kind.cells_along_columnar as u64;
            num_cells_total += cells;
            let block =
                round_to_bytes(kind.territory_capacity as usize * bits_per_synapse_record);
            bits_per_territory_block.push(block);
            total_bits += cells * (bits_per_cell_record as u64 + block as u64);
        }
        if num_cells_total > u32::MAX as u64 || total_bits / 8 > usize::MAX as u64 / 2 {
            return Err(TissueError::Unsupported(
                "tissue too large for in-memory packed storage".into(),
            ));
        }

        info!(
            cells = num_cells_total,
            sensory = num_sensory_cells,
            muscles = config.num_muscle_cells,
            packed_bytes = total_bits / 8,
            "static tissue description built"
        );

        Ok(Self {
            config,
            columnar_len,
            segments,
            sensory_ranges,
            num_sensory_cells,
            max_capacity,
            kind_base,
            num_cells_total: num_cells_total as usize,
            bits_per_x,
            bits_per_y,
            bits_per_source_ref,
            bits_per_kind,
            bits_per_slot,
            bits_per_cell_record,
            bits_per_synapse_record,
            bits_per_territory_block,
            bits_per_muscle_synapse_record,
        })
    }

    pub fn config(&self) -> &TissueConfig {
        &self.config
    }

    // ---- kind and axis queries ------------------------------------------

    #[inline]
    pub fn num_tissue_kinds(&self) -> usize {
        self.config.tissue_kinds.len()
    }

    #[inline]
    pub fn num_sensory_kinds(&self) -> usize {
        self.config.sensory_kinds.len()
    }

    #[inline]
    pub fn cells_along_x(&self) -> u32 {
        self.config.cells_along_x
    }

    #[inline]
    pub fn cells_along_y(&self) -> u32 {
        self.config.cells_along_y
    }

    #[inline]
    pub fn cells_along_columnar(&self) -> u32 {
        self.columnar_len
    }

    pub fn axis_len(&self, axis: Axis) -> u32 {
        match axis {
            Axis::X => self.config.cells_along_x,
            Axis::Y => self.config.cells_along_y,
            Axis::Columnar => self.columnar_len,
        }
    }

    pub fn is_toroidal(&self, axis: Axis) -> bool {
        match axis {
            Axis::X => self.config.toroidal_x,
            Axis::Y => self.config.toroidal_y,
            Axis::Columnar => self.config.toroidal_columnar,
        }
    }

    /// Territory capacity of cells of `kind`.
    pub fn territory_capacity(&self, kind: usize) -> u32 {
        self.config.tissue_kinds[kind].territory_capacity
    }

    pub fn max_territory_capacity(&self) -> u32 {
        self.max_capacity
    }

    /// Columnar coordinate range occupied by `kind`.
    pub fn columnar_segment(&self, kind: usize) -> Range<u32> {
        self.segments[kind].clone()
    }

    /// Tissue kind occupying the given columnar coordinate.
    pub fn kind_of_columnar(&self, columnar: u32) -> usize {
        assert!(columnar < self.columnar_len, "columnar coordinate out of range");
        self.segments
            .iter()
            .position(|s| s.contains(&columnar))
            .expect("segments cover the columnar axis")
    }

    pub fn num_sensory_cells(&self) -> u32 {
        self.num_sensory_cells
    }

    /// Sensory-cell index range of a sensory kind.
    pub fn sensory_range(&self, sensory_kind: usize) -> Range<u32> {
        self.sensory_ranges[sensory_kind].clone()
    }

    pub fn num_muscle_cells(&self) -> u32 {
        self.config.num_muscle_cells
    }

    pub fn synapses_per_muscle(&self) -> u32 {
        self.config.synapses_per_muscle
    }

    pub fn num_synapses_to_muscles(&self) -> usize {
        self.config.num_muscle_cells as usize * self.config.synapses_per_muscle as usize
    }

    pub fn transition(&self) -> &TransitionConfig {
        &self.config.transition
    }

    // ---- cell enumeration ------------------------------------------------

    /// Number of cells of `kind`.
    pub fn num_cells_of_kind(&self, kind: usize) -> usize {
        self.config.cells_along_x as usize
            * self.config.cells_along_y as usize
            * self.config.tissue_kinds[kind].cells_along_columnar as usize
    }

    pub fn num_cells_total(&self) -> usize {
        self.num_cells_total
    }

    /// Base of `kind` in the kind-major flat enumeration of all cells.
    pub fn kind_base(&self, kind: usize) -> usize {
        self.kind_base[kind]
    }

    /// Kind and flat index within that kind of the cell at `coords`.
    pub fn cell_index_in_kind(&self, coords: CellCoords) -> (usize, usize) {
        assert!(coords.x < self.config.cells_along_x, "x coordinate out of range");
        assert!(coords.y < self.config.cells_along_y, "y coordinate out of range");
        let kind = self.kind_of_columnar(coords.columnar);
        let local_c = (coords.columnar - self.segments[kind].start) as usize;
        let count = self.config.tissue_kinds[kind].cells_along_columnar as usize;
        let index = ((coords.x as usize * self.config.cells_along_y as usize)
            + coords.y as usize)
            * count
            + local_c;
        (kind, index)
    }

    /// Inverse of [`Self::cell_index_in_kind`].
    pub fn coords_of_kind_index(&self, kind: usize, index: usize) -> CellCoords {
        let count = self.config.tissue_kinds[kind].cells_along_columnar as usize;
        assert!(count > 0 && index < self.num_cells_of_kind(kind));
        let local_c = index % count;
        let xy = index / count;
        let y = xy % self.config.cells_along_y as usize;
        let x = xy / self.config.cells_along_y as usize;
        CellCoords::new(x as u32, y as u32, self.segments[kind].start + local_c as u32)
    }

    // ---- coordinate arithmetic ------------------------------------------

    /// Map an arbitrary signed coordinate onto `axis`.
    ///
    /// A toroidal axis wraps modulo its length; a non-toroidal axis clamps to
    /// `[0, len - 1]`. Total for negative and overflowing inputs alike.
    pub fn clip_tissue_coordinate(&self, coord: i64, axis: Axis) -> u32 {
        let len = self.axis_len(axis) as i64;
        if self.is_toroidal(axis) {
            coord.rem_euclid(len) as u32
        } else {
            coord.clamp(0, len - 1) as u32
        }
    }

    /// Apply a [`CoordShift`] to `base`, clipping each axis independently.
    pub fn shifted_coords(&self, base: CellCoords, shift: CoordShift) -> CellCoords {
        CellCoords::new(
            self.clip_tissue_coordinate(base.x as i64 + shift.dx as i64, Axis::X),
            self.clip_tissue_coordinate(base.y as i64 + shift.dy as i64, Axis::Y),
            self.clip_tissue_coordinate(base.columnar as i64 + shift.dc as i64, Axis::Columnar),
        )
    }

    /// Convert a polar offset around an area centre to grid coordinates.
    pub fn from_polar_to_tissue_coordinates(
        &self,
        centre_x: u32,
        centre_y: u32,
        angle: f32,
        radius: f32,
    ) -> (u32, u32) {
        let dx = (radius * angle.cos()).round() as i64;
        let dy = (radius * angle.sin()).round() as i64;
        (
            self.clip_tissue_coordinate(centre_x as i64 + dx, Axis::X),
            self.clip_tissue_coordinate(centre_y as i64 + dy, Axis::Y),
        )
    }

    // ---- record bit widths ----------------------------------------------

    #[inline]
    pub fn bits_per_x(&self) -> usize {
        self.bits_per_x
    }

    #[inline]
    pub fn bits_per_y(&self) -> usize {
        self.bits_per_y
    }

    #[inline]
    pub fn bits_per_source_ref(&self) -> usize {
        self.bits_per_source_ref
    }

    #[inline]
    pub fn bits_per_kind(&self) -> usize {
        self.bits_per_kind
    }

    #[inline]
    pub fn bits_per_slot(&self) -> usize {
        self.bits_per_slot
    }

    #[inline]
    pub fn bits_per_cell_record(&self) -> usize {
        self.bits_per_cell_record
    }

    #[inline]
    pub fn bits_per_synapse_record(&self) -> usize {
        self.bits_per_synapse_record
    }

    #[inline]
    pub fn bits_per_territory_block(&self, kind: usize) -> usize {
        self.bits_per_territory_block[kind]
    }

    #[inline]
    pub fn bits_per_muscle_synapse_record(&self) -> usize {
        self.bits_per_muscle_synapse_record
    }
}

/// Number of delimiter indices stored per territory (one boundary after each
/// territorial-state run).
pub const NUM_DELIMITERS: usize = 7;

#[cfg(test)]
mod tests {
    use super::*;

    fn config_3x3() -> TissueConfig {
        TissueConfig {
            cells_along_x: 3,
            cells_along_y: 3,
            toroidal_x: false,
            toroidal_y: false,
            toroidal_columnar: false,
            tissue_kinds: vec![TissueKindConfig {
                cells_along_columnar: 1,
                territory_capacity: 4,
            }],
            sensory_kinds: vec![SensoryKindConfig { num_cells: 2 }],
            num_muscle_cells: 1,
            synapses_per_muscle: 2,
            transition: TransitionConfig::default(),
        }
    }

    #[test]
    fn derived_widths_are_minimal() {
        assert_eq!(num_bits_to_index(1), 1);
        assert_eq!(num_bits_to_index(2), 1);
        assert_eq!(num_bits_to_index(3), 2);
        assert_eq!(num_bits_to_index(256), 8);
        assert_eq!(num_bits_to_index(257), 9);

        let geo = StaticTissue::new(config_3x3()).unwrap();
        assert_eq!(geo.bits_per_x(), 2);
        assert_eq!(geo.bits_per_y(), 2);
        // 1 columnar coordinate + 2 virtual sensory columns.
        assert_eq!(geo.bits_per_source_ref(), 2);
        assert_eq!(geo.bits_per_slot(), 3); // stores 0..=4
        assert_eq!(geo.bits_per_cell_record() % 8, 0);
        assert_eq!(geo.bits_per_territory_block(0) % 8, 0);
    }

    #[test]
    fn non_toroidal_axis_clamps_and_toroidal_wraps() {
        let mut cfg = config_3x3();
        cfg.cells_along_x = 5;
        cfg.toroidal_x = true;
        let geo = StaticTissue::new(cfg).unwrap();

        // Toroidal: -7 mod 5 == 3.
        assert_eq!(geo.clip_tissue_coordinate(-7, Axis::X), 3);
        assert_eq!(geo.clip_tissue_coordinate(12, Axis::X), 2);
        assert_eq!(geo.clip_tissue_coordinate(4, Axis::X), 4);

        // Non-toroidal: clamp to the border.
        assert_eq!(geo.clip_tissue_coordinate(-7, Axis::Y), 0);
        assert_eq!(geo.clip_tissue_coordinate(99, Axis::Y), 2);
    }

    #[test]
    fn coord_shifts_clip_per_axis() {
        let mut cfg = config_3x3();
        cfg.cells_along_x = 5;
        cfg.toroidal_x = true;
        let geo = StaticTissue::new(cfg).unwrap();
        let base = CellCoords::new(0, 2, 0);
        let shifted = geo.shifted_coords(
            base,
            CoordShift {
                dx: -2,
                dy: 4,
                dc: -1,
            },
        );
        // x wraps (toroidal), y and columnar clamp.
        assert_eq!(shifted, CellCoords::new(3, 2, 0));
    }

    #[test]
    fn kind_segments_partition_the_columnar_axis() {
        let mut cfg = config_3x3();
        cfg.tissue_kinds = vec![
            TissueKindConfig {
                cells_along_columnar: 2,
                territory_capacity: 4,
            },
            TissueKindConfig {
                cells_along_columnar: 3,
                territory_capacity: 8,
            },
        ];
        let geo = StaticTissue::new(cfg).unwrap();
        assert_eq!(geo.cells_along_columnar(), 5);
        assert_eq!(geo.columnar_segment(0), 0..2);
        assert_eq!(geo.columnar_segment(1), 2..5);
        assert_eq!(geo.kind_of_columnar(1), 0);
        assert_eq!(geo.kind_of_columnar(2), 1);
        assert_eq!(geo.kind_base(0), 0);
        assert_eq!(geo.kind_base(1), 18);
    }

    #[test]
    fn cell_indexing_roundtrips() {
        let mut cfg = config_3x3();
        cfg.tissue_kinds = vec![
            TissueKindConfig {
                cells_along_columnar: 2,
                territory_capacity: 4,
            },
            TissueKindConfig {
                cells_along_columnar: 1,
                territory_capacity: 2,
            },
        ];
        let geo = StaticTissue::new(cfg).unwrap();
        for x in 0..3 {
            for y in 0..3 {
                for c in 0..3 {
                    let coords = CellCoords::new(x, y, c);
                    let (kind, index) = geo.cell_index_in_kind(coords);
                    assert_eq!(geo.coords_of_kind_index(kind, index), coords);
                }
            }
        }
    }

    #[test]
    fn rejects_degenerate_configs() {
        let mut cfg = config_3x3();
        cfg.tissue_kinds.clear();
        assert!(matches!(
            StaticTissue::new(cfg),
            Err(TissueError::InvalidConfig(_))
        ));

        let mut cfg = config_3x3();
        cfg.cells_along_x = 0;
        assert!(StaticTissue::new(cfg).is_err());

        let mut cfg = config_3x3();
        cfg.tissue_kinds[0].cells_along_columnar = 0;
        assert!(StaticTissue::new(cfg).is_err());
    }

    #[test]
    fn oversized_configs_are_rejected_as_unsupported() {
        // The rejection is a distinct error kind, not a degraded build.
        let mut cfg = config_3x3();
        cfg.cells_along_x = 1;
        cfg.cells_along_y = 1;
        cfg.tissue_kinds = vec![
            TissueKindConfig {
                cells_along_columnar: u32::MAX,
                territory_capacity: 1,
            },
            TissueKindConfig {
                cells_along_columnar: 1,
                territory_capacity: 1,
            },
        ];
        assert!(matches!(
            StaticTissue::new(cfg),
            Err(TissueError::Unsupported(_))
        ));
    }

    #[test]
    #[cfg(feature = "serde")]
    fn config_loads_from_json() {
        let json = r#"{
            "cells_along_x": 4,
            "cells_along_y": 4,
            "toroidal_x": true,
            "toroidal_y": false,
            "toroidal_columnar": false,
            "tissue_kinds": [
                { "cells_along_columnar": 2, "territory_capacity": 16 }
            ],
            "sensory_kinds": [ { "num_cells": 8 } ],
            "num_muscle_cells": 2,
            "synapses_per_muscle": 4,
            "transition": {
                "decay": 0.2,
                "integration_gain": 1.0,
                "order": "DeliverThenDecay"
            }
        }"#;
        let cfg = TissueConfig::from_json_reader(json.as_bytes()).unwrap();
        let geo = StaticTissue::new(cfg).unwrap();
        assert_eq!(geo.cells_along_x(), 4);
        assert_eq!(geo.num_sensory_cells(), 8);
        assert_eq!(geo.transition().order, UpdateOrder::DeliverThenDecay);
    }
}
