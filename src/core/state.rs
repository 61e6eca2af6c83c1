//! Dynamic tissue state.
//!
//! The mutable, packed simulation data built over a [`StaticTissue`]: per-kind
//! arrays of cell records and territory blocks, sensory/muscle values, and
//! the synapses feeding the muscles. Storage is allocated exactly once, sized
//! to worst-case territory capacities, and never reallocated mid-simulation.
//!
//! Thread-safety contract: distinct cells (and distinct territory blocks)
//! occupy disjoint byte ranges, so concurrent access to *different* cells
//! needs no locking. Concurrent access to the *same* cell requires external
//! synchronization, provided by the connectivity algorithms and the feedback
//! loop, never by this layer.

use std::sync::Arc;

use tracing::info;

use crate::bits::{BitArray, BitsMut, BitsRef};
use crate::geometry::{Axis, CellCoords, StaticTissue, NUM_DELIMITERS};

/// Number of territorial states a synapse slot can be in.
pub const NUM_TERRITORIAL_STATES: usize = 7;

/// Where a synapse slot currently sits in its owner's territory.
///
/// `SignalDelivery` means settled and delivering to this cell. The six
/// migration states mean the slot is still owned by this territory but must
/// relocate one step in the named direction during the next spread pass.
/// Migration is thus "which partition a slot sits in", not a pointer
/// mutation, which is what keeps the update parallelizable per cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TerritorialState {
    SignalDelivery = 0,
    MigrateXUp = 1,
    MigrateXDown = 2,
    MigrateYUp = 3,
    MigrateYDown = 4,
    MigrateColumnarUp = 5,
    MigrateColumnarDown = 6,
}

impl TerritorialState {
    pub const ALL: [TerritorialState; NUM_TERRITORIAL_STATES] = [
        TerritorialState::SignalDelivery,
        TerritorialState::MigrateXUp,
        TerritorialState::MigrateXDown,
        TerritorialState::MigrateYUp,
        TerritorialState::MigrateYDown,
        TerritorialState::MigrateColumnarUp,
        TerritorialState::MigrateColumnarDown,
    ];

    #[inline]
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> TerritorialState {
        assert!(
            (tag as usize) < NUM_TERRITORIAL_STATES,
            "invalid territorial state tag"
        );
        Self::ALL[tag as usize]
    }

    /// Migration direction of this state, or `None` for `SignalDelivery`.
    pub fn migration_step(self) -> Option<(Axis, i64)> {
        match self {
            TerritorialState::SignalDelivery => None,
            TerritorialState::MigrateXUp => Some((Axis::X, 1)),
            TerritorialState::MigrateXDown => Some((Axis::X, -1)),
            TerritorialState::MigrateYUp => Some((Axis::Y, 1)),
            TerritorialState::MigrateYDown => Some((Axis::Y, -1)),
            TerritorialState::MigrateColumnarUp => Some((Axis::Columnar, 1)),
            TerritorialState::MigrateColumnarDown => Some((Axis::Columnar, -1)),
        }
    }
}

/// Decoded source of a synapse: either a tissue cell or a sensory cell.
///
/// On the wire a source is `(x, y, ref)` where `ref` below the columnar
/// length is a columnar coordinate and values at or above it index the
/// "virtual sensory columns" appended after the tissue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceRef {
    Tissue(CellCoords),
    Sensory(u32),
}

/// Encode a sensory-cell index as a source reference.
#[inline]
pub fn sensory_source_ref(geometry: &StaticTissue, sensory_index: u32) -> u32 {
    assert!(sensory_index < geometry.num_sensory_cells());
    geometry.cells_along_columnar() + sensory_index
}

/// One synapse slot, decoded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SynapseRecord {
    pub source_x: u32,
    pub source_y: u32,
    pub source_ref: u32,
    pub state: TerritorialState,
    pub weight: f32,
}

impl SynapseRecord {
    /// Placeholder written by `fill_territories`: settled, zero source, zero
    /// weight.
    pub const fn placeholder() -> Self {
        Self {
            source_x: 0,
            source_y: 0,
            source_ref: 0,
            state: TerritorialState::SignalDelivery,
            weight: 0.0,
        }
    }

    pub fn source(&self, geometry: &StaticTissue) -> SourceRef {
        if self.source_ref < geometry.cells_along_columnar() {
            SourceRef::Tissue(CellCoords::new(self.source_x, self.source_y, self.source_ref))
        } else {
            SourceRef::Sensory(self.source_ref - geometry.cells_along_columnar())
        }
    }
}

/// One synapse feeding a muscle cell, decoded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MuscleSynapseRecord {
    pub source_x: u32,
    pub source_y: u32,
    pub source_ref: u32,
    pub weight: f32,
}

// ---------------------------------------------------------------------------
// Record layouts
// ---------------------------------------------------------------------------

/// Field offsets inside a packed cell record. Derived from the geometry once
/// and copied freely (all fields are plain counts).
///
/// Layout: kind tag | potential (f32 bits) | `NUM_DELIMITERS` slot indices.
#[derive(Debug, Clone, Copy)]
pub struct CellLayout {
    bits_per_kind: usize,
    potential_off: usize,
    delim_off: usize,
    bits_per_slot: usize,
}

impl CellLayout {
    pub fn of(geometry: &StaticTissue) -> Self {
        let bits_per_kind = geometry.bits_per_kind();
        Self {
            bits_per_kind,
            potential_off: bits_per_kind,
            delim_off: bits_per_kind + 32,
            bits_per_slot: geometry.bits_per_slot(),
        }
    }

    pub fn read_kind(&self, unit: &BitsRef<'_>) -> usize {
        unit.bits_to_value(0, self.bits_per_kind) as usize
    }

    pub fn write_kind(&self, unit: &mut BitsMut<'_>, kind: usize) {
        unit.value_to_bits(kind as u64, 0, self.bits_per_kind);
    }

    pub fn read_potential(&self, unit: &BitsRef<'_>) -> f32 {
        f32::from_bits(unit.bits_to_value(self.potential_off, 32) as u32)
    }

    pub fn write_potential(&self, unit: &mut BitsMut<'_>, value: f32) {
        unit.value_to_bits(value.to_bits() as u64, self.potential_off, 32);
    }

    pub fn read_delimiters(&self, unit: &BitsRef<'_>) -> [u32; NUM_DELIMITERS] {
        let mut out = [0u32; NUM_DELIMITERS];
        for (i, d) in out.iter_mut().enumerate() {
            *d = unit.bits_to_value(self.delim_off + i * self.bits_per_slot, self.bits_per_slot)
                as u32;
        }
        out
    }

    pub fn write_delimiters(&self, unit: &mut BitsMut<'_>, delimiters: &[u32; NUM_DELIMITERS]) {
        for (i, d) in delimiters.iter().enumerate() {
            unit.value_to_bits(
                *d as u64,
                self.delim_off + i * self.bits_per_slot,
                self.bits_per_slot,
            );
        }
    }

    /// Write the delimiter table of a territory whose used prefix is one
    /// single `SignalDelivery` run of `total` slots.
    pub fn write_uniform_delimiters(&self, unit: &mut BitsMut<'_>, total: u32) {
        self.write_delimiters(unit, &[total; NUM_DELIMITERS]);
    }
}

/// Field offsets inside one packed synapse record; records pack back to back
/// inside a territory block.
///
/// Layout: source-x | source-y | source-ref | state tag (3) | weight (f32).
#[derive(Debug, Clone, Copy)]
pub struct SynapseLayout {
    bits_per_x: usize,
    bits_per_y: usize,
    bits_per_source_ref: usize,
    record_bits: usize,
}

impl SynapseLayout {
    pub fn of(geometry: &StaticTissue) -> Self {
        Self {
            bits_per_x: geometry.bits_per_x(),
            bits_per_y: geometry.bits_per_y(),
            bits_per_source_ref: geometry.bits_per_source_ref(),
            record_bits: geometry.bits_per_synapse_record(),
        }
    }

    #[inline]
    pub fn record_bits(&self) -> usize {
        self.record_bits
    }

    pub fn read(&self, territory: &BitsRef<'_>, slot: usize) -> SynapseRecord {
        let base = slot * self.record_bits;
        let mut at = base;
        let source_x = territory.bits_to_value(at, self.bits_per_x) as u32;
        at += self.bits_per_x;
        let source_y = territory.bits_to_value(at, self.bits_per_y) as u32;
        at += self.bits_per_y;
        let source_ref = territory.bits_to_value(at, self.bits_per_source_ref) as u32;
        at += self.bits_per_source_ref;
        let state = TerritorialState::from_tag(territory.bits_to_value(at, 3) as u8);
        at += 3;
        let weight = f32::from_bits(territory.bits_to_value(at, 32) as u32);
        SynapseRecord {
            source_x,
            source_y,
            source_ref,
            state,
            weight,
        }
    }

    pub fn write(&self, territory: &mut BitsMut<'_>, slot: usize, record: &SynapseRecord) {
        let base = slot * self.record_bits;
        let mut at = base;
        territory.value_to_bits(record.source_x as u64, at, self.bits_per_x);
        at += self.bits_per_x;
        territory.value_to_bits(record.source_y as u64, at, self.bits_per_y);
        at += self.bits_per_y;
        territory.value_to_bits(record.source_ref as u64, at, self.bits_per_source_ref);
        at += self.bits_per_source_ref;
        territory.value_to_bits(record.state.tag() as u64, at, 3);
        at += 3;
        territory.value_to_bits(record.weight.to_bits() as u64, at, 32);
    }

    /// Rewrite only the territorial-state tag of a slot.
    pub fn write_state(&self, territory: &mut BitsMut<'_>, slot: usize, state: TerritorialState) {
        let at = slot * self.record_bits
            + self.bits_per_x
            + self.bits_per_y
            + self.bits_per_source_ref;
        territory.value_to_bits(state.tag() as u64, at, 3);
    }

    pub fn read_state(&self, territory: &BitsRef<'_>, slot: usize) -> TerritorialState {
        let at = slot * self.record_bits
            + self.bits_per_x
            + self.bits_per_y
            + self.bits_per_source_ref;
        TerritorialState::from_tag(territory.bits_to_value(at, 3) as u8)
    }
}

/// Field offsets inside one packed synapse-to-muscle record.
#[derive(Debug, Clone, Copy)]
pub struct MuscleSynapseLayout {
    bits_per_x: usize,
    bits_per_y: usize,
    bits_per_source_ref: usize,
}

impl MuscleSynapseLayout {
    pub fn of(geometry: &StaticTissue) -> Self {
        Self {
            bits_per_x: geometry.bits_per_x(),
            bits_per_y: geometry.bits_per_y(),
            bits_per_source_ref: geometry.bits_per_source_ref(),
        }
    }

    pub fn read(&self, unit: &BitsRef<'_>) -> MuscleSynapseRecord {
        let mut at = 0;
        let source_x = unit.bits_to_value(at, self.bits_per_x) as u32;
        at += self.bits_per_x;
        let source_y = unit.bits_to_value(at, self.bits_per_y) as u32;
        at += self.bits_per_y;
        let source_ref = unit.bits_to_value(at, self.bits_per_source_ref) as u32;
        at += self.bits_per_source_ref;
        let weight = f32::from_bits(unit.bits_to_value(at, 32) as u32);
        MuscleSynapseRecord {
            source_x,
            source_y,
            source_ref,
            weight,
        }
    }

    pub fn write(&self, unit: &mut BitsMut<'_>, record: &MuscleSynapseRecord) {
        let mut at = 0;
        unit.value_to_bits(record.source_x as u64, at, self.bits_per_x);
        at += self.bits_per_x;
        unit.value_to_bits(record.source_y as u64, at, self.bits_per_y);
        at += self.bits_per_y;
        unit.value_to_bits(record.source_ref as u64, at, self.bits_per_source_ref);
        at += self.bits_per_source_ref;
        unit.value_to_bits(record.weight.to_bits() as u64, at, 32);
    }
}

// ---------------------------------------------------------------------------
// Dynamic state
// ---------------------------------------------------------------------------

/// The packed, mutable grid of cells and synapses built over a
/// [`StaticTissue`].
#[derive(Debug)]
pub struct DynamicTissue {
    geometry: Arc<StaticTissue>,
    cell_layout: CellLayout,
    synapse_layout: SynapseLayout,
    muscle_layout: MuscleSynapseLayout,

    /// Per tissue kind: one unit per cell.
    cells: Vec<BitArray>,
    /// Per tissue kind: one unit per cell, holding the whole territory block.
    territories: Vec<BitArray>,
    /// One f32 value per sensory cell.
    sensory: BitArray,
    /// One f32 value per muscle cell.
    muscles: BitArray,
    /// One record per synapse feeding a muscle.
    synapses_to_muscles: BitArray,
}

impl DynamicTissue {
    /// Allocate packed storage for the worst-case capacities of `geometry`.
    pub fn new(geometry: Arc<StaticTissue>) -> Self {
        let cell_layout = CellLayout::of(&geometry);
        let synapse_layout = SynapseLayout::of(&geometry);
        let muscle_layout = MuscleSynapseLayout::of(&geometry);

        let mut cells = Vec::with_capacity(geometry.num_tissue_kinds());
        let mut territories = Vec::with_capacity(geometry.num_tissue_kinds());
        for kind in 0..geometry.num_tissue_kinds() {
            let n = geometry.num_cells_of_kind(kind);
            cells.push(BitArray::new(n, geometry.bits_per_cell_record()));
            territories.push(BitArray::new(n, geometry.bits_per_territory_block(kind)));
        }
        let sensory = BitArray::new(geometry.num_sensory_cells() as usize, 32);
        let muscles = BitArray::new(geometry.num_muscle_cells() as usize, 32);
        let synapses_to_muscles = BitArray::new(
            geometry.num_synapses_to_muscles(),
            geometry.bits_per_muscle_synapse_record(),
        );

        let mut tissue = Self {
            geometry,
            cell_layout,
            synapse_layout,
            muscle_layout,
            cells,
            territories,
            sensory,
            muscles,
            synapses_to_muscles,
        };

        // Kind tags are static facts; stamp them once at allocation.
        for kind in 0..tissue.geometry.num_tissue_kinds() {
            let n = tissue.geometry.num_cells_of_kind(kind);
            let layout = tissue.cell_layout;
            let array = &mut tissue.cells[kind];
            for i in 0..n {
                layout.write_kind(&mut array.unit_mut(i), kind);
            }
        }

        let packed_bytes: usize = tissue.cells.iter().map(BitArray::num_bytes).sum::<usize>()
            + tissue.territories.iter().map(BitArray::num_bytes).sum::<usize>()
            + tissue.sensory.num_bytes()
            + tissue.muscles.num_bytes()
            + tissue.synapses_to_muscles.num_bytes();
        info!(packed_bytes, "dynamic tissue state allocated");

        tissue
    }

    pub fn geometry(&self) -> &StaticTissue {
        &self.geometry
    }

    pub fn geometry_handle(&self) -> Arc<StaticTissue> {
        Arc::clone(&self.geometry)
    }

    #[inline]
    pub fn cell_layout(&self) -> CellLayout {
        self.cell_layout
    }

    #[inline]
    pub fn synapse_layout(&self) -> SynapseLayout {
        self.synapse_layout
    }

    #[inline]
    pub fn muscle_synapse_layout(&self) -> MuscleSynapseLayout {
        self.muscle_layout
    }

    // ---- record-scoped bit references -----------------------------------

    /// Bits of exactly one cell record.
    pub fn find_bits_of_cell(&self, coords: CellCoords) -> BitsRef<'_> {
        let (kind, index) = self.geometry.cell_index_in_kind(coords);
        self.cells[kind].unit(index)
    }

    pub fn find_bits_of_cell_mut(&mut self, coords: CellCoords) -> BitsMut<'_> {
        let (kind, index) = self.geometry.cell_index_in_kind(coords);
        self.cells[kind].unit_mut(index)
    }

    /// Bits of exactly one synapse record in a cell's territory.
    pub fn find_bits_of_synapse(&self, coords: CellCoords, slot: u32) -> BitsRef<'_> {
        let (kind, index) = self.geometry.cell_index_in_kind(coords);
        assert!(
            slot < self.geometry.territory_capacity(kind),
            "synapse slot out of territory capacity"
        );
        let record_bits = self.synapse_layout.record_bits();
        self.territories[kind]
            .unit(index)
            .narrow(slot as usize * record_bits, record_bits)
    }

    pub fn find_bits_of_synapse_mut(&mut self, coords: CellCoords, slot: u32) -> BitsMut<'_> {
        let (kind, index) = self.geometry.cell_index_in_kind(coords);
        assert!(
            slot < self.geometry.territory_capacity(kind),
            "synapse slot out of territory capacity"
        );
        let record_bits = self.synapse_layout.record_bits();
        self.territories[kind]
            .unit_mut(index)
            .narrow(slot as usize * record_bits, record_bits)
    }

    /// Bits of exactly one sensory cell value.
    pub fn find_bits_of_sensory_cell(&self, index: u32) -> BitsRef<'_> {
        self.sensory.unit(index as usize)
    }

    pub fn find_bits_of_sensory_cell_mut(&mut self, index: u32) -> BitsMut<'_> {
        self.sensory.unit_mut(index as usize)
    }

    /// Bits of exactly one muscle cell value.
    pub fn find_bits_of_muscle_cell(&self, index: u32) -> BitsRef<'_> {
        self.muscles.unit(index as usize)
    }

    pub fn find_bits_of_muscle_cell_mut(&mut self, index: u32) -> BitsMut<'_> {
        self.muscles.unit_mut(index as usize)
    }

    /// Bits of exactly one synapse-to-muscle record.
    pub fn find_bits_of_synapse_to_muscle(&self, index: usize) -> BitsRef<'_> {
        self.synapses_to_muscles.unit(index)
    }

    pub fn find_bits_of_synapse_to_muscle_mut(&mut self, index: usize) -> BitsMut<'_> {
        self.synapses_to_muscles.unit_mut(index)
    }

    // ---- typed convenience accessors ------------------------------------

    pub fn cell_kind_tag(&self, coords: CellCoords) -> usize {
        self.cell_layout.read_kind(&self.find_bits_of_cell(coords))
    }

    pub fn cell_potential(&self, coords: CellCoords) -> f32 {
        self.cell_layout.read_potential(&self.find_bits_of_cell(coords))
    }

    pub fn set_cell_potential(&mut self, coords: CellCoords, value: f32) {
        let layout = self.cell_layout;
        layout.write_potential(&mut self.find_bits_of_cell_mut(coords), value);
    }

    pub fn delimiters_of_cell(&self, coords: CellCoords) -> [u32; NUM_DELIMITERS] {
        self.cell_layout.read_delimiters(&self.find_bits_of_cell(coords))
    }

    pub fn set_delimiters_of_cell(&mut self, coords: CellCoords, delimiters: &[u32; NUM_DELIMITERS]) {
        let layout = self.cell_layout;
        layout.write_delimiters(&mut self.find_bits_of_cell_mut(coords), delimiters);
    }

    pub fn synapse_record(&self, coords: CellCoords, slot: u32) -> SynapseRecord {
        // The narrowed view holds exactly one record at slot 0.
        let bits = self.find_bits_of_synapse(coords, slot);
        self.synapse_layout.read(&bits, 0)
    }

    pub fn set_synapse_record(&mut self, coords: CellCoords, slot: u32, record: &SynapseRecord) {
        let layout = self.synapse_layout;
        let mut bits = self.find_bits_of_synapse_mut(coords, slot);
        layout.write(&mut bits, 0, record);
    }

    pub fn sensory_value(&self, index: u32) -> f32 {
        f32::from_bits(self.find_bits_of_sensory_cell(index).bits_to_value(0, 32) as u32)
    }

    pub fn set_sensory_value(&mut self, index: u32, value: f32) {
        self.find_bits_of_sensory_cell_mut(index)
            .value_to_bits(value.to_bits() as u64, 0, 32);
    }

    pub fn muscle_value(&self, index: u32) -> f32 {
        f32::from_bits(self.find_bits_of_muscle_cell(index).bits_to_value(0, 32) as u32)
    }

    pub fn set_muscle_value(&mut self, index: u32, value: f32) {
        self.find_bits_of_muscle_cell_mut(index)
            .value_to_bits(value.to_bits() as u64, 0, 32);
    }

    pub fn synapse_to_muscle(&self, index: usize) -> MuscleSynapseRecord {
        self.muscle_layout.read(&self.find_bits_of_synapse_to_muscle(index))
    }

    pub fn set_synapse_to_muscle(&mut self, index: usize, record: &MuscleSynapseRecord) {
        let layout = self.muscle_layout;
        layout.write(&mut self.find_bits_of_synapse_to_muscle_mut(index), record);
    }

    // ---- invariant checks and aggregate queries -------------------------

    /// Check the delimiter invariant for every cell: indices non-decreasing,
    /// bounded by capacity, and every slot below the last delimiter tagged
    /// with the state of the run it sits in.
    pub fn validate_territories(&self) -> Result<(), String> {
        for kind in 0..self.geometry.num_tissue_kinds() {
            self.validate_territories_of_kind(kind)?;
        }
        Ok(())
    }

    /// Single-kind variant of [`Self::validate_territories`].
    pub fn validate_territories_of_kind(&self, kind: usize) -> Result<(), String> {
        let capacity = self.geometry.territory_capacity(kind);
        for index in 0..self.geometry.num_cells_of_kind(kind) {
            let cell = self.cells[kind].unit(index);
            let delimiters = self.cell_layout.read_delimiters(&cell);
            let mut prev = 0u32;
            for (run, &d) in delimiters.iter().enumerate() {
                if d < prev {
                    return Err(format!(
                        "kind {kind} cell {index}: delimiter {run} decreases ({d} < {prev})"
                    ));
                }
                if d > capacity {
                    return Err(format!(
                        "kind {kind} cell {index}: delimiter {run} exceeds capacity {capacity}"
                    ));
                }
                prev = d;
            }
            let territory = self.territories[kind].unit(index);
            let mut prev = 0u32;
            for (run, &d) in delimiters.iter().enumerate() {
                for slot in prev..d {
                    let state = self.synapse_layout.read_state(&territory, slot as usize);
                    if state.tag() as usize != run {
                        return Err(format!(
                            "kind {kind} cell {index} slot {slot}: tagged {state:?}, \
                             sits in run {run}"
                        ));
                    }
                }
                prev = d;
            }
        }
        Ok(())
    }

    /// Total number of synapse slots currently tagged `state`, across the
    /// whole grid.
    pub fn count_synapses_in_state(&self, state: TerritorialState) -> u64 {
        let mut total = 0u64;
        for kind in 0..self.geometry.num_tissue_kinds() {
            for index in 0..self.geometry.num_cells_of_kind(kind) {
                let cell = self.cells[kind].unit(index);
                let used = self.cell_layout.read_delimiters(&cell)[NUM_DELIMITERS - 1];
                let territory = self.territories[kind].unit(index);
                for slot in 0..used {
                    if self.synapse_layout.read_state(&territory, slot as usize) == state {
                        total += 1;
                    }
                }
            }
        }
        total
    }

    // ---- storage access for in-crate algorithms -------------------------

    pub(crate) fn kind_storage_mut(&mut self, kind: usize) -> (&mut BitArray, &mut BitArray) {
        (&mut self.cells[kind], &mut self.territories[kind])
    }

    pub(crate) fn cells_array(&self, kind: usize) -> &BitArray {
        &self.cells[kind]
    }

    pub(crate) fn cells_array_mut(&mut self, kind: usize) -> &mut BitArray {
        &mut self.cells[kind]
    }

    pub(crate) fn territory_array(&self, kind: usize) -> &BitArray {
        &self.territories[kind]
    }

    pub(crate) fn territory_array_mut(&mut self, kind: usize) -> &mut BitArray {
        &mut self.territories[kind]
    }

    pub(crate) fn sensory_array(&self) -> &BitArray {
        &self.sensory
    }

    pub(crate) fn sensory_array_mut(&mut self) -> &mut BitArray {
        &mut self.sensory
    }

    pub(crate) fn muscles_array_mut(&mut self) -> &mut BitArray {
        &mut self.muscles
    }

    pub(crate) fn muscles_array(&self) -> &BitArray {
        &self.muscles
    }

    pub(crate) fn synapses_to_muscles_array(&self) -> &BitArray {
        &self.synapses_to_muscles
    }

    pub(crate) fn synapses_to_muscles_array_mut(&mut self) -> &mut BitArray {
        &mut self.synapses_to_muscles
    }

    /// Split borrows for the muscle update pass: mutable muscle values,
    /// shared view of everything they read.
    pub(crate) fn muscle_split(&mut self) -> MuscleSplit<'_> {
        MuscleSplit {
            geometry: &self.geometry,
            cell_layout: self.cell_layout,
            muscle_layout: self.muscle_layout,
            cells: &self.cells,
            sensory: &self.sensory,
            synapses_to_muscles: &self.synapses_to_muscles,
            muscles: &mut self.muscles,
        }
    }
}

pub(crate) struct MuscleSplit<'a> {
    pub geometry: &'a StaticTissue,
    pub cell_layout: CellLayout,
    pub muscle_layout: MuscleSynapseLayout,
    pub cells: &'a [BitArray],
    pub sensory: &'a BitArray,
    pub synapses_to_muscles: &'a BitArray,
    pub muscles: &'a mut BitArray,
}

/// Read the potential of an arbitrary source (tissue cell or sensory cell)
/// straight from packed storage.
pub(crate) fn potential_of_source(
    geometry: &StaticTissue,
    cell_layout: &CellLayout,
    cells: &[BitArray],
    sensory: &BitArray,
    source_x: u32,
    source_y: u32,
    source_ref: u32,
) -> f32 {
    if source_ref < geometry.cells_along_columnar() {
        let (kind, index) =
            geometry.cell_index_in_kind(CellCoords::new(source_x, source_y, source_ref));
        cell_layout.read_potential(&cells[kind].unit(index))
    } else {
        let sensory_index = (source_ref - geometry.cells_along_columnar()) as usize;
        f32::from_bits(sensory.unit(sensory_index).bits_to_value(0, 32) as u32)
    }
}
