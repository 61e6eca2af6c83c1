//! Parallel construction and rewiring of the dynamic tissue state.
//!
//! Every algorithm here shares one structure: partition the iteration space
//! (cells of one kind, sensory cells, muscles) into `max_threads` contiguous
//! non-overlapping ranges, launch one worker per range inside
//! `std::thread::scope`, and join before returning. Each worker receives a
//! disjoint mutable window of the packed storage (`BitArray::split_units_mut`),
//! so the borrow checker enforces the disjoint-write rule the concurrency
//! model depends on.
//!
//! Determinism: for a fixed geometry and seed, every pass produces
//! byte-identical state for any `max_threads >= 1`. Partitioning affects only
//! scheduling, never which cell processes which data; random draws come from
//! per-cell streams ([`Prng::for_stream`]).
//!
//! Passes that move data *between* cells (migration spread, sensory links)
//! run in two phases separated by a barrier: phase 1 computes intents with
//! per-cell ownership, phase 2 applies them with per-destination ownership.
//!
//! Callers must respect the dependency order: territories before delimiters
//! before source-coordinate fill before migration spread. The engine does not
//! enforce the order; debug builds validate the delimiter invariant at the
//! end of each pass.

use std::ops::Range;
use std::thread;

use hashbrown::HashMap;
use tracing::debug;

use crate::bits::BitArray;
use crate::geometry::{Axis, CellCoords, StaticTissue, NUM_DELIMITERS};
use crate::prng::Prng;
use crate::state::{
    sensory_source_ref, DynamicTissue, MuscleSynapseRecord, SynapseRecord, TerritorialState,
    NUM_TERRITORIAL_STATES,
};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Partition `0..num_items` into at most `max_threads` contiguous
/// non-overlapping ranges of near-equal size.
///
/// `max_threads == 0` is treated as 1.
pub fn partition_ranges(num_items: usize, max_threads: usize) -> Vec<Range<usize>> {
    if num_items == 0 {
        return Vec::new();
    }
    let threads = max_threads.max(1).min(num_items);
    let chunk = num_items.div_ceil(threads);
    let mut ranges = Vec::with_capacity(threads);
    let mut start = 0;
    while start < num_items {
        let end = (start + chunk).min(num_items);
        ranges.push(start..end);
        start = end;
    }
    ranges
}

/// How many synapses a cell of a given tissue kind draws from each source
/// kind. Rows are tissue kinds; columns are tissue kinds followed by sensory
/// kinds.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TargetAreas {
    num_target_kinds: usize,
    num_source_kinds: usize,
    counts: Vec<u32>,
}

impl TargetAreas {
    /// Zeroed matrix with dimensions matching `geometry`.
    pub fn new(geometry: &StaticTissue) -> Self {
        let num_target_kinds = geometry.num_tissue_kinds();
        let num_source_kinds = geometry.num_tissue_kinds() + geometry.num_sensory_kinds();
        Self {
            num_target_kinds,
            num_source_kinds,
            counts: vec![0; num_target_kinds * num_source_kinds],
        }
    }

    #[inline]
    pub fn num_target_kinds(&self) -> usize {
        self.num_target_kinds
    }

    #[inline]
    pub fn num_source_kinds(&self) -> usize {
        self.num_source_kinds
    }

    pub fn set(&mut self, target_kind: usize, source_kind: usize, count: u32) {
        assert!(target_kind < self.num_target_kinds && source_kind < self.num_source_kinds);
        self.counts[target_kind * self.num_source_kinds + source_kind] = count;
    }

    pub fn count(&self, target_kind: usize, source_kind: usize) -> u32 {
        assert!(target_kind < self.num_target_kinds && source_kind < self.num_source_kinds);
        self.counts[target_kind * self.num_source_kinds + source_kind]
    }

    fn assert_matches(&self, geometry: &StaticTissue) {
        assert_eq!(
            self.num_target_kinds,
            geometry.num_tissue_kinds(),
            "target-area matrix row count must equal the number of tissue kinds"
        );
        assert_eq!(
            self.num_source_kinds,
            geometry.num_tissue_kinds() + geometry.num_sensory_kinds(),
            "target-area matrix column count must equal tissue + sensory kinds"
        );
    }
}

/// Slot-group boundaries of one territory, by source kind, in matrix column
/// order, saturated at the territory capacity.
///
/// Shared by `fill_territories`, `fill_coords_of_source_cells_of_synapses_in_tissue`
/// and `add_links_from_sensory_cells` so all three agree on which slot feeds
/// from which source kind.
fn group_prefix(areas: &TargetAreas, target_kind: usize, capacity: u32) -> Vec<u32> {
    let mut prefix = Vec::with_capacity(areas.num_source_kinds() + 1);
    prefix.push(0u32);
    let mut total = 0u64;
    for source_kind in 0..areas.num_source_kinds() {
        total = (total + areas.count(target_kind, source_kind) as u64).min(capacity as u64);
        prefix.push(total as u32);
    }
    prefix
}

/// Counters reported by [`fill_territories`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FillStats {
    pub cells: usize,
    pub synapses: u64,
    /// Cells whose requested totals exceeded their capacity and were
    /// silently saturated.
    pub saturated_cells: u64,
}

/// Counters reported by [`spread_synapses_into_local_neighbourhoods`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpreadStats {
    /// Records relocated into a neighbouring cell's territory.
    pub migrated: u64,
    /// Records whose migration clipped onto their own cell and settled in
    /// place.
    pub redelivered: u64,
    /// Records lost to a full destination territory.
    pub dropped: u64,
}

/// Counters reported by the link builders.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub linked: u64,
    pub dropped: u64,
}

/// Initialize every cell's territory: one `SignalDelivery` placeholder slot
/// per requested synapse, grouped by source kind, and a uniform delimiter
/// table.
///
/// Requested totals above a cell's capacity saturate silently; callers that
/// need to know compare delimiter totals against the capacity afterwards.
pub fn fill_territories(
    tissue: &mut DynamicTissue,
    areas: &TargetAreas,
    max_threads: usize,
) -> FillStats {
    let geometry = tissue.geometry_handle();
    areas.assert_matches(&geometry);
    let cell_layout = tissue.cell_layout();
    let synapse_layout = tissue.synapse_layout();

    let mut stats = FillStats::default();
    for kind in 0..geometry.num_tissue_kinds() {
        let capacity = geometry.territory_capacity(kind);
        let prefix = group_prefix(areas, kind, capacity);
        let total = *prefix.last().expect("prefix is never empty");
        let requested: u64 = (0..areas.num_source_kinds())
            .map(|j| areas.count(kind, j) as u64)
            .sum();

        let num_cells = geometry.num_cells_of_kind(kind);
        let ranges = partition_ranges(num_cells, max_threads);
        let (cells, territories) = tissue.kind_storage_mut(kind);
        let cell_windows = cells.split_units_mut(&ranges);
        let territory_windows = territories.split_units_mut(&ranges);

        thread::scope(|scope| {
            for (mut cell_window, mut territory_window) in
                cell_windows.into_iter().zip(territory_windows)
            {
                scope.spawn(move || {
                    let first = cell_window.first_unit();
                    for i in first..first + cell_window.num_units() {
                        let mut cell = cell_window.unit_mut(i);
                        cell_layout.write_uniform_delimiters(&mut cell, total);
                        let mut territory = territory_window.unit_mut(i);
                        for slot in 0..total as usize {
                            synapse_layout.write(&mut territory, slot, &SynapseRecord::placeholder());
                        }
                    }
                });
            }
        });

        stats.cells += num_cells;
        stats.synapses += total as u64 * num_cells as u64;
        if requested > total as u64 {
            stats.saturated_cells += num_cells as u64;
        }
    }

    debug!(
        cells = stats.cells,
        synapses = stats.synapses,
        saturated = stats.saturated_cells,
        "fill_territories"
    );
    debug_assert_eq!(tissue.validate_territories(), Ok(()));
    stats
}

/// Recompute the delimiter tables of every cell of every kind after synapse
/// tags have changed. `O(capacity)` per cell, fully parallel across cells.
pub fn fill_delimiters_between_territorial_lists(tissue: &mut DynamicTissue, max_threads: usize) {
    for kind in 0..tissue.geometry().num_tissue_kinds() {
        fill_delimiters_of_kind(tissue, kind, max_threads);
    }
    debug_assert_eq!(tissue.validate_territories(), Ok(()));
}

/// Single-kind variant of [`fill_delimiters_between_territorial_lists`]:
/// scan each territory's used prefix once, count records per territorial
/// state, regroup the records into contiguous runs and store the new
/// boundaries.
pub fn fill_delimiters_of_kind(tissue: &mut DynamicTissue, kind: usize, max_threads: usize) {
    let geometry = tissue.geometry_handle();
    assert!(kind < geometry.num_tissue_kinds(), "unconfigured tissue kind");
    let cell_layout = tissue.cell_layout();
    let synapse_layout = tissue.synapse_layout();

    let num_cells = geometry.num_cells_of_kind(kind);
    let ranges = partition_ranges(num_cells, max_threads);
    let (cells, territories) = tissue.kind_storage_mut(kind);
    let cell_windows = cells.split_units_mut(&ranges);
    let territory_windows = territories.split_units_mut(&ranges);

    thread::scope(|scope| {
        for (mut cell_window, mut territory_window) in
            cell_windows.into_iter().zip(territory_windows)
        {
            scope.spawn(move || {
                let mut scratch: Vec<SynapseRecord> = Vec::new();
                let first = cell_window.first_unit();
                for i in first..first + cell_window.num_units() {
                    let used = {
                        let cell = cell_window.unit(i);
                        cell_layout.read_delimiters(&cell)[NUM_DELIMITERS - 1] as usize
                    };

                    // One scan: count per state, then bucket into run order.
                    let mut counts = [0u32; NUM_TERRITORIAL_STATES];
                    scratch.clear();
                    scratch.reserve(used);
                    {
                        let territory = territory_window.unit(i);
                        for slot in 0..used {
                            let record = synapse_layout.read(&territory, slot);
                            counts[record.state.tag() as usize] += 1;
                            scratch.push(record);
                        }
                    }

                    let mut delimiters = [0u32; NUM_DELIMITERS];
                    let mut running = 0u32;
                    for (run, count) in counts.iter().enumerate() {
                        running += count;
                        delimiters[run] = running;
                    }

                    let mut cursors = [0u32; NUM_TERRITORIAL_STATES];
                    for run in 1..NUM_TERRITORIAL_STATES {
                        cursors[run] = delimiters[run - 1];
                    }

                    let mut territory = territory_window.unit_mut(i);
                    for record in &scratch {
                        let run = record.state.tag() as usize;
                        synapse_layout.write(&mut territory, cursors[run] as usize, record);
                        cursors[run] += 1;
                    }

                    let mut cell = cell_window.unit_mut(i);
                    cell_layout.write_delimiters(&mut cell, &delimiters);
                }
            });
        }
    });

    debug!(kind, num_cells, "fill_delimiters_of_kind");
    debug_assert_eq!(tissue.validate_territories_of_kind(kind), Ok(()));
}

/// Neighbourhood and weight distribution for
/// [`fill_coords_of_source_cells_of_synapses_in_tissue`].
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NeighbourhoodSpec {
    /// Maximum absolute lateral shift of a source cell from its target, per
    /// axis.
    pub max_shift_x: u8,
    pub max_shift_y: u8,
    /// Initial synapse weights are drawn uniformly from this range.
    pub weight_low: f32,
    pub weight_high: f32,
}

/// Assign a source-cell reference to every used synapse slot of every cell.
///
/// Slots feeding from a tissue kind get the cell's own lateral position
/// shifted within the neighbourhood (clipped or wrapped per axis) and a
/// columnar coordinate drawn inside the source kind's segment. Slots feeding
/// from a sensory kind get a uniformly drawn sensory cell of that kind.
/// Territorial states are preserved.
///
/// Deterministic for a fixed `seed` regardless of `max_threads`.
pub fn fill_coords_of_source_cells_of_synapses_in_tissue(
    tissue: &mut DynamicTissue,
    areas: &TargetAreas,
    neighbourhood: &NeighbourhoodSpec,
    seed: u64,
    max_threads: usize,
) {
    let geometry = tissue.geometry_handle();
    areas.assert_matches(&geometry);
    let cell_layout = tissue.cell_layout();
    let synapse_layout = tissue.synapse_layout();
    let num_tissue_kinds = geometry.num_tissue_kinds();

    for kind in 0..num_tissue_kinds {
        let capacity = geometry.territory_capacity(kind);
        let prefix = group_prefix(areas, kind, capacity);
        let num_cells = geometry.num_cells_of_kind(kind);
        let ranges = partition_ranges(num_cells, max_threads);
        let stream_base = geometry.kind_base(kind) as u64;

        let (cells, territories) = tissue.kind_storage_mut(kind);
        let cells: &BitArray = cells;
        let territory_windows = territories.split_units_mut(&ranges);
        let geometry = &geometry;
        let prefix = &prefix;

        thread::scope(|scope| {
            for mut territory_window in territory_windows {
                scope.spawn(move || {
                    let first = territory_window.first_unit();
                    for i in first..first + territory_window.num_units() {
                        let used = cell_layout.read_delimiters(&cells.unit(i))[NUM_DELIMITERS - 1];
                        let own = geometry.coords_of_kind_index(kind, i);
                        let mut rng = Prng::for_stream(seed, stream_base + i as u64);
                        let mut territory = territory_window.unit_mut(i);

                        for source_kind in 0..areas_source_kinds(prefix) {
                            let lo = prefix[source_kind].min(used);
                            let hi = prefix[source_kind + 1].min(used);
                            for slot in lo..hi {
                                let state =
                                    synapse_layout.read_state(&territory.as_ref(), slot as usize);
                                let record = if source_kind < num_tissue_kinds {
                                    let segment = geometry.columnar_segment(source_kind);
                                    if segment.is_empty() {
                                        continue;
                                    }
                                    let source_x = geometry.clip_tissue_coordinate(
                                        own.x as i64 + rng.gen_shift(neighbourhood.max_shift_x),
                                        Axis::X,
                                    );
                                    let source_y = geometry.clip_tissue_coordinate(
                                        own.y as i64 + rng.gen_shift(neighbourhood.max_shift_y),
                                        Axis::Y,
                                    );
                                    let source_ref = segment.start
                                        + rng.gen_range_usize(0, segment.len()) as u32;
                                    SynapseRecord {
                                        source_x,
                                        source_y,
                                        source_ref,
                                        state,
                                        weight: rng.gen_range_f32(
                                            neighbourhood.weight_low,
                                            neighbourhood.weight_high,
                                        ),
                                    }
                                } else {
                                    let range =
                                        geometry.sensory_range(source_kind - num_tissue_kinds);
                                    if range.is_empty() {
                                        continue;
                                    }
                                    let sensory_index =
                                        range.start + rng.gen_range_usize(0, range.len()) as u32;
                                    SynapseRecord {
                                        source_x: 0,
                                        source_y: 0,
                                        source_ref: sensory_source_ref(geometry, sensory_index),
                                        state,
                                        weight: rng.gen_range_f32(
                                            neighbourhood.weight_low,
                                            neighbourhood.weight_high,
                                        ),
                                    }
                                };
                                synapse_layout.write(&mut territory, slot as usize, &record);
                            }
                        }
                    }
                });
            }
        });
    }

    debug!(seed, "fill_coords_of_source_cells_of_synapses_in_tissue");
    debug_assert_eq!(tissue.validate_territories(), Ok(()));
}

#[inline]
fn areas_source_kinds(prefix: &[u32]) -> usize {
    prefix.len() - 1
}

struct MigrationIntent {
    dest_kind: usize,
    dest_index: usize,
    record: SynapseRecord,
}

/// Relocate every synapse in a migration run into the neighbouring cell's
/// territory, converting it to `SignalDelivery` there.
///
/// A migration write touches two cells, so the pass runs in two phases under
/// a barrier: phase 1 (per-cell ownership) extracts outgoing records into
/// intent buffers and compacts the source territory; phase 2
/// (per-destination ownership) appends incoming records. A migration that
/// clips onto its own cell (non-toroidal border) settles in place. Full
/// destinations drop records silently, reported in [`SpreadStats::dropped`].
pub fn spread_synapses_into_local_neighbourhoods(
    tissue: &mut DynamicTissue,
    max_threads: usize,
) -> SpreadStats {
    let geometry = tissue.geometry_handle();
    let cell_layout = tissue.cell_layout();
    let synapse_layout = tissue.synapse_layout();

    // Phase 1: per-cell extraction. Worker vectors are concatenated in range
    // order, so the combined intent list is in global (kind, cell, run, slot)
    // order no matter how many threads ran.
    let mut intents: Vec<MigrationIntent> = Vec::new();
    let mut stats = SpreadStats::default();
    for kind in 0..geometry.num_tissue_kinds() {
        let num_cells = geometry.num_cells_of_kind(kind);
        let ranges = partition_ranges(num_cells, max_threads);
        let (cells, territories) = tissue.kind_storage_mut(kind);
        let cell_windows = cells.split_units_mut(&ranges);
        let territory_windows = territories.split_units_mut(&ranges);
        let geometry = &geometry;

        let results = thread::scope(|scope| {
            let mut handles = Vec::new();
            for (mut cell_window, mut territory_window) in
                cell_windows.into_iter().zip(territory_windows)
            {
                handles.push(scope.spawn(move || {
                    let mut outgoing: Vec<MigrationIntent> = Vec::new();
                    let mut migrated = 0u64;
                    let mut redelivered = 0u64;
                    let first = cell_window.first_unit();
                    for i in first..first + cell_window.num_units() {
                        let delimiters = cell_layout.read_delimiters(&cell_window.unit(i));
                        let signal_end = delimiters[0];
                        let mut appended = 0u32;
                        {
                            let mut territory = territory_window.unit_mut(i);
                            let own = geometry.coords_of_kind_index(kind, i);
                            for run in 1..NUM_TERRITORIAL_STATES {
                                let state = TerritorialState::ALL[run];
                                let (axis, step) =
                                    state.migration_step().expect("migration run");
                                for slot in delimiters[run - 1]..delimiters[run] {
                                    let mut record =
                                        synapse_layout.read(&territory.as_ref(), slot as usize);
                                    record.state = TerritorialState::SignalDelivery;
                                    let dest = step_along(geometry, own, axis, step);
                                    if dest == own {
                                        // Clipped back onto the border cell:
                                        // settle in place.
                                        synapse_layout.write(
                                            &mut territory,
                                            (signal_end + appended) as usize,
                                            &record,
                                        );
                                        appended += 1;
                                        redelivered += 1;
                                    } else {
                                        let (dest_kind, dest_index) =
                                            geometry.cell_index_in_kind(dest);
                                        outgoing.push(MigrationIntent {
                                            dest_kind,
                                            dest_index,
                                            record,
                                        });
                                        migrated += 1;
                                    }
                                }
                            }
                        }
                        let mut cell = cell_window.unit_mut(i);
                        cell_layout.write_uniform_delimiters(&mut cell, signal_end + appended);
                    }
                    (outgoing, migrated, redelivered)
                }));
            }
            handles
                .into_iter()
                .map(|h| h.join().expect("spread worker panicked"))
                .collect::<Vec<_>>()
        });

        for (outgoing, migrated, redelivered) in results {
            intents.extend(outgoing);
            stats.migrated += migrated;
            stats.redelivered += redelivered;
        }
    }

    // Barrier: group intents by destination. Vec order per destination
    // preserves the global origin order, keeping phase 2 deterministic.
    let mut routing: HashMap<(usize, usize), Vec<SynapseRecord>> = HashMap::new();
    for intent in intents {
        routing
            .entry((intent.dest_kind, intent.dest_index))
            .or_default()
            .push(intent.record);
    }
    let routing = &routing;

    // Phase 2: per-destination append.
    for kind in 0..geometry.num_tissue_kinds() {
        let capacity = geometry.territory_capacity(kind);
        let num_cells = geometry.num_cells_of_kind(kind);
        let ranges = partition_ranges(num_cells, max_threads);
        let (cells, territories) = tissue.kind_storage_mut(kind);
        let cell_windows = cells.split_units_mut(&ranges);
        let territory_windows = territories.split_units_mut(&ranges);

        let dropped: u64 = thread::scope(|scope| {
            let mut handles = Vec::new();
            for (mut cell_window, mut territory_window) in
                cell_windows.into_iter().zip(territory_windows)
            {
                handles.push(scope.spawn(move || {
                    let mut dropped = 0u64;
                    let first = cell_window.first_unit();
                    for i in first..first + cell_window.num_units() {
                        let Some(incoming) = routing.get(&(kind, i)) else {
                            continue;
                        };
                        let mut used =
                            cell_layout.read_delimiters(&cell_window.unit(i))[NUM_DELIMITERS - 1];
                        {
                            let mut territory = territory_window.unit_mut(i);
                            for record in incoming {
                                if used < capacity {
                                    synapse_layout.write(&mut territory, used as usize, record);
                                    used += 1;
                                } else {
                                    dropped += 1;
                                }
                            }
                        }
                        let mut cell = cell_window.unit_mut(i);
                        cell_layout.write_uniform_delimiters(&mut cell, used);
                    }
                    dropped
                }));
            }
            handles
                .into_iter()
                .map(|h| h.join().expect("spread worker panicked"))
                .sum()
        });
        stats.dropped += dropped;
    }

    debug!(
        migrated = stats.migrated,
        redelivered = stats.redelivered,
        dropped = stats.dropped,
        "spread_synapses_into_local_neighbourhoods"
    );
    debug_assert_eq!(tissue.validate_territories(), Ok(()));
    stats
}

fn step_along(geometry: &StaticTissue, coords: CellCoords, axis: Axis, step: i64) -> CellCoords {
    let mut out = coords;
    match axis {
        Axis::X => out.x = geometry.clip_tissue_coordinate(coords.x as i64 + step, Axis::X),
        Axis::Y => out.y = geometry.clip_tissue_coordinate(coords.y as i64 + step, Axis::Y),
        Axis::Columnar => {
            out.columnar =
                geometry.clip_tissue_coordinate(coords.columnar as i64 + step, Axis::Columnar)
        }
    }
    out
}

/// Wiring of one sensory kind into one tissue kind around an area centre.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SensoryLinkSpec {
    pub sensory_kind: usize,
    pub target_kind: usize,
    pub centre_x: u32,
    pub centre_y: u32,
    /// Lateral spread of targets around the centre, in cells.
    pub radius: f32,
    /// Tissue cells wired per sensory cell.
    pub links_per_cell: u32,
    pub weight: f32,
}

/// Rewire placeholder slots so tissue cells near each spec's area centre feed
/// from concrete sensory cells.
///
/// Phase 1 (per sensory cell) samples target cells polar-around the centre;
/// phase 2 (per destination cell) rebinds that cell's slots reserved for the
/// sensory kind, cycling through the group. Cells without a matching slot
/// group drop the link silently.
pub fn add_links_from_sensory_cells(
    tissue: &mut DynamicTissue,
    areas: &TargetAreas,
    specs: &[SensoryLinkSpec],
    seed: u64,
    max_threads: usize,
) -> LinkStats {
    let geometry = tissue.geometry_handle();
    areas.assert_matches(&geometry);
    let cell_layout = tissue.cell_layout();
    let synapse_layout = tissue.synapse_layout();
    let num_tissue_kinds = geometry.num_tissue_kinds();
    let num_sensory_kinds = geometry.num_sensory_kinds();

    // (dest_kind, dest_index, sensory_kind, source_ref, weight), in global
    // (spec, sensory cell, link) order.
    let mut intents: Vec<(usize, usize, usize, u32, f32)> = Vec::new();
    for (spec_index, spec) in specs.iter().enumerate() {
        assert!(spec.sensory_kind < num_sensory_kinds, "unconfigured sensory kind");
        assert!(spec.target_kind < num_tissue_kinds, "unconfigured tissue kind");
        let sensory_cells = geometry.sensory_range(spec.sensory_kind);
        let segment = geometry.columnar_segment(spec.target_kind);
        if sensory_cells.is_empty() || segment.is_empty() {
            continue;
        }

        let count = sensory_cells.len();
        let ranges = partition_ranges(count, max_threads);
        let geometry = &geometry;
        let sensory_cells = &sensory_cells;
        let segment = &segment;
        let results = thread::scope(|scope| {
            let mut handles = Vec::new();
            for range in &ranges {
                let range = range.clone();
                handles.push(scope.spawn(move || {
                    let mut out = Vec::new();
                    for local in range {
                        let mut rng = Prng::for_stream(
                            seed,
                            ((spec_index as u64) << 32) | local as u64,
                        );
                        let sensory_index = sensory_cells.start + local as u32;
                        for _ in 0..spec.links_per_cell {
                            let angle = rng.gen_range_f32(0.0, core::f32::consts::TAU);
                            let radius = rng.gen_range_f32(0.0, spec.radius);
                            let (x, y) = geometry.from_polar_to_tissue_coordinates(
                                spec.centre_x,
                                spec.centre_y,
                                angle,
                                radius,
                            );
                            let columnar =
                                segment.start + rng.gen_range_usize(0, segment.len()) as u32;
                            let (dest_kind, dest_index) = geometry
                                .cell_index_in_kind(CellCoords::new(x, y, columnar));
                            out.push((
                                dest_kind,
                                dest_index,
                                spec.sensory_kind,
                                sensory_source_ref(geometry, sensory_index),
                                spec.weight,
                            ));
                        }
                    }
                    out
                }));
            }
            handles
                .into_iter()
                .map(|h| h.join().expect("link worker panicked"))
                .collect::<Vec<_>>()
        });
        for out in results {
            intents.extend(out);
        }
    }

    // Barrier: group by destination, preserving origin order per cell.
    let mut routing: HashMap<(usize, usize), Vec<(usize, u32, f32)>> = HashMap::new();
    for (dest_kind, dest_index, sensory_kind, source_ref, weight) in intents {
        routing
            .entry((dest_kind, dest_index))
            .or_default()
            .push((sensory_kind, source_ref, weight));
    }
    let routing = &routing;

    let mut stats = LinkStats::default();
    for kind in 0..num_tissue_kinds {
        let capacity = geometry.territory_capacity(kind);
        let prefix = group_prefix(areas, kind, capacity);
        let num_cells = geometry.num_cells_of_kind(kind);
        let ranges = partition_ranges(num_cells, max_threads);
        let (cells, territories) = tissue.kind_storage_mut(kind);
        let cells: &BitArray = cells;
        let territory_windows = territories.split_units_mut(&ranges);
        let prefix = &prefix;

        let results = thread::scope(|scope| {
            let mut handles = Vec::new();
            for mut territory_window in territory_windows {
                handles.push(scope.spawn(move || {
                    let mut local = LinkStats::default();
                    let mut cursors = vec![0u32; num_sensory_kinds];
                    let first = territory_window.first_unit();
                    for i in first..first + territory_window.num_units() {
                        let Some(incoming) = routing.get(&(kind, i)) else {
                            continue;
                        };
                        let used = cell_layout.read_delimiters(&cells.unit(i))[NUM_DELIMITERS - 1];
                        let mut territory = territory_window.unit_mut(i);
                        cursors.iter_mut().for_each(|c| *c = 0);
                        for &(sensory_kind, source_ref, weight) in incoming {
                            let group = num_tissue_kinds + sensory_kind;
                            let lo = prefix[group].min(used);
                            let hi = prefix[group + 1].min(used);
                            if lo == hi {
                                local.dropped += 1;
                                continue;
                            }
                            let slot = lo + cursors[sensory_kind] % (hi - lo);
                            cursors[sensory_kind] += 1;
                            let state =
                                synapse_layout.read_state(&territory.as_ref(), slot as usize);
                            synapse_layout.write(
                                &mut territory,
                                slot as usize,
                                &SynapseRecord {
                                    source_x: 0,
                                    source_y: 0,
                                    source_ref,
                                    state,
                                    weight,
                                },
                            );
                            local.linked += 1;
                        }
                    }
                    local
                }));
            }
            handles
                .into_iter()
                .map(|h| h.join().expect("link worker panicked"))
                .collect::<Vec<_>>()
        });
        for local in results {
            stats.linked += local.linked;
            stats.dropped += local.dropped;
        }
    }

    debug!(linked = stats.linked, dropped = stats.dropped, "add_links_from_sensory_cells");
    debug_assert_eq!(tissue.validate_territories(), Ok(()));
    stats
}

/// Wiring of one muscle's input synapses around an area centre.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MuscleLinkSpec {
    pub source_kind: usize,
    pub centre_x: u32,
    pub centre_y: u32,
    pub radius: f32,
    pub weight: f32,
}

/// Assign source cells to every synapse-to-muscle record, one spec per
/// muscle cell.
///
/// Each record is owned by exactly one muscle, so the pass is a plain
/// parallel-for over muscles; no two-phase split is needed.
pub fn add_links_to_synapses_to_muscles(
    tissue: &mut DynamicTissue,
    specs: &[MuscleLinkSpec],
    seed: u64,
    max_threads: usize,
) {
    let geometry = tissue.geometry_handle();
    assert_eq!(
        specs.len(),
        geometry.num_muscle_cells() as usize,
        "one muscle-link spec per muscle cell"
    );
    for spec in specs {
        assert!(
            spec.source_kind < geometry.num_tissue_kinds(),
            "unconfigured tissue kind"
        );
    }
    let muscle_layout = tissue.muscle_synapse_layout();
    let synapses_per_muscle = geometry.synapses_per_muscle() as usize;
    if synapses_per_muscle == 0 || specs.is_empty() {
        return;
    }

    let muscle_ranges = partition_ranges(specs.len(), max_threads);
    let unit_ranges: Vec<Range<usize>> = muscle_ranges
        .iter()
        .map(|r| r.start * synapses_per_muscle..r.end * synapses_per_muscle)
        .collect();
    let windows = tissue
        .synapses_to_muscles_array_mut()
        .split_units_mut(&unit_ranges);
    let geometry = &geometry;

    thread::scope(|scope| {
        for (muscle_range, mut window) in muscle_ranges.into_iter().zip(windows) {
            scope.spawn(move || {
                for muscle in muscle_range {
                    let spec = &specs[muscle];
                    let segment = geometry.columnar_segment(spec.source_kind);
                    if segment.is_empty() {
                        continue;
                    }
                    let mut rng = Prng::for_stream(seed, muscle as u64);
                    for s in 0..synapses_per_muscle {
                        let angle = rng.gen_range_f32(0.0, core::f32::consts::TAU);
                        let radius = rng.gen_range_f32(0.0, spec.radius);
                        let (x, y) = geometry.from_polar_to_tissue_coordinates(
                            spec.centre_x,
                            spec.centre_y,
                            angle,
                            radius,
                        );
                        let columnar = segment.start + rng.gen_range_usize(0, segment.len()) as u32;
                        let mut unit = window.unit_mut(muscle * synapses_per_muscle + s);
                        muscle_layout.write(
                            &mut unit,
                            &MuscleSynapseRecord {
                                source_x: x,
                                source_y: y,
                                source_ref: columnar,
                                weight: spec.weight,
                            },
                        );
                    }
                }
            });
        }
    });

    debug!(muscles = specs.len(), "add_links_to_synapses_to_muscles");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{
        SensoryKindConfig, TissueConfig, TissueKindConfig, TransitionConfig,
    };
    use crate::state::SourceRef;
    use std::sync::Arc;

    fn geometry_3x3() -> Arc<StaticTissue> {
        Arc::new(
            StaticTissue::new(TissueConfig {
                cells_along_x: 3,
                cells_along_y: 3,
                toroidal_x: false,
                toroidal_y: false,
                toroidal_columnar: false,
                tissue_kinds: vec![TissueKindConfig {
                    cells_along_columnar: 1,
                    territory_capacity: 4,
                }],
                sensory_kinds: vec![SensoryKindConfig { num_cells: 4 }],
                num_muscle_cells: 2,
                synapses_per_muscle: 3,
                transition: TransitionConfig::default(),
            })
            .unwrap(),
        )
    }

    fn geometry_two_kinds() -> Arc<StaticTissue> {
        Arc::new(
            StaticTissue::new(TissueConfig {
                cells_along_x: 4,
                cells_along_y: 3,
                toroidal_x: true,
                toroidal_y: false,
                toroidal_columnar: false,
                tissue_kinds: vec![
                    TissueKindConfig {
                        cells_along_columnar: 2,
                        territory_capacity: 6,
                    },
                    TissueKindConfig {
                        cells_along_columnar: 1,
                        territory_capacity: 5,
                    },
                ],
                sensory_kinds: vec![SensoryKindConfig { num_cells: 6 }],
                num_muscle_cells: 3,
                synapses_per_muscle: 2,
                transition: TransitionConfig::default(),
            })
            .unwrap(),
        )
    }

    fn demo_areas(geometry: &StaticTissue) -> TargetAreas {
        let mut areas = TargetAreas::new(geometry);
        for target in 0..areas.num_target_kinds() {
            for source in 0..areas.num_source_kinds() {
                areas.set(target, source, 1 + ((target + source) % 3) as u32);
            }
        }
        areas
    }

    #[test]
    fn partition_covers_everything_without_overlap() {
        for (n, t) in [(0usize, 4usize), (1, 1), (10, 3), (10, 64), (7, 7)] {
            let ranges = partition_ranges(n, t);
            let mut covered = 0;
            for r in &ranges {
                assert_eq!(r.start, covered);
                assert!(r.end > r.start);
                covered = r.end;
            }
            assert_eq!(covered, n);
            assert!(ranges.len() <= t.max(1));
        }
        assert_eq!(partition_ranges(5, 0).len(), 1);
    }

    #[test]
    fn small_grid_fills_two_sensory_synapses_per_cell() {
        // 3x3x1 grid, capacity 4, two synapses requested from the sensory
        // kind: every delimiter lands on 2 and nothing migrates.
        let geometry = geometry_3x3();
        let mut tissue = DynamicTissue::new(Arc::clone(&geometry));
        let mut areas = TargetAreas::new(&geometry);
        areas.set(0, 1, 2); // source column 1 is the sensory kind
        let stats = fill_territories(&mut tissue, &areas, 4);

        assert_eq!(stats.cells, 9);
        assert_eq!(stats.synapses, 18);
        assert_eq!(stats.saturated_cells, 0);
        for x in 0..3 {
            for y in 0..3 {
                let delimiters = tissue.delimiters_of_cell(CellCoords::new(x, y, 0));
                assert_eq!(delimiters, [2; NUM_DELIMITERS]);
            }
        }
        assert_eq!(
            tissue.count_synapses_in_state(TerritorialState::SignalDelivery),
            18
        );
        assert_eq!(tissue.validate_territories(), Ok(()));
    }

    #[test]
    fn requested_totals_saturate_at_capacity() {
        let geometry = geometry_3x3();
        let mut tissue = DynamicTissue::new(Arc::clone(&geometry));
        let mut areas = TargetAreas::new(&geometry);
        areas.set(0, 0, 3);
        areas.set(0, 1, 3); // 6 requested, capacity 4
        let stats = fill_territories(&mut tissue, &areas, 2);
        assert_eq!(stats.saturated_cells, 9);
        for x in 0..3 {
            for y in 0..3 {
                let delimiters = tissue.delimiters_of_cell(CellCoords::new(x, y, 0));
                assert_eq!(delimiters[NUM_DELIMITERS - 1], 4);
            }
        }
    }

    #[test]
    #[should_panic]
    fn mismatched_matrix_dimensions_are_fatal() {
        let geometry = geometry_3x3();
        let other = geometry_two_kinds();
        let mut tissue = DynamicTissue::new(geometry);
        let areas = TargetAreas::new(&other);
        fill_territories(&mut tissue, &areas, 1);
    }

    fn state_bytes(tissue: &DynamicTissue) -> Vec<u8> {
        let mut bytes = Vec::new();
        crate::snapshot::save_state_to(tissue, &mut bytes).unwrap();
        bytes
    }

    #[test]
    fn construction_passes_are_thread_count_invariant() {
        let geometry = geometry_two_kinds();
        let areas = demo_areas(&geometry);
        let neighbourhood = NeighbourhoodSpec {
            max_shift_x: 2,
            max_shift_y: 1,
            weight_low: -0.5,
            weight_high: 0.5,
        };

        let build = |threads: usize| {
            let mut tissue = DynamicTissue::new(Arc::clone(&geometry));
            fill_territories(&mut tissue, &areas, threads);
            fill_coords_of_source_cells_of_synapses_in_tissue(
                &mut tissue,
                &areas,
                &neighbourhood,
                0xFEED,
                threads,
            );
            fill_delimiters_between_territorial_lists(&mut tissue, threads);
            assert_eq!(tissue.validate_territories(), Ok(()));
            state_bytes(&tissue)
        };

        let reference = build(1);
        assert_eq!(reference, build(8));
        assert_eq!(reference, build(64));
    }

    #[test]
    fn filled_sources_stay_inside_their_kind() {
        let geometry = geometry_two_kinds();
        let mut tissue = DynamicTissue::new(Arc::clone(&geometry));
        let areas = demo_areas(&geometry);
        fill_territories(&mut tissue, &areas, 3);
        fill_coords_of_source_cells_of_synapses_in_tissue(
            &mut tissue,
            &areas,
            &NeighbourhoodSpec {
                max_shift_x: 1,
                max_shift_y: 1,
                weight_low: 0.0,
                weight_high: 1.0,
            },
            7,
            3,
        );

        for kind in 0..geometry.num_tissue_kinds() {
            let capacity = geometry.territory_capacity(kind);
            let prefix = group_prefix(&areas, kind, capacity);
            for index in 0..geometry.num_cells_of_kind(kind) {
                let coords = geometry.coords_of_kind_index(kind, index);
                let used = tissue.delimiters_of_cell(coords)[NUM_DELIMITERS - 1];
                for source_kind in 0..areas.num_source_kinds() {
                    let lo = prefix[source_kind].min(used);
                    let hi = prefix[source_kind + 1].min(used);
                    for slot in lo..hi {
                        let record = tissue.synapse_record(coords, slot);
                        match record.source(&geometry) {
                            SourceRef::Tissue(source) => {
                                assert!(source_kind < geometry.num_tissue_kinds());
                                assert_eq!(
                                    geometry.kind_of_columnar(source.columnar),
                                    source_kind
                                );
                            }
                            SourceRef::Sensory(index) => {
                                let sensory_kind = source_kind - geometry.num_tissue_kinds();
                                assert!(geometry.sensory_range(sensory_kind).contains(&index));
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn delimiters_regroup_mixed_tags() {
        let geometry = geometry_3x3();
        let mut tissue = DynamicTissue::new(Arc::clone(&geometry));
        let mut areas = TargetAreas::new(&geometry);
        areas.set(0, 0, 4);
        fill_territories(&mut tissue, &areas, 1);

        // Tag slots out of order; grouping is broken until the delimiters
        // pass runs.
        let coords = CellCoords::new(1, 1, 0);
        for (slot, state) in [
            (0, TerritorialState::MigrateYUp),
            (1, TerritorialState::SignalDelivery),
            (2, TerritorialState::MigrateYUp),
            (3, TerritorialState::MigrateColumnarDown),
        ] {
            let mut record = tissue.synapse_record(coords, slot);
            record.state = state;
            record.weight = slot as f32;
            tissue.set_synapse_record(coords, slot, &record);
        }
        assert!(tissue.validate_territories().is_err());

        fill_delimiters_between_territorial_lists(&mut tissue, 2);
        assert_eq!(tissue.validate_territories(), Ok(()));
        let delimiters = tissue.delimiters_of_cell(coords);
        assert_eq!(delimiters, [1, 1, 1, 3, 3, 3, 4]);
        // Regrouping is stable: the two MigrateYUp records keep their order.
        assert_eq!(tissue.synapse_record(coords, 0).weight, 1.0);
        assert_eq!(tissue.synapse_record(coords, 1).weight, 0.0);
        assert_eq!(tissue.synapse_record(coords, 2).weight, 2.0);
        assert_eq!(tissue.synapse_record(coords, 3).weight, 3.0);
    }

    #[test]
    fn spread_conserves_synapses() {
        let geometry = geometry_3x3();
        let mut tissue = DynamicTissue::new(Arc::clone(&geometry));
        let mut areas = TargetAreas::new(&geometry);
        areas.set(0, 0, 2);
        fill_territories(&mut tissue, &areas, 2);

        // Mark one slot per cell to migrate +x.
        for x in 0..3 {
            for y in 0..3 {
                let coords = CellCoords::new(x, y, 0);
                let mut record = tissue.synapse_record(coords, 0);
                record.state = TerritorialState::MigrateXUp;
                tissue.set_synapse_record(coords, 0, &record);
            }
        }
        fill_delimiters_between_territorial_lists(&mut tissue, 2);

        let before_total = tissue.count_synapses_in_state(TerritorialState::SignalDelivery)
            + tissue.count_synapses_in_state(TerritorialState::MigrateXUp);
        assert_eq!(before_total, 18);

        let stats = spread_synapses_into_local_neighbourhoods(&mut tissue, 4);
        // x = 2 clamps onto itself on the non-toroidal axis.
        assert_eq!(stats.migrated, 6);
        assert_eq!(stats.redelivered, 3);
        assert_eq!(stats.dropped, 0);
        assert_eq!(
            tissue.count_synapses_in_state(TerritorialState::SignalDelivery),
            before_total
        );
        assert_eq!(tissue.validate_territories(), Ok(()));

        // Column x=0 lost its migrating slot, column x=1 got one back,
        // column x=2 kept the redelivered one and gained one.
        for y in 0..3 {
            assert_eq!(
                tissue.delimiters_of_cell(CellCoords::new(0, y, 0))[NUM_DELIMITERS - 1],
                1
            );
            assert_eq!(
                tissue.delimiters_of_cell(CellCoords::new(1, y, 0))[NUM_DELIMITERS - 1],
                2
            );
            assert_eq!(
                tissue.delimiters_of_cell(CellCoords::new(2, y, 0))[NUM_DELIMITERS - 1],
                3
            );
        }
    }

    #[test]
    fn spread_is_thread_count_invariant() {
        let geometry = geometry_two_kinds();
        let areas = demo_areas(&geometry);

        let build = |threads: usize| {
            let mut tissue = DynamicTissue::new(Arc::clone(&geometry));
            fill_territories(&mut tissue, &areas, threads);
            fill_coords_of_source_cells_of_synapses_in_tissue(
                &mut tissue,
                &areas,
                &NeighbourhoodSpec {
                    max_shift_x: 1,
                    max_shift_y: 1,
                    weight_low: 0.0,
                    weight_high: 1.0,
                },
                3,
                threads,
            );
            // Deterministically mark a third of the slots for migration.
            for kind in 0..geometry.num_tissue_kinds() {
                for index in 0..geometry.num_cells_of_kind(kind) {
                    let coords = geometry.coords_of_kind_index(kind, index);
                    let used = tissue.delimiters_of_cell(coords)[NUM_DELIMITERS - 1];
                    for slot in 0..used {
                        if (slot + index as u32) % 3 == 0 {
                            let mut record = tissue.synapse_record(coords, slot);
                            record.state = TerritorialState::ALL
                                [1 + ((slot as usize + index) % (NUM_TERRITORIAL_STATES - 1))];
                            tissue.set_synapse_record(coords, slot, &record);
                        }
                    }
                }
            }
            fill_delimiters_between_territorial_lists(&mut tissue, threads);
            spread_synapses_into_local_neighbourhoods(&mut tissue, threads);
            state_bytes(&tissue)
        };

        let reference = build(1);
        assert_eq!(reference, build(8));
        assert_eq!(reference, build(64));
    }

    #[test]
    fn toroidal_migration_wraps_across_the_border() {
        let config = TissueConfig {
            cells_along_x: 3,
            cells_along_y: 3,
            toroidal_x: true,
            toroidal_y: false,
            toroidal_columnar: false,
            tissue_kinds: vec![TissueKindConfig {
                cells_along_columnar: 1,
                territory_capacity: 4,
            }],
            sensory_kinds: vec![],
            num_muscle_cells: 0,
            synapses_per_muscle: 0,
            transition: TransitionConfig::default(),
        };
        let geometry = Arc::new(StaticTissue::new(config).unwrap());
        let mut tissue = DynamicTissue::new(Arc::clone(&geometry));
        let mut areas = TargetAreas::new(&geometry);
        areas.set(0, 0, 1);
        fill_territories(&mut tissue, &areas, 1);

        let border = CellCoords::new(2, 1, 0);
        let mut record = tissue.synapse_record(border, 0);
        record.state = TerritorialState::MigrateXUp;
        record.weight = 9.0;
        tissue.set_synapse_record(border, 0, &record);
        fill_delimiters_of_kind(&mut tissue, 0, 1);

        let stats = spread_synapses_into_local_neighbourhoods(&mut tissue, 2);
        assert_eq!(stats.migrated, 1);
        assert_eq!(stats.redelivered, 0);

        // Wrapped to x = 0 and settled there.
        let landed = CellCoords::new(0, 1, 0);
        assert_eq!(tissue.delimiters_of_cell(landed)[NUM_DELIMITERS - 1], 2);
        assert_eq!(tissue.synapse_record(landed, 1).weight, 9.0);
    }

    #[test]
    fn full_destinations_drop_migrations_silently() {
        let geometry = geometry_3x3();
        let mut tissue = DynamicTissue::new(Arc::clone(&geometry));
        let mut areas = TargetAreas::new(&geometry);
        areas.set(0, 0, 4); // capacity 4: every territory starts full
        fill_territories(&mut tissue, &areas, 1);

        let coords = CellCoords::new(0, 0, 0);
        let mut record = tissue.synapse_record(coords, 0);
        record.state = TerritorialState::MigrateXUp;
        tissue.set_synapse_record(coords, 0, &record);
        fill_delimiters_of_kind(&mut tissue, 0, 1);

        let stats = spread_synapses_into_local_neighbourhoods(&mut tissue, 1);
        assert_eq!(stats.migrated, 1);
        assert_eq!(stats.dropped, 1);
        assert_eq!(tissue.validate_territories(), Ok(()));
    }

    #[test]
    fn sensory_links_rebind_reserved_slots() {
        let geometry = geometry_3x3();
        let mut tissue = DynamicTissue::new(Arc::clone(&geometry));
        let mut areas = TargetAreas::new(&geometry);
        areas.set(0, 0, 1);
        areas.set(0, 1, 2); // two slots per cell reserved for the sensory kind
        fill_territories(&mut tissue, &areas, 2);

        let specs = [SensoryLinkSpec {
            sensory_kind: 0,
            target_kind: 0,
            centre_x: 1,
            centre_y: 1,
            radius: 2.0,
            links_per_cell: 3,
            weight: 0.25,
        }];
        let stats = add_links_from_sensory_cells(&mut tissue, &areas, &specs, 11, 2);
        assert_eq!(stats.linked + stats.dropped, 4 * 3);
        assert!(stats.linked > 0);

        // Every rebound slot references a real sensory cell and sits in the
        // sensory group.
        let mut rebound = 0u64;
        for x in 0..3 {
            for y in 0..3 {
                let coords = CellCoords::new(x, y, 0);
                for slot in 1..3 {
                    let record = tissue.synapse_record(coords, slot);
                    if let SourceRef::Sensory(index) = record.source(&geometry) {
                        assert!(index < geometry.num_sensory_cells());
                        assert_eq!(record.weight, 0.25);
                        rebound += 1;
                    }
                }
            }
        }
        // Cyclic rebinding may hit a slot twice, so unique rebound slots are
        // bounded by the link count.
        assert!(rebound > 0 && rebound <= stats.linked);
        assert_eq!(tissue.validate_territories(), Ok(()));
    }

    #[test]
    fn muscle_links_sample_the_source_kind() {
        let geometry = geometry_two_kinds();
        let mut tissue = DynamicTissue::new(Arc::clone(&geometry));
        let specs = vec![
            MuscleLinkSpec {
                source_kind: 0,
                centre_x: 0,
                centre_y: 0,
                radius: 1.5,
                weight: 0.5,
            };
            3
        ];
        add_links_to_synapses_to_muscles(&mut tissue, &specs, 21, 2);

        for index in 0..geometry.num_synapses_to_muscles() {
            let record = tissue.synapse_to_muscle(index);
            assert!(geometry.columnar_segment(0).contains(&record.source_ref));
            assert!(record.source_x < geometry.cells_along_x());
            assert!(record.source_y < geometry.cells_along_y());
            assert_eq!(record.weight, 0.5);
        }
    }
}
