//! Round-based orchestration between the tissue and an external environment.
//!
//! A round is: (1) the environment callback runs once, writing sensory values
//! and reading the previous round's muscle values through guarded accessors;
//! (2) the tissue transitions: every cell decays and integrates the signal
//! delivered along its settled synapses, using the same disjoint-partition
//! parallel scheme as the connectivity passes; (3) muscle values are
//! recomputed from the synapses feeding them.
//!
//! Sensory and muscle cells are the one genuinely shared resource: the
//! environment may fan its callback out across its own workers. Their
//! accessors therefore synchronize through an [`AccessSync`], which degrades
//! to a no-op when the caller asserts single-threaded access, so the hot path
//! pays nothing unless concurrency is actually requested. Tissue-internal
//! cells are never guarded.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;

use tracing::debug;

use crate::bits::BitArray;
use crate::connectivity::partition_ranges;
use crate::geometry::{CellCoords, StaticTissue, UpdateOrder};
use crate::state::{potential_of_source, DynamicTissue};

/// External collaborator driving the tissue's sensory inputs and consuming
/// its muscle outputs. Called exactly once per round.
pub trait Environment {
    fn compute_next_state_of_sensory_and_muscle_cells(
        &mut self,
        sensory: &SensoryAccess<'_>,
        muscles: &MuscleAccess<'_>,
        max_threads: usize,
    );
}

/// Synchronization policy for environment access to boundary cells.
pub enum AccessSync {
    /// The caller asserts the environment callback touches the accessors
    /// from one thread only. Guard acquisition is a no-op.
    SingleThreaded,
    /// Environment workers may touch the accessors concurrently.
    Locked(Mutex<()>),
}

impl AccessSync {
    pub fn locked() -> Self {
        AccessSync::Locked(Mutex::new(()))
    }

    fn guard(&self) -> Option<MutexGuard<'_, ()>> {
        match self {
            AccessSync::SingleThreaded => None,
            AccessSync::Locked(mutex) => {
                Some(mutex.lock().unwrap_or_else(PoisonError::into_inner))
            }
        }
    }
}

/// Guarded write access to the sensory cells, handed to the environment.
///
/// Values are f32 bit patterns held in atomics, so sharing the accessor
/// across environment workers is sound; the [`AccessSync`] guard adds batch
/// atomicity on top when requested.
pub struct SensoryAccess<'a> {
    sync: &'a AccessSync,
    values: &'a [AtomicU32],
}

impl SensoryAccess<'_> {
    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn set_value(&self, index: usize, value: f32) {
        let _guard = self.sync.guard();
        self.values[index].store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn value(&self, index: usize) -> f32 {
        let _guard = self.sync.guard();
        f32::from_bits(self.values[index].load(Ordering::Relaxed))
    }

    /// Write every sensory value under one guard acquisition.
    pub fn write_all(&self, values: &[f32]) {
        assert_eq!(values.len(), self.values.len(), "sensory value count mismatch");
        let _guard = self.sync.guard();
        for (slot, value) in self.values.iter().zip(values) {
            slot.store(value.to_bits(), Ordering::Relaxed);
        }
    }
}

/// Guarded read access to the muscle cells, handed to the environment.
///
/// Values observed are those published at the end of the previous round.
pub struct MuscleAccess<'a> {
    sync: &'a AccessSync,
    values: &'a [AtomicU32],
}

impl MuscleAccess<'_> {
    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn value(&self, index: usize) -> f32 {
        let _guard = self.sync.guard();
        f32::from_bits(self.values[index].load(Ordering::Relaxed))
    }

    /// Read every muscle value under one guard acquisition.
    pub fn read_all(&self, out: &mut [f32]) {
        assert_eq!(out.len(), self.values.len(), "muscle value count mismatch");
        let _guard = self.sync.guard();
        for (slot, value) in self.values.iter().zip(out) {
            *value = f32::from_bits(slot.load(Ordering::Relaxed));
        }
    }
}

/// Owns a dynamic tissue and drives it round by round against an
/// [`Environment`].
pub struct FeedbackLoop {
    tissue: DynamicTissue,
    sync: AccessSync,
    sensory_staging: Vec<AtomicU32>,
    muscle_staging: Vec<AtomicU32>,
    rounds: u64,
}

impl FeedbackLoop {
    pub fn new(tissue: DynamicTissue, sync: AccessSync) -> Self {
        let sensory_staging = (0..tissue.geometry().num_sensory_cells())
            .map(|i| AtomicU32::new(tissue.sensory_value(i).to_bits()))
            .collect();
        let muscle_staging = (0..tissue.geometry().num_muscle_cells())
            .map(|i| AtomicU32::new(tissue.muscle_value(i).to_bits()))
            .collect();
        Self {
            tissue,
            sync,
            sensory_staging,
            muscle_staging,
            rounds: 0,
        }
    }

    pub fn tissue(&self) -> &DynamicTissue {
        &self.tissue
    }

    pub fn tissue_mut(&mut self) -> &mut DynamicTissue {
        &mut self.tissue
    }

    pub fn into_tissue(self) -> DynamicTissue {
        self.tissue
    }

    pub fn rounds(&self) -> u64 {
        self.rounds
    }

    /// Run one full round. The environment callback sees the muscle values
    /// published at the end of the previous round; the sensory values it
    /// writes feed the transition that follows in this round.
    pub fn run_round(&mut self, environment: &mut dyn Environment, max_threads: usize) {
        let sensory = SensoryAccess {
            sync: &self.sync,
            values: &self.sensory_staging,
        };
        let muscles = MuscleAccess {
            sync: &self.sync,
            values: &self.muscle_staging,
        };
        environment.compute_next_state_of_sensory_and_muscle_cells(&sensory, &muscles, max_threads);

        // Staged sensory input becomes the packed sensory state for this
        // round's transition.
        for (i, slot) in self.sensory_staging.iter().enumerate() {
            self.tissue
                .set_sensory_value(i as u32, f32::from_bits(slot.load(Ordering::Relaxed)));
        }

        transition_cells(&mut self.tissue, max_threads);
        update_muscles(&mut self.tissue, max_threads);

        for (i, slot) in self.muscle_staging.iter().enumerate() {
            slot.store(
                self.tissue.muscle_value(i as u32).to_bits(),
                Ordering::Relaxed,
            );
        }

        self.rounds += 1;
        debug!(rounds = self.rounds, "feedback round complete");
    }
}

/// One potential update for every cell: decay and integration of the signal
/// delivered along the settled synapses, in the configured order.
///
/// All source potentials are read from a snapshot of the previous round, so
/// results are independent of update order across cells and of
/// `max_threads`.
pub fn transition_cells(tissue: &mut DynamicTissue, max_threads: usize) {
    let geometry = tissue.geometry_handle();
    let cell_layout = tissue.cell_layout();
    let synapse_layout = tissue.synapse_layout();
    let transition = *geometry.transition();

    // Kind-major snapshot of every tissue potential, with sensory values
    // appended after all cells.
    let num_cells = geometry.num_cells_total();
    let num_sensory = geometry.num_sensory_cells() as usize;
    let mut snapshot = vec![0f32; num_cells + num_sensory];
    for kind in 0..geometry.num_tissue_kinds() {
        let base = geometry.kind_base(kind);
        let count = geometry.num_cells_of_kind(kind);
        let ranges = partition_ranges(count, max_threads);
        let cells = tissue.cells_array(kind);
        let mut rest = &mut snapshot[base..base + count];
        thread::scope(|scope| {
            for range in &ranges {
                let take = range.end - range.start;
                let (head, tail) = core::mem::take(&mut rest).split_at_mut(take);
                let range = range.clone();
                scope.spawn(move || {
                    for (offset, i) in range.enumerate() {
                        head[offset] = cell_layout.read_potential(&cells.unit(i));
                    }
                });
                rest = tail;
            }
        });
    }
    for i in 0..num_sensory {
        snapshot[num_cells + i] = tissue.sensory_value(i as u32);
    }
    let snapshot = &snapshot;

    for kind in 0..geometry.num_tissue_kinds() {
        let count = geometry.num_cells_of_kind(kind);
        let ranges = partition_ranges(count, max_threads);
        let kind_base = geometry.kind_base(kind);
        let (cells, territories) = tissue.kind_storage_mut(kind);
        let cell_windows = cells.split_units_mut(&ranges);
        let territories: &BitArray = territories;
        let geometry = &geometry;

        thread::scope(|scope| {
            for mut cell_window in cell_windows {
                scope.spawn(move || {
                    let first = cell_window.first_unit();
                    for i in first..first + cell_window.num_units() {
                        let signal_end =
                            cell_layout.read_delimiters(&cell_window.unit(i))[0];
                        let territory = territories.unit(i);
                        let mut delivered = 0f32;
                        for slot in 0..signal_end {
                            let record = synapse_layout.read(&territory, slot as usize);
                            delivered += record.weight
                                * snapshot_potential(
                                    geometry,
                                    snapshot,
                                    record.source_x,
                                    record.source_y,
                                    record.source_ref,
                                );
                        }
                        let own = snapshot[kind_base + i];
                        let next = match transition.order {
                            UpdateOrder::DecayThenDeliver => {
                                own * (1.0 - transition.decay)
                                    + transition.integration_gain * delivered
                            }
                            UpdateOrder::DeliverThenDecay => {
                                (own + transition.integration_gain * delivered)
                                    * (1.0 - transition.decay)
                            }
                        };
                        cell_layout.write_potential(&mut cell_window.unit_mut(i), next);
                    }
                });
            }
        });
    }
}

fn snapshot_potential(
    geometry: &StaticTissue,
    snapshot: &[f32],
    source_x: u32,
    source_y: u32,
    source_ref: u32,
) -> f32 {
    if source_ref < geometry.cells_along_columnar() {
        let (kind, index) =
            geometry.cell_index_in_kind(CellCoords::new(source_x, source_y, source_ref));
        snapshot[geometry.kind_base(kind) + index]
    } else {
        let sensory = (source_ref - geometry.cells_along_columnar()) as usize;
        snapshot[geometry.num_cells_total() + sensory]
    }
}

/// Recompute every muscle value from the synapses feeding it, reading the
/// potentials just written by [`transition_cells`].
pub fn update_muscles(tissue: &mut DynamicTissue, max_threads: usize) {
    let split = tissue.muscle_split();
    let num_muscles = split.geometry.num_muscle_cells() as usize;
    let synapses_per_muscle = split.geometry.synapses_per_muscle() as usize;
    if num_muscles == 0 {
        return;
    }

    let geometry = split.geometry;
    let cell_layout = split.cell_layout;
    let muscle_layout = split.muscle_layout;
    let cells = split.cells;
    let sensory = split.sensory;
    let synapses_to_muscles = split.synapses_to_muscles;

    let ranges = partition_ranges(num_muscles, max_threads);
    let windows = split.muscles.split_units_mut(&ranges);
    thread::scope(|scope| {
        for mut window in windows {
            scope.spawn(move || {
                let first = window.first_unit();
                for muscle in first..first + window.num_units() {
                    let mut value = 0f32;
                    for s in 0..synapses_per_muscle {
                        let record = muscle_layout
                            .read(&synapses_to_muscles.unit(muscle * synapses_per_muscle + s));
                        value += record.weight
                            * potential_of_source(
                                geometry,
                                &cell_layout,
                                cells,
                                sensory,
                                record.source_x,
                                record.source_y,
                                record.source_ref,
                            );
                    }
                    window
                        .unit_mut(muscle)
                        .value_to_bits(value.to_bits() as u64, 0, 32);
                }
            });
        }
    });
}
