//! # neurotissue
//!
//! A bit-packed, multi-threaded cellular neural-tissue engine.
//!
//! A fixed 3D grid of computational cells and the synapses connecting them,
//! stored at sub-byte granularity to stay small at million-cell scale, and
//! updated by parallel passes that produce identical results for any thread
//! count.
//!
//! ## Quick Start
//!
//! ```
//! use neurotissue::prelude::*;
//! use std::sync::Arc;
//!
//! let geometry = Arc::new(
//!     StaticTissue::new(TissueConfig {
//!         cells_along_x: 3,
//!         cells_along_y: 3,
//!         toroidal_x: false,
//!         toroidal_y: false,
//!         toroidal_columnar: false,
//!         tissue_kinds: vec![TissueKindConfig {
//!             cells_along_columnar: 1,
//!             territory_capacity: 4,
//!         }],
//!         sensory_kinds: vec![SensoryKindConfig { num_cells: 2 }],
//!         num_muscle_cells: 1,
//!         synapses_per_muscle: 2,
//!         transition: TransitionConfig::default(),
//!     })
//!     .unwrap(),
//! );
//!
//! let mut tissue = DynamicTissue::new(Arc::clone(&geometry));
//!
//! // Every cell draws two synapses from the sensory kind.
//! let mut areas = TargetAreas::new(&geometry);
//! areas.set(0, 1, 2);
//! fill_territories(&mut tissue, &areas, 4);
//! fill_coords_of_source_cells_of_synapses_in_tissue(
//!     &mut tissue,
//!     &areas,
//!     &NeighbourhoodSpec {
//!         max_shift_x: 1,
//!         max_shift_y: 1,
//!         weight_low: 0.0,
//!         weight_high: 1.0,
//!     },
//!     42,
//!     4,
//! );
//! assert_eq!(tissue.validate_territories(), Ok(()));
//! ```
//!
//! ## Modules
//!
//! - [`bits`]: sub-byte views and the owned bit-array allocation primitive
//! - [`geometry`]: immutable static tissue description
//! - [`state`]: packed, mutable dynamic tissue state
//! - [`connectivity`]: parallel construction and rewiring passes
//! - [`feedback`]: round-based loop against an external environment
//! - [`snapshot`]: chunked LZ4 snapshots and the debug report
//!
//! ## Feature Flags
//!
//! - `serde` (default): serialization support for configuration types

#[path = "core/bits.rs"]
pub mod bits;

#[path = "core/prng.rs"]
pub mod prng;

#[path = "core/geometry.rs"]
pub mod geometry;

#[path = "core/state.rs"]
pub mod state;

#[path = "core/connectivity.rs"]
pub mod connectivity;

#[path = "core/feedback.rs"]
pub mod feedback;

#[path = "core/snapshot.rs"]
pub mod snapshot;

/// Prelude module for convenient imports.
///
/// ```
/// use neurotissue::prelude::*;
/// ```
pub mod prelude {
    pub use crate::connectivity::{
        add_links_from_sensory_cells, add_links_to_synapses_to_muscles,
        fill_coords_of_source_cells_of_synapses_in_tissue,
        fill_delimiters_between_territorial_lists, fill_delimiters_of_kind, fill_territories,
        spread_synapses_into_local_neighbourhoods, FillStats, LinkStats, MuscleLinkSpec,
        NeighbourhoodSpec, SensoryLinkSpec, SpreadStats, TargetAreas,
    };
    pub use crate::feedback::{
        AccessSync, Environment, FeedbackLoop, MuscleAccess, SensoryAccess,
    };
    pub use crate::geometry::{
        Axis, CellCoords, CoordShift, SensoryKindConfig, StaticTissue, TissueConfig,
        TissueError, TissueKindConfig, TransitionConfig, UpdateOrder,
    };
    pub use crate::snapshot::{describe_static_tissue, load_state_from, save_state_to};
    pub use crate::state::{
        DynamicTissue, MuscleSynapseRecord, SourceRef, SynapseRecord, TerritorialState,
    };
}
