//! # snapindex
//!
//! snapindex is an engine for serial diffraction data, written in Rust. It
//! takes a stream of detector snapshots of microcrystals, finds the Bragg
//! peaks in each image, determines the crystal orientation (indexing),
//! predicts every reflection implied by that orientation and integrates
//! their intensities, writing one ordered record per image to a text
//! stream suitable for downstream merging.
//!
//! ## Structure
//!
//! The engine is four subsystems:
//!
//! - the **dispatcher** ([`dispatcher`]): N isolated worker seats, serial
//!   assignment, heartbeat watching with respawn, and a bounded reorder
//!   buffer so the output stream is written in strictly ascending serial
//!   order with back-pressure instead of dropped records;
//! - the **per-image pipeline** ([`pipeline`]): acquire, filter (with a
//!   pre-filter snapshot restored before integration), peak search,
//!   indexing, refinement, integration and chunk formatting, with
//!   per-stage wall-clock accounts and cancellation polls at every stage
//!   boundary;
//! - the **indexing driver** ([`indexing`]): an ordered list of backends
//!   behind one trait, reference-cell matching over axis permutations and
//!   combinations, a peak-alignment check, bounded retry with the weakest
//!   peaks deleted, and multi-lattice extraction;
//! - **prediction and integration** ([`predict`], [`refine`],
//!   [`integration`]): Ewald-sphere prediction under four partiality
//!   models, simplex refinement of orientation/radius/wavelength, and
//!   three-ring integration with planar background subtraction and
//!   optional profile fitting.
//!
//! ## Configuration
//!
//! Everything is driven by a YAML [`config::Config`]. A minimal file:
//!
//! ```yml
//! geometry_path: geometry.yaml
//! cell_path: reference_cell.yaml
//! input_list_path: files.lst
//! output_stream_path: run.stream
//! n_workers: 8
//! peak_method: peakfinder8
//! min_peaks: 15
//! indexing_methods: [vecsearch]
//! multi: true
//! ```
//!
//! The detector geometry and the reference cell are YAML documents too;
//! see [`geometry::Detector`] and [`cell::CellFile`].
//!
//! ## Output
//!
//! The stream ([`stream`]) is line-oriented and append-only: a header with
//! the command line, geometry digest, reference cell and indexing method
//! list, then one chunk per image between `----- Begin chunk -----` and
//! `----- End chunk -----` delimiter lines. Chunks appear atomically, in
//! serial order, and carry the peak list and one block per crystal.
//!
//! ## Failure model
//!
//! A worker crash or stall costs exactly the image it was processing: the
//! image is counted as failed and not retried, the seat is respawned, and
//! late results from the retired worker are discarded before they can
//! touch the stream.

pub mod cell;
pub mod cell_match;
pub mod config;
pub mod constants;
pub mod crystal;
pub mod dispatcher;
pub mod error;
pub mod external;
pub mod filters;
pub mod geometry;
pub mod hdf5_reader;
pub mod image;
pub mod indexing;
pub mod inject;
pub mod integration;
pub mod matrix;
pub mod payload;
pub mod peak_search;
pub mod peakfinder8;
pub mod peakfinder9;
pub mod peaks;
pub mod pipeline;
pub mod predict;
pub mod refine;
pub mod reflection;
pub mod run;
pub mod source;
pub mod spectrum;
pub mod stream;
pub mod time_accounts;
pub mod vecsearch;
pub mod worker_status;
