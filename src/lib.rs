/*
  Copyright© 2023 Raúl Wolters(1)

  This file is part of celltrack-watershed.

  celltrack-watershed is free software: you can redistribute it and/or modify it
  under the terms of the European Union Public License version 1.2 or later, as
  published by the European Commission.

  celltrack-watershed is distributed in the hope that it will be useful, but
  WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
  FITNESS FOR A PARTICULAR PURPOSE. See the European Union Public License for
  more details.

  You should have received a copy of the EUPL in an/all official language(s) of
  the European Union along with celltrack-watershed.  If not, see
  <https://ec.europa.eu/info/european-union-public-licence_en/>.

  (1) Resident of the Kingdom of the Netherlands; agreement between licensor and
  licensee subject to Dutch law as per article 15 of the EUPL.
*/

//! Celltrack-watershed segments and tracks cells in time-lapse microscopy
//! datasets.
//!
//! # Features
//! For every frame of every field of view (FOV), the crate
//! 1. runs a (user supplied) predictor producing a soft foreground map;
//! 2. binarizes the prediction with an isodata threshold, or a fixed one;
//! 3. splits the foreground into individual cells with a seeded watershed
//! transform on the distance map, merging lakes that were split without
//! evidence in the prediction and removing debris;
//! 4. carries cell identities over from the previous frame by optimal
//! bipartite matching of overlapping regions.
//!
//! Every intermediate result is persisted in a [`LayeredStore`](store::LayeredStore):
//! four layers (raw mask, threshold, segmentation, prediction) of rasters keyed
//! by `(fov, time)`. Predictions are cached, so interrupted runs can be
//! restarted without recomputing them. FOVs are processed in parallel, time
//! points within a FOV strictly in order.
//!
//! ## Short example: tracking a moving square
//! ```rust
//! use celltrack_watershed::prelude::*;
//!
//! //A bright square moving one pixel per frame
//! let frames: Vec<_> = (0..3)
//!   .map(|shift| {
//!     let mut img = nd::Array2::<u16>::zeros((40, 40));
//!     img.slice_mut(nd::s![10..22, 10 + shift..22 + shift]).fill(1000);
//!     img
//!   })
//!   .collect();
//! let source = StackSource::new(vec![frames]).unwrap();
//!
//! //Any `Fn(ArrayView2<u16>, bool) -> Result<Array2<f32>>` is a predictor
//! fn predict(img: nd::ArrayView2<u16>, _normalize: bool) -> Result<nd::Array2<f32>> {
//!   Ok(img.mapv(|px| px as f32 / 1000.0))
//! }
//!
//! let dir = tempfile::tempdir().unwrap();
//! let config = DatasetConfig {
//!   store_root: dir.path().to_path_buf(),
//!   name: "demo".to_string(),
//!   ..DatasetConfig::default()
//! };
//! let tracker = Tracker::from_config(source, predict, &config).unwrap();
//! let report = tracker.process_fov(0).unwrap();
//! assert_eq!(report.frames[2].matched, 1);
//! assert_eq!(report.next_identity, 2);
//! ```
//!
//! # Cargo feature gates
//! *By default, all features behind cargo feature gates are **disabled***
//! - `jemalloc`: this feature enables the [jemalloc allocator](https://jemalloc.net).
//! From the jemalloc website: *"jemalloc is a general purpose `malloc`(3)
//! implementation that emphasizes fragmentation avoidance and scalable concurrency
//! support."*. Jemalloc is enabled though usage of the `jemalloc` crate, which
//! increases compile times considerably. To compile `celltrack-watershed` with
//! the `jemalloc` feature, jemalloc must be installed on the host system.
//! - `progress`: this feature enables a progress bar over the time points of
//! every FOV. Enabling this feature adds the `indicatif` crate as a dependency,
//! which should not considerably slow down compile times.
//! - `debug`: this feature enables per-frame and per-segmentation performance
//! reports, emitted through the `log` facade at debug level. Enabling this
//! feature does not add additional dependencies.

//Set Jemalloc as the global allocator for this crate
#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

pub mod artifacts;
pub mod assignment;
pub mod config;
pub mod correspondence;
pub mod error;
pub mod merge;
pub mod morphology;
pub mod raster;
pub mod segmentation;
pub mod source;
pub mod store;
pub mod threshold;
pub mod tracker;
pub mod watershed;

#[cfg(feature = "debug")]
mod perf;

pub use error::{Error, Result};

//Utility prelude for batch import
pub mod prelude {
  pub use ndarray as nd;

  pub use crate::artifacts::ArtifactFilter;
  pub use crate::assignment::AssignmentSolver;
  pub use crate::config::{ArtifactParams, DatasetConfig, MergeParams, SegmentationParams, TrackingParams};
  pub use crate::correspondence::{Correspondence, CorrespondenceEngine};
  pub use crate::error::{Error, Result};
  pub use crate::merge::{BoundaryMerge, MergePolicy, NoMerge};
  pub use crate::segmentation::{PipelineBuilder, SegmentationPipeline};
  pub use crate::source::{FolderSource, ImageSource, Predictor, StackSource};
  pub use crate::store::{layer, Dimensions, FrameCoord, LayerKind, LayeredStore};
  pub use crate::threshold::{binarize, isodata_threshold};
  pub use crate::tracker::{FovReport, FrameReport, Tracker};
}
