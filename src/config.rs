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

//! Serializable parameters for every stage, with the defaults used when a
//! field is left out of a dataset configuration file.

use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::assignment::AssignmentSolver;
use crate::error::Result;
use crate::watershed::NORMAL_MAX;

/// Parameters of the segmentation pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentationParams {
  /// Minimum separation between watershed seeds, in pixels
  pub min_seed_distance: usize,
  /// Highest water level the flood reaches (at most 254)
  pub max_water_level: u8,
  pub merge: MergeParams,
  pub artifacts: ArtifactParams,
}

impl Default for SegmentationParams {
  fn default() -> Self {
    SegmentationParams {
      min_seed_distance: 10,
      max_water_level: NORMAL_MAX,
      merge: MergeParams::default(),
      artifacts: ArtifactParams::default(),
    }
  }
}

/// Parameters of the default (boundary contrast) merge policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeParams {
  pub enabled: bool,
  /// Two regions merge when the mean prediction along their shared boundary
  /// is at least this fraction of the smaller of their mean predictions
  pub min_boundary_ratio: f32,
  /// Minimum number of boundary pixels before a boundary is considered
  pub min_contact: usize,
  /// Regions smaller than this always merge into their best-connected neighbour
  pub min_fragment_area: usize,
}

impl Default for MergeParams {
  fn default() -> Self {
    MergeParams { enabled: true, min_boundary_ratio: 0.9, min_contact: 3, min_fragment_area: 15 }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactParams {
  /// Regions with fewer pixels are removed
  pub min_area: usize,
  /// Remove every region touching the frame edge
  pub discard_border: bool,
}

impl Default for ArtifactParams {
  fn default() -> Self {
    ArtifactParams { min_area: 10, discard_border: false }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingParams {
  pub solver: AssignmentSolver,
  /// Regions that do not overlap may still be matched when their centroids
  /// are at most this many pixels apart. `None` only matches overlapping
  /// regions.
  pub max_centroid_distance: Option<f64>,
}

impl Default for TrackingParams {
  fn default() -> Self {
    TrackingParams { solver: AssignmentSolver::Hungarian, max_centroid_distance: None }
  }
}

/// Everything needed to run a dataset end to end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
  /// Directory holding the dataset containers
  pub store_root: PathBuf,
  /// Dataset name, used as file stem for the containers
  pub name: String,
  /// Channel fed to the predictor (the transmitted-light channel)
  pub default_channel: usize,
  /// Source channels readable by name with `Tracker::load_fluorescence`
  pub fluorescence_channels: Vec<String>,
  /// Fixed binarization threshold; `None` uses the isodata threshold
  pub threshold: Option<f32>,
  /// Ask the predictor to normalize its input
  pub normalize_input: bool,
  pub segmentation: SegmentationParams,
  pub tracking: TrackingParams,
}

impl Default for DatasetConfig {
  fn default() -> Self {
    DatasetConfig {
      store_root: PathBuf::from("."),
      name: "dataset".to_string(),
      default_channel: 0,
      fluorescence_channels: Vec::new(),
      threshold: None,
      normalize_input: true,
      segmentation: SegmentationParams::default(),
      tracking: TrackingParams::default(),
    }
  }
}

impl DatasetConfig {
  pub fn from_json_file(path: &Path) -> Result<Self> {
    let reader = BufReader::new(fs::File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
  }

  pub fn to_json_file(&self, path: &Path) -> Result<()> {
    let mut writer = BufWriter::new(fs::File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, self)?;
    writer.flush()?;
    Ok(())
  }
}
