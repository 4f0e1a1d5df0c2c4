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

//! Error type shared by the store, the segmentation pipeline, the correspondence
//! engine and the tracker.
//!
//! Precondition violations (`OutOfBounds`, `ShapeMismatch`) are fatal for the
//! operation that raised them. Missing data is *not* an error anywhere in this
//! crate: absent layers read as zero-filled rasters.

use std::path::PathBuf;

use crate::store::FrameCoord;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error("frame {coord} lies outside the dataset ({npos} FOVs, {sizet} time points)")]
  OutOfBounds { coord: FrameCoord, npos: usize, sizet: usize },

  #[error("raster shape mismatch: expected {expected:?}, found {found:?}")]
  ShapeMismatch { expected: (usize, usize), found: (usize, usize) },

  #[error("corrupt raster file {path:?}: {reason}")]
  Corrupt { path: PathBuf, reason: String },

  #[error("a dataset already exists at {0:?}")]
  AlreadyExists(PathBuf),

  #[error("no dataset manifest found at {0:?}")]
  NotFound(PathBuf),

  #[error("image source has no frame for {coord} (channel {channel})")]
  FrameUnavailable { coord: FrameCoord, channel: usize },

  #[error("label space exhausted: more than {} distinct labels", u16::MAX)]
  LabelOverflow,

  #[error("invalid configuration: {0}")]
  Config(String),

  #[error("prediction failed: {0}")]
  Prediction(String),

  #[error("could not decode image: {0}")]
  Image(#[from] image::ImageError),

  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),

  #[error("manifest error: {0}")]
  Json(#[from] serde_json::Error),
}
