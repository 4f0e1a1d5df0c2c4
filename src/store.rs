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

//! Persistent, layered raster store.
//!
//! A dataset is stored as four *containers* (directories) next to a JSON
//! manifest:
//! ```text
//! <root>/<name>.json              manifest (dimensions, channel names)
//! <root>/<name>/FOV0/T0.raster.gz raw (final) masks
//! <root>/<name>_thresholded/...   threshold masks
//! <root>/<name>_segmented/...     segmentation masks
//! <root>/<name>_predicted/...     soft predictions
//! ```
//! Every container holds one group per field of view, created up front. A
//! raster is only written once it is explicitly materialized (see
//! [`LayeredStore::load_or_create`]) or saved, so asking whether a frame has
//! ever been touched ([`LayeredStore::exists`]) never changes the store.

use std::collections::HashMap;
use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use ndarray as nd;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::raster::{self, Pixel};

const MANIFEST_VERSION: u32 = 1;
const RASTER_EXTENSION: &str = "raster.gz";

////////////////////////////////////////////////////////////////////////////////
//                              FRAME COORDINATES                             //
////////////////////////////////////////////////////////////////////////////////

/// (field of view, time point) pair. The sole key into every layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FrameCoord {
  pub fov: usize,
  pub time: usize,
}

impl FrameCoord {
  pub fn new(fov: usize, time: usize) -> Self {
    FrameCoord { fov, time }
  }

  pub fn fov_label(&self) -> String {
    format!("FOV{}", self.fov)
  }

  pub fn time_label(&self) -> String {
    format!("T{}", self.time)
  }

  /// The same field of view one time point earlier, if there is one
  pub fn previous(&self) -> Option<FrameCoord> {
    self.time.checked_sub(1).map(|time| FrameCoord { fov: self.fov, time })
  }
}

impl std::fmt::Display for FrameCoord {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}/{}", self.fov_label(), self.time_label())
  }
}

/// Size of a dataset as reported by its image source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
  pub sizex: usize,
  pub sizey: usize,
  /// number of channels
  pub sizec: usize,
  /// number of time points
  pub sizet: usize,
  /// number of fields of view
  pub npos: usize,
}

impl Dimensions {
  /// Shape of every raster in the dataset, in `ndarray` (row, column) order
  pub fn shape(&self) -> (usize, usize) {
    (self.sizey, self.sizex)
  }
}

////////////////////////////////////////////////////////////////////////////////
//                                   LAYERS                                   //
////////////////////////////////////////////////////////////////////////////////

/// The four layers kept for every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LayerKind {
  /// Final, identity-consistent masks
  Mask,
  Threshold,
  Segmentation,
  Prediction,
}

impl LayerKind {
  pub const ALL: [LayerKind; 4] =
    [LayerKind::Mask, LayerKind::Threshold, LayerKind::Segmentation, LayerKind::Prediction];

  fn container_suffix(self) -> &'static str {
    match self {
      LayerKind::Mask => "",
      LayerKind::Threshold => "_thresholded",
      LayerKind::Segmentation => "_segmented",
      LayerKind::Prediction => "_predicted",
    }
  }
}

/// A layer together with the pixel type it stores.
pub struct Layer<T> {
  kind: LayerKind,
  px: PhantomData<fn() -> T>,
}

impl<T> Layer<T> {
  const fn new(kind: LayerKind) -> Self {
    Layer { kind, px: PhantomData }
  }

  pub fn kind(&self) -> LayerKind {
    self.kind
  }
}

impl<T> Clone for Layer<T> {
  fn clone(&self) -> Self {
    *self
  }
}
impl<T> Copy for Layer<T> {}

impl<T> std::fmt::Debug for Layer<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "Layer({:?})", self.kind)
  }
}

/// Typed handles for the four layers
pub mod layer {
  use super::{Layer, LayerKind};

  pub const MASK: Layer<u16> = Layer::new(LayerKind::Mask);
  pub const THRESHOLD: Layer<u16> = Layer::new(LayerKind::Threshold);
  pub const SEGMENTATION: Layer<u16> = Layer::new(LayerKind::Segmentation);
  pub const PREDICTION: Layer<f32> = Layer::new(LayerKind::Prediction);
}

////////////////////////////////////////////////////////////////////////////////
//                                   STORE                                    //
////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
  pub name: String,
  pub dimensions: Dimensions,
  pub channel_names: Vec<String>,
  pub format_version: u32,
  /// Manual threshold the stored threshold masks were made with, `None` for
  /// isodata
  #[serde(default)]
  pub threshold: Option<f32>,
}

/// Disk-backed store holding the four raster layers of one dataset.
///
/// The store may be shared between threads. Writers to the same
/// (layer, frame) slot are serialized, writers to different slots are not.
/// Every write goes to a temporary file that is renamed into place, so a
/// reader never observes a half-written raster.
#[derive(Debug)]
pub struct LayeredStore {
  root: PathBuf,
  manifest: Manifest,
  slots: Mutex<HashMap<(LayerKind, FrameCoord), Arc<Mutex<()>>>>,
}

fn manifest_path(root: &Path, name: &str) -> PathBuf {
  root.join(format!("{name}.json"))
}

//Only a missing file means "not stored", any other I/O failure is an error
fn is_stored(path: &Path) -> Result<bool> {
  match fs::metadata(path) {
    Ok(meta) => Ok(meta.is_file()),
    Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
    Err(err) => Err(err.into()),
  }
}

impl LayeredStore {
  /// Creates a new dataset with all four containers and one empty group per
  /// field of view. Fails if a dataset with this name already exists.
  pub fn create(
    root: &Path,
    name: &str,
    dimensions: Dimensions,
    channel_names: Vec<String>,
  ) -> Result<Self> {
    let manifest_file = manifest_path(root, name);
    if manifest_file.exists() {
      return Err(Error::AlreadyExists(manifest_file));
    }
    if dimensions.sizex == 0 || dimensions.sizey == 0 {
      return Err(Error::Config(format!("dataset {name} has an empty frame shape")));
    }

    let manifest = Manifest {
      name: name.to_string(),
      dimensions,
      channel_names,
      format_version: MANIFEST_VERSION,
      threshold: None,
    };
    let store = LayeredStore { root: root.to_path_buf(), manifest, slots: Mutex::new(HashMap::new()) };

    for kind in LayerKind::ALL {
      let container = store.container_path(kind);
      fs::create_dir_all(&container)?;
      for fov in 0..dimensions.npos {
        fs::create_dir_all(container.join(FrameCoord::new(fov, 0).fov_label()))?;
      }
    }

    //Manifest last: a directory without one is not a dataset
    store.write_manifest()?;

    info!(
      "created dataset {name} in {root:?}: {} FOVs x {} time points of {}x{} px",
      dimensions.npos, dimensions.sizet, dimensions.sizey, dimensions.sizex
    );
    Ok(store)
  }

  /// Opens an existing dataset
  pub fn open(root: &Path, name: &str) -> Result<Self> {
    let manifest_file = manifest_path(root, name);
    if !manifest_file.is_file() {
      return Err(Error::NotFound(manifest_file));
    }
    let manifest: Manifest = serde_json::from_reader(BufReader::new(fs::File::open(&manifest_file)?))?;
    if manifest.format_version != MANIFEST_VERSION {
      return Err(Error::Config(format!(
        "dataset {name} uses manifest version {}, expected {MANIFEST_VERSION}",
        manifest.format_version
      )));
    }
    info!("opened dataset {name} in {root:?}");
    Ok(LayeredStore { root: root.to_path_buf(), manifest, slots: Mutex::new(HashMap::new()) })
  }

  /// Opens the dataset if it exists (its dimensions must match), creates it
  /// otherwise.
  pub fn open_or_create(
    root: &Path,
    name: &str,
    dimensions: Dimensions,
    channel_names: Vec<String>,
  ) -> Result<Self> {
    if !manifest_path(root, name).is_file() {
      return Self::create(root, name, dimensions, channel_names);
    }
    let store = Self::open(root, name)?;
    if store.manifest.dimensions != dimensions {
      return Err(Error::Config(format!(
        "dataset {name} was created for {:?}, the image source reports {dimensions:?}",
        store.manifest.dimensions
      )));
    }
    Ok(store)
  }

  /// Records the threshold setting that threshold masks are made with. If it
  /// differs from the recorded one, every stored threshold mask is deleted
  /// before the manifest is updated. Returns whether masks were dropped.
  pub fn set_threshold_setting(&mut self, threshold: Option<f32>) -> Result<bool> {
    if threshold.map(f32::to_bits) == self.manifest.threshold.map(f32::to_bits) {
      return Ok(false);
    }
    let container = self.container_path(LayerKind::Threshold);
    match fs::remove_dir_all(&container) {
      Err(err) if err.kind() != std::io::ErrorKind::NotFound => return Err(err.into()),
      _ => {}
    }
    for fov in 0..self.manifest.dimensions.npos {
      fs::create_dir_all(container.join(FrameCoord::new(fov, 0).fov_label()))?;
    }

    info!(
      "dataset {}: threshold setting changed from {:?} to {threshold:?}, dropped stored threshold masks",
      self.manifest.name, self.manifest.threshold
    );
    self.manifest.threshold = threshold;
    self.write_manifest()?;
    Ok(true)
  }

  /// Deletes the whole dataset from disk. There is no partial removal.
  pub fn remove(self) -> Result<()> {
    for kind in LayerKind::ALL {
      match fs::remove_dir_all(self.container_path(kind)) {
        Err(err) if err.kind() != std::io::ErrorKind::NotFound => return Err(err.into()),
        _ => {}
      }
    }
    fs::remove_file(manifest_path(&self.root, &self.manifest.name))?;
    info!("removed dataset {} from {:?}", self.manifest.name, self.root);
    Ok(())
  }

  pub fn name(&self) -> &str {
    &self.manifest.name
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn manifest(&self) -> &Manifest {
    &self.manifest
  }

  pub fn dimensions(&self) -> Dimensions {
    self.manifest.dimensions
  }

  pub fn shape(&self) -> (usize, usize) {
    self.manifest.dimensions.shape()
  }

  pub fn channel_names(&self) -> &[String] {
    &self.manifest.channel_names
  }

  pub fn threshold_setting(&self) -> Option<f32> {
    self.manifest.threshold
  }

  /// Directory holding all rasters of one layer
  pub fn container_path(&self, kind: LayerKind) -> PathBuf {
    self.root.join(format!("{}{}", self.manifest.name, kind.container_suffix()))
  }

  pub fn raster_path(&self, kind: LayerKind, coord: FrameCoord) -> PathBuf {
    self
      .container_path(kind)
      .join(coord.fov_label())
      .join(format!("{}.{RASTER_EXTENSION}", coord.time_label()))
  }

  /// All valid frame coordinates, FOV-major and in increasing time order
  pub fn frames(&self) -> impl Iterator<Item = FrameCoord> + '_ {
    let dims = self.manifest.dimensions;
    (0..dims.npos).flat_map(move |fov| (0..dims.sizet).map(move |time| FrameCoord { fov, time }))
  }

  pub fn check_coord(&self, coord: FrameCoord) -> Result<()> {
    let dims = self.manifest.dimensions;
    if coord.fov < dims.npos && coord.time < dims.sizet {
      Ok(())
    } else {
      Err(Error::OutOfBounds { coord, npos: dims.npos, sizet: dims.sizet })
    }
  }

  pub fn check_shape(&self, found: (usize, usize)) -> Result<()> {
    let expected = self.shape();
    if found == expected {
      Ok(())
    } else {
      Err(Error::ShapeMismatch { expected, found })
    }
  }

  /// True iff a raster was ever materialized or saved for this slot. Never
  /// modifies the store.
  pub fn exists<T: Pixel>(&self, layer: Layer<T>, coord: FrameCoord) -> Result<bool> {
    self.check_coord(coord)?;
    is_stored(&self.raster_path(layer.kind, coord))
  }

  /// Returns the stored raster, or `None` if the slot was never touched.
  /// Unlike [`LayeredStore::load_or_create`] this does not materialize
  /// anything.
  pub fn read<T: Pixel>(&self, layer: Layer<T>, coord: FrameCoord) -> Result<Option<nd::Array2<T>>> {
    self.check_coord(coord)?;
    let path = self.raster_path(layer.kind, coord);
    if !is_stored(&path)? {
      return Ok(None);
    }
    self.read_file(&path).map(Some)
  }

  /// Returns the stored raster. If the slot was never touched, a zero-filled
  /// raster of the dataset shape is persisted first, so that `exists` is true
  /// for this slot from now on.
  pub fn load_or_create<T: Pixel>(&self, layer: Layer<T>, coord: FrameCoord) -> Result<nd::Array2<T>> {
    self.check_coord(coord)?;
    let path = self.raster_path(layer.kind, coord);

    let slot = self.slot_lock(layer.kind, coord);
    let _guard = slot.lock();
    if is_stored(&path)? {
      return self.read_file(&path);
    }

    let zeros = nd::Array2::<T>::zeros(self.shape());
    self.write_file(&path, zeros.view())?;
    debug!("materialized empty {:?} raster for {coord}", layer.kind);
    Ok(zeros)
  }

  /// Stores `raster`, replacing whatever was stored before.
  pub fn save<T: Pixel>(&self, layer: Layer<T>, coord: FrameCoord, raster: nd::ArrayView2<T>) -> Result<()> {
    self.check_coord(coord)?;
    self.check_shape(raster.dim())?;
    let path = self.raster_path(layer.kind, coord);

    let slot = self.slot_lock(layer.kind, coord);
    let _guard = slot.lock();
    self.write_file(&path, raster)?;
    debug!("saved {:?} raster for {coord}", layer.kind);
    Ok(())
  }

  //Locks are never evicted, there are at most 4 * npos * sizet of them
  fn slot_lock(&self, kind: LayerKind, coord: FrameCoord) -> Arc<Mutex<()>> {
    self.slots.lock().entry((kind, coord)).or_default().clone()
  }

  fn read_file<T: Pixel>(&self, path: &Path) -> Result<nd::Array2<T>> {
    let raster = raster::decode::<T, _>(BufReader::new(fs::File::open(path)?), path)?;
    if raster.dim() != self.shape() {
      return Err(Error::Corrupt {
        path: path.to_path_buf(),
        reason: format!("stored shape {:?} differs from dataset shape {:?}", raster.dim(), self.shape()),
      });
    }
    Ok(raster)
  }

  fn write_manifest(&self) -> Result<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(&self.root)?;
    {
      let mut writer = BufWriter::new(tmp.as_file_mut());
      serde_json::to_writer_pretty(&mut writer, &self.manifest)?;
      writer.flush()?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(manifest_path(&self.root, &self.manifest.name)).map_err(|err| err.error)?;
    Ok(())
  }

  fn write_file<T: Pixel>(&self, path: &Path, raster: nd::ArrayView2<T>) -> Result<()> {
    let dir = path.parent().ok_or_else(|| Error::Config(format!("raster path {path:?} has no parent")))?;
    fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    {
      let mut writer = BufWriter::new(tmp.as_file_mut());
      raster::encode(raster, &mut writer)?;
      writer.flush()?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
  }
}
