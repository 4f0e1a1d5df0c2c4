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

//! Drives the whole pipeline over a dataset.
//!
//! For every frame the [`Tracker`] runs prediction, binarization,
//! segmentation and correspondence, persisting each layer in the
//! [`LayeredStore`]. Predictions are cached: a frame whose prediction layer
//! already exists is not predicted again, so an interrupted run can simply be
//! restarted. Fields of view are independent and run in parallel; time points
//! within a field of view run strictly in order, because each frame needs the
//! final mask of the one before it.

use log::{debug, info};
use ndarray as nd;
use rayon::prelude::*;

use crate::config::DatasetConfig;
use crate::correspondence::{Correspondence, CorrespondenceEngine};
use crate::error::{Error, Result};
use crate::segmentation::{PipelineBuilder, SegmentationPipeline};
use crate::source::{ImageSource, Predictor};
use crate::store::{layer, FrameCoord, LayeredStore};
use crate::threshold::binarize;

#[cfg(feature = "progress")]
fn set_up_bar(sizet: usize) -> indicatif::ProgressBar {
  const TEMPLATE: &str = "{spinner}[{elapsed}/{duration}] time point {pos}/{len}{bar:60}";
  let bar = indicatif::ProgressBar::new(sizet as u64);
  if let Ok(style) = indicatif::ProgressStyle::with_template(TEMPLATE) {
    bar.set_style(style);
  }
  bar
}

/// Summary of one processed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameReport {
  pub coord: FrameCoord,
  /// Whether the prediction was computed in this run (`false` if cached)
  pub predicted: bool,
  pub cells: usize,
  pub matched: usize,
  pub born: Vec<u16>,
  pub lost: Vec<u16>,
  pub next_identity: u32,
}

/// Summary of one processed field of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FovReport {
  pub fov: usize,
  pub frames: Vec<FrameReport>,
  pub next_identity: u32,
}

pub struct Tracker<S, P> {
  source: S,
  predictor: P,
  store: LayeredStore,
  pipeline: SegmentationPipeline,
  engine: CorrespondenceEngine,
  default_channel: usize,
  fluorescence_channels: Vec<String>,
  normalize_input: bool,
}

impl<S: ImageSource, P: Predictor> Tracker<S, P> {
  /// Fails with a `Config` error if `store` was created for a dataset of other
  /// dimensions than `source` reports. Binarization uses the threshold setting
  /// recorded in the store.
  pub fn new(
    source: S,
    predictor: P,
    store: LayeredStore,
    pipeline: SegmentationPipeline,
    engine: CorrespondenceEngine,
  ) -> Result<Self> {
    if source.dimensions() != store.dimensions() {
      return Err(Error::Config(format!(
        "store {} holds {:?}, the image source reports {:?}",
        store.name(),
        store.dimensions(),
        source.dimensions()
      )));
    }
    Ok(Tracker {
      source,
      predictor,
      store,
      pipeline,
      engine,
      default_channel: 0,
      fluorescence_channels: Vec::new(),
      normalize_input: true,
    })
  }

  /// Opens (or creates) the store described by `config` and sets up every
  /// stage from it.
  pub fn from_config(source: S, predictor: P, config: &DatasetConfig) -> Result<Self> {
    let dimensions = source.dimensions();
    if config.default_channel >= dimensions.sizec {
      return Err(Error::Config(format!(
        "default channel {} does not exist, the source has {} channels",
        config.default_channel, dimensions.sizec
      )));
    }
    let store =
      LayeredStore::open_or_create(&config.store_root, &config.name, dimensions, source.channel_names())?;
    let pipeline = PipelineBuilder::from_params(config.segmentation.clone()).build()?;
    let engine = CorrespondenceEngine::new(&config.tracking);

    Self::new(source, predictor, store, pipeline, engine)?
      .with_default_channel(config.default_channel)
      .with_normalize_input(config.normalize_input)
      .with_fluorescence_channels(config.fluorescence_channels.clone())?
      .with_threshold(config.threshold)
  }

  /// Channel passed to the predictor
  pub fn with_default_channel(mut self, channel: usize) -> Self {
    self.default_channel = channel;
    self
  }

  /// Fixed binarization threshold; `None` selects the isodata threshold.
  /// Switching to another setting drops the threshold masks stored so far.
  pub fn with_threshold(mut self, threshold: Option<f32>) -> Result<Self> {
    if let Some(t) = threshold.filter(|t| !t.is_finite()) {
      return Err(Error::Config(format!("manual threshold {t} is not a finite number")));
    }
    self.store.set_threshold_setting(threshold)?;
    Ok(self)
  }

  /// Names of the channels readable with [`Tracker::load_fluorescence`]. Every
  /// name must be a channel of the image source.
  pub fn with_fluorescence_channels(mut self, names: Vec<String>) -> Result<Self> {
    let available = self.source.channel_names();
    if let Some(missing) = names.iter().find(|name| !available.contains(*name)) {
      return Err(Error::Config(format!(
        "fluorescence channel {missing} does not exist, the source has {available:?}"
      )));
    }
    self.fluorescence_channels = names;
    Ok(self)
  }

  pub fn with_normalize_input(mut self, normalize: bool) -> Self {
    self.normalize_input = normalize;
    self
  }

  pub fn store(&self) -> &LayeredStore {
    &self.store
  }

  pub fn source(&self) -> &S {
    &self.source
  }

  pub fn predictor(&self) -> &P {
    &self.predictor
  }

  pub fn fluorescence_channels(&self) -> &[String] {
    &self.fluorescence_channels
  }

  pub fn pipeline(&self) -> &SegmentationPipeline {
    &self.pipeline
  }

  pub fn engine(&self) -> &CorrespondenceEngine {
    &self.engine
  }

  /// Consumes the tracker, handing back its store
  pub fn into_store(self) -> LayeredStore {
    self.store
  }

  /// Whether `coord` lies inside the dataset
  pub fn contains(&self, coord: FrameCoord) -> bool {
    self.store.check_coord(coord).is_ok()
  }

  /// Raw frame of any channel, in the dataset's shape.
  pub fn load_image_channel(&self, coord: FrameCoord, channel: usize) -> Result<nd::Array2<u16>> {
    self.store.check_coord(coord)?;
    let frame = self
      .source
      .load_frame(coord.time, coord.fov, channel)?
      .ok_or(Error::FrameUnavailable { coord, channel })?;
    self.store.check_shape(frame.dim())?;
    Ok(frame)
  }

  /// Raw frame of a configured fluorescence channel, looked up by name.
  pub fn load_fluorescence(&self, coord: FrameCoord, name: &str) -> Result<nd::Array2<u16>> {
    if !self.fluorescence_channels.iter().any(|channel| channel == name) {
      return Err(Error::Config(format!("{name} is not a configured fluorescence channel")));
    }
    let channel = self
      .source
      .channel_names()
      .iter()
      .position(|channel| channel == name)
      .ok_or_else(|| Error::Config(format!("the image source has no channel {name}")))?;
    self.load_image_channel(coord, channel)
  }

  /// Predicts the frame at `coord` and saves the prediction, unless a
  /// prediction is already stored. Returns whether a prediction was made.
  pub fn launch_prediction(&self, coord: FrameCoord) -> Result<bool> {
    if self.store.exists(layer::PREDICTION, coord)? {
      debug!("prediction for {coord} is cached");
      return Ok(false);
    }
    let image = self.load_image_channel(coord, self.default_channel)?;
    let prediction = self.predictor.predict(image.view(), self.normalize_input)?;
    self.store.check_shape(prediction.dim())?;
    self.store.save(layer::PREDICTION, coord, prediction.view())?;
    Ok(true)
  }

  /// Binary mask of the stored prediction. All zero if there is none.
  pub fn threshold_prediction(&self, coord: FrameCoord) -> Result<nd::Array2<u16>> {
    Ok(match self.store.read(layer::PREDICTION, coord)? {
      Some(prediction) => binarize(prediction.view(), self.store.threshold_setting()),
      None => nd::Array2::zeros(self.store.shape()),
    })
  }

  /// Labelled segmentation of the stored threshold mask. All zero unless both
  /// the threshold mask and the prediction are stored.
  pub fn segment(&self, coord: FrameCoord) -> Result<nd::Array2<u16>> {
    let threshold = self.store.read(layer::THRESHOLD, coord)?;
    let prediction = self.store.read(layer::PREDICTION, coord)?;
    match (threshold, prediction) {
      (Some(threshold), Some(prediction)) => self.pipeline.segment(threshold.view(), prediction.view()),
      _ => Ok(nd::Array2::zeros(self.store.shape())),
    }
  }

  /// Carries identities from the final mask at `T-1` into the stored
  /// segmentation at `T`. Neither layer is materialized.
  pub fn cell_correspondence(&self, coord: FrameCoord, identity_floor: u32) -> Result<Correspondence> {
    self.store.check_coord(coord)?;
    let previous = match coord.previous() {
      Some(prev) => self.store.read(layer::MASK, prev)?,
      None => None,
    };
    let current = self.store.read(layer::SEGMENTATION, coord)?;
    self.engine.correspond(
      previous.as_ref().map(|mask| mask.view()),
      current.as_ref().map(|mask| mask.view()),
      self.store.shape(),
      identity_floor,
    )
  }

  /// Runs every stage for one frame and persists all layers. Cached
  /// predictions and threshold masks are reused. Frames of a FOV must be
  /// processed in increasing time order.
  pub fn process_frame(&self, coord: FrameCoord, identity_floor: u32) -> Result<FrameReport> {
    self.store.check_coord(coord)?;

    #[cfg(feature = "debug")]
    let (mut perf, start) = (crate::perf::PerfReport::default(), std::time::Instant::now());
    #[cfg(feature = "debug")]
    let predicted = perf.time("prediction", || self.launch_prediction(coord))?;
    #[cfg(not(feature = "debug"))]
    let predicted = self.launch_prediction(coord)?;

    //A stored threshold mask is reused unless the prediction under it changed.
    //Masks of another threshold setting were dropped when it was configured.
    if predicted || !self.store.exists(layer::THRESHOLD, coord)? {
      let threshold = self.threshold_prediction(coord)?;
      self.store.save(layer::THRESHOLD, coord, threshold.view())?;
    }

    #[cfg(feature = "debug")]
    let segmentation = perf.time("segmentation", || self.segment(coord))?;
    #[cfg(not(feature = "debug"))]
    let segmentation = self.segment(coord)?;
    self.store.save(layer::SEGMENTATION, coord, segmentation.view())?;

    #[cfg(feature = "debug")]
    let corr = perf.time("correspondence", || self.cell_correspondence(coord, identity_floor))?;
    #[cfg(not(feature = "debug"))]
    let corr = self.cell_correspondence(coord, identity_floor)?;
    self.store.save(layer::MASK, coord, corr.mask.view())?;

    #[cfg(feature = "debug")]
    {
      perf.total_ms = start.elapsed().as_millis() as usize;
      debug!("processed {coord}\n{perf}");
    }

    Ok(FrameReport {
      coord,
      predicted,
      cells: corr.cell_count(),
      matched: corr.matched.len(),
      born: corr.born,
      lost: corr.lost,
      next_identity: corr.next_identity,
    })
  }

  /// Processes every time point of `fov` in order. Fresh identities are never
  /// reused within the FOV.
  pub fn process_fov(&self, fov: usize) -> Result<FovReport> {
    let dims = self.store.dimensions();
    if fov >= dims.npos {
      return Err(Error::OutOfBounds { coord: FrameCoord::new(fov, 0), npos: dims.npos, sizet: dims.sizet });
    }

    #[cfg(feature = "progress")]
    let bar = set_up_bar(dims.sizet);

    let mut frames = Vec::with_capacity(dims.sizet);
    let mut next_identity = 1;
    for time in 0..dims.sizet {
      let report = self.process_frame(FrameCoord::new(fov, time), next_identity)?;
      next_identity = report.next_identity;
      frames.push(report);

      #[cfg(feature = "progress")]
      bar.inc(1);
    }

    #[cfg(feature = "progress")]
    bar.finish();

    info!("FOV{fov}: {} time points, {} identities", frames.len(), next_identity - 1);
    Ok(FovReport { fov, frames, next_identity })
  }

  /// Processes every FOV, in parallel.
  pub fn process_all(&self) -> Result<Vec<FovReport>>
  where
    S: Sync,
    P: Sync,
  {
    (0..self.store.dimensions().npos).into_par_iter().map(|fov| self.process_fov(fov)).collect()
  }
}
