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

use std::sync::atomic::{AtomicUsize, Ordering};

use celltrack_watershed::prelude::*;

const SHAPE: (usize, usize) = (80, 100);

fn init_logger() {
  let _ = env_logger::builder().is_test(true).try_init();
}

fn paint_disc(img: &mut nd::Array2<u16>, centre: (f64, f64), radius: f64) {
  img.indexed_iter_mut().for_each(|((r, c), px)| {
    if (r as f64 - centre.0).hypot(c as f64 - centre.1) <= radius {
      *px = 1000;
    }
  });
}

/// Frames of one FOV: cells A and B drift right; at t=2 B is gone and C
/// appears.
fn drifting_cells() -> Vec<nd::Array2<u16>> {
  (0..3)
    .map(|t| {
      let shift = 2.0 * t as f64;
      let mut img = nd::Array2::zeros(SHAPE);
      paint_disc(&mut img, (20.0, 20.0 + shift), 8.0);
      if t < 2 {
        paint_disc(&mut img, (20.0, 60.0 + shift), 8.0);
      } else {
        paint_disc(&mut img, (60.0, 40.0), 7.0);
      }
      img
    })
    .collect()
}

fn intensity_predictor(img: nd::ArrayView2<u16>, _normalize: bool) -> Result<nd::Array2<f32>> {
  Ok(img.mapv(|px| px as f32 / 1000.0))
}

fn config_in(dir: &tempfile::TempDir) -> DatasetConfig {
  DatasetConfig { store_root: dir.path().to_path_buf(), name: "timelapse".to_string(), ..DatasetConfig::default() }
}

#[test]
fn empty_dataset_yields_empty_masks() {
  init_logger();
  let frames = vec![nd::Array2::<u16>::zeros((100, 100)); 2];
  let source = StackSource::new(vec![frames]).unwrap();
  let dir = tempfile::tempdir().unwrap();
  let tracker = Tracker::from_config(source, intensity_predictor, &config_in(&dir)).unwrap();

  let report = tracker.process_fov(0).unwrap();
  assert_eq!(report.next_identity, 1);
  for coord in tracker.store().frames() {
    for mask in [layer::MASK, layer::THRESHOLD, layer::SEGMENTATION] {
      let raster = tracker.store().read(mask, coord).unwrap().unwrap();
      assert!(raster.iter().all(|&px| px == 0));
    }
    assert!(tracker.store().exists(layer::PREDICTION, coord).unwrap());
  }
}

#[test]
fn identities_follow_cells_through_time() {
  init_logger();
  let source = StackSource::new(vec![drifting_cells()]).unwrap();
  let dir = tempfile::tempdir().unwrap();
  let tracker = Tracker::from_config(source, intensity_predictor, &config_in(&dir)).unwrap();
  let report = tracker.process_fov(0).unwrap();

  assert_eq!(report.frames[0].born, vec![1, 2]);
  assert_eq!(report.frames[1].matched, 2);
  assert!(report.frames[1].born.is_empty());
  assert_eq!(report.frames[2].lost, vec![2]);
  assert_eq!(report.frames[2].born, vec![3]);
  assert_eq!(report.next_identity, 4);

  let store = tracker.store();
  let last = store.read(layer::MASK, FrameCoord::new(0, 2)).unwrap().unwrap();
  assert_eq!(last[(20, 24)], 1);
  assert_eq!(last[(60, 40)], 3);
  assert!(!last.iter().any(|&id| id == 2));

  //The segmentation layer keeps the per-frame labels
  let seg = store.read(layer::SEGMENTATION, FrameCoord::new(0, 2)).unwrap().unwrap();
  assert_eq!(seg[(60, 40)], 2);
}

#[test]
fn fields_of_view_run_in_parallel() {
  init_logger();
  let fovs = vec![drifting_cells(), drifting_cells().into_iter().rev().collect()];
  let source = StackSource::new(fovs).unwrap();
  let dir = tempfile::tempdir().unwrap();
  let tracker = Tracker::from_config(source, intensity_predictor, &config_in(&dir)).unwrap();

  let reports = tracker.process_all().unwrap();
  assert_eq!(reports.len(), 2);
  assert_eq!(reports[0].fov, 0);
  assert_eq!(reports[1].fov, 1);
  assert_eq!(reports[0].next_identity, 4);
  //Reversed: A and C at t=0, B appears at t=1 while C disappears
  assert_eq!(reports[1].frames[1].born, vec![3]);
  assert_eq!(reports[1].frames[1].lost, vec![2]);
}

/// Predicts from intensities and counts how often it was asked to.
struct CountingPredictor {
  calls: AtomicUsize,
}

impl Predictor for CountingPredictor {
  fn predict(&self, image: nd::ArrayView2<u16>, normalize: bool) -> Result<nd::Array2<f32>> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    intensity_predictor(image, normalize)
  }
}

#[test]
fn cached_predictions_are_not_recomputed() {
  init_logger();
  let dir = tempfile::tempdir().unwrap();
  fn failing(_: nd::ArrayView2<u16>, _: bool) -> Result<nd::Array2<f32>> {
    Err(Error::Prediction("model unavailable".to_string()))
  }

  let counting = CountingPredictor { calls: AtomicUsize::new(0) };
  let first = Tracker::from_config(StackSource::new(vec![drifting_cells()]).unwrap(), counting, &config_in(&dir)).unwrap();
  let report = first.process_fov(0).unwrap();
  assert!(report.frames.iter().all(|frame| frame.predicted));
  assert_eq!(first.predictor().calls.load(Ordering::SeqCst), 3);

  //Running a frame again reuses the stored prediction
  let again = first.process_frame(FrameCoord::new(0, 1), report.frames[0].next_identity).unwrap();
  assert!(!again.predicted);
  assert_eq!(first.predictor().calls.load(Ordering::SeqCst), 3);
  drop(first);

  //A second run over the same store never calls the predictor
  let second = Tracker::from_config(StackSource::new(vec![drifting_cells()]).unwrap(), failing, &config_in(&dir)).unwrap();
  let rerun = second.process_fov(0).unwrap();
  assert!(rerun.frames.iter().all(|frame| !frame.predicted));
  assert_eq!(rerun.next_identity, report.next_identity);
}

#[test]
fn prediction_errors_propagate() {
  fn failing(_: nd::ArrayView2<u16>, _: bool) -> Result<nd::Array2<f32>> {
    Err(Error::Prediction("model unavailable".to_string()))
  }
  fn wrong_shape(_: nd::ArrayView2<u16>, _: bool) -> Result<nd::Array2<f32>> {
    Ok(nd::Array2::zeros((3, 3)))
  }
  let dir = tempfile::tempdir().unwrap();
  let tracker = Tracker::from_config(StackSource::new(vec![drifting_cells()]).unwrap(), failing, &config_in(&dir)).unwrap();
  assert!(matches!(tracker.process_fov(0), Err(Error::Prediction(_))));
  assert!(!tracker.store().exists(layer::PREDICTION, FrameCoord::new(0, 0)).unwrap());
  drop(tracker);

  let tracker = Tracker::from_config(StackSource::new(vec![drifting_cells()]).unwrap(), wrong_shape, &config_in(&dir)).unwrap();
  assert!(matches!(tracker.launch_prediction(FrameCoord::new(0, 0)), Err(Error::ShapeMismatch { .. })));
}

#[test]
fn stages_without_inputs_produce_empty_masks() {
  let dir = tempfile::tempdir().unwrap();
  let tracker = Tracker::from_config(StackSource::new(vec![drifting_cells()]).unwrap(), intensity_predictor, &config_in(&dir)).unwrap();
  let coord = FrameCoord::new(0, 1);

  assert!(tracker.threshold_prediction(coord).unwrap().iter().all(|&px| px == 0));
  assert!(tracker.segment(coord).unwrap().iter().all(|&px| px == 0));
  let corr = tracker.cell_correspondence(coord, 1).unwrap();
  assert!(corr.mask.iter().all(|&px| px == 0));

  //None of this touched the store
  assert!(!tracker.store().exists(layer::MASK, FrameCoord::new(0, 0)).unwrap());
  assert!(!tracker.store().exists(layer::SEGMENTATION, coord).unwrap());
  assert!(!tracker.store().exists(layer::THRESHOLD, coord).unwrap());
}

#[test]
fn manual_threshold_from_config() {
  let dir = tempfile::tempdir().unwrap();
  //No prediction value exceeds the fixed threshold
  let config = DatasetConfig { threshold: Some(2.0), ..config_in(&dir) };
  let tracker = Tracker::from_config(StackSource::new(vec![drifting_cells()]).unwrap(), intensity_predictor, &config).unwrap();
  let report = tracker.process_fov(0).unwrap();
  assert!(report.frames.iter().all(|frame| frame.cells == 0));
}

#[test]
fn out_of_range_requests_fail() {
  let dir = tempfile::tempdir().unwrap();
  let tracker = Tracker::from_config(StackSource::new(vec![drifting_cells()]).unwrap(), intensity_predictor, &config_in(&dir)).unwrap();
  assert!(!tracker.contains(FrameCoord::new(0, 3)));
  assert!(tracker.contains(FrameCoord::new(0, 2)));
  assert!(matches!(tracker.process_fov(1), Err(Error::OutOfBounds { .. })));
  assert!(matches!(tracker.load_image_channel(FrameCoord::new(0, 0), 1), Err(Error::FrameUnavailable { channel: 1, .. })));
  assert_eq!(tracker.load_image_channel(FrameCoord::new(0, 1), 0).unwrap(), drifting_cells()[1]);
}

fn two_channel_source() -> StackSource {
  let frames: Vec<Vec<Vec<nd::Array2<u16>>>> =
    vec![drifting_cells().iter().map(|img| vec![img.clone(), img.mapv(|px| px / 10)]).collect()];
  StackSource::with_channels(frames, vec!["BF".to_string(), "GFP".to_string()]).unwrap()
}

#[test]
fn fluorescence_channels_are_read_by_name() {
  let dir = tempfile::tempdir().unwrap();
  let config = DatasetConfig { fluorescence_channels: vec!["GFP".to_string()], ..config_in(&dir) };
  let tracker = Tracker::from_config(two_channel_source(), intensity_predictor, &config).unwrap();

  assert_eq!(tracker.store().channel_names().to_vec(), vec!["BF".to_string(), "GFP".to_string()]);
  assert_eq!(tracker.fluorescence_channels().to_vec(), vec!["GFP".to_string()]);
  let gfp = tracker.load_fluorescence(FrameCoord::new(0, 0), "GFP").unwrap();
  assert_eq!(gfp[(20, 20)], 100);
  assert_eq!(gfp, tracker.load_image_channel(FrameCoord::new(0, 0), 1).unwrap());

  //Brightfield is a channel of the source, but not a fluorescence channel
  assert!(matches!(tracker.load_fluorescence(FrameCoord::new(0, 0), "BF"), Err(Error::Config(_))));
}

#[test]
fn unknown_fluorescence_channels_are_rejected() {
  let dir = tempfile::tempdir().unwrap();
  let config = DatasetConfig { fluorescence_channels: vec!["mCherry".to_string()], ..config_in(&dir) };
  let tracker = Tracker::from_config(two_channel_source(), intensity_predictor, &config);
  assert!(matches!(tracker, Err(Error::Config(_))));
}

#[test]
fn changed_threshold_setting_recomputes_masks() {
  let dir = tempfile::tempdir().unwrap();
  let source = || StackSource::new(vec![drifting_cells()]).unwrap();
  let first = Tracker::from_config(source(), intensity_predictor, &config_in(&dir)).unwrap();
  let report = first.process_fov(0).unwrap();
  assert!(report.frames.iter().all(|frame| frame.cells > 0));
  assert_eq!(first.store().threshold_setting(), None);
  drop(first);

  //Predictions stay cached, the threshold masks follow the new setting
  let config = DatasetConfig { threshold: Some(2.0), ..config_in(&dir) };
  let rerun = Tracker::from_config(source(), intensity_predictor, &config).unwrap();
  assert_eq!(rerun.store().threshold_setting(), Some(2.0));
  assert!(!rerun.store().exists(layer::THRESHOLD, FrameCoord::new(0, 0)).unwrap());
  let report = rerun.process_fov(0).unwrap();
  assert!(report.frames.iter().all(|frame| !frame.predicted && frame.cells == 0));

  let reopened = LayeredStore::open(dir.path(), "timelapse").unwrap();
  assert_eq!(reopened.threshold_setting(), Some(2.0));
}

#[test]
fn mismatched_store_is_rejected() {
  let dir = tempfile::tempdir().unwrap();
  let dims = Dimensions { sizex: 10, sizey: 10, sizec: 1, sizet: 1, npos: 1 };
  let store = LayeredStore::create(dir.path(), "other", dims, Vec::new()).unwrap();
  let pipeline = PipelineBuilder::new().build().unwrap();
  let source = StackSource::new(vec![drifting_cells()]).unwrap();
  let tracker = Tracker::new(source, intensity_predictor, store, pipeline, CorrespondenceEngine::default());
  assert!(matches!(tracker, Err(Error::Config(_))));
}

#[test]
fn config_files_fill_in_defaults() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("config.json");
  std::fs::write(&path, r#"{ "name": "plate3", "threshold": 0.4, "tracking": { "solver": "greedy" } }"#).unwrap();

  let config = DatasetConfig::from_json_file(&path).unwrap();
  assert_eq!(config.name, "plate3");
  assert_eq!(config.threshold, Some(0.4));
  assert_eq!(config.tracking.solver, AssignmentSolver::Greedy);
  assert_eq!(config.segmentation, SegmentationParams::default());

  config.to_json_file(&path).unwrap();
  assert_eq!(DatasetConfig::from_json_file(&path).unwrap(), config);
}
