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

//! From a binary foreground mask and a soft prediction to a label image.
//!
//! The pipeline runs in five stages:
//! 1. the Euclidean distance of every foreground pixel to the background is
//!    computed;
//! 2. local maxima of the distance map become watershed seeds, at least
//!    `min_seed_distance` pixels apart, and every connected foreground
//!    component gets at least one seed;
//! 3. the negated distance map is flooded from the seeds, restricted to the
//!    foreground, which splits touching cells along their narrowest neck;
//! 4. a [`MergePolicy`] rejoins lakes that were split without evidence in
//!    the prediction;
//! 5. an [`ArtifactFilter`] removes debris and numbers the regions `1..=n`.

use log::debug;
use ndarray as nd;

use crate::artifacts::ArtifactFilter;
use crate::config::{ArtifactParams, MergeParams, SegmentationParams};
use crate::error::{Error, Result};
use crate::merge::{self, BoundaryMerge, MergePolicy, NoMerge};
use crate::morphology::{distance_transform_edt, label_regions, maximum_filter};
use crate::watershed::{self, SeededWatershed, NORMAL_MAX};

/// A configured segmentation pipeline. Use [`PipelineBuilder`] to create one.
/// The pipeline is `Send + Sync` and can be shared between threads.
#[derive(Debug)]
pub struct SegmentationPipeline {
  min_seed_distance: usize,
  watershed: SeededWatershed,
  merge_policy: Box<dyn MergePolicy>,
  artifacts: ArtifactFilter,
}

impl SegmentationPipeline {
  /// Segments the foreground of `threshold` (non-zero pixels) into labelled
  /// cells, using `prediction` to decide about merging. Returns an all-zero
  /// image if there is no foreground.
  pub fn segment(&self, threshold: nd::ArrayView2<u16>, prediction: nd::ArrayView2<f32>) -> Result<nd::Array2<u16>> {
    if threshold.dim() != prediction.dim() {
      return Err(Error::ShapeMismatch { expected: threshold.dim(), found: prediction.dim() });
    }
    let mask = threshold.mapv(|px| px != 0);
    if !mask.iter().any(|&fg| fg) {
      debug!("no foreground, nothing to segment");
      return Ok(nd::Array2::zeros(threshold.dim()));
    }

    #[cfg(feature = "debug")]
    let (mut perf, start) = (crate::perf::PerfReport::default(), std::time::Instant::now());

    //(1-3) split the foreground into lakes
    #[cfg(feature = "debug")]
    let (mut lakes, n_lakes) = perf.time("splitting", || self.split(mask.view()));
    #[cfg(not(feature = "debug"))]
    let (mut lakes, n_lakes) = self.split(mask.view());

    //(4) rejoin over-split lakes
    #[cfg(feature = "debug")]
    perf.time("merging", || {
      let mergers = self.merge_policy.find_mergers(lakes.view(), prediction);
      merge::merge_lakes(lakes.view_mut(), n_lakes, mergers)
    });
    #[cfg(not(feature = "debug"))]
    {
      let mergers = self.merge_policy.find_mergers(lakes.view(), prediction);
      merge::merge_lakes(lakes.view_mut(), n_lakes, mergers);
    }

    //(5) remove debris
    #[cfg(feature = "debug")]
    let labels = perf.time("artifact removal", || self.artifacts.apply(lakes.view()))?;
    #[cfg(not(feature = "debug"))]
    let labels = self.artifacts.apply(lakes.view())?;

    #[cfg(feature = "debug")]
    {
      perf.total_ms = start.elapsed().as_millis() as usize;
      debug!("segmentation of {n_lakes} lakes\n{perf}");
    }

    Ok(labels)
  }

  /// Distance transform, seed detection and flooding of `mask`. Returns the
  /// lakes, coloured `1..=n`, and the number of seeds `n`.
  pub fn split(&self, mask: nd::ArrayView2<bool>) -> (nd::Array2<usize>, usize) {
    let distance = distance_transform_edt(mask);
    let seeds = self.find_seeds(distance.view(), mask);
    //Cell centres are the deepest points of the basin
    let levels = watershed::pre_processor(distance.mapv(|d| -d).view(), mask);
    let lakes = self.watershed.transform(levels.view(), &seeds);
    (lakes, seeds.len())
  }

  /// Seeds for the watershed transform of a distance map.
  ///
  /// Candidates are foreground pixels equal to the maximum of the
  /// `(2r+1)x(2r+1)` window around them, with `r = min_seed_distance`. They
  /// are accepted from the largest distance down (raster order on ties),
  /// skipping candidates within `r` pixels (Chebyshev) of an accepted seed.
  /// Connected foreground components left without a seed get one at their
  /// largest distance.
  pub fn find_seeds(&self, distance: nd::ArrayView2<f64>, mask: nd::ArrayView2<bool>) -> Vec<(usize, usize)> {
    let radius = self.min_seed_distance;
    let (rows, cols) = distance.dim();
    let peaks = maximum_filter(distance, radius);

    //(1) candidates, highest first
    let mut candidates: Vec<((usize, usize), f64)> = distance
      .indexed_iter()
      .filter(|&(idx, &dist)| mask[idx] && dist > 0.0 && dist >= peaks[idx])
      .map(|(idx, &dist)| (idx, dist))
      .collect();
    candidates.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

    //(2) greedy acceptance
    let mut blocked = nd::Array2::from_elem((rows, cols), false);
    let mut seeds = Vec::new();
    for (idx, _) in candidates {
      if blocked[idx] {
        continue;
      }
      seeds.push(idx);
      let (r, c) = idx;
      blocked
        .slice_mut(nd::s![r.saturating_sub(radius)..(r + radius + 1).min(rows), c.saturating_sub(radius)..(c + radius + 1).min(cols)])
        .fill(true);
    }

    //(3) make sure every component has a seed
    let (components, n_components) = label_regions(mask.mapv(u8::from).view());
    let mut seeded = vec![false; n_components + 1];
    seeds.iter().for_each(|&idx| seeded[components[idx]] = true);
    let mut deepest: Vec<Option<((usize, usize), f64)>> = vec![None; n_components + 1];
    for (idx, &comp) in components.indexed_iter() {
      if comp == 0 || seeded[comp] {
        continue;
      }
      let dist = distance[idx];
      if deepest[comp].map_or(true, |(_, best)| dist > best) {
        deepest[comp] = Some((idx, dist));
      }
    }
    seeds.extend(deepest.into_iter().flatten().map(|(idx, _)| idx));

    debug!("found {} seeds in {n_components} components", seeds.len());
    seeds
  }

  pub fn min_seed_distance(&self) -> usize {
    self.min_seed_distance
  }

  pub fn max_water_level(&self) -> u8 {
    self.watershed.max_water_level()
  }

  pub fn merge_policy(&self) -> &dyn MergePolicy {
    self.merge_policy.as_ref()
  }

  pub fn artifact_filter(&self) -> ArtifactFilter {
    self.artifacts
  }
}

/// Builder for [`SegmentationPipeline`].
///
/// Start from `PipelineBuilder::new()` (default parameters) or
/// `PipelineBuilder::from_params()`, adjust options with the `set_*` methods
/// and call `build()`.
/// ```
/// use celltrack_watershed::prelude::*;
///
/// let pipeline = PipelineBuilder::new()
///   .set_min_seed_distance(6)
///   .set_merge_policy(Box::new(NoMerge))
///   .build()
///   .unwrap();
/// let empty = nd::Array2::<u16>::zeros((32, 32));
/// let flat = nd::Array2::<f32>::zeros((32, 32));
/// assert!(pipeline.segment(empty.view(), flat.view()).unwrap().iter().all(|&l| l == 0));
/// ```
#[derive(Debug)]
pub struct PipelineBuilder {
  params: SegmentationParams,
  merge_policy: Option<Box<dyn MergePolicy>>,
}

impl Default for PipelineBuilder {
  fn default() -> Self {
    Self::new()
  }
}

impl PipelineBuilder {
  pub fn new() -> Self {
    Self::from_params(SegmentationParams::default())
  }

  pub fn from_params(params: SegmentationParams) -> Self {
    PipelineBuilder { params, merge_policy: None }
  }

  /// Minimum spacing between seeds, in pixels. Must be at least 1.
  pub fn set_min_seed_distance(mut self, pixels: usize) -> Self {
    self.params.min_seed_distance = pixels;
    self
  }

  /// Set the maximum water level that the flood will reach. Note that the
  /// maximum water level may not be set higher than `u8::MAX - 1` (254).
  /// Foreground pixels above the maximum level stay unlabelled.
  pub fn set_max_water_lvl(mut self, max_water_lvl: u8) -> Self {
    self.params.max_water_level = max_water_lvl;
    self
  }

  /// Configure the default merge policy. Overridden by `set_merge_policy`.
  pub fn set_merge_params(mut self, params: MergeParams) -> Self {
    self.params.merge = params;
    self
  }

  /// Use a custom merge policy.
  pub fn set_merge_policy(mut self, policy: Box<dyn MergePolicy>) -> Self {
    self.merge_policy = Some(policy);
    self
  }

  /// Configure the clean-up of the final label image.
  pub fn set_artifact_filter(mut self, filter: ArtifactFilter) -> Self {
    self.params.artifacts = ArtifactParams { min_area: filter.min_area, discard_border: filter.discard_border };
    self
  }

  /// Build a `SegmentationPipeline` from the current configuration. Returns a
  /// `Config` error for out-of-range parameters.
  pub fn build(self) -> Result<SegmentationPipeline> {
    let PipelineBuilder { params, merge_policy } = self;
    if params.max_water_level > NORMAL_MAX {
      return Err(Error::Config(format!(
        "Max water level was set at {}, which is higher than the allowed maximum ({NORMAL_MAX}).",
        params.max_water_level
      )));
    }
    if params.min_seed_distance == 0 {
      return Err(Error::Config("minimum seed distance must be at least one pixel".to_string()));
    }
    let ratio = params.merge.min_boundary_ratio;
    if !ratio.is_finite() || ratio < 0.0 {
      return Err(Error::Config(format!("merge boundary ratio must be a finite, non-negative number, got {ratio}")));
    }

    let merge_policy = merge_policy.unwrap_or_else(|| -> Box<dyn MergePolicy> {
      if params.merge.enabled {
        Box::new(BoundaryMerge::from(params.merge))
      } else {
        Box::new(NoMerge)
      }
    });

    Ok(SegmentationPipeline {
      min_seed_distance: params.min_seed_distance,
      watershed: SeededWatershed::new(params.max_water_level),
      merge_policy,
      artifacts: ArtifactFilter::from(params.artifacts),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn builder_rejects_out_of_range_parameters() {
    assert!(matches!(PipelineBuilder::new().set_max_water_lvl(255).build(), Err(Error::Config(_))));
    assert!(matches!(PipelineBuilder::new().set_min_seed_distance(0).build(), Err(Error::Config(_))));
    let params = MergeParams { min_boundary_ratio: f32::NAN, ..MergeParams::default() };
    assert!(matches!(PipelineBuilder::new().set_merge_params(params).build(), Err(Error::Config(_))));
  }

  #[test]
  fn every_component_gets_a_seed() {
    //Two small squares closer together than the seed distance
    let mut mask = nd::Array2::from_elem((12, 12), false);
    mask.slice_mut(nd::s![1..4, 1..4]).fill(true);
    mask.slice_mut(nd::s![1..4, 6..8]).fill(true);
    let pipeline = PipelineBuilder::new().set_min_seed_distance(10).build().unwrap();
    let distance = distance_transform_edt(mask.view());
    let seeds = pipeline.find_seeds(distance.view(), mask.view());

    assert_eq!(seeds.len(), 2);
    assert_eq!(seeds[0], (2, 2));
    assert!(seeds.iter().all(|&idx| mask[idx]));
  }

  #[test]
  fn flooding_covers_the_whole_foreground() {
    let mut mask = nd::Array2::from_elem((20, 30), false);
    mask.slice_mut(nd::s![2..18, 3..27]).fill(true);
    let pipeline = PipelineBuilder::new().set_min_seed_distance(4).build().unwrap();
    let (lakes, n) = pipeline.split(mask.view());

    assert!(n >= 1);
    nd::Zip::from(&lakes).and(&mask).for_each(|&lake, &fg| assert_eq!(lake != 0, fg));
  }
}
