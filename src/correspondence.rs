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

//! Carrying cell identities from one frame to the next.
//!
//! Every region in the final mask of frame `t-1` carries an *identity*. The
//! regions of the segmentation of frame `t` are matched against these and
//! take over the identity of their match; unmatched regions are *born* and
//! receive a fresh identity, unmatched identities are *lost*.
//!
//! Matching runs in two passes:
//! 1. pairs that are each other's unique largest overlap are locked in;
//! 2. the remaining regions are matched by a minimum-cost assignment. An
//!    overlapping pair costs `1 - IoU`. Non-overlapping pairs can only be
//!    matched if a centroid distance gate is configured, at a cost
//!    `1 + d/gate` for centroids at most `gate` pixels apart.
//!
//! Fresh identities are allocated from `max(floor, largest previous
//! identity + 1)` upward, in ascending order of the current labels.

use std::collections::{BTreeMap, BTreeSet};

use log::debug;
use ndarray as nd;

use crate::assignment::{AssignmentSolver, FORBIDDEN};
use crate::config::TrackingParams;
use crate::error::{Error, Result};
use crate::morphology::{region_props, RegionProps};

/// Outcome of carrying identities into a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Correspondence {
  /// The current segmentation relabelled with identities
  pub mask: nd::Array2<u16>,
  /// `(identity, current label)` of every matched region, by identity
  pub matched: Vec<(u16, u16)>,
  /// Fresh identities handed out in this frame, ascending
  pub born: Vec<u16>,
  /// Identities of the previous frame without a match, ascending
  pub lost: Vec<u16>,
  /// Smallest identity a later frame may hand out
  pub next_identity: u32,
}

impl Correspondence {
  pub fn cell_count(&self) -> usize {
    self.matched.len() + self.born.len()
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CorrespondenceEngine {
  solver: AssignmentSolver,
  max_centroid_distance: Option<f64>,
}

impl CorrespondenceEngine {
  pub fn new(params: &TrackingParams) -> Self {
    CorrespondenceEngine { solver: params.solver, max_centroid_distance: params.max_centroid_distance }
  }

  pub fn with_solver(mut self, solver: AssignmentSolver) -> Self {
    self.solver = solver;
    self
  }

  pub fn with_max_centroid_distance(mut self, gate: Option<f64>) -> Self {
    self.max_centroid_distance = gate;
    self
  }

  pub fn solver(&self) -> AssignmentSolver {
    self.solver
  }

  pub fn max_centroid_distance(&self) -> Option<f64> {
    self.max_centroid_distance
  }

  /// Carries identities from `previous` (the final mask of the preceding
  /// frame) into `current` (the segmentation of this frame). Either may be
  /// absent:
  ///
  /// | previous | current | result |
  /// |----------|---------|--------|
  /// | yes | yes | current relabelled with carried identities |
  /// | yes | no  | all zero, every previous identity lost |
  /// | no  | yes | current unchanged, every label born |
  /// | no  | no  | all zero |
  ///
  /// `identity_floor` is the smallest identity a newborn region may take.
  pub fn correspond(
    &self,
    previous: Option<nd::ArrayView2<u16>>,
    current: Option<nd::ArrayView2<u16>>,
    shape: (usize, usize),
    identity_floor: u32,
  ) -> Result<Correspondence> {
    for found in previous.map(|r| r.dim()).into_iter().chain(current.map(|r| r.dim())) {
      if found != shape {
        return Err(Error::ShapeMismatch { expected: shape, found });
      }
    }
    let floor = identity_floor.max(1);

    match (previous, current) {
      (Some(previous), Some(current)) => self.relabel(previous, current, floor),
      (Some(previous), None) => {
        let lost: Vec<u16> = labels_of(previous).into_iter().collect();
        let next_identity = floor.max(lost.last().map_or(0, |&id| id as u32 + 1));
        Ok(Correspondence { mask: nd::Array2::zeros(shape), matched: Vec::new(), born: Vec::new(), lost, next_identity })
      }
      (None, Some(current)) => {
        let born: Vec<u16> = labels_of(current).into_iter().collect();
        let next_identity = floor.max(born.last().map_or(0, |&id| id as u32 + 1));
        Ok(Correspondence { mask: current.to_owned(), matched: Vec::new(), born, lost: Vec::new(), next_identity })
      }
      (None, None) => Ok(Correspondence {
        mask: nd::Array2::zeros(shape),
        matched: Vec::new(),
        born: Vec::new(),
        lost: Vec::new(),
        next_identity: floor,
      }),
    }
  }

  /// Relabels `current` with the identities of `previous`. Both rasters must
  /// have the same shape.
  pub fn relabel(&self, previous: nd::ArrayView2<u16>, current: nd::ArrayView2<u16>, identity_floor: u32) -> Result<Correspondence> {
    if previous.dim() != current.dim() {
      return Err(Error::ShapeMismatch { expected: previous.dim(), found: current.dim() });
    }
    let prev_props = region_props(previous);
    let curr_props = region_props(current);
    let overlaps = overlap_counts(previous, current);

    //(1) lock in unambiguous largest overlaps
    let locked = overlap_locks(&overlaps);
    let locked_prev: BTreeSet<u16> = locked.iter().map(|&(p, _)| p).collect();
    let locked_curr: BTreeSet<u16> = locked.iter().map(|&(_, c)| c).collect();

    //(2) optimal assignment of what is left
    let rest_prev: Vec<u16> = prev_props.keys().copied().filter(|id| !locked_prev.contains(id)).collect();
    let rest_curr: Vec<u16> = curr_props.keys().copied().filter(|lbl| !locked_curr.contains(lbl)).collect();
    let mut identity_of: BTreeMap<u16, u16> = locked.iter().map(|&(p, c)| (c, p)).collect();
    if !rest_prev.is_empty() && !rest_curr.is_empty() {
      let cost = nd::Array2::from_shape_fn((rest_prev.len(), rest_curr.len()), |(i, j)| {
        let (p, c) = (rest_prev[i], rest_curr[j]);
        self.pair_cost(overlaps.get(&(p, c)).copied(), &prev_props[&p], &curr_props[&c])
      });
      for (i, j) in self.solver.solve(cost.view()) {
        identity_of.insert(rest_curr[j], rest_prev[i]);
      }
    }
    let matched_ids: BTreeSet<u16> = identity_of.values().copied().collect();

    //(3) fresh identities for the unmatched, in ascending label order
    let mut next = identity_floor.max(1).max(prev_props.keys().next_back().map_or(0, |&id| id as u32 + 1));
    let mut born = Vec::new();
    for &lbl in curr_props.keys() {
      if identity_of.contains_key(&lbl) {
        continue;
      }
      let id = u16::try_from(next).map_err(|_| Error::LabelOverflow)?;
      identity_of.insert(lbl, id);
      born.push(id);
      next += 1;
    }
    let lost: Vec<u16> = prev_props.keys().copied().filter(|id| !matched_ids.contains(id)).collect();

    //(4) apply the relabelling through a lookup table
    let max_label = curr_props.keys().next_back().copied().unwrap_or(0) as usize;
    let mut lut = vec![0u16; max_label + 1];
    identity_of.iter().for_each(|(&lbl, &id)| lut[lbl as usize] = id);
    let mask = current.mapv(|lbl| lut[lbl as usize]);

    let mut matched: Vec<(u16, u16)> = identity_of
      .iter()
      .filter(|&(_, &id)| matched_ids.contains(&id))
      .map(|(&lbl, &id)| (id, lbl))
      .collect();
    matched.sort_unstable();
    debug!(
      "carried {} identities ({} locked), {} born, {} lost",
      matched.len(),
      locked.len(),
      born.len(),
      lost.len()
    );

    Ok(Correspondence { mask, matched, born, lost, next_identity: next })
  }

  fn pair_cost(&self, overlap: Option<usize>, prev: &RegionProps, curr: &RegionProps) -> f64 {
    if let Some(overlap) = overlap {
      let union = prev.area + curr.area - overlap;
      return 1.0 - overlap as f64 / union as f64;
    }
    match self.max_centroid_distance {
      Some(gate) => {
        let ((pr, pc), (cr, cc)) = (prev.centroid(), curr.centroid());
        let distance = (pr - cr).hypot(pc - cc);
        if distance > gate {
          FORBIDDEN
        } else if gate > 0.0 {
          1.0 + distance / gate
        } else {
          1.0
        }
      }
      None => FORBIDDEN,
    }
  }
}

fn labels_of(raster: nd::ArrayView2<u16>) -> BTreeSet<u16> {
  raster.iter().copied().filter(|&lbl| lbl != 0).collect()
}

/// Number of pixels shared by every `(previous, current)` pair of regions.
fn overlap_counts(previous: nd::ArrayView2<u16>, current: nd::ArrayView2<u16>) -> BTreeMap<(u16, u16), usize> {
  let mut overlaps = BTreeMap::new();
  nd::Zip::from(&previous).and(&current).for_each(|&p, &c| {
    if p != 0 && c != 0 {
      *overlaps.entry((p, c)).or_insert(0) += 1;
    }
  });
  overlaps
}

/// Pairs `(previous, current)` where the previous identity is the strict best
/// overlap of the current region and no other current region overlaps that
/// identity by more. When several current regions qualify for one identity
/// none of them is locked.
fn overlap_locks(overlaps: &BTreeMap<(u16, u16), usize>) -> Vec<(u16, u16)> {
  //Best partner per current region, `None` when the maximum is shared
  let mut best_for_curr: BTreeMap<u16, (Option<u16>, usize)> = BTreeMap::new();
  let mut max_on_prev: BTreeMap<u16, usize> = BTreeMap::new();
  for (&(p, c), &count) in overlaps {
    let entry = best_for_curr.entry(c).or_insert((None, 0));
    if count > entry.1 {
      *entry = (Some(p), count);
    } else if count == entry.1 {
      entry.0 = None;
    }
    let max = max_on_prev.entry(p).or_insert(0);
    *max = (*max).max(count);
  }

  let mut claims: BTreeMap<u16, Vec<u16>> = BTreeMap::new();
  for (c, (p, count)) in best_for_curr {
    if let Some(p) = p {
      if max_on_prev.get(&p) == Some(&count) {
        claims.entry(p).or_default().push(c);
      }
    }
  }
  claims.into_iter().filter(|(_, cs)| cs.len() == 1).map(|(p, cs)| (p, cs[0])).collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn ties_are_not_locked() {
    let overlaps: BTreeMap<(u16, u16), usize> = [((1, 1), 5), ((1, 2), 5), ((2, 3), 4)].into_iter().collect();
    assert_eq!(overlap_locks(&overlaps), vec![(2, 3)]);
  }

  #[test]
  fn sole_overlap_is_locked_despite_a_tie_on_the_identity() {
    //Current 1 only touches identity 1, current 2 prefers identity 2
    let overlaps: BTreeMap<(u16, u16), usize> =
      [((1, 1), 10), ((1, 2), 10), ((2, 2), 20), ((2, 3), 30)].into_iter().collect();
    assert_eq!(overlap_locks(&overlaps), vec![(1, 1), (2, 3)]);
  }

  #[test]
  fn distance_gate_allows_nearby_regions() {
    let mut previous = nd::Array2::<u16>::zeros((10, 10));
    previous.slice_mut(nd::s![1..3, 1..3]).fill(4);
    let mut current = nd::Array2::<u16>::zeros((10, 10));
    current.slice_mut(nd::s![1..3, 5..7]).fill(1);

    let strict = CorrespondenceEngine::default().relabel(previous.view(), current.view(), 1).unwrap();
    assert_eq!(strict.born, vec![5]);
    assert_eq!(strict.lost, vec![4]);

    let gated = CorrespondenceEngine::default().with_max_centroid_distance(Some(5.0));
    let carried = gated.relabel(previous.view(), current.view(), 1).unwrap();
    assert_eq!(carried.matched, vec![(4, 1)]);
    assert_eq!(carried.mask[(1, 5)], 4);
    assert_eq!(carried.next_identity, 5);
  }
}
