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

//! Merging of over-split watershed lakes.
//!
//! Distance-transform seeds are placed purely on geometry, so elongated or
//! irregular cells can end up split over several lakes. A [`MergePolicy`]
//! decides which neighbouring lakes belong together. Mergers are resolved
//! transitively: if `1` merges with `2` and `2` with `3`, all three become
//! one region carrying the smallest of their colours.

use std::collections::BTreeMap;

use ndarray as nd;
use rayon::prelude::*;

use crate::config::MergeParams;
use crate::morphology::neighbours_8con;
use crate::watershed::UNCOLOURED;

/// Strategy deciding which touching lakes describe the same cell.
pub trait MergePolicy: Send + Sync + std::fmt::Debug {
  /// Returns groups of lake colours that should be merged. Groups may share
  /// colours; they are combined transitively by the pipeline.
  ///
  /// `lakes` and `prediction` always have the same shape.
  fn find_mergers(&self, lakes: nd::ArrayView2<usize>, prediction: nd::ArrayView2<f32>) -> Vec<Vec<usize>>;
}

/// Never merges anything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoMerge;

impl MergePolicy for NoMerge {
  fn find_mergers(&self, _: nd::ArrayView2<usize>, _: nd::ArrayView2<f32>) -> Vec<Vec<usize>> {
    Vec::new()
  }
}

/// Merges lakes whose shared boundary shows no dip in the prediction, and
/// lakes too small to be a cell on their own.
///
/// A boundary between lakes `a` and `b` is merged when it is at least
/// `min_contact` pixels long and its mean prediction is at least
/// `min_boundary_ratio` times the smaller of the two lake means. A lake with
/// fewer than `min_fragment_area` pixels is merged into the neighbour it
/// shares the longest boundary with (smaller colour on ties).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundaryMerge {
  pub min_boundary_ratio: f32,
  pub min_contact: usize,
  pub min_fragment_area: usize,
}

impl Default for BoundaryMerge {
  fn default() -> Self {
    BoundaryMerge::from(MergeParams::default())
  }
}

impl From<MergeParams> for BoundaryMerge {
  fn from(params: MergeParams) -> Self {
    BoundaryMerge {
      min_boundary_ratio: params.min_boundary_ratio,
      min_contact: params.min_contact,
      min_fragment_area: params.min_fragment_area,
    }
  }
}

impl MergePolicy for BoundaryMerge {
  fn find_mergers(&self, lakes: nd::ArrayView2<usize>, prediction: nd::ArrayView2<f32>) -> Vec<Vec<usize>> {
    let contacts = find_contacts(lakes, prediction);
    let stats = lake_stats(lakes, prediction);
    let mut mergers = Vec::new();

    //(1) boundaries without a valley in the prediction
    for (&(a, b), contact) in &contacts {
      if contact.pixels < self.min_contact {
        continue;
      }
      let boundary = contact.prediction_sum / contact.pixels as f64;
      let interior = stats[&a].mean().min(stats[&b].mean());
      //A flat, empty prediction carries no evidence either way
      if interior > 0.0 && boundary >= self.min_boundary_ratio as f64 * interior {
        mergers.push(vec![a, b]);
      }
    }

    //(2) fragments too small to stand on their own
    for (&col, stat) in &stats {
      if stat.area >= self.min_fragment_area {
        continue;
      }
      let best = contacts
        .iter()
        .filter_map(|(&(a, b), contact)| {
          if col == a {
            Some((b, contact.pixels))
          } else if col == b {
            Some((a, contact.pixels))
          } else {
            None
          }
        })
        //Iteration is in ascending colour order, so strict comparison keeps
        //the smaller colour on ties
        .fold(None, |best: Option<(usize, usize)>, (other, pixels)| match best {
          Some((_, most)) if most >= pixels => best,
          _ => Some((other, pixels)),
        });
      if let Some((other, _)) = best {
        mergers.push(vec![col, other]);
      }
    }

    mergers
  }
}

#[derive(Debug, Clone, Copy, Default)]
struct Contact {
  pixels: usize,
  prediction_sum: f64,
}

#[derive(Debug, Clone, Copy, Default)]
struct LakeStat {
  area: usize,
  prediction_sum: f64,
}

impl LakeStat {
  fn mean(&self) -> f64 {
    self.prediction_sum / self.area.max(1) as f64
  }
}

/// Boundary pixels between every pair of touching lakes, keyed `(small, large)`.
/// A boundary pixel is a pixel with at least one 8-neighbour of another colour;
/// pixels on both sides of a boundary count.
fn find_contacts(lakes: nd::ArrayView2<usize>, prediction: nd::ArrayView2<f32>) -> BTreeMap<(usize, usize), Contact> {
  //Window size and index of center window pixel
  const WINDOW: (usize, usize) = (3, 3);
  const MID: (usize, usize) = (1, 1);

  let (rows, cols) = lakes.dim();
  let mut padded = nd::Array2::from_elem((rows + 2, cols + 2), UNCOLOURED);
  padded.slice_mut(nd::s![1..rows + 1, 1..cols + 1]).assign(&lakes);
  let mut padded_pred = nd::Array2::<f32>::zeros((rows + 2, cols + 2));
  padded_pred.slice_mut(nd::s![1..rows + 1, 1..cols + 1]).assign(&prediction);

  /*
    For each target pixel we:
      1. Check if the pixel is uncoloured. YES -> ignore, NO -> continue
      2. Collect the colours of its neighbours that are neither uncoloured nor
        its own colour
      3. Ignore the pixel if there are none (this is a lake pixel)
    What is left are boundary pixels, together with the lakes they touch.
  */
  let boundary: Vec<(usize, Vec<usize>, f32)> = nd::Zip::from(padded.windows(WINDOW))
    .and(padded_pred.windows(WINDOW))
    .into_par_iter()
    //(1) Check pixel colour
    .filter(|&(col_wd, _)| col_wd[MID] != UNCOLOURED)
    //(2) Map to the colours of foreign neighbours
    .map(|(col_wd, pred_wd)| {
      let own_col = col_wd[MID];
      let mut neigh_col: Vec<usize> = neighbours_8con(&MID)
        .into_iter()
        .map(|idx| col_wd[idx])
        .filter(|&col| col != UNCOLOURED && col != own_col)
        .collect();
      neigh_col.sort_unstable();
      neigh_col.dedup();
      (own_col, neigh_col, pred_wd[MID])
    })
    //(3) Ignore lake pixels
    .filter(|(_own_col, neigh_col, _pred)| !neigh_col.is_empty())
    .collect();

  //Accumulate sequentially, in raster order, so sums do not depend on threads
  let mut contacts: BTreeMap<(usize, usize), Contact> = BTreeMap::new();
  for (own_col, neigh_col, pred) in boundary {
    for other in neigh_col {
      let entry = contacts.entry((own_col.min(other), own_col.max(other))).or_default();
      entry.pixels += 1;
      entry.prediction_sum += pred as f64;
    }
  }
  contacts
}

fn lake_stats(lakes: nd::ArrayView2<usize>, prediction: nd::ArrayView2<f32>) -> BTreeMap<usize, LakeStat> {
  let mut stats: BTreeMap<usize, LakeStat> = BTreeMap::new();
  nd::Zip::from(&lakes).and(&prediction).for_each(|&col, &pred| {
    if col != UNCOLOURED {
      let entry = stats.entry(col).or_default();
      entry.area += 1;
      entry.prediction_sum += pred as f64;
    }
  });
  stats
}

/// Applies `local_mergers` to `lakes`, which carries colours `0..=n_colours`.
pub(crate) fn merge_lakes(lakes: nd::ArrayViewMut2<usize>, n_colours: usize, local_mergers: Vec<Vec<usize>>) {
  if local_mergers.is_empty() {
    return;
  }
  let mut colour_map: Vec<usize> = (0..=n_colours).collect();
  make_colour_map(&mut colour_map, local_mergers);
  recolour(lakes, colour_map);
}

#[inline(always)]
fn recolour(canvas: nd::ArrayViewMut2<usize>, colour_map: Vec<usize>) {
  canvas.into_par_iter().for_each(|col| *col = colour_map.get(*col).copied().unwrap_or(*col))
}

fn make_colour_map(base_map: &mut [usize], local_mergers: Vec<Vec<usize>>) {
  /* REDUCING 2-REGION MERGERS TO N-REGION MERGERS
    We are given a list of *locally* connected regions. For instance:
      (1,2,3) and (2,4,5)
    We have to turn locally connected regions into globally connected regions.
    In the example, the two locally connected regions are not connected directly,
    but only via region 2. They still have to merge into a single region:
      (1,2,3,4,5)
    regardless of the order in which they were specified!
  */
  let mut connected_mergers: Vec<Vec<usize>> = Vec::new();

  for mut local_merge in local_mergers {
    //Split off every region sharing a colour with the local merger
    let (connected, rest): (Vec<_>, Vec<_>) = connected_mergers
      .into_iter()
      .partition(|region| local_merge.iter().any(|col| region.contains(col)));

    let mut new_region: Vec<usize> = connected.into_iter().flatten().collect();
    new_region.append(&mut local_merge);
    new_region.sort_unstable();
    new_region.dedup();

    connected_mergers = rest;
    connected_mergers.push(new_region);
  }

  let len = base_map.len();
  for merge in connected_mergers {
    //Regions are sorted, the first colour is the smallest
    if let Some(&merged_col) = merge.first() {
      merge.into_iter().filter(|&col| col < len).for_each(|original| base_map[original] = merged_col)
    }
  }
}
