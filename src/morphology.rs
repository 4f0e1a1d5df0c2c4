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

//! Numeric building blocks shared by the segmentation pipeline and the
//! correspondence engine: neighbourhoods, the exact euclidean distance
//! transform, maximum filtering and connected-region labelling.

use std::collections::{BTreeMap, VecDeque};

use ndarray as nd;
use num_traits::Zero;
use rayon::prelude::*;

//Stand-in for "infinitely far" that keeps the lower-envelope arithmetic exact
//for any realistic frame size (squared distances stay well below 2^53)
const FAR: f64 = 1e12;

////////////////////////////////////////////////////////////////////////////////
//                               NEIGHBOURHOODS                               //
////////////////////////////////////////////////////////////////////////////////

#[inline]
pub(crate) fn neighbours_8con(index: &(usize, usize)) -> Vec<(usize, usize)> {
  let (x, y): (isize, isize) = (index.0 as isize, index.1 as isize);
  [
    (x + 1, y),
    (x + 1, y + 1),
    (x + 1, y - 1),
    (x, y + 1),
    (x, y - 1),
    (x - 1, y),
    (x - 1, y + 1),
    (x - 1, y - 1),
  ]
  .iter()
  .filter_map(|&(x, y)| if x < 0 || y < 0 { None } else { Some((x as usize, y as usize)) })
  .collect()
}

/// 8-connected neighbours of `index` that lie inside an array of `shape`
#[inline]
pub(crate) fn neighbours_within(index: &(usize, usize), shape: (usize, usize)) -> Vec<(usize, usize)> {
  neighbours_8con(index).into_iter().filter(|&(x, y)| x < shape.0 && y < shape.1).collect()
}

////////////////////////////////////////////////////////////////////////////////
//                             DISTANCE TRANSFORM                             //
////////////////////////////////////////////////////////////////////////////////

/// Exact euclidean distance from every foreground (`true`) pixel to the nearest
/// background pixel. Background pixels have distance zero.
///
/// The transform is separable: the squared distance is computed column by
/// column and then row by row as the lower envelope of parabolas (Felzenszwalb
/// & Huttenlocher, 2012). Both passes run in parallel over lanes.
///
/// A frame without any background pixel measures distances to the (virtual)
/// background just outside the frame.
pub fn distance_transform_edt(mask: nd::ArrayView2<bool>) -> nd::Array2<f64> {
  let (rows, cols) = mask.dim();
  if rows == 0 || cols == 0 {
    return nd::Array2::zeros((rows, cols));
  }

  if mask.iter().all(|&fg| fg) {
    let mut padded = nd::Array2::from_elem((rows + 2, cols + 2), false);
    padded.slice_mut(nd::s![1..rows + 1, 1..cols + 1]).assign(&mask);
    let dist = squared_edt(padded.view());
    return dist.slice(nd::s![1..rows + 1, 1..cols + 1]).mapv(f64::sqrt);
  }

  squared_edt(mask).mapv_into(f64::sqrt)
}

fn squared_edt(mask: nd::ArrayView2<bool>) -> nd::Array2<f64> {
  let mut out = mask.mapv(|fg| if fg { FAR } else { 0.0 });
  //(1) along columns
  out.axis_iter_mut(nd::Axis(1)).into_par_iter().for_each(envelope_lane);
  //(2) along rows, on top of the column distances
  out.axis_iter_mut(nd::Axis(0)).into_par_iter().for_each(envelope_lane);
  out
}

fn envelope_lane(mut lane: nd::ArrayViewMut1<f64>) {
  let f = lane.to_vec();
  let n = f.len();
  if n == 0 {
    return;
  }

  //Abscissa where the parabolas rooted at q and p (q > p) intersect
  let intersect = |q: usize, p: usize| -> f64 {
    let (qf, pf) = (q as f64, p as f64);
    ((f[q] + qf * qf) - (f[p] + pf * pf)) / (2.0 * (qf - pf))
  };

  //v: roots of the parabolas in the envelope, z: boundaries between them
  let mut v = vec![0usize; n];
  let mut z = vec![0f64; n + 1];
  let mut k = 0usize;
  z[0] = f64::NEG_INFINITY;
  z[1] = f64::INFINITY;

  for q in 1..n {
    let mut s = intersect(q, v[k]);
    while s <= z[k] {
      k -= 1;
      s = intersect(q, v[k]);
    }
    k += 1;
    v[k] = q;
    z[k] = s;
    z[k + 1] = f64::INFINITY;
  }

  k = 0;
  for q in 0..n {
    while z[k + 1] < q as f64 {
      k += 1;
    }
    let dq = q as f64 - v[k] as f64;
    lane[q] = dq * dq + f[v[k]];
  }
}

////////////////////////////////////////////////////////////////////////////////
//                               MAXIMUM FILTER                               //
////////////////////////////////////////////////////////////////////////////////

/// Maximum over a square `(2 * radius + 1)` window centred on every pixel. The
/// window is clipped at the frame edge.
pub fn maximum_filter(img: nd::ArrayView2<f64>, radius: usize) -> nd::Array2<f64> {
  let mut out = img.to_owned();
  if radius == 0 {
    return out;
  }
  out.axis_iter_mut(nd::Axis(0)).into_par_iter().for_each(|lane| max_lane(lane, radius));
  out.axis_iter_mut(nd::Axis(1)).into_par_iter().for_each(|lane| max_lane(lane, radius));
  out
}

fn max_lane(mut lane: nd::ArrayViewMut1<f64>, radius: usize) {
  let src = lane.to_vec();
  let n = src.len();
  for (i, px) in lane.iter_mut().enumerate() {
    let lo = i.saturating_sub(radius);
    let hi = (i + radius).min(n - 1);
    *px = src[lo..=hi].iter().copied().fold(f64::NEG_INFINITY, f64::max);
  }
}

////////////////////////////////////////////////////////////////////////////////
//                                  REGIONS                                   //
////////////////////////////////////////////////////////////////////////////////

/// Labels 8-connected regions of equal, non-zero value. Regions are numbered
/// `1..=n` in raster order of their first pixel; zero stays zero. Returns the
/// label image and `n`.
pub fn label_regions<T>(img: nd::ArrayView2<T>) -> (nd::Array2<usize>, usize)
where
  T: Copy + PartialEq + Zero,
{
  let shape = img.dim();
  let mut labels = nd::Array2::<usize>::zeros(shape);
  let mut count = 0;
  let mut queue = VecDeque::new();

  for ((r, c), &px) in img.indexed_iter() {
    if px.is_zero() || labels[(r, c)] != 0 {
      continue;
    }
    count += 1;
    labels[(r, c)] = count;
    queue.push_back((r, c));

    while let Some(idx) = queue.pop_front() {
      for neigh in neighbours_within(&idx, shape) {
        if labels[neigh] == 0 && img[neigh] == px {
          labels[neigh] = count;
          queue.push_back(neigh);
        }
      }
    }
  }

  (labels, count)
}

/// Area, centroid and border contact of a labelled region.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RegionProps {
  pub area: usize,
  pub row_sum: f64,
  pub col_sum: f64,
  pub touches_border: bool,
}

impl RegionProps {
  pub fn centroid(&self) -> (f64, f64) {
    let area = self.area.max(1) as f64;
    (self.row_sum / area, self.col_sum / area)
  }
}

/// Region properties of every non-zero label, in ascending label order.
pub fn region_props<T>(labels: nd::ArrayView2<T>) -> BTreeMap<T, RegionProps>
where
  T: Copy + Ord + Zero,
{
  let (rows, cols) = labels.dim();
  let mut props: BTreeMap<T, RegionProps> = BTreeMap::new();
  for ((r, c), &lbl) in labels.indexed_iter() {
    if lbl.is_zero() {
      continue;
    }
    let entry = props.entry(lbl).or_default();
    entry.area += 1;
    entry.row_sum += r as f64;
    entry.col_sum += c as f64;
    entry.touches_border |= r == 0 || c == 0 || r + 1 == rows || c + 1 == cols;
  }
  props
}
