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

//! Seeded, masked watershed flooding.
//!
//! The input is a `u8` "height map" of water levels. Pixels that must never be
//! flooded (the background of a cell mask) carry the special `NEVER_FILL`
//! value. Starting from one coloured pixel per seed, the water level is raised
//! one step at a time. At every level, uncoloured flooded pixels that touch a
//! coloured pixel take over the colour of their neighbours until no more
//! pixels can be coloured, after which the level is raised again. Lakes that
//! meet do not merge: the boundary between them stays where the two floods
//! met, which is what splits touching cells.

use log::debug;
use ndarray as nd;
use num_traits::ToPrimitive;
use rayon::prelude::*;

use crate::morphology::neighbours_8con;

//Constants for pixels that have to be left uncoloured, or have to be coloured
pub(crate) const UNCOLOURED: usize = 0;
pub const NORMAL_MAX: u8 = u8::MAX - 1;
pub const ALWAYS_FILL: u8 = u8::MIN;
pub const NEVER_FILL: u8 = u8::MAX;

/// Converts an array of any numeric type into water levels, restricted to the
/// pixels where `mask` is `true`.
///
/// Finite values inside the mask are stretched linearly onto `0..=NORMAL_MAX`.
/// Negative infinity is mapped to `ALWAYS_FILL`. `NaN`, positive infinity and
/// every pixel outside the mask are mapped to `NEVER_FILL`.
///
/// # Panics
/// if `img` and `mask` differ in shape.
pub fn pre_processor<T>(img: nd::ArrayView2<T>, mask: nd::ArrayView2<bool>) -> nd::Array2<u8>
where
  T: Copy + ToPrimitive,
{
  //Calculate max and min values of the finite, masked pixels
  let (min, max) =
    nd::Zip::from(&img).and(&mask).fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), px, &inside| {
      match px.to_f64() {
        Some(val) if inside && val.is_finite() => (lo.min(val), hi.max(val)),
        _ => (lo, hi),
      }
    });
  let range = max - min;

  //Map image to u8 range, taking care of NaN and infty
  nd::Zip::from(&img).and(&mask).map_collect(|px, &inside| -> u8 {
    if !inside {
      return NEVER_FILL;
    }
    match px.to_f64() {
      Some(float) if float.is_finite() => {
        if range > 0.0 {
          ((float - min) / range * NORMAL_MAX as f64).round() as u8
        } else {
          ALWAYS_FILL
        }
      }
      //negative infinity, always fill
      Some(float) if float == f64::NEG_INFINITY => ALWAYS_FILL,
      //Nans and positive infinity, never fill
      _ => NEVER_FILL,
    }
  })
}

/// Most common non-zero colour, ties broken in favour of the smaller colour.
fn dominant_colour(neighbours: impl Iterator<Item = usize>) -> Option<usize> {
  let mut cols: Vec<usize> = neighbours.filter(|&col| col != UNCOLOURED).collect();
  cols.sort_unstable();

  let mut best: Option<(usize, usize)> = None;
  let mut start = 0;
  while start < cols.len() {
    let col = cols[start];
    let end = start + cols[start..].iter().take_while(|&&other| other == col).count();
    //Strictly greater: colours are visited in ascending order
    if best.map_or(true, |(count, _)| end - start > count) {
      best = Some((end - start, col));
    }
    start = end;
  }
  best.map(|(_, col)| col)
}

fn find_px(
  img: nd::ArrayView2<u8>,
  cols: nd::ArrayView2<usize>,
  lvl: u8,
) -> Vec<((usize, usize), usize)> {
  //Window size and index of center window pixel
  const WINDOW: (usize, usize) = (3, 3);
  const MID: (usize, usize) = (1, 1);

  /*
    We lock-step through (3x3) windows of both the input image and the output
    watershed (coloured water). We only consider the centre pixel, since all the
    windows overlap anyways. The index of the nd::Zip function is the (0,0) index
    of the window, so the index of the target pixel is at window_idx + (1,1).

    For each target pixel we:
      1. Check if it is flooded: YES -> continue, NO -> ignore px
      2. Check if it is uncoloured: YES -> continue, NO -> ignore px
      3. Find the colours of the 8 neighbouring pixels
        None coloured -> ignore px
        Otherwise -> colour MID pixel with the most common neighbour colour
  */
  nd::Zip::indexed(cols.windows(WINDOW))
    .and(img.windows(WINDOW))
    .into_par_iter()
    //(1) Ignore unflooded pixels
    .filter(|&(_idx, _col_wd, img_wd)| img_wd[MID] <= lvl)
    //(2) Ignore already coloured pixels
    .filter(|&(_idx, col_wd, _img_wd)| col_wd[MID] == UNCOLOURED)
    //(3) Decide which colour our pixel should be, if any
    .filter_map(|(idx, col_wd, _img_wd)| {
      let neigh_cols = neighbours_8con(&MID).into_iter().map(|neigh_idx| col_wd[neigh_idx]);
      dominant_colour(neigh_cols).map(|col| ((idx.0 + 1, idx.1 + 1), col))
    })
    .collect()
}

/// Watershed transform flooding from a given set of seeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeededWatershed {
  max_water_level: u8,
}

impl Default for SeededWatershed {
  fn default() -> Self {
    SeededWatershed { max_water_level: NORMAL_MAX }
  }
}

impl SeededWatershed {
  /// `max_water_level` may not exceed `NORMAL_MAX`; the pipeline builder
  /// checks this.
  pub(crate) fn new(max_water_level: u8) -> Self {
    SeededWatershed { max_water_level }
  }

  pub fn max_water_level(&self) -> u8 {
    self.max_water_level
  }

  /// Returns the watershed transform of `input`. Seed `i` (zero-based) colours
  /// its lake with colour `i + 1`; pixels no lake reached stay `0`.
  ///
  /// # Panics
  /// if a seed lies outside `input`.
  pub fn transform(&self, input: nd::ArrayView2<u8>, seeds: &[(usize, usize)]) -> nd::Array2<usize> {
    //(1) pad the image with a never-filled edge, so that the 3x3 windows reach
    //every pixel of the frame
    let (rows, cols) = input.dim();
    let mut padded = nd::Array2::from_elem((rows + 2, cols + 2), NEVER_FILL);
    padded.slice_mut(nd::s![1..rows + 1, 1..cols + 1]).assign(&input);
    let mut output = nd::Array2::<usize>::zeros(padded.dim());

    //(2) colour the starting pixels, seed order decides the colour
    for (col, &(r, c)) in seeds.iter().enumerate() {
      output[(r + 1, c + 1)] = col + 1;
    }

    //(3) raise the water level, starting from the lowest pixel in the image
    let lowest = input.iter().copied().min().unwrap_or(NEVER_FILL);
    let mut passes = 0usize;
    for water_level in lowest..=self.max_water_level {
      /*(i) Colour all flooded pixels connected to a source
        We have to loop multiple times because there may be plateau's. These
        require us to colour more than just one neighbouring pixel -> we need
        to loop until there are no more uncoloured, flooded pixels connected to
        a source left.
      */
      'colouring_loop: loop {
        passes += 1;
        let pix_to_colour = find_px(padded.view(), output.view(), water_level);
        if pix_to_colour.is_empty() {
          //No more connected, flooded pixels left -> raise water level
          break 'colouring_loop;
        }
        //At most one colour instruction per pixel, so order does not matter
        pix_to_colour.into_iter().for_each(|(idx, col)| {
          output[idx] = col;
        });
      }
    }
    debug!("flooded {} seeds over {rows}x{cols} px in {passes} passes", seeds.len());

    //(4) strip the padding again
    output.slice(nd::s![1..rows + 1, 1..cols + 1]).to_owned()
  }
}
