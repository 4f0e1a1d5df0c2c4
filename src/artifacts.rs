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

//! Clean-up of merged watershed output into a final label image.

use std::collections::BTreeMap;

use log::debug;
use ndarray as nd;

use crate::config::ArtifactParams;
use crate::error::{Error, Result};
use crate::morphology::{label_regions, region_props};

/// Removes segmentation artifacts and relabels the survivors.
///
/// Every label is reduced to its largest 8-connected piece (the piece
/// containing the first pixel in raster order on ties). Pieces smaller than
/// `min_area`, and with `discard_border` pieces touching the frame edge, are
/// removed. The remaining regions are numbered `1..=n` in raster order of
/// their first pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArtifactFilter {
  pub min_area: usize,
  pub discard_border: bool,
}

impl Default for ArtifactFilter {
  fn default() -> Self {
    ArtifactFilter::from(ArtifactParams::default())
  }
}

impl From<ArtifactParams> for ArtifactFilter {
  fn from(params: ArtifactParams) -> Self {
    ArtifactFilter { min_area: params.min_area, discard_border: params.discard_border }
  }
}

impl ArtifactFilter {
  /// Returns the cleaned label image. Fails with `LabelOverflow` if more
  /// regions survive than fit in a `u16`.
  pub fn apply(&self, labels: nd::ArrayView2<usize>) -> Result<nd::Array2<u16>> {
    //(1) split every label into its connected pieces. Pieces are numbered in
    //raster order of their first pixel
    let (pieces, n_pieces) = label_regions(labels);
    let props = region_props(pieces.view());
    let mut owner = vec![0usize; n_pieces + 1];
    nd::Zip::from(&pieces).and(&labels).for_each(|&piece, &lbl| owner[piece] = lbl);

    //(2) find the largest piece of every label
    let mut largest: BTreeMap<usize, (usize, usize)> = BTreeMap::new();
    for (&piece, prop) in &props {
      let best = largest.entry(owner[piece]).or_insert((prop.area, piece));
      if prop.area > best.0 {
        *best = (prop.area, piece);
      }
    }

    //(3) keep the pieces that pass every filter, numbering them in order
    let mut new_label = vec![0u16; n_pieces + 1];
    let mut count: usize = 0;
    for (&piece, prop) in &props {
      let keep = largest[&owner[piece]].1 == piece
        && prop.area >= self.min_area
        && !(self.discard_border && prop.touches_border);
      if keep {
        count += 1;
        new_label[piece] = u16::try_from(count).map_err(|_| Error::LabelOverflow)?;
      }
    }
    debug!("kept {count} of {} regions", largest.len());

    Ok(pieces.mapv(|piece| new_label[piece]))
  }
}
