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

//! Binarization of soft predictions.

use log::debug;
use ndarray as nd;

const HISTOGRAM_BINS: usize = 256;

/// Isodata (Ridler-Calvard) threshold of the finite values in `values`.
///
/// The values are binned into a 256-bin histogram. The threshold is the
/// smallest bin centre `t` for which the midpoint between the mean of the bins
/// up to and including `t` and the mean of the bins above `t` lies within one
/// bin width above `t`. Returns `None` if there are no finite values, and the
/// common value if all values are equal.
pub fn isodata_threshold(values: nd::ArrayView2<f32>) -> Option<f32> {
  let finite: Vec<f64> = values.iter().filter(|v| v.is_finite()).map(|&v| v as f64).collect();
  let min = finite.iter().copied().fold(f64::INFINITY, f64::min);
  let max = finite.iter().copied().fold(f64::NEG_INFINITY, f64::max);
  if finite.is_empty() {
    return None;
  }
  if min == max {
    return Some(min as f32);
  }

  //(1) histogram
  let bin_width = (max - min) / HISTOGRAM_BINS as f64;
  let mut counts = [0usize; HISTOGRAM_BINS];
  for &v in &finite {
    let bin = (((v - min) / bin_width) as usize).min(HISTOGRAM_BINS - 1);
    counts[bin] += 1;
  }
  let centre = |bin: usize| min + (bin as f64 + 0.5) * bin_width;

  //(2) walk the candidate thresholds from low to high
  let total_count: usize = counts.iter().sum();
  let total_sum: f64 = counts.iter().enumerate().map(|(bin, &n)| n as f64 * centre(bin)).sum();
  let (mut low_count, mut low_sum) = (0usize, 0.0f64);
  for bin in 0..HISTOGRAM_BINS - 1 {
    low_count += counts[bin];
    low_sum += counts[bin] as f64 * centre(bin);
    let high_count = total_count - low_count;
    if low_count == 0 || high_count == 0 {
      continue;
    }
    let midpoint = 0.5 * (low_sum / low_count as f64 + (total_sum - low_sum) / high_count as f64);
    let distance = midpoint - centre(bin);
    if distance >= 0.0 && distance < bin_width {
      return Some(centre(bin) as f32);
    }
  }

  //(3) no bin satisfies the condition exactly, iterate on the raw values
  let mut threshold = finite.iter().sum::<f64>() / finite.len() as f64;
  for _ in 0..100 {
    let (mut lo, mut lo_n, mut hi, mut hi_n) = (0.0, 0usize, 0.0, 0usize);
    for &v in &finite {
      if v <= threshold {
        lo += v;
        lo_n += 1;
      } else {
        hi += v;
        hi_n += 1;
      }
    }
    if lo_n == 0 || hi_n == 0 {
      break;
    }
    let next = 0.5 * (lo / lo_n as f64 + hi / hi_n as f64);
    if (next - threshold).abs() < 1e-9 {
      break;
    }
    threshold = next;
  }
  Some(threshold as f32)
}

/// Foreground mask (`1`) of all pixels strictly above the threshold. Without a
/// `manual` threshold the isodata threshold of `prediction` is used.
pub fn binarize(prediction: nd::ArrayView2<f32>, manual: Option<f32>) -> nd::Array2<u16> {
  match manual.or_else(|| isodata_threshold(prediction)) {
    Some(threshold) => {
      debug!("binarizing prediction at {threshold}");
      prediction.mapv(|p| (p > threshold) as u16)
    }
    None => nd::Array2::zeros(prediction.dim()),
  }
}
