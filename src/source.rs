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

//! Where raw frames and predictions come from.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use ndarray as nd;

use crate::error::{Error, Result};
use crate::store::Dimensions;

/// A multi-dimensional image dataset.
pub trait ImageSource {
  fn dimensions(&self) -> Dimensions;

  /// Names of the channels, `Channel1..` unless the source knows better
  fn channel_names(&self) -> Vec<String> {
    (1..=self.dimensions().sizec).map(|c| format!("Channel{c}")).collect()
  }

  /// Raw frame at (`time`, `fov`) of `channel`, in the shape reported by
  /// `dimensions()`. Returns `None` for indices outside the dataset.
  fn load_frame(&self, time: usize, fov: usize, channel: usize) -> Result<Option<nd::Array2<u16>>>;
}

/// Turns a raw image into a soft foreground prediction of the same shape.
pub trait Predictor {
  /// With `normalize`, the predictor should equalize the intensities of
  /// `image` before running.
  fn predict(&self, image: nd::ArrayView2<u16>, normalize: bool) -> Result<nd::Array2<f32>>;
}

impl<F> Predictor for F
where
  F: Fn(nd::ArrayView2<u16>, bool) -> Result<nd::Array2<f32>>,
{
  fn predict(&self, image: nd::ArrayView2<u16>, normalize: bool) -> Result<nd::Array2<f32>> {
    self(image, normalize)
  }
}

////////////////////////////////////////////////////////////////////////////////
//                                 IN MEMORY                                  //
////////////////////////////////////////////////////////////////////////////////

/// Frames held in memory, indexed `[fov][time][channel]`.
#[derive(Debug, Clone)]
pub struct StackSource {
  frames: Vec<Vec<Vec<nd::Array2<u16>>>>,
  dimensions: Dimensions,
  channel_names: Vec<String>,
}

impl StackSource {
  /// Single-channel source from frames indexed `[fov][time]`.
  pub fn new(frames: Vec<Vec<nd::Array2<u16>>>) -> Result<Self> {
    let frames = frames.into_iter().map(|fov| fov.into_iter().map(|frame| vec![frame]).collect()).collect();
    Self::with_channels(frames, vec!["Channel1".to_string()])
  }

  /// Multi-channel source from frames indexed `[fov][time][channel]`. Every FOV
  /// needs the same number of time points, every time point one frame per
  /// channel name, and every frame the same shape.
  pub fn with_channels(frames: Vec<Vec<Vec<nd::Array2<u16>>>>, channel_names: Vec<String>) -> Result<Self> {
    let npos = frames.len();
    let sizet = frames.first().map_or(0, Vec::len);
    let sizec = channel_names.len();
    let shape = frames
      .iter()
      .flatten()
      .flatten()
      .next()
      .map(|frame| frame.dim())
      .ok_or_else(|| Error::Config("an image stack needs at least one frame".to_string()))?;

    for fov in &frames {
      if fov.len() != sizet {
        return Err(Error::Config(format!("FOVs hold different numbers of time points ({} and {sizet})", fov.len())));
      }
      for channels in fov {
        if channels.len() != sizec {
          return Err(Error::Config(format!("expected {sizec} channels per frame, found {}", channels.len())));
        }
        if let Some(frame) = channels.iter().find(|frame| frame.dim() != shape) {
          return Err(Error::ShapeMismatch { expected: shape, found: frame.dim() });
        }
      }
    }

    let dimensions = Dimensions { sizex: shape.1, sizey: shape.0, sizec, sizet, npos };
    Ok(StackSource { frames, dimensions, channel_names })
  }
}

impl ImageSource for StackSource {
  fn dimensions(&self) -> Dimensions {
    self.dimensions
  }

  fn channel_names(&self) -> Vec<String> {
    self.channel_names.clone()
  }

  fn load_frame(&self, time: usize, fov: usize, channel: usize) -> Result<Option<nd::Array2<u16>>> {
    Ok(self.frames.get(fov).and_then(|fov| fov.get(time)).and_then(|t| t.get(channel)).cloned())
  }
}

////////////////////////////////////////////////////////////////////////////////
//                                  FOLDERS                                   //
////////////////////////////////////////////////////////////////////////////////

const SUPPORTED_EXTENSIONS: [&str; 10] = ["png", "tif", "tiff", "jpg", "jpeg", "bmp", "pbm", "pgm", "ppm", "pnm"];

/// A directory of single-channel images, one per time point of a single field
/// of view. Files are taken in lexicographic order; hidden files and files
/// with unsupported extensions are skipped. Frames smaller than the largest
/// frame are zero-padded at the bottom and right.
#[derive(Debug, Clone)]
pub struct FolderSource {
  dir: PathBuf,
  files: Vec<PathBuf>,
  shape: (usize, usize),
}

impl FolderSource {
  pub fn open(dir: &Path) -> Result<Self> {
    let mut files: Vec<PathBuf> = Vec::new();
    for entry in fs::read_dir(dir)? {
      let path = entry?.path();
      let hidden = path.file_name().and_then(|name| name.to_str()).map_or(true, |name| name.starts_with('.'));
      let supported = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map_or(false, |ext| SUPPORTED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));
      if path.is_file() && !hidden && supported {
        files.push(path);
      } else {
        debug!("skipping {path:?}");
      }
    }
    files.sort();
    if files.is_empty() {
      return Err(Error::Config(format!("no supported image files in {dir:?}")));
    }

    //Common shape is the largest frame in each direction
    let mut shape = (0, 0);
    for file in &files {
      let (width, height) = image::image_dimensions(file)?;
      shape = (shape.0.max(height as usize), shape.1.max(width as usize));
    }
    if shape.0 == 0 || shape.1 == 0 {
      warn!("image folder {dir:?} only holds empty images");
      return Err(Error::Config(format!("images in {dir:?} have no pixels")));
    }

    Ok(FolderSource { dir: dir.to_path_buf(), files, shape })
  }

  pub fn dir(&self) -> &Path {
    &self.dir
  }

  pub fn files(&self) -> &[PathBuf] {
    &self.files
  }
}

impl ImageSource for FolderSource {
  fn dimensions(&self) -> Dimensions {
    Dimensions { sizex: self.shape.1, sizey: self.shape.0, sizec: 1, sizet: self.files.len(), npos: 1 }
  }

  fn load_frame(&self, time: usize, fov: usize, channel: usize) -> Result<Option<nd::Array2<u16>>> {
    let Some(file) = self.files.get(time).filter(|_| fov == 0 && channel == 0) else {
      return Ok(None);
    };
    let img = image::open(file)?.into_luma16();
    let (width, height) = (img.width() as usize, img.height() as usize);
    let raw = nd::Array2::from_shape_vec((height, width), img.into_raw())
      .map_err(|err| Error::Corrupt { path: file.clone(), reason: err.to_string() })?;

    let mut frame = nd::Array2::zeros(self.shape);
    frame.slice_mut(nd::s![..height, ..width]).assign(&raw);
    Ok(Some(frame))
  }
}
