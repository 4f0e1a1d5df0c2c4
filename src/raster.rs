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

//! On-disk encoding of single rasters.
//!
//! A raster file is a gzip stream holding a fixed 14-byte header followed by
//! the pixel values in row-major, little-endian order:
//!
//! | bytes | content                          |
//! |-------|----------------------------------|
//! | 0..4  | magic `CTWR`                     |
//! | 4     | format version (currently `1`)   |
//! | 5     | pixel type tag (see [`Pixel`])   |
//! | 6..10 | number of rows (`u32`, LE)       |
//! | 10..14| number of columns (`u32`, LE)    |

use std::io::{Read, Write};
use std::path::Path;

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use ndarray as nd;
use num_traits::Zero;

use crate::error::{Error, Result};

const MAGIC: &[u8; 4] = b"CTWR";
const FORMAT_VERSION: u8 = 1;
const HEADER_LEN: usize = 14;

//gzip compression level of every raster
const GZIP_LEVEL: u32 = 7;

/// Pixel types that can be stored in a layer.
///
/// Label masks are stored as `u16`, soft predictions as `f32`.
pub trait Pixel: Copy + Send + Sync + Zero + PartialEq + std::fmt::Debug + 'static {
  /// Tag written into the raster header
  const DTYPE: u8;
  /// Size of one pixel in bytes
  const WIDTH: usize;

  fn write_le(self, buf: &mut Vec<u8>);
  fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_pixel {
  ($t:ty, $tag:expr) => {
    impl Pixel for $t {
      const DTYPE: u8 = $tag;
      const WIDTH: usize = std::mem::size_of::<$t>();

      #[inline]
      fn write_le(self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.to_le_bytes())
      }

      #[inline]
      fn read_le(bytes: &[u8]) -> Self {
        let mut raw = [0u8; std::mem::size_of::<$t>()];
        raw.copy_from_slice(bytes);
        <$t>::from_le_bytes(raw)
      }
    }
  };
}

impl_pixel!(u16, 1);
impl_pixel!(f32, 2);

/// Writes `raster` as a compressed raster stream into `writer`.
pub fn encode<T: Pixel, W: Write>(raster: nd::ArrayView2<T>, writer: W) -> std::io::Result<()> {
  let (rows, cols) = raster.dim();
  let mut buf = Vec::with_capacity(HEADER_LEN + rows * cols * T::WIDTH);
  buf.extend_from_slice(MAGIC);
  buf.push(FORMAT_VERSION);
  buf.push(T::DTYPE);
  buf.extend_from_slice(&(rows as u32).to_le_bytes());
  buf.extend_from_slice(&(cols as u32).to_le_bytes());
  //iter() walks the array in logical (row-major) order, whatever its layout
  raster.iter().for_each(|&px| px.write_le(&mut buf));

  let mut encoder = GzEncoder::new(writer, Compression::new(GZIP_LEVEL));
  encoder.write_all(&buf)?;
  encoder.finish()?;
  Ok(())
}

/// Reads a raster stream written by [`encode`]. `path` is only used for error
/// reporting.
pub fn decode<T: Pixel, R: Read>(reader: R, path: &Path) -> Result<nd::Array2<T>> {
  let corrupt = |reason: String| Error::Corrupt { path: path.to_path_buf(), reason };

  let mut buf = Vec::new();
  GzDecoder::new(reader).read_to_end(&mut buf).map_err(|err| match err.kind() {
    std::io::ErrorKind::InvalidInput | std::io::ErrorKind::InvalidData | std::io::ErrorKind::UnexpectedEof => {
      corrupt(format!("invalid gzip stream: {err}"))
    }
    _ => Error::Io(err),
  })?;

  if buf.len() < HEADER_LEN || &buf[0..4] != MAGIC {
    return Err(corrupt("missing raster header".to_string()));
  }
  if buf[4] != FORMAT_VERSION {
    return Err(corrupt(format!("unsupported format version {}", buf[4])));
  }
  if buf[5] != T::DTYPE {
    return Err(corrupt(format!("pixel type tag {} does not match expected tag {}", buf[5], T::DTYPE)));
  }

  let rows = u32::from_le_bytes([buf[6], buf[7], buf[8], buf[9]]) as usize;
  let cols = u32::from_le_bytes([buf[10], buf[11], buf[12], buf[13]]) as usize;
  let payload = &buf[HEADER_LEN..];
  let expected = rows.checked_mul(cols).and_then(|n| n.checked_mul(T::WIDTH));
  if expected != Some(payload.len()) {
    return Err(corrupt(format!(
      "payload holds {} bytes, header promises {rows}x{cols} pixels",
      payload.len()
    )));
  }

  let data: Vec<T> = payload.chunks_exact(T::WIDTH).map(T::read_le).collect();
  nd::Array2::from_shape_vec((rows, cols), data).map_err(|err| corrupt(err.to_string()))
}
