//! Streaming image encoders fed by the page pipeline.

use std::io::Cursor;
use std::str::FromStr;

use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageFormat, RgbImage};

use crate::error::{Error, Result};
use crate::page::{Geometry, Side};

/// An image encoder that consumes a page in row blocks while it is still
/// being scanned.
pub trait StreamEncoder: Send {
    /// Consume `rows` rows from `pixels`. `pixels` always spans a whole
    /// number of row blocks; rows past `rows` are padding.
    fn encode_rows(&mut self, pixels: &[u8], rows: usize) -> Result<()>;

    /// Finish the stream and return the encoded bytes.
    fn finish(self: Box<Self>) -> Result<Vec<u8>>;
}

/// Creates one encoder per page side.
pub type EncoderFactory = dyn Fn(Side, &Geometry) -> Result<Box<dyn StreamEncoder>> + Send + Sync;

/// File format of the encoded page images.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFormat {
    Jpeg { quality: u8 },
    Png,
}

impl PageFormat {
    pub const DEFAULT_QUALITY: u8 = 75;

    pub const fn extension(self) -> &'static str {
        match self {
            Self::Jpeg { .. } => "jpg",
            Self::Png => "png",
        }
    }
}

impl Default for PageFormat {
    fn default() -> Self {
        Self::Jpeg {
            quality: Self::DEFAULT_QUALITY,
        }
    }
}

impl FromStr for PageFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "jpeg" | "jpg" => Ok(Self::default()),
            "png" => Ok(Self::Png),
            other => Err(Error::Config(format!("unknown page format {other:?}"))),
        }
    }
}

/// Collects the rows of one side and compresses them when the page is
/// complete.
pub struct PageEncoder {
    format: PageFormat,
    geometry: Geometry,
    body: Vec<u8>,
    rows: usize,
}

impl PageEncoder {
    pub fn new(format: PageFormat, geometry: Geometry) -> Self {
        Self {
            format,
            geometry,
            body: Vec::with_capacity(geometry.row_bytes() * geometry.height),
            rows: 0,
        }
    }

    pub fn factory(format: PageFormat) -> Box<EncoderFactory> {
        Box::new(move |_side, geometry| {
            Ok(Box::new(PageEncoder::new(format, *geometry)) as Box<dyn StreamEncoder>)
        })
    }
}

impl StreamEncoder for PageEncoder {
    fn encode_rows(&mut self, pixels: &[u8], rows: usize) -> Result<()> {
        let block = self.geometry.block_bytes();
        if block == 0 || pixels.len() % block != 0 {
            return Err(Error::Pipeline(format!(
                "encoder input of {} bytes is not row-block aligned",
                pixels.len()
            )));
        }
        let n = rows * self.geometry.row_bytes();
        if n > pixels.len() {
            return Err(Error::Pipeline(format!(
                "{rows} rows claimed but only {} bytes supplied",
                pixels.len()
            )));
        }
        self.body.extend_from_slice(&pixels[..n]);
        self.rows += rows;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<Vec<u8>> {
        if self.rows == 0 {
            return Err(Error::Pipeline("no rows to encode".into()));
        }
        let dims = |n: usize| {
            u32::try_from(n).map_err(|_| Error::Pipeline(format!("image dimension {n} too large")))
        };
        let (width, height) = (dims(self.geometry.width)?, dims(self.rows)?);

        let mut out = Vec::new();
        match self.format {
            PageFormat::Jpeg { quality } => {
                JpegEncoder::new_with_quality(&mut out, quality).encode(
                    &self.body,
                    width,
                    height,
                    ExtendedColorType::Rgb8,
                )?;
            }
            PageFormat::Png => {
                let img = RgbImage::from_raw(width, height, self.body)
                    .ok_or_else(|| Error::Pipeline("page buffer size mismatch".into()))?;
                img.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)?;
            }
        }
        Ok(out)
    }
}
