//! RGB → luma conversion and binarization of raw scanner rows.

use std::str::FromStr;

use log::warn;

use crate::error::Error;
use crate::page::{Bitmap, Geometry, CHANNELS};

/// How RGB triples are turned into luma. All strategies produce identical
/// output; they differ only in speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelStrategy {
    /// Straight fixed-point arithmetic per pixel.
    Scalar,
    /// Per-channel precomputed products, summed per pixel.
    #[default]
    Table,
}

impl FromStr for PixelStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "scalar" => Ok(Self::Scalar),
            "table" => Ok(Self::Table),
            other => Err(Error::Config(format!("unknown pixel strategy {other:?}"))),
        }
    }
}

const R_WEIGHT: u32 = 19595;
const G_WEIGHT: u32 = 38470;
const B_WEIGHT: u32 = 7471;

/// ITU-R 601 luma on 16-bit-expanded samples, rounded to 8 bits.
#[inline]
pub fn luma_scalar(r: u8, g: u8, b: u8) -> u8 {
    let r = u32::from(r) * 0x101;
    let g = u32::from(g) * 0x101;
    let b = u32::from(b) * 0x101;
    ((R_WEIGHT * r + G_WEIGHT * g + B_WEIGHT * b + (1 << 15)) >> 24) as u8
}

struct LumaTable {
    r: [u32; 256],
    g: [u32; 256],
    b: [u32; 256],
}

const fn build_table() -> LumaTable {
    let mut t = LumaTable {
        r: [0; 256],
        g: [0; 256],
        b: [0; 256],
    };
    let mut i = 0;
    while i < 256 {
        let v = i as u32 * 0x101;
        t.r[i] = R_WEIGHT * v;
        t.g[i] = G_WEIGHT * v;
        t.b[i] = B_WEIGHT * v;
        i += 1;
    }
    t
}

static LUMA: LumaTable = build_table();

#[inline]
pub fn luma_table(r: u8, g: u8, b: u8) -> u8 {
    ((LUMA.r[r as usize] + LUMA.g[g as usize] + LUMA.b[b as usize] + (1 << 15)) >> 24) as u8
}

impl PixelStrategy {
    pub fn luma_fn(self) -> fn(u8, u8, u8) -> u8 {
        match self {
            Self::Scalar => luma_scalar,
            Self::Table => luma_table,
        }
    }
}

/// Binarize `rows` rows of raw RGB and write them into `bin`, rotated by 180
/// degrees. The feeder delivers the sheet upside down, so source row `y` of a
/// chunk starting at page row `offset` lands on bitmap row
/// `height - 1 - (offset + y)`, mirrored horizontally.
///
/// Returns the number of white pixels written. Rows past the page height are
/// dropped.
pub fn binarize_rotated(
    chunk: &[u8],
    rows: usize,
    geometry: &Geometry,
    bin: &mut Bitmap,
    offset: usize,
    strategy: PixelStrategy,
) -> usize {
    let luma = strategy.luma_fn();
    let width = geometry.width;
    let height = geometry.height;
    let row_bytes = geometry.row_bytes();

    let fit = rows.min(height.saturating_sub(offset));
    if fit < rows {
        warn!(
            "page overflow: dropping {} rows past row {height}",
            rows - fit
        );
    }

    let mut white = 0;
    for (y, row) in chunk.chunks_exact(row_bytes).take(fit).enumerate() {
        let out_row = (height - 1 - (offset + y)) * width;
        for (x, px) in row.chunks_exact(CHANNELS).enumerate() {
            let o = out_row + (width - 1 - x);
            if luma(px[0], px[1], px[2]) > 127 {
                bin.pix[o] = 0xff;
                white += 1;
            } else {
                bin.pix[o] = 0x00;
            }
        }
    }
    white
}
