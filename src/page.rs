use std::fmt;

/// One side of a sheet, and the image channel carrying it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Front,
    Back,
}

impl Side {
    pub const BOTH: [Side; 2] = [Side::Front, Side::Back];

    /// Window id used by SCAN, READ and the channel-select command.
    pub const fn window_id(self) -> u8 {
        match self {
            Self::Front => 0x00,
            Self::Back => 0x80,
        }
    }

    pub const fn index(self) -> usize {
        match self {
            Self::Front => 0,
            Self::Back => 1,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Front => "front",
            Self::Back => "back",
        })
    }
}

/// Pixel layout of one scanned page as the device delivers it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub width: usize,
    pub height: usize,
    /// Rows the encoder consumes per call.
    pub row_block: usize,
}

/// Bytes per pixel; the device always sends interleaved RGB.
pub const CHANNELS: usize = 3;

impl Geometry {
    /// DIN A4 at 600 dpi.
    pub const A4_600DPI: Geometry = Geometry {
        width: 4960,
        height: 7016,
        row_block: 16,
    };

    pub const fn row_bytes(&self) -> usize {
        self.width * CHANNELS
    }

    pub const fn block_bytes(&self) -> usize {
        self.row_bytes() * self.row_block
    }

    pub const fn pixels(&self) -> usize {
        self.width * self.height
    }
}

impl Default for Geometry {
    fn default() -> Self {
        Self::A4_600DPI
    }
}

/// 8-bit grayscale bitmap, one byte per pixel (0x00 black, 0xff white).
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap {
    pub width: usize,
    pub height: usize,
    pub pix: Vec<u8>,
}

impl Bitmap {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            pix: vec![0; width * height],
        }
    }

    pub fn row(&self, y: usize) -> &[u8] {
        &self.pix[y * self.width..(y + 1) * self.width]
    }
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bitmap({}x{})", self.width, self.height)
    }
}

/// A finished page: one side of one sheet.
#[derive(Debug)]
pub struct Page {
    pub side: Side,
    /// Output of the streaming encoder.
    pub encoded: Vec<u8>,
    /// Binarized page, rotated upright.
    pub bitmap: Bitmap,
    /// Fraction of white pixels over the whole page.
    pub white_ratio: f64,
    /// Set when `white_ratio` exceeds the blank threshold.
    pub blank: bool,
}
