//! Hand-off of finished pages to whatever stores them.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use image::{GrayImage, ImageFormat};
use log::info;
use serde::Serialize;

use crate::encoder::PageFormat;
use crate::error::{Error, Result};
use crate::page::{Bitmap, Page, Side};

/// Pages of one scan session, in the order they will be ingested.
#[derive(Debug, Default)]
pub struct Job {
    pages: Vec<Page>,
}

impl Job {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_page(&mut self, page: Page) {
        self.pages.push(page);
    }

    /// The feeder scans the last sheet put in first.
    pub fn reverse_pages(&mut self) {
        self.pages.reverse();
    }

    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

/// Consumer of scan jobs.
pub trait Ingester {
    fn new_job(&mut self) -> Result<Job> {
        Ok(Job::new())
    }

    /// Take ownership of a finished job and return its id.
    fn ingest(&mut self, job: Job) -> Result<String>;
}

#[derive(Serialize)]
struct Manifest {
    pages: Vec<ManifestPage>,
}

#[derive(Serialize)]
struct ManifestPage {
    image: String,
    bitmap: String,
    side: String,
    white_ratio: f64,
    blank: bool,
}

/// Writes each job into its own directory below `root`:
/// `page-NNN.jpg` (or `.png`), the bitmap as `page-NNN-bw.png` and a
/// `job.toml` manifest.
pub struct DirIngester {
    root: PathBuf,
    format: PageFormat,
    seq: u32,
}

impl DirIngester {
    /// `format` must match the encoder that produced the pages.
    pub fn new(root: impl Into<PathBuf>, format: PageFormat) -> Self {
        Self {
            root: root.into(),
            format,
            seq: 0,
        }
    }

    fn next_id(&mut self) -> String {
        self.seq += 1;
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        format!("{secs}-{:03}", self.seq)
    }
}

/// Bitmaps are stored as 8-bit grayscale PNG.
fn write_bitmap(path: &Path, bitmap: &Bitmap) -> Result<()> {
    let img = GrayImage::from_raw(dim(bitmap.width)?, dim(bitmap.height)?, bitmap.pix.clone())
        .ok_or_else(|| Error::Pipeline("bitmap size mismatch".into()))?;
    img.save_with_format(path, ImageFormat::Png)?;
    Ok(())
}

fn dim(n: usize) -> Result<u32> {
    u32::try_from(n).map_err(|_| Error::Pipeline(format!("bitmap dimension {n} too large")))
}

fn write_job(dir: &Path, pages: &[Page], extension: &str) -> Result<()> {
    fs::create_dir_all(dir)?;
    let mut manifest = Manifest { pages: Vec::new() };
    for (i, page) in pages.iter().enumerate() {
        let image = format!("page-{:03}.{extension}", i + 1);
        let bitmap = format!("page-{:03}-bw.png", i + 1);
        fs::write(dir.join(&image), &page.encoded)?;
        write_bitmap(&dir.join(&bitmap), &page.bitmap)?;
        manifest.pages.push(ManifestPage {
            image,
            bitmap,
            side: page.side.to_string(),
            white_ratio: page.white_ratio,
            blank: page.blank,
        });
    }
    let text = toml::to_string(&manifest).map_err(std::io::Error::other)?;
    fs::write(dir.join("job.toml"), text)?;
    Ok(())
}

impl Ingester for DirIngester {
    fn ingest(&mut self, job: Job) -> Result<String> {
        if job.is_empty() {
            return Err(Error::NoDocument);
        }
        let id = self.next_id();
        let partial = self.root.join(format!(".{id}.partial"));
        let done = self.root.join(&id);
        if let Err(e) = write_job(&partial, job.pages(), self.format.extension()) {
            let _ = fs::remove_dir_all(&partial);
            return Err(e);
        }
        fs::rename(&partial, &done)?;
        let blank = job.pages().iter().filter(|p| p.blank).count();
        info!(
            "job {id}: {} pages ({blank} blank) → {}",
            job.len(),
            done.display()
        );
        Ok(id)
    }
}

/// Sides of a job in order, for logging and tests.
pub fn sides(job: &Job) -> Vec<Side> {
    job.pages().iter().map(|p| p.side).collect()
}
