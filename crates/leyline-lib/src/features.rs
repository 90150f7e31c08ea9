//! Screenshot fetching and feature extraction
//!
//! `FeatureSource` is the capability the sync engine consumes: one image URL
//! in, one fixed-width feature vector out. The default implementation fetches
//! the image over HTTP and computes a HOG descriptor of a downscaled
//! grayscale copy.

use crate::error::{Error, Result};
use async_trait::async_trait;
use image::imageops::FilterType;
use imageproc::hog::{hog, HogOptions};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Resolves an image URL to its feature vector
#[async_trait]
pub trait FeatureSource: Send + Sync {
    async fn features(&self, url: &str) -> Result<Vec<f32>>;
}

/// Turns encoded image bytes into a feature vector; deterministic per image
pub trait FeatureExtractor: Send + Sync {
    fn extract(&self, bytes: &[u8]) -> std::result::Result<Vec<f32>, String>;

    /// Length of every vector `extract` returns
    fn width(&self) -> usize;
}

/// HTTP image download with a fixed user agent
#[derive(Clone)]
pub struct ImageFetcher {
    client: Client,
}

impl ImageFetcher {
    pub fn new(user_agent: &str) -> Result<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(crate::error::RemoteError::from)?;
        Ok(Self { client })
    }

    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let failed = |reason: String| Error::Feature {
            url: url.to_string(),
            reason,
        };

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(failed(format!("HTTP {}", response.status())));
        }
        let bytes = response.bytes().await.map_err(|e| failed(e.to_string()))?;
        debug!(url = %url, bytes = bytes.len(), "Fetched image");
        Ok(bytes.to_vec())
    }
}

/// Histogram-of-oriented-gradients descriptor.
///
/// The image is resized to `side x side` grayscale pixels; the whole cells
/// of `cell` pixels from the top-left corner feed `imageproc`'s HOG with
/// unsigned `orientations` bins and `block x block` cell blocks at stride 1.
#[derive(Debug, Clone, Copy)]
pub struct HogDescriptor {
    pub side: u32,
    pub cell: usize,
    pub block: usize,
    pub orientations: usize,
}

impl Default for HogDescriptor {
    fn default() -> Self {
        Self {
            side: 100,
            cell: 8,
            block: 2,
            orientations: 9,
        }
    }
}

impl HogDescriptor {
    fn options(&self) -> HogOptions {
        HogOptions {
            orientations: self.orientations,
            signed: false,
            cell_side: self.cell,
            block_side: self.block,
            block_stride: 1,
        }
    }

    fn cells_per_side(&self) -> usize {
        self.side as usize / self.cell
    }

    /// Side of the region the cells cover; trailing pixels are dropped
    fn covered_side(&self) -> u32 {
        (self.cells_per_side() * self.cell) as u32
    }
}

impl FeatureExtractor for HogDescriptor {
    fn extract(&self, bytes: &[u8]) -> std::result::Result<Vec<f32>, String> {
        let decoded = image::load_from_memory(bytes).map_err(|e| format!("decode image: {e}"))?;
        let gray = image::imageops::resize(
            &decoded.to_luma8(),
            self.side,
            self.side,
            FilterType::Triangle,
        );
        let covered = self.covered_side();
        let cropped = image::imageops::crop_imm(&gray, 0, 0, covered, covered).to_image();
        hog(&cropped, self.options())
    }

    fn width(&self) -> usize {
        let blocks = self.cells_per_side().saturating_sub(self.block) + 1;
        blocks * blocks * self.block * self.block * self.orientations
    }
}

/// Fetch over HTTP, then extract on the blocking pool
pub struct ImageFeatures<E> {
    fetcher: ImageFetcher,
    extractor: Arc<E>,
}

impl<E: FeatureExtractor + 'static> ImageFeatures<E> {
    pub fn new(fetcher: ImageFetcher, extractor: E) -> Self {
        Self {
            fetcher,
            extractor: Arc::new(extractor),
        }
    }
}

#[async_trait]
impl<E: FeatureExtractor + 'static> FeatureSource for ImageFeatures<E> {
    async fn features(&self, url: &str) -> Result<Vec<f32>> {
        let bytes = self.fetcher.fetch(url).await?;
        let extractor = Arc::clone(&self.extractor);
        tokio::task::spawn_blocking(move || extractor.extract(&bytes))
            .await?
            .map_err(|reason| Error::Feature {
                url: url.to_string(),
                reason,
            })
    }
}
