//! Derived asset cache: watermark images and trimmed intro/outro clips.
//!
//! Assets are created on first use and never deleted here.

use crate::catalog::{Catalog, CatalogError, WatermarkKey, WatermarkKind};
use crate::encode::{EncodeError, Encoder, TranscodeJob};
use crate::overlay::{OverlayRenderer, OverlaySpec, OverlayStyle, RenderError};
use encode_queue_config::{BrandingConfig, Config, FormatSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Log id used for intro/outro encodes.
const INTRO_LOG_ID: &str = "intros";

#[derive(Debug, Error)]
pub enum AssetError {
    #[error("Failed to encode asset: {0}")]
    Encode(#[from] EncodeError),
    #[error("Failed to render watermark: {0}")]
    Render(#[from] RenderError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("No {kind} owner with id {owner_id}")]
    UnknownOwner { kind: WatermarkKind, owner_id: u64 },
    #[error("Intro/outro upload not found: {0}")]
    MissingUpload(PathBuf),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Cached intro and outro clips for one site and frame size.
#[derive(Debug, Clone, PartialEq)]
pub struct IntroOutro {
    pub intro: PathBuf,
    pub outro: PathBuf,
}

impl IntroOutro {
    /// `intro, middle, outro` as a concat list.
    pub fn around(&self, middle: &Path) -> Vec<PathBuf> {
        vec![self.intro.clone(), middle.to_path_buf(), self.outro.clone()]
    }
}

pub struct DerivedAssetCache {
    catalog: Arc<dyn Catalog>,
    encoder: Arc<dyn Encoder>,
    renderer: Arc<dyn OverlayRenderer>,
    watermark_dir: PathBuf,
    intro_cache_dir: PathBuf,
    intro_uploads: PathBuf,
    intro_formats: FormatSet,
    branding: BrandingConfig,
    /// Serializes generation so concurrent pipelines never render the same file twice.
    generating: Mutex<()>,
}

impl DerivedAssetCache {
    pub fn new(
        cfg: &Config,
        catalog: Arc<dyn Catalog>,
        encoder: Arc<dyn Encoder>,
        renderer: Arc<dyn OverlayRenderer>,
    ) -> Self {
        Self {
            catalog,
            encoder,
            renderer,
            watermark_dir: cfg.paths.watermarks.clone(),
            intro_cache_dir: cfg.paths.work_dir.join("intros"),
            intro_uploads: cfg.paths.intro_uploads.clone(),
            intro_formats: cfg.formats.intro.clone(),
            branding: cfg.branding.clone(),
            generating: Mutex::new(()),
        }
    }

    /// Return the watermark for `(owner, kind, width, height)`, rendering it
    /// when there is no mapping or the mapped file is gone.
    pub async fn watermark(
        &self,
        owner_id: u64,
        kind: WatermarkKind,
        width: u32,
        height: u32,
    ) -> Result<PathBuf, AssetError> {
        let key = WatermarkKey {
            owner_id,
            kind,
            width,
            height,
        };

        let _guard = self.generating.lock().await;

        if let Some(filename) = self.catalog.watermark(&key)? {
            let path = self.watermark_dir.join(&filename);
            if path.exists() {
                return Ok(path);
            }
            warn!(path = %path.display(), "Watermark mapped but file is missing, regenerating");
        }

        let (name, text, style) = match kind {
            WatermarkKind::Tube => {
                let tube = self
                    .catalog
                    .tube(owner_id)?
                    .ok_or(AssetError::UnknownOwner { kind, owner_id })?;
                let text = format!("{}{}", self.branding.tube_url_prefix, tube.name);
                (tube.name, text, OverlayStyle::Band)
            }
            WatermarkKind::Scene | WatermarkKind::Fhg => {
                let site = self
                    .catalog
                    .site(owner_id)?
                    .ok_or(AssetError::UnknownOwner { kind, owner_id })?;
                (site.name, site.url, OverlayStyle::Transparent)
            }
        };

        let filename = watermark_filename(&name, kind, width, height);
        let path = self.watermark_dir.join(&filename);
        std::fs::create_dir_all(&self.watermark_dir)?;

        let spec = OverlaySpec {
            width,
            height,
            band_height: self.branding.band_height,
            point_size: self.branding.point_size,
            text,
            style,
        };
        info!(path = %path.display(), %kind, owner_id, "Rendering watermark");
        self.renderer.render(&spec, &path).await?;
        self.catalog.set_watermark(key, filename)?;

        Ok(path)
    }

    /// Intro and outro trimmed to `width x height`, or `None` when the site has none.
    pub async fn intro_outro(
        &self,
        site_id: u64,
        width: u32,
        height: u32,
        cancel: &CancellationToken,
    ) -> Result<Option<IntroOutro>, AssetError> {
        let cached = IntroOutro {
            intro: self
                .intro_cache_dir
                .join(format!("in_{}_{}_{}.mpg", site_id, width, height)),
            outro: self
                .intro_cache_dir
                .join(format!("out_{}_{}_{}.mpg", site_id, width, height)),
        };

        let _guard = self.generating.lock().await;

        if cached.intro.exists() && cached.outro.exists() {
            return Ok(Some(cached));
        }

        let Some(assets) = self.catalog.intro_assets(site_id)? else {
            info!(site_id, "No intro/outro configured for site");
            return Ok(None);
        };

        std::fs::create_dir_all(&self.intro_cache_dir)?;
        let formats: FormatSet = self
            .intro_formats
            .iter()
            .map(|(name, spec)| (name.clone(), spec.with_size(width, height)))
            .collect();

        for (upload, dest, trim) in [
            (&assets.intro, &cached.intro, assets.intro_duration),
            (&assets.outro, &cached.outro, assets.outro_duration),
        ] {
            let source = self.intro_uploads.join(upload);
            if !source.exists() {
                return Err(AssetError::MissingUpload(source));
            }
            let mut job = TranscodeJob::new(&source, dest, formats.clone(), INTRO_LOG_ID);
            job.duration = trim.filter(|t| *t > 0);
            info!(source = %source.display(), dest = %dest.display(), "Encoding intro/outro");
            self.encoder.transcode(&job, cancel).await?;
        }

        Ok(Some(cached))
    }
}

/// `{name} - {kind} - {w}x{h}.png`
pub fn watermark_filename(name: &str, kind: WatermarkKind, width: u32, height: u32) -> String {
    format!("{} - {} - {}x{}.png", name, kind, width, height)
}
