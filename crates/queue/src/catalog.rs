//! Catalog collaborator: titles, scenes, sites and the file records the
//! pipelines read and write.
//!
//! [`Catalog`] is deliberately narrow; [`MemoryCatalog`] implements it in
//! process and can be seeded from a JSON file.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Failed to read catalog: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse catalog: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Catalog backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dvd {
    pub dvd_id: u64,
    pub site_id: u64,
    pub slug: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    pub scene_id: u64,
    pub site_id: u64,
    pub dvd_id: u64,
    /// Position of the scene within its title, used in file names.
    pub id_place: u32,
    pub place: u32,
    #[serde(default)]
    pub tooltip_thumbs: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub site_id: u64,
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tube {
    pub tube_id: u64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OriginalFile {
    pub scene_id: u64,
    pub site_id: u64,
    pub dvd_id: u64,
    pub format_id: u32,
    pub filename: String,
    pub volume: u32,
    pub size: u64,
    pub encode_status: String,
    pub encode_id: String,
}

/// A final encoded scene file in durable storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneFile {
    pub scene_id: u64,
    pub site_id: u64,
    pub dvd_id: u64,
    pub format: String,
    pub filename: String,
    pub volume: u32,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrailerRecord {
    pub scene_id: u64,
    pub site_id: u64,
    pub dvd_id: u64,
    pub format_id: u32,
    pub filename: String,
    pub volume: u32,
    pub size: u64,
    pub duration: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrailerOriginal {
    pub scene_id: u64,
    pub site_id: u64,
    pub dvd_id: u64,
    pub format_id: u32,
    pub filename: String,
    pub volume: u32,
    pub size: u64,
}

/// One cut clip of a clip set, per format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipRecord {
    pub scene_id: u64,
    pub site_id: u64,
    pub dvd_id: u64,
    pub place: u32,
    pub format: String,
    pub filename: String,
    pub volume: u32,
    /// Start offset in the source, seconds.
    pub timecode: u32,
}

/// A finalized clip-set video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipSetRecord {
    pub scene_id: u64,
    pub site_id: u64,
    pub dvd_id: u64,
    pub filename: String,
    pub volume: u32,
    pub dimensions: String,
    pub timecode: u32,
    pub place: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TubeEncode {
    pub scene_id: u64,
    pub site_id: u64,
    pub dvd_id: u64,
    pub tube_id: u64,
    pub format: String,
    pub filename: String,
    pub volume: u32,
}

/// Raw intro/outro uploads for a site, relative to the upload directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntroAssets {
    pub site_id: u64,
    pub intro: String,
    pub outro: String,
    #[serde(default)]
    pub intro_duration: Option<u32>,
    #[serde(default)]
    pub outro_duration: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatermarkKind {
    Scene,
    /// Clip-set watermark.
    Fhg,
    Tube,
}

impl std::fmt::Display for WatermarkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatermarkKind::Scene => write!(f, "scene"),
            WatermarkKind::Fhg => write!(f, "fhg"),
            WatermarkKind::Tube => write!(f, "tube"),
        }
    }
}

/// Identity of a derived watermark image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WatermarkKey {
    /// Site id, or tube id for [`WatermarkKind::Tube`].
    pub owner_id: u64,
    pub kind: WatermarkKind,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatermarkMapping {
    #[serde(flatten)]
    pub key: WatermarkKey,
    /// File name relative to the watermark directory.
    pub filename: String,
}

pub trait Catalog: Send + Sync {
    fn dvd(&self, dvd_id: u64, site_id: u64) -> Result<Option<Dvd>, CatalogError>;
    fn scene(&self, scene_id: u64, site_id: u64) -> Result<Option<Scene>, CatalogError>;
    fn site(&self, site_id: u64) -> Result<Option<Site>, CatalogError>;
    fn tube(&self, tube_id: u64) -> Result<Option<Tube>, CatalogError>;

    fn original_file(&self, scene_id: u64, site_id: u64)
        -> Result<Option<OriginalFile>, CatalogError>;
    /// Insert, or replace the record for the same scene and site.
    fn upsert_original_file(&self, file: OriginalFile) -> Result<(), CatalogError>;

    fn scene_files(&self, scene_id: u64, site_id: u64) -> Result<Vec<SceneFile>, CatalogError>;
    /// Replace every final file recorded for the scene and site.
    fn replace_scene_files(
        &self,
        scene_id: u64,
        site_id: u64,
        files: Vec<SceneFile>,
    ) -> Result<(), CatalogError>;
    fn set_tooltips_generated(&self, scene_id: u64, site_id: u64) -> Result<(), CatalogError>;

    fn replace_trailer(&self, record: TrailerRecord) -> Result<(), CatalogError>;
    fn replace_trailer_original(&self, record: TrailerOriginal) -> Result<(), CatalogError>;

    fn purge_clips(&self, scene_id: u64, site_id: u64) -> Result<(), CatalogError>;
    fn insert_clip(&self, record: ClipRecord) -> Result<(), CatalogError>;
    fn clips(&self, scene_id: u64, site_id: u64) -> Result<Vec<ClipRecord>, CatalogError>;

    fn purge_clip_set(&self, scene_id: u64, site_id: u64, dvd_id: u64)
        -> Result<(), CatalogError>;
    fn insert_clip_set(&self, record: ClipSetRecord) -> Result<(), CatalogError>;

    /// Replace the row for the same scene, site, tube and format.
    fn replace_tube_encode(&self, record: TubeEncode) -> Result<(), CatalogError>;

    fn intro_assets(&self, site_id: u64) -> Result<Option<IntroAssets>, CatalogError>;

    fn watermark(&self, key: &WatermarkKey) -> Result<Option<String>, CatalogError>;
    fn set_watermark(&self, key: WatermarkKey, filename: String) -> Result<(), CatalogError>;
}

/// Everything [`MemoryCatalog`] holds; also the shape of the JSON seed file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogData {
    pub dvds: Vec<Dvd>,
    pub scenes: Vec<Scene>,
    pub sites: Vec<Site>,
    pub tubes: Vec<Tube>,
    pub originals: Vec<OriginalFile>,
    pub scene_files: Vec<SceneFile>,
    pub trailers: Vec<TrailerRecord>,
    pub trailer_originals: Vec<TrailerOriginal>,
    pub clips: Vec<ClipRecord>,
    pub clip_sets: Vec<ClipSetRecord>,
    pub tube_encodes: Vec<TubeEncode>,
    pub intros: Vec<IntroAssets>,
    pub watermarks: Vec<WatermarkMapping>,
}

#[derive(Debug, Default)]
pub struct MemoryCatalog {
    data: Mutex<CatalogData>,
}

impl MemoryCatalog {
    pub fn new(data: CatalogData) -> Self {
        Self {
            data: Mutex::new(data),
        }
    }

    pub fn from_json_file(path: &Path) -> Result<Self, CatalogError> {
        let content = fs::read_to_string(path)?;
        Ok(Self::new(serde_json::from_str(&content)?))
    }

    pub fn snapshot(&self) -> CatalogData {
        self.data.lock().clone()
    }

    /// Write the current records back in the seed file format.
    pub fn save_json_file(&self, path: &Path) -> Result<(), CatalogError> {
        let json = serde_json::to_string_pretty(&*self.data.lock())?;
        fs::write(path, json)?;
        Ok(())
    }
}

impl Catalog for MemoryCatalog {
    fn dvd(&self, dvd_id: u64, site_id: u64) -> Result<Option<Dvd>, CatalogError> {
        Ok(self
            .data
            .lock()
            .dvds
            .iter()
            .find(|d| d.dvd_id == dvd_id && d.site_id == site_id)
            .cloned())
    }

    fn scene(&self, scene_id: u64, site_id: u64) -> Result<Option<Scene>, CatalogError> {
        Ok(self
            .data
            .lock()
            .scenes
            .iter()
            .find(|s| s.scene_id == scene_id && s.site_id == site_id)
            .cloned())
    }

    fn site(&self, site_id: u64) -> Result<Option<Site>, CatalogError> {
        Ok(self.data.lock().sites.iter().find(|s| s.site_id == site_id).cloned())
    }

    fn tube(&self, tube_id: u64) -> Result<Option<Tube>, CatalogError> {
        Ok(self.data.lock().tubes.iter().find(|t| t.tube_id == tube_id).cloned())
    }

    fn original_file(
        &self,
        scene_id: u64,
        site_id: u64,
    ) -> Result<Option<OriginalFile>, CatalogError> {
        Ok(self
            .data
            .lock()
            .originals
            .iter()
            .find(|o| o.scene_id == scene_id && o.site_id == site_id)
            .cloned())
    }

    fn upsert_original_file(&self, file: OriginalFile) -> Result<(), CatalogError> {
        let mut data = self.data.lock();
        data.originals
            .retain(|o| !(o.scene_id == file.scene_id && o.site_id == file.site_id));
        data.originals.push(file);
        Ok(())
    }

    fn scene_files(&self, scene_id: u64, site_id: u64) -> Result<Vec<SceneFile>, CatalogError> {
        Ok(self
            .data
            .lock()
            .scene_files
            .iter()
            .filter(|f| f.scene_id == scene_id && f.site_id == site_id)
            .cloned()
            .collect())
    }

    fn replace_scene_files(
        &self,
        scene_id: u64,
        site_id: u64,
        files: Vec<SceneFile>,
    ) -> Result<(), CatalogError> {
        let mut data = self.data.lock();
        data.scene_files
            .retain(|f| !(f.scene_id == scene_id && f.site_id == site_id));
        data.scene_files.extend(files);
        Ok(())
    }

    fn set_tooltips_generated(&self, scene_id: u64, site_id: u64) -> Result<(), CatalogError> {
        let mut data = self.data.lock();
        for scene in data
            .scenes
            .iter_mut()
            .filter(|s| s.scene_id == scene_id && s.site_id == site_id)
        {
            scene.tooltip_thumbs = true;
        }
        Ok(())
    }

    fn replace_trailer(&self, record: TrailerRecord) -> Result<(), CatalogError> {
        let mut data = self.data.lock();
        data.trailers
            .retain(|t| !(t.scene_id == record.scene_id && t.site_id == record.site_id));
        data.trailers.push(record);
        Ok(())
    }

    fn replace_trailer_original(&self, record: TrailerOriginal) -> Result<(), CatalogError> {
        let mut data = self.data.lock();
        data.trailer_originals
            .retain(|t| !(t.scene_id == record.scene_id && t.site_id == record.site_id));
        data.trailer_originals.push(record);
        Ok(())
    }

    fn purge_clips(&self, scene_id: u64, site_id: u64) -> Result<(), CatalogError> {
        self.data
            .lock()
            .clips
            .retain(|c| !(c.scene_id == scene_id && c.site_id == site_id));
        Ok(())
    }

    fn insert_clip(&self, record: ClipRecord) -> Result<(), CatalogError> {
        self.data.lock().clips.push(record);
        Ok(())
    }

    fn clips(&self, scene_id: u64, site_id: u64) -> Result<Vec<ClipRecord>, CatalogError> {
        Ok(self
            .data
            .lock()
            .clips
            .iter()
            .filter(|c| c.scene_id == scene_id && c.site_id == site_id)
            .cloned()
            .collect())
    }

    fn purge_clip_set(
        &self,
        scene_id: u64,
        site_id: u64,
        dvd_id: u64,
    ) -> Result<(), CatalogError> {
        self.data.lock().clip_sets.retain(|c| {
            !(c.scene_id == scene_id && c.site_id == site_id && c.dvd_id == dvd_id)
        });
        Ok(())
    }

    fn insert_clip_set(&self, record: ClipSetRecord) -> Result<(), CatalogError> {
        self.data.lock().clip_sets.push(record);
        Ok(())
    }

    fn replace_tube_encode(&self, record: TubeEncode) -> Result<(), CatalogError> {
        let mut data = self.data.lock();
        data.tube_encodes.retain(|t| {
            !(t.scene_id == record.scene_id
                && t.site_id == record.site_id
                && t.tube_id == record.tube_id
                && t.format == record.format)
        });
        data.tube_encodes.push(record);
        Ok(())
    }

    fn intro_assets(&self, site_id: u64) -> Result<Option<IntroAssets>, CatalogError> {
        Ok(self.data.lock().intros.iter().find(|i| i.site_id == site_id).cloned())
    }

    fn watermark(&self, key: &WatermarkKey) -> Result<Option<String>, CatalogError> {
        Ok(self
            .data
            .lock()
            .watermarks
            .iter()
            .find(|w| w.key == *key)
            .map(|w| w.filename.clone()))
    }

    fn set_watermark(&self, key: WatermarkKey, filename: String) -> Result<(), CatalogError> {
        let mut data = self.data.lock();
        data.watermarks.retain(|w| w.key != key);
        data.watermarks.push(WatermarkMapping { key, filename });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn clip(place: u32, format: &str) -> ClipRecord {
        ClipRecord {
            scene_id: 1,
            site_id: 2,
            dvd_id: 3,
            place,
            format: format.to_string(),
            filename: format!("clip-{}.mpg", place),
            volume: 8,
            timecode: 300,
        }
    }

    #[test]
    fn test_seed_from_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("catalog.json");
        fs::write(
            &path,
            r#"{
                "dvds": [{"dvd_id": 3, "site_id": 2, "slug": "summer-heat"}],
                "scenes": [{"scene_id": 1, "site_id": 2, "dvd_id": 3, "id_place": 4, "place": 4}],
                "watermarks": [{"owner_id": 2, "kind": "fhg", "width": 1280, "height": 720, "filename": "x.png"}]
            }"#,
        )
        .unwrap();

        let catalog = MemoryCatalog::from_json_file(&path).unwrap();
        assert_eq!(catalog.dvd(3, 2).unwrap().unwrap().slug, "summer-heat");
        assert!(catalog.dvd(3, 9).unwrap().is_none());
        assert!(!catalog.scene(1, 2).unwrap().unwrap().tooltip_thumbs);

        let key = WatermarkKey { owner_id: 2, kind: WatermarkKind::Fhg, width: 1280, height: 720 };
        assert_eq!(catalog.watermark(&key).unwrap().as_deref(), Some("x.png"));
    }

    #[test]
    fn test_saved_catalog_reloads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("catalog.json");
        let catalog = MemoryCatalog::default();
        catalog.insert_clip(clip(2, "sd")).unwrap();

        catalog.save_json_file(&path).unwrap();

        let reloaded = MemoryCatalog::from_json_file(&path).unwrap();
        assert_eq!(reloaded.snapshot(), catalog.snapshot());
    }

    #[test]
    fn test_clip_purge_is_scoped() {
        let catalog = MemoryCatalog::default();
        catalog.insert_clip(clip(1, "hd")).unwrap();
        catalog.insert_clip(ClipRecord { site_id: 5, ..clip(1, "hd") }).unwrap();

        catalog.purge_clips(1, 2).unwrap();
        assert!(catalog.clips(1, 2).unwrap().is_empty());
        assert_eq!(catalog.clips(1, 5).unwrap().len(), 1);
    }

    #[test]
    fn test_tube_encode_replaces_same_format() {
        let catalog = MemoryCatalog::default();
        let row = TubeEncode {
            scene_id: 1,
            site_id: 2,
            dvd_id: 3,
            tube_id: 9,
            format: "hd".to_string(),
            filename: "a.mp4".to_string(),
            volume: 8,
        };
        catalog.replace_tube_encode(row.clone()).unwrap();
        catalog
            .replace_tube_encode(TubeEncode { filename: "b.mp4".to_string(), ..row.clone() })
            .unwrap();
        catalog
            .replace_tube_encode(TubeEncode { format: "sd".to_string(), ..row })
            .unwrap();

        let rows = catalog.snapshot().tube_encodes;
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().any(|r| r.format == "hd" && r.filename == "b.mp4"));
    }

    #[test]
    fn test_set_watermark_overwrites_mapping() {
        let catalog = MemoryCatalog::default();
        let key = WatermarkKey { owner_id: 1, kind: WatermarkKind::Scene, width: 1920, height: 1080 };
        catalog.set_watermark(key, "a.png".to_string()).unwrap();
        catalog.set_watermark(key, "b.png".to_string()).unwrap();
        assert_eq!(catalog.watermark(&key).unwrap().as_deref(), Some("b.png"));
        assert_eq!(catalog.snapshot().watermarks.len(), 1);
    }
}
