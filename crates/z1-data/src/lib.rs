use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

pub mod items;
pub mod rooms;

pub use rooms::RoomMode;

/// Canonical NES frame width, the coordinate space every HUD position is defined in.
pub const CANONICAL_WIDTH: u32 = 256;
/// Canonical NES frame height.
pub const CANONICAL_HEIGHT: u32 = 240;

/// Variance below which a patch is treated as flat (luma in 0..1).
pub const FLAT_VARIANCE: f32 = 1e-6;

/// Named template groups in the asset store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupKind {
    Digits,
    BItems,
    Swords,
    Drops,
    OverworldRooms,
    DungeonRooms,
}

impl GroupKind {
    pub const ALL: [GroupKind; 6] = [
        GroupKind::Digits,
        GroupKind::BItems,
        GroupKind::Swords,
        GroupKind::Drops,
        GroupKind::OverworldRooms,
        GroupKind::DungeonRooms,
    ];

    /// Directory name under `templates/`
    pub fn dir_name(self) -> &'static str {
        match self {
            GroupKind::Digits => "digits",
            GroupKind::BItems => "b_items",
            GroupKind::Swords => "swords",
            GroupKind::Drops => "drops",
            GroupKind::OverworldRooms => "overworld_rooms",
            GroupKind::DungeonRooms => "dungeon_rooms",
        }
    }

    /// Fixed template size (width, height) for this group
    pub fn size(self) -> (u32, u32) {
        match self {
            GroupKind::Digits => (8, 8),
            GroupKind::BItems | GroupKind::Swords | GroupKind::Drops => (8, 16),
            GroupKind::OverworldRooms | GroupKind::DungeonRooms => (64, 44),
        }
    }

    /// Upper bound on templates kept for this group
    pub fn capacity(self) -> usize {
        match self {
            GroupKind::Digits => 10,
            GroupKind::BItems | GroupKind::Swords => 32,
            GroupKind::Drops => 48,
            GroupKind::OverworldRooms => RoomMode::Overworld.room_count(),
            GroupKind::DungeonRooms => RoomMode::Dungeon.room_count(),
        }
    }
}

/// A single zero-mean, unit-variance grayscale template.
#[derive(Debug, Clone)]
pub struct Template {
    pub name: String,
    /// Normalized luma values, row-major
    pub values: Vec<f32>,
    /// True when the source image had no variance; such a template scores 0 against everything.
    pub flat: bool,
}

/// Templates of one kind, all the same size.
#[derive(Debug, Clone)]
pub struct TemplateGroup {
    pub kind: GroupKind,
    pub width: u32,
    pub height: u32,
    pub templates: Vec<Template>,
}

impl TemplateGroup {
    /// Build a group from raw luma patches (values in 0..1), normalizing each one.
    pub fn from_raw(kind: GroupKind, raw: Vec<(String, Vec<f32>)>) -> Result<Self> {
        let (width, height) = kind.size();
        let expected = (width * height) as usize;
        let mut templates = Vec::with_capacity(raw.len());
        for (name, pixels) in raw {
            anyhow::ensure!(
                pixels.len() == expected,
                "template {} has {} pixels, expected {}",
                name,
                pixels.len(),
                expected
            );
            let (values, flat) = normalize(&pixels);
            templates.push(Template { name, values, flat });
        }
        templates.truncate(kind.capacity());
        Ok(Self {
            kind,
            width,
            height,
            templates,
        })
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.templates.iter().map(|t| t.name.as_str())
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.templates.get(index).map(|t| t.name.as_str())
    }
}

/// Read-only reference patches shared by every racer pipeline.
#[derive(Debug, Clone, Default)]
pub struct TemplateAtlas {
    groups: HashMap<GroupKind, TemplateGroup>,
}

impl TemplateAtlas {
    /// Load every template group found under `data_dir/templates/`.
    ///
    /// Each group is a directory of PNG files; the file stem is the template name.
    /// Missing directories leave that group absent, which disables whatever
    /// correlation pass depends on it.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let root = data_dir.join("templates");
        let mut atlas = Self::default();

        for kind in GroupKind::ALL {
            let dir = root.join(kind.dir_name());
            if !dir.is_dir() {
                warn!("No {} templates at {}", kind.dir_name(), dir.display());
                continue;
            }
            let group = load_group(kind, &dir)
                .with_context(|| format!("Failed to load {} templates", kind.dir_name()))?;
            if group.is_empty() {
                warn!("Template directory {} is empty", dir.display());
                continue;
            }
            info!("Loaded {} {} templates", group.len(), kind.dir_name());
            atlas.groups.insert(kind, group);
        }

        Ok(atlas)
    }

    pub fn from_groups(groups: impl IntoIterator<Item = TemplateGroup>) -> Self {
        Self {
            groups: groups
                .into_iter()
                .filter(|g| !g.is_empty())
                .map(|g| (g.kind, g))
                .collect(),
        }
    }

    pub fn group(&self, kind: GroupKind) -> Option<&TemplateGroup> {
        self.groups.get(&kind)
    }

    pub fn template_count(&self) -> usize {
        self.groups.values().map(|g| g.len()).sum()
    }
}

fn load_group(kind: GroupKind, dir: &Path) -> Result<TemplateGroup> {
    let (width, height) = kind.size();
    let mut paths: Vec<_> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().map_or(false, |ext| ext.eq_ignore_ascii_case("png")))
        .collect();
    paths.sort();

    if paths.len() > kind.capacity() {
        warn!(
            "{} has {} templates, keeping the first {}",
            dir.display(),
            paths.len(),
            kind.capacity()
        );
        paths.truncate(kind.capacity());
    }

    let mut raw = Vec::with_capacity(paths.len());
    for path in &paths {
        let name = match path.file_stem() {
            Some(stem) => stem.to_string_lossy().to_string(),
            None => continue,
        };
        match load_luma(path, width, height) {
            Ok(pixels) => raw.push((name, pixels)),
            Err(e) => warn!("Failed to load template {}: {}", path.display(), e),
        }
    }

    TemplateGroup::from_raw(kind, raw)
}

/// Open an image as luma values in 0..1, resized to the group size when needed.
fn load_luma(path: &Path, width: u32, height: u32) -> Result<Vec<f32>> {
    let img = image::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?
        .to_rgba8();
    let img = if img.dimensions() != (width, height) {
        debug!(
            "Resizing {} from {:?} to {}x{}",
            path.display(),
            img.dimensions(),
            width,
            height
        );
        image::imageops::resize(&img, width, height, image::imageops::FilterType::Triangle)
    } else {
        img
    };
    Ok(img.pixels().map(|p| luma([p[0], p[1], p[2]])).collect())
}

/// BT.601 luma of an RGB pixel, in 0..1.
pub fn luma(rgb: [u8; 3]) -> f32 {
    (0.299 * rgb[0] as f32 + 0.587 * rgb[1] as f32 + 0.114 * rgb[2] as f32) / 255.0
}

/// Zero-mean, unit-variance normalization.
/// Returns the normalized values and whether the input was flat.
pub fn normalize(pixels: &[f32]) -> (Vec<f32>, bool) {
    let (mean, variance) = stats(pixels);
    if variance <= FLAT_VARIANCE {
        return (vec![0.0; pixels.len()], true);
    }
    let std_dev = variance.sqrt();
    (pixels.iter().map(|p| (p - mean) / std_dev).collect(), false)
}

/// Population mean and variance
pub fn stats(pixels: &[f32]) -> (f32, f32) {
    let n = pixels.len() as f32;
    if n == 0.0 {
        return (0.0, 0.0);
    }
    let mean = pixels.iter().sum::<f32>() / n;
    let variance = pixels.iter().map(|p| (p - mean).powi(2)).sum::<f32>() / n;
    (mean, variance)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_nonexistent() {
        let atlas = TemplateAtlas::load(Path::new("/nonexistent")).unwrap();
        assert_eq!(atlas.template_count(), 0);
        assert!(atlas.group(GroupKind::Digits).is_none());
    }

    #[test]
    fn test_normalize_zero_mean_unit_variance() {
        let pixels: Vec<f32> = (0..64).map(|i| (i % 7) as f32 / 7.0).collect();
        let (values, flat) = normalize(&pixels);
        assert!(!flat);
        let (mean, variance) = stats(&values);
        assert!(mean.abs() < 1e-4, "mean {}", mean);
        assert!((variance - 1.0).abs() < 1e-3, "variance {}", variance);
    }

    #[test]
    fn test_flat_template() {
        let (values, flat) = normalize(&[0.5; 64]);
        assert!(flat);
        assert!(values.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_from_raw_rejects_wrong_size() {
        let result = TemplateGroup::from_raw(GroupKind::Digits, vec![("0".into(), vec![0.0; 10])]);
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_group_is_dropped() {
        let empty = TemplateGroup::from_raw(GroupKind::Drops, vec![]).unwrap();
        let atlas = TemplateAtlas::from_groups([empty]);
        assert!(atlas.group(GroupKind::Drops).is_none());
    }

    #[test]
    fn test_load_group_from_disk() {
        let dir = std::env::temp_dir().join(format!("z1_atlas_test_{}", std::process::id()));
        let digits = dir.join("templates").join("digits");
        std::fs::create_dir_all(&digits).unwrap();
        for d in 0..3u32 {
            let img = image::RgbaImage::from_fn(8, 8, |x, y| {
                let v = if (x + y + d) % 3 == 0 { 255 } else { 0 };
                image::Rgba([v, v, v, 255])
            });
            img.save(digits.join(format!("{}.png", d))).unwrap();
        }
        // Directories no pass reads are left alone
        let enemies = dir.join("templates").join("enemies");
        std::fs::create_dir_all(&enemies).unwrap();
        image::RgbaImage::new(32, 32).save(enemies.join("octorok.png")).unwrap();

        let atlas = TemplateAtlas::load(&dir).unwrap();
        let group = atlas.group(GroupKind::Digits).unwrap();
        assert_eq!(group.names().collect::<Vec<_>>(), vec!["0", "1", "2"]);
        assert_eq!(group.templates[0].values.len(), 64);
        assert_eq!(atlas.template_count(), 3);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
