//! On-disk recipe layout.
//!
//! ```text
//! <root>/<id>/<id>.json   metadata
//! <root>/<id>/<id>.png    reference image, 8-bit gray
//! <root>/<id>/<id>.desc   keypoints and descriptors
//! ```
//!
//! The three files are written into `<root>/.staging-<id>/`, synced, and the
//! directory is renamed into place, so a recipe directory is either complete
//! or absent.
//!
//! Descriptor file, little-endian:
//!
//! ```text
//! magic "RDSC" | u16 format version | u16 descriptor bytes | u32 count
//! count x { f32 x | f32 y | f32 angle | f32 response | u8 octave | [u8; 32] }
//! ```

use std::fs::{self, File};
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use image::{DynamicImage, GrayImage, ImageFormat};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::RecipeError;
use crate::recipe::model::{
    DESCRIPTOR_BYTES, Descriptor, DescriptorSet, Keypoint, QualityMetrics, Recipe, RecipeId,
    ReferenceSize,
};
use crate::tracker::Rect;

pub(crate) const METADATA_FORMAT_VERSION: u32 = 1;
const DESC_MAGIC: &[u8; 4] = b"RDSC";
const DESC_FORMAT_VERSION: u16 = 1;
const DESC_HEADER_LEN: usize = 12;
const DESC_ENTRY_LEN: usize = 4 * 4 + 1 + DESCRIPTOR_BYTES;
pub(crate) const STAGING_PREFIX: &str = ".staging-";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Metadata {
    pub format_version: u32,
    pub id: RecipeId,
    pub name: String,
    pub version: u32,
    pub supersedes: Option<RecipeId>,
    #[serde(default)]
    pub notes: String,
    pub created_at: DateTime<Utc>,
    pub roi: Rect,
    pub reference_size: ReferenceSize,
    pub quality: QualityMetrics,
    pub descriptor_count: usize,
}

impl Metadata {
    fn of(recipe: &Recipe) -> Self {
        Self {
            format_version: METADATA_FORMAT_VERSION,
            id: recipe.id,
            name: recipe.name.clone(),
            version: recipe.version,
            supersedes: recipe.supersedes,
            notes: recipe.notes.clone(),
            created_at: recipe.created_at,
            roi: recipe.roi,
            reference_size: recipe.reference_size,
            quality: recipe.quality,
            descriptor_count: recipe.descriptors.len(),
        }
    }
}

pub(crate) fn recipe_dir(root: &Path, id: &RecipeId) -> PathBuf {
    root.join(id.to_string())
}

fn artifact(dir: &Path, id: &RecipeId, ext: &str) -> PathBuf {
    dir.join(format!("{id}.{ext}"))
}

fn corrupt(path: &Path, reason: impl Into<String>) -> RecipeError {
    RecipeError::Corrupt {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<(), RecipeError> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

/// Persist `recipe` under `root`, returning its final directory.
pub(crate) fn write_recipe(root: &Path, recipe: &Recipe) -> Result<PathBuf, RecipeError> {
    let id = recipe.id;
    let staging = root.join(format!("{STAGING_PREFIX}{id}"));
    if staging.exists() {
        fs::remove_dir_all(&staging)?;
    }
    fs::create_dir_all(&staging)?;

    let result = (|| -> Result<PathBuf, RecipeError> {
        let metadata = serde_json::to_vec_pretty(&Metadata::of(recipe))?;
        write_synced(&artifact(&staging, &id, "json"), &metadata)?;
        write_synced(&artifact(&staging, &id, "png"), &encode_png(&recipe.reference_image)?)?;
        write_synced(&artifact(&staging, &id, "desc"), &encode_descriptors(&recipe.descriptors))?;

        let target = recipe_dir(root, &id);
        fs::rename(&staging, &target)?;
        Ok(target)
    })();

    if result.is_err() {
        let _ = fs::remove_dir_all(&staging);
    }
    result
}

pub(crate) fn read_metadata(dir: &Path, id: &RecipeId) -> Result<Metadata, RecipeError> {
    let path = artifact(dir, id, "json");
    let metadata: Metadata = serde_json::from_slice(&fs::read(&path)?)?;
    if metadata.format_version != METADATA_FORMAT_VERSION {
        return Err(corrupt(
            &path,
            format!("unsupported metadata format {}", metadata.format_version),
        ));
    }
    if metadata.id != *id {
        return Err(corrupt(&path, format!("metadata names recipe {}", metadata.id)));
    }
    Ok(metadata)
}

/// Load a complete recipe, checking the three artifacts against each other.
pub(crate) fn read_recipe(dir: &Path, id: &RecipeId) -> Result<Recipe, RecipeError> {
    let metadata = read_metadata(dir, id)?;

    let png_path = artifact(dir, id, "png");
    let reference_image = decode_png(&png_path, &fs::read(&png_path)?)?;
    let (rows, cols) = reference_image.dim();
    if cols as u32 != metadata.reference_size.width
        || rows as u32 != metadata.reference_size.height
    {
        return Err(corrupt(
            &png_path,
            format!(
                "image is {cols}x{rows}, metadata says {}x{}",
                metadata.reference_size.width, metadata.reference_size.height
            ),
        ));
    }

    let desc_path = artifact(dir, id, "desc");
    let descriptors = decode_descriptors(&desc_path, &fs::read(&desc_path)?)?;
    if descriptors.len() != metadata.descriptor_count {
        return Err(corrupt(
            &desc_path,
            format!(
                "{} descriptors stored, metadata says {}",
                descriptors.len(),
                metadata.descriptor_count
            ),
        ));
    }

    Ok(Recipe {
        id: metadata.id,
        name: metadata.name,
        version: metadata.version,
        supersedes: metadata.supersedes,
        notes: metadata.notes,
        created_at: metadata.created_at,
        roi: metadata.roi,
        reference_image: Arc::new(reference_image),
        descriptors,
        reference_size: metadata.reference_size,
        quality: metadata.quality,
    })
}

fn encode_png(pixels: &Array2<u8>) -> Result<Vec<u8>, RecipeError> {
    let (rows, cols) = pixels.dim();
    let raw: Vec<u8> = pixels.iter().copied().collect();
    let image = GrayImage::from_raw(cols as u32, rows as u32, raw)
        .ok_or_else(|| RecipeError::Corrupt {
            path: PathBuf::new(),
            reason: "reference image buffer does not match its shape".into(),
        })?;
    let mut bytes = Vec::new();
    image.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
    Ok(bytes)
}

fn decode_png(path: &Path, bytes: &[u8]) -> Result<Array2<u8>, RecipeError> {
    let DynamicImage::ImageLuma8(image) =
        image::load_from_memory_with_format(bytes, ImageFormat::Png)?
    else {
        return Err(corrupt(path, "reference image is not 8-bit grayscale"));
    };
    let (width, height) = image.dimensions();
    Array2::from_shape_vec((height as usize, width as usize), image.into_raw())
        .map_err(|e| corrupt(path, e.to_string()))
}

pub(crate) fn encode_descriptors(set: &DescriptorSet) -> Vec<u8> {
    let mut out = Vec::with_capacity(DESC_HEADER_LEN + set.len() * DESC_ENTRY_LEN);
    out.extend_from_slice(DESC_MAGIC);
    out.extend_from_slice(&DESC_FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&(DESCRIPTOR_BYTES as u16).to_le_bytes());
    out.extend_from_slice(&(set.len() as u32).to_le_bytes());
    for (kp, desc) in set.iter() {
        for value in [kp.x, kp.y, kp.angle, kp.response] {
            out.extend_from_slice(&value.to_le_bytes());
        }
        out.push(kp.octave);
        out.extend_from_slice(&desc.0);
    }
    out
}

pub(crate) fn decode_descriptors(path: &Path, bytes: &[u8]) -> Result<DescriptorSet, RecipeError> {
    if bytes.len() < DESC_HEADER_LEN {
        return Err(corrupt(path, "descriptor file is truncated"));
    }
    if &bytes[0..4] != DESC_MAGIC {
        return Err(corrupt(path, "bad descriptor file magic"));
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != DESC_FORMAT_VERSION {
        return Err(corrupt(path, format!("unsupported descriptor format {version}")));
    }
    let length = u16::from_le_bytes([bytes[6], bytes[7]]) as usize;
    if length != DESCRIPTOR_BYTES {
        return Err(corrupt(
            path,
            format!("descriptor length {length}, expected {DESCRIPTOR_BYTES}"),
        ));
    }
    let count = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
    let body = &bytes[DESC_HEADER_LEN..];
    if body.len() != count * DESC_ENTRY_LEN {
        return Err(corrupt(
            path,
            format!("{} payload bytes for {count} entries", body.len()),
        ));
    }

    let f32_at = |chunk: &[u8], offset: usize| {
        f32::from_le_bytes([chunk[offset], chunk[offset + 1], chunk[offset + 2], chunk[offset + 3]])
    };
    let mut set = DescriptorSet::with_capacity(count);
    for chunk in body.chunks_exact(DESC_ENTRY_LEN) {
        let keypoint = Keypoint {
            x: f32_at(chunk, 0),
            y: f32_at(chunk, 4),
            angle: f32_at(chunk, 8),
            response: f32_at(chunk, 12),
            octave: chunk[16],
        };
        let mut descriptor = [0u8; DESCRIPTOR_BYTES];
        descriptor.copy_from_slice(&chunk[17..]);
        set.push(keypoint, Descriptor(descriptor));
    }
    Ok(set)
}
