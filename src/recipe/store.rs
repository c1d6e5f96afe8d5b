use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use ndarray::ArrayView2;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::error::RecipeError;
use crate::recipe::RegistrationConfig;
use crate::recipe::model::{QualityMetrics, Recipe, RecipeId, RecipeSummary, ReferenceSize};
use crate::recipe::persist::{self, STAGING_PREFIX};
use crate::tracker::{FeatureExtractor, Rect};

/// Registers recipes and keeps them on disk.
///
/// All operations are synchronous and safe to call from several threads.
/// The tracking flow never touches the store; it works on an
/// `Arc<Recipe>` loaded at session start.
pub struct RecipeStore {
    root: PathBuf,
    config: RegistrationConfig,
    extractor: FeatureExtractor,
    index: RwLock<BTreeMap<RecipeId, RecipeSummary>>,
}

impl RecipeStore {
    /// Open (creating if needed) the store rooted at `root`.
    ///
    /// Leftover staging directories from interrupted saves are removed.
    /// Recipe directories that cannot be read are skipped with a warning.
    /// A version still on disk next to the version that superseded it (a
    /// save interrupted before the old directory was removed) is removed,
    /// so every name maps to one saved recipe.
    ///
    /// # Arguments
    /// * `root` - Directory holding one subdirectory per recipe
    /// * `config` - Registration thresholds for recipes created later
    ///
    /// # Returns
    /// The store with its index built, or an I/O or configuration error.
    pub fn open(root: impl AsRef<Path>, config: RegistrationConfig) -> Result<Self, RecipeError> {
        config.validate()?;
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        let mut index = BTreeMap::new();
        let mut superseded = Vec::new();
        for entry in fs::read_dir(&root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(STAGING_PREFIX) {
                warn!(path = %entry.path().display(), "removing incomplete recipe save");
                fs::remove_dir_all(entry.path())?;
                continue;
            }
            let Some(id) = RecipeId::parse(&name) else {
                continue;
            };
            match persist::read_metadata(&entry.path(), &id) {
                Ok(meta) => {
                    superseded.extend(meta.supersedes);
                    index.insert(
                        id,
                        RecipeSummary {
                            id,
                            name: meta.name,
                            version: meta.version,
                            created_at: meta.created_at,
                            reference_size: meta.reference_size,
                            quality: meta.quality,
                        },
                    );
                }
                Err(e) => warn!(recipe = %id, error = %e, "skipping unreadable recipe"),
            }
        }

        for old in superseded {
            if index.remove(&old).is_none() {
                continue;
            }
            let old_dir = persist::recipe_dir(&root, &old);
            warn!(recipe = %old, "removing superseded recipe left by an interrupted save");
            if let Err(e) = fs::remove_dir_all(&old_dir) {
                warn!(recipe = %old, error = %e, "failed to remove superseded recipe");
            }
        }

        info!(root = %root.display(), recipes = index.len(), "recipe store opened");
        Ok(Self {
            extractor: FeatureExtractor::new(config.extractor.clone()),
            root,
            config,
            index: RwLock::new(index),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &RegistrationConfig {
        &self.config
    }

    /// Register the region of interest `pixels`, cut from a frame at `roi`.
    ///
    /// The recipe is not persisted until [`save`](Self::save). Notes can be
    /// filled in before saving.
    ///
    /// # Arguments
    /// * `name` - Display name, trimmed; must not be empty
    /// * `pixels` - Grayscale reference image of the region
    /// * `roi` - Where the region sat in the source frame
    ///
    /// # Returns
    /// A version 1 recipe, or `InvalidName` / `InsufficientFeatures`.
    pub fn create(
        &self,
        name: &str,
        pixels: ArrayView2<'_, u8>,
        roi: Rect,
    ) -> Result<Recipe, RecipeError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(RecipeError::InvalidName);
        }
        self.build(name.to_string(), pixels, roi, 1, None, String::new())
    }

    /// Register a new version of the saved recipe `id`.
    ///
    /// The result keeps the name and notes, increments the version and
    /// records `id` as superseded. Saving it replaces the old version.
    pub fn reregister(
        &self,
        id: &RecipeId,
        pixels: ArrayView2<'_, u8>,
        roi: Rect,
    ) -> Result<Recipe, RecipeError> {
        let previous = self.load(id)?;
        self.build(
            previous.name,
            pixels,
            roi,
            previous.version + 1,
            Some(previous.id),
            previous.notes,
        )
    }

    fn build(
        &self,
        name: String,
        pixels: ArrayView2<'_, u8>,
        roi: Rect,
        version: u32,
        supersedes: Option<RecipeId>,
        notes: String,
    ) -> Result<Recipe, RecipeError> {
        let descriptors = self.extractor.extract(&pixels);
        let required = self.config.min_keypoints;
        if descriptors.len() < required {
            debug!(name = %name, found = descriptors.len(), required, "registration rejected");
            return Err(RecipeError::InsufficientFeatures {
                found: descriptors.len(),
                required,
            });
        }

        let quality = QualityMetrics::assess(&descriptors, required);
        let (rows, cols) = pixels.dim();
        Ok(Recipe {
            id: RecipeId::new(),
            name,
            version,
            supersedes,
            notes,
            created_at: Utc::now(),
            roi,
            reference_image: Arc::new(pixels.to_owned()),
            descriptors,
            reference_size: ReferenceSize {
                width: cols as u32,
                height: rows as u32,
            },
            quality,
        })
    }

    /// Persist `recipe`.
    ///
    /// Names are unique among saved recipes, except that a re-registration
    /// may reuse the name of the version it supersedes, which is removed
    /// once the new version is on disk.
    ///
    /// # Returns
    /// `DuplicateName` on a name clash, `AlreadySaved` if the id is already
    /// on disk, or the I/O error of the staged write.
    pub fn save(&self, recipe: &Recipe) -> Result<(), RecipeError> {
        let mut index = self.index.write();
        if index.contains_key(&recipe.id) {
            return Err(RecipeError::AlreadySaved(recipe.id));
        }
        let clash = index
            .values()
            .any(|s| s.name == recipe.name && Some(s.id) != recipe.supersedes);
        if clash {
            return Err(RecipeError::DuplicateName(recipe.name.clone()));
        }

        let dir = persist::write_recipe(&self.root, recipe)?;
        index.insert(recipe.id, recipe.summary());
        info!(
            recipe = %recipe.id,
            name = %recipe.name,
            version = recipe.version,
            path = %dir.display(),
            "recipe saved"
        );

        if let Some(old) = recipe.supersedes
            && index.remove(&old).is_some()
        {
            let old_dir = persist::recipe_dir(&self.root, &old);
            if let Err(e) = fs::remove_dir_all(&old_dir) {
                warn!(recipe = %old, error = %e, "failed to remove superseded recipe");
            }
        }
        Ok(())
    }

    /// Read the saved recipe `id` with its reference image and descriptors.
    ///
    /// # Returns
    /// `NotFound` for ids not in the store, `Corrupt` when the three
    /// artifacts on disk disagree.
    pub fn load(&self, id: &RecipeId) -> Result<Recipe, RecipeError> {
        if !self.index.read().contains_key(id) {
            return Err(RecipeError::NotFound(*id));
        }
        let recipe = persist::read_recipe(&persist::recipe_dir(&self.root, id), id)?;
        debug!(recipe = %id, descriptors = recipe.descriptors.len(), "recipe loaded");
        Ok(recipe)
    }

    /// Latest saved recipe named `name`.
    ///
    /// # Returns
    /// `Ok(None)` when no saved recipe has the name, otherwise the highest
    /// version, loaded as by [`load`](Self::load).
    pub fn find_by_name(&self, name: &str) -> Result<Option<Recipe>, RecipeError> {
        let id = self
            .index
            .read()
            .values()
            .filter(|s| s.name == name.trim())
            .max_by_key(|s| s.version)
            .map(|s| s.id);
        id.map(|id| self.load(&id)).transpose()
    }

    /// Summaries of all saved recipes, ordered by name then version.
    pub fn list(&self) -> Vec<RecipeSummary> {
        let mut summaries: Vec<RecipeSummary> = self.index.read().values().cloned().collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name).then(a.version.cmp(&b.version)));
        summaries
    }

    /// Remove the saved recipe `id` and its directory.
    pub fn delete(&self, id: &RecipeId) -> Result<(), RecipeError> {
        let mut index = self.index.write();
        if index.remove(id).is_none() {
            return Err(RecipeError::NotFound(*id));
        }
        fs::remove_dir_all(persist::recipe_dir(&self.root, id))?;
        info!(recipe = %id, "recipe deleted");
        Ok(())
    }
}
