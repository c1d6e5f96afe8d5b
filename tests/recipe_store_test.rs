mod common;

use std::fs;

use common::{temp_store_dir, texture};
use ndarray::Array2;
use recipe_track::{RecipeError, RecipeId, RecipeStore, Rect, RegistrationConfig};

fn roi() -> Rect {
    Rect::new(10.0, 20.0, 120.0, 100.0)
}

fn open(tag: &str) -> RecipeStore {
    RecipeStore::open(temp_store_dir(tag), RegistrationConfig::default()).unwrap()
}

#[test]
fn test_save_load_roundtrip() {
    let store = open("roundtrip");
    let patch = texture(120, 100, 1);
    let mut recipe = store.create("  bracket ", patch.view(), roi()).unwrap();
    recipe.notes = "left side up".into();
    store.save(&recipe).unwrap();

    let loaded = store.load(&recipe.id).unwrap();
    assert_eq!(loaded.name, "bracket");
    assert_eq!(loaded.version, 1);
    assert_eq!(loaded.notes, "left side up");
    assert_eq!(loaded.roi, recipe.roi);
    assert_eq!(loaded.created_at, recipe.created_at);
    assert_eq!(loaded.reference_size, recipe.reference_size);
    assert_eq!(*loaded.reference_image, patch);
    assert_eq!(loaded.descriptors.keypoints(), recipe.descriptors.keypoints());
    assert_eq!(loaded.descriptors.descriptors(), recipe.descriptors.descriptors());
    assert_eq!(loaded.quality.keypoint_count, recipe.descriptors.len());

    let _ = fs::remove_dir_all(store.root());
}

#[test]
fn test_registration_needs_enough_features() {
    let store = open("features");
    let flat = Array2::<u8>::from_elem((80, 80), 128);
    let err = store.create("blank", flat.view(), roi()).unwrap_err();
    assert!(matches!(
        err,
        RecipeError::InsufficientFeatures { found: 0, required: 10 }
    ));

    assert!(store.create("busy", texture(120, 100, 2).view(), roi()).is_ok());
    let _ = fs::remove_dir_all(store.root());
}

#[test]
fn test_empty_name_rejected() {
    let store = open("name");
    let err = store
        .create("   ", texture(120, 100, 3).view(), roi())
        .unwrap_err();
    assert!(matches!(err, RecipeError::InvalidName));
    let _ = fs::remove_dir_all(store.root());
}

#[test]
fn test_duplicate_name_and_double_save() {
    let store = open("duplicate");
    let first = store
        .create("gear", texture(120, 100, 4).view(), roi())
        .unwrap();
    store.save(&first).unwrap();
    assert!(matches!(store.save(&first), Err(RecipeError::AlreadySaved(id)) if id == first.id));

    let second = store
        .create("gear", texture(120, 100, 5).view(), roi())
        .unwrap();
    assert!(matches!(store.save(&second), Err(RecipeError::DuplicateName(name)) if name == "gear"));
    assert_eq!(store.list().len(), 1);
    let _ = fs::remove_dir_all(store.root());
}

#[test]
fn test_list_sorted_by_name() {
    let store = open("list");
    for (seed, name) in [(6, "washer"), (7, "bolt"), (8, "nut")] {
        let recipe = store
            .create(name, texture(120, 100, seed).view(), roi())
            .unwrap();
        store.save(&recipe).unwrap();
    }
    let names: Vec<String> = store.list().into_iter().map(|s| s.name).collect();
    assert_eq!(names, ["bolt", "nut", "washer"]);
    let _ = fs::remove_dir_all(store.root());
}

#[test]
fn test_missing_recipe() {
    let store = open("missing");
    let id = RecipeId::new();
    assert!(matches!(store.load(&id), Err(RecipeError::NotFound(missing)) if missing == id));
    assert!(matches!(store.delete(&id), Err(RecipeError::NotFound(_))));
    assert!(store.find_by_name("nothing").unwrap().is_none());
    let _ = fs::remove_dir_all(store.root());
}

#[test]
fn test_delete_removes_files() {
    let store = open("delete");
    let recipe = store
        .create("clip", texture(120, 100, 9).view(), roi())
        .unwrap();
    store.save(&recipe).unwrap();
    let dir = store.root().join(recipe.id.to_string());
    assert!(dir.is_dir());

    store.delete(&recipe.id).unwrap();
    assert!(!dir.exists());
    assert!(store.list().is_empty());
    let _ = fs::remove_dir_all(store.root());
}

#[test]
fn test_reregistration_replaces_previous_version() {
    let store = open("reregister");
    let mut original = store
        .create("panel", texture(120, 100, 10).view(), roi())
        .unwrap();
    original.notes = "matte finish".into();
    store.save(&original).unwrap();

    let update = store
        .reregister(&original.id, texture(120, 100, 11).view(), roi())
        .unwrap();
    assert_eq!(update.name, "panel");
    assert_eq!(update.version, 2);
    assert_eq!(update.supersedes, Some(original.id));
    assert_eq!(update.notes, "matte finish");
    store.save(&update).unwrap();

    let listed = store.list();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, update.id);
    assert_eq!(listed[0].version, 2);
    assert!(matches!(store.load(&original.id), Err(RecipeError::NotFound(_))));
    assert!(!store.root().join(original.id.to_string()).exists());

    let found = store.find_by_name("panel").unwrap().unwrap();
    assert_eq!(found.id, update.id);
    let _ = fs::remove_dir_all(store.root());
}

#[test]
fn test_corrupt_descriptor_file_rejected() {
    let store = open("corrupt");
    let recipe = store
        .create("latch", texture(120, 100, 12).view(), roi())
        .unwrap();
    store.save(&recipe).unwrap();

    let id = recipe.id.to_string();
    let desc = store.root().join(&id).join(format!("{id}.desc"));
    let bytes = fs::read(&desc).unwrap();
    fs::write(&desc, &bytes[..bytes.len() - 7]).unwrap();

    assert!(matches!(store.load(&recipe.id), Err(RecipeError::Corrupt { .. })));
    let _ = fs::remove_dir_all(store.root());
}

#[test]
fn test_reopen_indexes_saved_recipes_and_drops_staging() {
    let dir = temp_store_dir("reopen");
    let saved = {
        let store = RecipeStore::open(&dir, RegistrationConfig::default()).unwrap();
        let recipe = store
            .create("hinge", texture(120, 100, 13).view(), roi())
            .unwrap();
        store.save(&recipe).unwrap();
        recipe.id
    };

    // Interrupted save.
    let staging = dir.join(format!(".staging-{}", RecipeId::new()));
    fs::create_dir_all(&staging).unwrap();
    fs::write(staging.join("partial.json"), b"{").unwrap();
    // Unreadable recipe directory.
    let broken = RecipeId::new().to_string();
    fs::create_dir_all(dir.join(&broken)).unwrap();
    fs::write(dir.join(&broken).join(format!("{broken}.json")), b"not json").unwrap();

    let store = RecipeStore::open(&dir, RegistrationConfig::default()).unwrap();
    assert!(!staging.exists());
    let listed = store.list();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, saved);
    assert_eq!(store.load(&saved).unwrap().name, "hinge");
    let _ = fs::remove_dir_all(&dir);
}

fn copy_dir(from: &std::path::Path, to: &std::path::Path) {
    fs::create_dir_all(to).unwrap();
    for entry in fs::read_dir(from).unwrap() {
        let entry = entry.unwrap();
        fs::copy(entry.path(), to.join(entry.file_name())).unwrap();
    }
}

#[test]
fn test_reopen_removes_version_left_behind_by_reregistration() {
    let dir = temp_store_dir("superseded");
    let backup = temp_store_dir("superseded-backup");
    let (v1, v2) = {
        let store = RecipeStore::open(&dir, RegistrationConfig::default()).unwrap();
        let v1 = store
            .create("panel", texture(120, 100, 14).view(), roi())
            .unwrap();
        store.save(&v1).unwrap();
        copy_dir(&dir.join(v1.id.to_string()), &backup);

        let v2 = store
            .reregister(&v1.id, texture(120, 100, 15).view(), roi())
            .unwrap();
        store.save(&v2).unwrap();
        (v1.id, v2.id)
    };
    // Save interrupted before the old version was removed.
    let stale = dir.join(v1.to_string());
    copy_dir(&backup, &stale);

    let store = RecipeStore::open(&dir, RegistrationConfig::default()).unwrap();
    let listed: Vec<(String, u32)> = store
        .list()
        .into_iter()
        .map(|s| (s.name, s.version))
        .collect();
    assert_eq!(listed, [("panel".to_string(), 2)]);
    assert!(!stale.exists());
    assert!(matches!(store.load(&v1), Err(RecipeError::NotFound(_))));
    assert!(matches!(
        store.reregister(&v1, texture(120, 100, 16).view(), roi()),
        Err(RecipeError::NotFound(_))
    ));
    assert_eq!(store.find_by_name("panel").unwrap().unwrap().id, v2);

    let v3 = store
        .reregister(&v2, texture(120, 100, 16).view(), roi())
        .unwrap();
    assert_eq!(v3.version, 3);
    store.save(&v3).unwrap();
    assert_eq!(store.list().len(), 1);

    let _ = fs::remove_dir_all(&dir);
    let _ = fs::remove_dir_all(&backup);
}

#[test]
fn test_invalid_registration_config_rejected() {
    let config = RegistrationConfig {
        min_keypoints: 2,
        ..Default::default()
    };
    let result = RecipeStore::open(temp_store_dir("config"), config);
    assert!(matches!(result, Err(RecipeError::Config(_))));
}
