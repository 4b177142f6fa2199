//! Persona Resolution & Paths
//!
//! A persona string partitions all durable state. Persona names are
//! sanitized by replacing path separators with underscores before use as a
//! directory name. The legacy single-file layout
//! `<data>/memory/<persona>.sqlite` is migrated in place on first access.

use std::path::{Path, PathBuf};

pub const DEFAULT_PERSONA: &str = "default";

/// Replace path separators so a persona name is a safe directory component.
pub fn sanitize(persona: &str) -> String {
    persona.replace(['/', '\\'], "_")
}

/// Per-persona filesystem layout under `<data>/memory/<persona>/`.
#[derive(Debug, Clone)]
pub struct PersonaPaths {
    pub persona: String,
    pub dir: PathBuf,
}

impl PersonaPaths {
    pub fn new(memory_root: &Path, persona: &str) -> Self {
        let safe = sanitize(persona);
        Self {
            persona: safe.clone(),
            dir: memory_root.join(&safe),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.dir.join("memory.sqlite")
    }

    pub fn equipment_db_path(&self) -> PathBuf {
        self.dir.join("equipment.db")
    }

    pub fn context_path(&self) -> PathBuf {
        self.dir.join("persona_context.json")
    }

    /// Ensure the persona directory exists and migrate the legacy
    /// single-file database if only the legacy path is present.
    ///
    /// The rename is atomic on the same filesystem; the directory is synced
    /// afterwards so a crash cannot leave both paths half-visible. A failed
    /// rename leaves the legacy file untouched.
    pub fn ensure(&self, memory_root: &Path) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;

        let legacy = memory_root.join(format!("{}.sqlite", self.persona));
        let new_db = self.db_path();
        if legacy.exists() && !new_db.exists() {
            match std::fs::rename(&legacy, &new_db) {
                Ok(()) => {
                    if let Ok(dir) = std::fs::File::open(&self.dir) {
                        let _ = dir.sync_all();
                    }
                    tracing::info!(
                        "Migrated legacy database {} -> {}",
                        legacy.display(),
                        new_db.display()
                    );
                }
                Err(e) => {
                    tracing::warn!("Legacy database migration failed for {}: {}", legacy.display(), e);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_path_separators() {
        assert_eq!(sanitize("a/b"), "a_b");
        assert_eq!(sanitize("a\\b"), "a_b");
        assert_eq!(sanitize("plain"), "plain");
    }

    #[test]
    fn test_paths_layout() {
        let paths = PersonaPaths::new(Path::new("/data/memory"), "hertha");
        assert_eq!(paths.db_path(), PathBuf::from("/data/memory/hertha/memory.sqlite"));
        assert_eq!(
            paths.equipment_db_path(),
            PathBuf::from("/data/memory/hertha/equipment.db")
        );
        assert_eq!(
            paths.context_path(),
            PathBuf::from("/data/memory/hertha/persona_context.json")
        );
    }

    #[test]
    fn test_legacy_migration_renames_once() {
        let root = tempfile::tempdir().unwrap();
        let legacy = root.path().join("luna.sqlite");
        std::fs::write(&legacy, b"legacy-bytes").unwrap();

        let paths = PersonaPaths::new(root.path(), "luna");
        paths.ensure(root.path()).unwrap();

        assert!(!legacy.exists());
        assert_eq!(std::fs::read(paths.db_path()).unwrap(), b"legacy-bytes");

        // Second ensure is a no-op
        paths.ensure(root.path()).unwrap();
        assert!(paths.db_path().exists());
    }

    #[test]
    fn test_no_migration_when_new_db_exists() {
        let root = tempfile::tempdir().unwrap();
        let paths = PersonaPaths::new(root.path(), "luna");
        std::fs::create_dir_all(&paths.dir).unwrap();
        std::fs::write(paths.db_path(), b"new").unwrap();
        let legacy = root.path().join("luna.sqlite");
        std::fs::write(&legacy, b"old").unwrap();

        paths.ensure(root.path()).unwrap();
        assert!(legacy.exists());
        assert_eq!(std::fs::read(paths.db_path()).unwrap(), b"new");
    }
}
