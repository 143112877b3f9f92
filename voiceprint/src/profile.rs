//! Persistence of enrollment clips as raw PCM files.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Stores enrollment clips under a directory as `clip_N.pcm` files.
///
/// Saving replaces any previous profile wholesale; loading returns the
/// clips in name order so the derived reference embedding is stable
/// across restarts.
pub struct ProfileStore {
    dir: PathBuf,
}

impl ProfileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether a profile with at least one clip exists.
    pub fn is_enrolled(&self) -> bool {
        self.load().map(|clips| !clips.is_empty()).unwrap_or(false)
    }

    /// Replaces the stored profile with `clips`.
    pub fn save(&self, clips: &[Vec<u8>]) -> io::Result<()> {
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir)?;
        }
        fs::create_dir_all(&self.dir)?;
        for (index, clip) in clips.iter().enumerate() {
            fs::write(self.dir.join(format!("clip_{}.pcm", index + 1)), clip)?;
        }
        Ok(())
    }

    /// Loads the stored clips in name order. A missing directory is an
    /// empty profile, not an error.
    pub fn load(&self) -> io::Result<Vec<Vec<u8>>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut paths: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.is_file()
                    && p.extension()
                        .is_some_and(|ext| ext.eq_ignore_ascii_case("pcm"))
            })
            .collect();
        paths.sort();

        let mut clips = Vec::with_capacity(paths.len());
        for path in paths {
            clips.push(fs::read(path)?);
        }
        Ok(clips)
    }

    /// Deletes the stored profile, if any.
    pub fn clear(&self) -> io::Result<()> {
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    static COUNTER: AtomicU32 = AtomicU32::new(0);

    fn scratch_store() -> ProfileStore {
        let unique = format!(
            "voicegate-profile-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        ProfileStore::new(std::env::temp_dir().join(unique))
    }

    #[test]
    fn missing_profile_loads_empty() {
        let store = scratch_store();
        assert!(store.load().unwrap().is_empty());
        assert!(!store.is_enrolled());
    }

    #[test]
    fn save_load_roundtrip_preserves_order() {
        let store = scratch_store();
        let clips = vec![vec![1u8; 64], vec![2u8; 32], vec![3u8; 16]];
        store.save(&clips).unwrap();

        assert!(store.is_enrolled());
        assert_eq!(store.load().unwrap(), clips);

        store.clear().unwrap();
    }

    #[test]
    fn save_replaces_previous_profile() {
        let store = scratch_store();
        store.save(&[vec![1u8; 8], vec![2u8; 8], vec![3u8; 8]]).unwrap();
        store.save(&[vec![9u8; 4]]).unwrap();

        let clips = store.load().unwrap();
        assert_eq!(clips.len(), 1);
        assert_eq!(clips[0], vec![9u8; 4]);

        store.clear().unwrap();
    }

    #[test]
    fn clear_is_idempotent() {
        let store = scratch_store();
        store.clear().unwrap();
        store.save(&[vec![1u8; 8]]).unwrap();
        store.clear().unwrap();
        store.clear().unwrap();
        assert!(!store.is_enrolled());
    }
}
