//! Resource staging: materialize scripts into the deployment repository.
//!
//! Every write goes to a temp file in the target's directory and is then
//! renamed over the target, so readers only ever see the old file or the
//! complete new one. Concurrent writers to the same path each own a distinct
//! temp file; the last rename wins.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::assets::{sha256_hex, AssetCatalog};
use crate::error::{StagingError, StagingResult};

#[cfg(unix)]
const SCRIPT_MODE: u32 = 0o755;

/// A script written to disk by the stager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedScript {
    pub path: PathBuf,
    pub size: u64,
    /// Hex SHA-256 of the staged bytes.
    pub digest: String,
}

/// Copies embedded assets into target paths. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Stager {
    catalog: Arc<AssetCatalog>,
}

impl Stager {
    pub fn new(catalog: Arc<AssetCatalog>) -> Self {
        Self { catalog }
    }

    pub fn builtin() -> Self {
        Self::new(Arc::new(AssetCatalog::builtin()))
    }

    pub fn catalog(&self) -> &AssetCatalog {
        &self.catalog
    }

    /// Copy asset `asset_name` to `target`, replacing any existing file.
    ///
    /// The asset is resolved before the filesystem is touched: a missing
    /// asset leaves `target` exactly as it was.
    pub fn stage(&self, asset_name: &str, target: &Path) -> StagingResult<StagedScript> {
        let bytes = self
            .catalog
            .get(asset_name)
            .ok_or_else(|| StagingError::AssetNotFound {
                name: asset_name.to_string(),
            })?;
        self.stage_bytes(bytes, target)
    }

    /// Write caller-supplied script bytes to `target` with the same guarantees
    /// as [`Stager::stage`].
    pub fn stage_bytes(&self, bytes: &[u8], target: &Path) -> StagingResult<StagedScript> {
        persist_atomic(target, bytes, true)?;
        let staged = StagedScript {
            path: target.to_path_buf(),
            size: bytes.len() as u64,
            digest: sha256_hex(bytes),
        };
        crate::obs::emit_staged(&staged.path, staged.size, &staged.digest);
        Ok(staged)
    }
}

/// Atomically replace `target` with `bytes` (non-executable).
pub fn write_atomic(target: &Path, bytes: &[u8]) -> StagingResult<()> {
    persist_atomic(target, bytes, false)
}

fn persist_atomic(target: &Path, bytes: &[u8], executable: bool) -> StagingResult<()> {
    let io_err = |source: std::io::Error| StagingError::Io {
        path: target.to_path_buf(),
        source,
    };

    let parent = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(io_err)?;

    // The temp file is deleted on drop, so any early return below leaves
    // nothing behind.
    let mut tmp = tempfile::Builder::new()
        .prefix(".staging-")
        .tempfile_in(parent)
        .map_err(io_err)?;
    tmp.write_all(bytes).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if executable {
            tmp.as_file()
                .set_permissions(fs::Permissions::from_mode(SCRIPT_MODE))
                .map_err(io_err)?;
        }
    }
    #[cfg(not(unix))]
    let _ = executable;

    tmp.persist(target).map_err(|e| io_err(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_stager() -> Stager {
        let catalog = AssetCatalog::empty()
            .with_asset("deploy.sh", b"#!/bin/bash\necho OUTPUT_ENDPOINT=http://a:1\n")
            .with_asset("other.sh", b"#!/bin/bash\nexit 0\n");
        Stager::new(Arc::new(catalog))
    }

    fn leftover_temp_files(dir: &Path) -> usize {
        fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".staging-"))
            .count()
    }

    #[test]
    fn test_stage_writes_identical_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let stager = make_stager();
        let target = dir.path().join("deploy.sh");

        let staged = stager.stage("deploy.sh", &target).unwrap();

        let on_disk = fs::read(&target).unwrap();
        assert_eq!(on_disk, stager.catalog().get("deploy.sh").unwrap());
        assert_eq!(staged.size, on_disk.len() as u64);
        assert_eq!(Some(staged.digest), stager.catalog().digest("deploy.sh"));
    }

    #[test]
    fn test_stage_overwrites_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let stager = make_stager();
        let target = dir.path().join("deploy.sh");
        fs::write(&target, b"stale content that is longer than the asset ...........").unwrap();

        stager.stage("other.sh", &target).unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"#!/bin/bash\nexit 0\n");
        assert_eq!(leftover_temp_files(dir.path()), 0);
    }

    #[test]
    fn test_missing_asset_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let stager = make_stager();
        let target = dir.path().join("nested").join("deploy.sh");

        match stager.stage("absent.sh", &target) {
            Err(StagingError::AssetNotFound { name }) => assert_eq!(name, "absent.sh"),
            other => panic!("expected AssetNotFound, got {other:?}"),
        }
        assert!(!target.exists());
        assert!(!dir.path().join("nested").exists());
    }

    #[test]
    fn test_missing_asset_leaves_existing_target_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let stager = make_stager();
        let target = dir.path().join("deploy.sh");
        fs::write(&target, b"previous").unwrap();

        assert!(stager.stage("absent.sh", &target).is_err());
        assert_eq!(fs::read(&target).unwrap(), b"previous");
    }

    #[test]
    fn test_stage_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let stager = make_stager();
        let target = dir.path().join("a").join("b").join("deploy.sh");

        stager.stage("deploy.sh", &target).unwrap();
        assert!(target.is_file());
    }

    #[test]
    fn test_failed_persist_leaves_no_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let stager = make_stager();
        // A non-empty directory cannot be replaced by a file.
        let target = dir.path().join("occupied");
        fs::create_dir(&target).unwrap();
        fs::write(target.join("keep"), b"x").unwrap();

        match stager.stage("deploy.sh", &target) {
            Err(StagingError::Io { path, .. }) => assert_eq!(path, target),
            other => panic!("expected Io, got {other:?}"),
        }
        assert!(target.is_dir());
        assert_eq!(leftover_temp_files(dir.path()), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_staged_script_is_executable() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("deploy.sh");
        make_stager().stage("deploy.sh", &target).unwrap();
        let mode = fs::metadata(&target).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn test_write_atomic_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("deploy.log");
        write_atomic(&target, b"first").unwrap();
        write_atomic(&target, b"second").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"second");
    }

    #[test]
    fn test_concurrent_writers_never_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("deploy.sh");
        let a = vec![b'a'; 256 * 1024];
        let b = vec![b'b'; 256 * 1024];
        let stager = Stager::new(Arc::new(
            AssetCatalog::empty().with_asset("a", &a).with_asset("b", &b),
        ));

        std::thread::scope(|s| {
            for i in 0..8 {
                let stager = stager.clone();
                let target = target.clone();
                s.spawn(move || {
                    let name = if i % 2 == 0 { "a" } else { "b" };
                    stager.stage(name, &target).unwrap();
                });
            }
        });

        let content = fs::read(&target).unwrap();
        assert!(content == a || content == b, "staged file was interleaved");
        assert_eq!(leftover_temp_files(dir.path()), 0);
    }
}
