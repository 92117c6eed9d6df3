//! Versioned bundle directories and the stable symlinks that select the active version.
//!
//! Layout:
//!   {installs_root}/{name}/{version}/...   (install path, one per version)
//!   {enable_root}/{name} -> install path   (enable path)
//!
//! A bundle is installed iff its install path exists; nothing else records that fact.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::settings::AgentConfig;

pub mod fs;

pub use fs::{FileSystem, OsFileSystem, Ownership};

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("install dir does not exist")]
    NotInstalled,
    #[error("bundle must be installed")]
    MustBeInstalled,
    #[error("invalid bundle {field} `{value}`")]
    InvalidName { field: &'static str, value: String },
    #[error("{op} `{}`", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("unpacking archive `{}`: {reason}", path.display())]
    Archive { path: PathBuf, reason: String },
}

fn io_err<'a>(op: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> BundleError + 'a {
    move |source| BundleError::Io { op, path: path.to_path_buf(), source }
}

#[derive(Clone)]
pub struct FileBundle {
    install_path: PathBuf,
    enable_path: PathBuf,
    dir_mode: u32,
    owner: Ownership,
    fs: Arc<dyn FileSystem>,
}

impl std::fmt::Debug for FileBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileBundle")
            .field("install_path", &self.install_path)
            .field("enable_path", &self.enable_path)
            .finish()
    }
}

impl FileBundle {
    pub fn new(
        install_path: impl Into<PathBuf>,
        enable_path: impl Into<PathBuf>,
        dir_mode: u32,
        owner: Ownership,
        fs: Arc<dyn FileSystem>,
    ) -> Self {
        Self {
            install_path: install_path.into(),
            enable_path: enable_path.into(),
            dir_mode,
            owner,
            fs,
        }
    }

    pub fn enable_path(&self) -> &Path {
        &self.enable_path
    }

    /// Create the (empty) install directory and hand it to the bundle owner.
    ///
    /// The directory is created before ownership is set, so a failed chown still leaves the
    /// bundle reporting as installed.
    pub fn install_without_contents(&self) -> Result<PathBuf, BundleError> {
        debug!(bundle=?self, "Installing without contents");

        self.fs
            .mkdir_all(&self.install_path, self.dir_mode)
            .map_err(io_err("Creating installation directory", &self.install_path))?;
        self.fs
            .chown(&self.install_path, self.owner)
            .map_err(io_err("Setting ownership on installation directory", &self.install_path))?;

        Ok(self.install_path.clone())
    }

    /// Unpack a zip archive and move it into place as the install path.
    ///
    /// Contents are staged next to the install path and renamed in as the final step, so a
    /// crash mid-unpack never leaves a partially populated install path behind.
    pub fn install_with_contents(&self, archive: &Path) -> Result<PathBuf, BundleError> {
        debug!(bundle=?self, archive=%archive.display(), "Installing with contents");
        if self.is_installed() {
            return Ok(self.install_path.clone());
        }

        let parent = self.install_path.parent().unwrap_or(Path::new("/"));
        self.fs
            .mkdir_all(parent, self.dir_mode)
            .map_err(io_err("Creating installation parent directory", parent))?;

        let file_name = self
            .install_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let staging = parent.join(format!(".{}.staging-{}", file_name, uuid::Uuid::new_v4()));
        self.fs
            .mkdir_all(&staging, self.dir_mode)
            .map_err(io_err("Creating staging directory", &staging))?;

        let staged = self
            .unpack_zip(archive, &staging)
            .and_then(|_| {
                self.fs
                    .chown(&staging, self.owner)
                    .map_err(io_err("Setting ownership on staging directory", &staging))
            })
            .and_then(|_| {
                self.fs
                    .rename(&staging, &self.install_path)
                    .map_err(io_err("Moving staged contents into place", &self.install_path))
            });
        if let Err(e) = staged {
            let _ = self.fs.remove_all(&staging);
            return Err(e);
        }

        Ok(self.install_path.clone())
    }

    pub fn get_install_path(&self) -> Result<PathBuf, BundleError> {
        if !self.fs.file_exists(&self.install_path) {
            return Err(BundleError::NotInstalled);
        }
        Ok(self.install_path.clone())
    }

    pub fn is_installed(&self) -> bool {
        self.fs.file_exists(&self.install_path)
    }

    /// Point the enable path at this bundle's install path.
    pub fn enable(&self) -> Result<PathBuf, BundleError> {
        debug!(bundle=?self, "Enabling");

        if !self.fs.file_exists(&self.install_path) {
            return Err(BundleError::MustBeInstalled);
        }

        let enable_dir = self.enable_path.parent().unwrap_or(Path::new("/"));
        self.fs
            .mkdir_all(enable_dir, self.dir_mode)
            .map_err(io_err("Creating enable directory", enable_dir))?;
        self.fs
            .chown(enable_dir, self.owner)
            .map_err(io_err("Setting ownership on enable directory", enable_dir))?;

        self.fs
            .symlink(&self.install_path, &self.enable_path)
            .map_err(io_err("Enabling bundle", &self.enable_path))?;

        Ok(self.enable_path.clone())
    }

    /// Remove the enable path, but only while it still points at this bundle.
    ///
    /// Another version may have re-pointed the link since this one was enabled; that link
    /// belongs to the other version and is left alone.
    pub fn disable(&self) -> Result<(), BundleError> {
        debug!(bundle=?self, "Disabling");

        let target = match self.fs.read_link(&self.enable_path) {
            Ok(t) => t,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(BundleError::Io { op: "Reading symlink", path: self.enable_path.clone(), source: e })
            }
        };
        debug!(enable_path=%self.enable_path.display(), target=%target.display(), "Read enable link");

        let mut install_path = self.install_path.clone();
        let mut target = target;
        if install_path.is_absolute() {
            install_path = fs::clean_path(&install_path);
            if target.is_relative() {
                let link_dir = self.enable_path.parent().unwrap_or(Path::new("/"));
                target = link_dir.join(target);
            }
            target = fs::clean_path(&target);
        }

        debug!(install_path=%install_path.display(), target=%target.display(), "Comparing enable target");
        if target == install_path {
            return self
                .fs
                .remove_all(&self.enable_path)
                .map_err(io_err("Removing enable link", &self.enable_path));
        }

        debug!(enable_path=%self.enable_path.display(), "Enable link belongs to another version, leaving it");
        Ok(())
    }

    /// Write every archive entry under `dest` through the bundle's filesystem.
    fn unpack_zip(&self, archive: &Path, dest: &Path) -> Result<(), BundleError> {
        let archive_err = |reason: String| BundleError::Archive { path: archive.to_path_buf(), reason };

        let file = std::fs::File::open(archive).map_err(io_err("Opening bundle archive", archive))?;
        let mut zip = zip::ZipArchive::new(file).map_err(|e| archive_err(format!("invalid zip: {e}")))?;
        for i in 0..zip.len() {
            let mut entry = zip.by_index(i).map_err(|e| archive_err(format!("entry {i}: {e}")))?;
            let rel = entry
                .enclosed_name()
                .map(Path::to_path_buf)
                .ok_or_else(|| archive_err(format!("entry `{}` escapes the bundle", entry.name())))?;
            let out = dest.join(rel);
            if entry.is_dir() {
                self.fs
                    .mkdir_all(&out, self.dir_mode)
                    .map_err(io_err("Creating archive directory", &out))?;
                continue;
            }
            if let Some(parent) = out.parent() {
                self.fs
                    .mkdir_all(parent, self.dir_mode)
                    .map_err(io_err("Creating archive directory", parent))?;
            }
            self.fs
                .write_file(&out, &mut entry)
                .map_err(io_err("Writing archive file", &out))?;
            if let Some(mode) = entry.unix_mode() {
                self.fs
                    .set_mode(&out, mode)
                    .map_err(io_err("Setting archive file mode", &out))?;
            }
        }
        Ok(())
    }
}

/// Maps `(name, version)` pairs onto bundles under two roots.
#[derive(Clone)]
pub struct BundleCollection {
    installs_root: PathBuf,
    enable_root: PathBuf,
    dir_mode: u32,
    owner: Ownership,
    fs: Arc<dyn FileSystem>,
}

impl BundleCollection {
    pub fn new(
        installs_root: impl Into<PathBuf>,
        enable_root: impl Into<PathBuf>,
        dir_mode: u32,
        owner: Ownership,
        fs: Arc<dyn FileSystem>,
    ) -> Self {
        Self {
            installs_root: installs_root.into(),
            enable_root: enable_root.into(),
            dir_mode,
            owner,
            fs,
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(
            config.installs_root(),
            config.enable_root(),
            config.bundles.dir_mode,
            Ownership { uid: config.bundles.uid, gid: config.bundles.gid },
            Arc::new(OsFileSystem),
        )
    }

    pub fn get(&self, name: &str, version: &str) -> Result<FileBundle, BundleError> {
        validate_segment("name", name)?;
        validate_segment("version", version)?;
        Ok(FileBundle::new(
            self.installs_root.join(name).join(version),
            self.enable_root.join(name),
            self.dir_mode,
            self.owner,
            self.fs.clone(),
        ))
    }

    /// Versions of `name` with an install directory, sorted.
    pub fn installed_versions(&self, name: &str) -> Result<Vec<String>, BundleError> {
        validate_segment("name", name)?;
        let dir = self.installs_root.join(name);
        match self.fs.list_dir(&dir) {
            Ok(names) => Ok(names.into_iter().filter(|n| !n.starts_with('.')).collect()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(BundleError::Io { op: "Listing installed versions", path: dir, source: e }),
        }
    }

    /// Version the enable link of `name` currently points at, if any.
    pub fn enabled_version(&self, name: &str) -> Result<Option<String>, BundleError> {
        validate_segment("name", name)?;
        let link = self.enable_root.join(name);
        match self.fs.read_link(&link) {
            Ok(target) => Ok(target.file_name().map(|n| n.to_string_lossy().into_owned())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BundleError::Io { op: "Reading symlink", path: link, source: e }),
        }
    }
}

fn validate_segment(field: &'static str, value: &str) -> Result<(), BundleError> {
    let bad = value.is_empty()
        || value == "."
        || value == ".."
        || value.starts_with('.')
        || value.contains('/')
        || value.contains('\\');
    if bad {
        return Err(BundleError::InvalidName { field, value: value.to_string() });
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::io::Write;

    struct Fixture {
        _dir: tempfile::TempDir,
        collection: BundleCollection,
        installs_root: PathBuf,
        enable_root: PathBuf,
    }

    fn fixture_with_fs(fs: Arc<dyn FileSystem>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let installs_root = dir.path().join("data").join("jobs");
        let enable_root = dir.path().join("jobs");
        let collection = BundleCollection::new(&installs_root, &enable_root, 0o750, Ownership::default(), fs);
        Fixture { _dir: dir, collection, installs_root, enable_root }
    }

    fn fixture() -> Fixture {
        fixture_with_fs(Arc::new(OsFileSystem))
    }

    /// Delegates to the real filesystem but fails every chown.
    struct ChownFails;

    impl FileSystem for ChownFails {
        fn mkdir_all(&self, path: &Path, mode: u32) -> io::Result<()> { OsFileSystem.mkdir_all(path, mode) }
        fn chown(&self, _path: &Path, _owner: Ownership) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "chown denied"))
        }
        fn file_exists(&self, path: &Path) -> bool { OsFileSystem.file_exists(path) }
        fn symlink(&self, target: &Path, link: &Path) -> io::Result<()> { OsFileSystem.symlink(target, link) }
        fn read_link(&self, path: &Path) -> io::Result<PathBuf> { OsFileSystem.read_link(path) }
        fn remove_all(&self, path: &Path) -> io::Result<()> { OsFileSystem.remove_all(path) }
        fn rename(&self, from: &Path, to: &Path) -> io::Result<()> { OsFileSystem.rename(from, to) }
        fn list_dir(&self, path: &Path) -> io::Result<Vec<String>> { OsFileSystem.list_dir(path) }
        fn write_file(&self, path: &Path, contents: &mut dyn io::Read) -> io::Result<u64> { OsFileSystem.write_file(path, contents) }
        fn set_mode(&self, path: &Path, mode: u32) -> io::Result<()> { OsFileSystem.set_mode(path, mode) }
    }

    /// Delegates to the real filesystem but refuses to change file modes.
    struct ModeFails;

    impl FileSystem for ModeFails {
        fn mkdir_all(&self, path: &Path, mode: u32) -> io::Result<()> { OsFileSystem.mkdir_all(path, mode) }
        fn chown(&self, path: &Path, owner: Ownership) -> io::Result<()> { OsFileSystem.chown(path, owner) }
        fn file_exists(&self, path: &Path) -> bool { OsFileSystem.file_exists(path) }
        fn symlink(&self, target: &Path, link: &Path) -> io::Result<()> { OsFileSystem.symlink(target, link) }
        fn read_link(&self, path: &Path) -> io::Result<PathBuf> { OsFileSystem.read_link(path) }
        fn remove_all(&self, path: &Path) -> io::Result<()> { OsFileSystem.remove_all(path) }
        fn rename(&self, from: &Path, to: &Path) -> io::Result<()> { OsFileSystem.rename(from, to) }
        fn list_dir(&self, path: &Path) -> io::Result<Vec<String>> { OsFileSystem.list_dir(path) }
        fn write_file(&self, path: &Path, contents: &mut dyn io::Read) -> io::Result<u64> { OsFileSystem.write_file(path, contents) }
        fn set_mode(&self, _path: &Path, _mode: u32) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "chmod denied"))
        }
    }

    fn write_archive(path: &Path) {
        let file = std::fs::File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let opts = zip::write::FileOptions::default().unix_permissions(0o755);
        zip.start_file("bin/run", opts).unwrap();
        zip.write_all(b"#!/bin/sh\necho hi\n").unwrap();
        zip.finish().unwrap();
    }

    #[test]
    fn install_marks_bundle_installed() {
        let f = fixture();
        let bundle = f.collection.get("web", "1.0").unwrap();
        assert!(!bundle.is_installed());
        assert!(matches!(bundle.get_install_path(), Err(BundleError::NotInstalled)));

        let path = bundle.install_without_contents().unwrap();
        assert_eq!(path, f.installs_root.join("web").join("1.0"));
        assert!(bundle.is_installed());
        assert_eq!(bundle.get_install_path().unwrap(), path);
        assert!(path.is_dir());
    }

    #[test]
    fn failed_chown_after_mkdir_still_reads_as_installed() {
        let f = fixture_with_fs(Arc::new(ChownFails));
        let bundle = f.collection.get("web", "1.0").unwrap();

        let err = bundle.install_without_contents().unwrap_err();
        assert!(err.to_string().contains("Setting ownership on installation directory"));
        assert!(bundle.is_installed());
    }

    #[test]
    fn enable_requires_install_and_touches_nothing() {
        let f = fixture();
        let bundle = f.collection.get("web", "1.0").unwrap();

        assert!(matches!(bundle.enable(), Err(BundleError::MustBeInstalled)));
        assert!(!f.enable_root.exists());
        assert!(!f.installs_root.exists());
    }

    #[test]
    fn enable_links_enable_path_to_install_path() {
        let f = fixture();
        let bundle = f.collection.get("web", "1.0").unwrap();
        let install = bundle.install_without_contents().unwrap();

        let enabled = bundle.enable().unwrap();
        assert_eq!(enabled, f.enable_root.join("web"));
        assert_eq!(std::fs::read_link(&enabled).unwrap(), install);
        assert_eq!(f.collection.enabled_version("web").unwrap().as_deref(), Some("1.0"));
    }

    #[test]
    fn enable_surfaces_conflicting_link() {
        let f = fixture();
        let v1 = f.collection.get("web", "1.0").unwrap();
        let v2 = f.collection.get("web", "2.0").unwrap();
        v1.install_without_contents().unwrap();
        v2.install_without_contents().unwrap();
        v1.enable().unwrap();

        let err = v2.enable().unwrap_err();
        assert!(matches!(err, BundleError::Io { op: "Enabling bundle", .. }));
    }

    #[test]
    fn disable_without_link_is_noop() {
        let f = fixture();
        let bundle = f.collection.get("web", "1.0").unwrap();
        bundle.install_without_contents().unwrap();

        bundle.disable().unwrap();
        assert!(!f.enable_root.exists());
        assert!(bundle.is_installed());
    }

    #[test]
    fn disable_leaves_link_owned_by_other_version() {
        let f = fixture();
        let v1 = f.collection.get("web", "1.0").unwrap();
        let v2 = f.collection.get("web", "2.0").unwrap();
        v1.install_without_contents().unwrap();
        let v2_install = v2.install_without_contents().unwrap();
        v2.enable().unwrap();

        v1.disable().unwrap();
        assert_eq!(std::fs::read_link(f.enable_root.join("web")).unwrap(), v2_install);
    }

    #[test]
    fn disable_removes_own_link() {
        let f = fixture();
        let bundle = f.collection.get("web", "1.0").unwrap();
        let install = bundle.install_without_contents().unwrap();
        bundle.enable().unwrap();

        bundle.disable().unwrap();
        assert!(std::fs::symlink_metadata(f.enable_root.join("web")).is_err());
        assert!(install.is_dir());
        assert_eq!(f.collection.enabled_version("web").unwrap(), None);
    }

    #[test]
    fn disable_matches_unclean_install_path() {
        let f = fixture();
        let clean = f.collection.get("web", "1.0").unwrap();
        let install = clean.install_without_contents().unwrap();
        clean.enable().unwrap();

        let dotted = install.parent().unwrap().join(".").join("1.0");
        let bundle = FileBundle::new(dotted, f.enable_root.join("web"), 0o750, Ownership::default(), Arc::new(OsFileSystem));
        bundle.disable().unwrap();
        assert!(std::fs::symlink_metadata(f.enable_root.join("web")).is_err());
    }

    #[test]
    fn rejects_path_like_names() {
        let f = fixture();
        assert!(matches!(f.collection.get("../etc", "1"), Err(BundleError::InvalidName { field: "name", .. })));
        assert!(matches!(f.collection.get("web", "a/b"), Err(BundleError::InvalidName { field: "version", .. })));
    }

    #[test]
    fn install_with_contents_unpacks_zip() {
        use std::os::unix::fs::PermissionsExt;

        let f = fixture();
        let archive = f._dir.path().join("web.zip");
        write_archive(&archive);

        let bundle = f.collection.get("web", "1.0").unwrap();
        let install = bundle.install_with_contents(&archive).unwrap();
        let run = install.join("bin").join("run");
        assert_eq!(std::fs::read(&run).unwrap(), b"#!/bin/sh\necho hi\n");
        assert_eq!(std::fs::metadata(&run).unwrap().permissions().mode() & 0o777, 0o755);
        assert_eq!(f.collection.installed_versions("web").unwrap(), vec!["1.0".to_string()]);
    }

    #[test]
    fn failed_mode_change_aborts_install() {
        let f = fixture_with_fs(Arc::new(ModeFails));
        let archive = f._dir.path().join("web.zip");
        write_archive(&archive);

        let bundle = f.collection.get("web", "1.0").unwrap();
        let err = bundle.install_with_contents(&archive).unwrap_err();
        assert!(matches!(err, BundleError::Io { op: "Setting archive file mode", .. }));
        assert!(!bundle.is_installed());
        assert!(f.collection.installed_versions("web").unwrap().is_empty());
    }

    #[test]
    fn install_with_bad_archive_leaves_bundle_absent() {
        let f = fixture();
        let archive = f._dir.path().join("broken.zip");
        std::fs::write(&archive, b"not a zip").unwrap();

        let bundle = f.collection.get("web", "1.0").unwrap();
        assert!(matches!(bundle.install_with_contents(&archive), Err(BundleError::Archive { .. })));
        assert!(!bundle.is_installed());
        assert!(f.collection.installed_versions("web").unwrap().is_empty());
    }
}
