use std::io;
use std::path::{Component, Path, PathBuf};

/// Owner applied to bundle directories. `None` leaves that id unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ownership {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

/// The filesystem operations bundles are allowed to perform.
pub trait FileSystem: Send + Sync {
    fn mkdir_all(&self, path: &Path, mode: u32) -> io::Result<()>;
    fn chown(&self, path: &Path, owner: Ownership) -> io::Result<()>;
    fn file_exists(&self, path: &Path) -> bool;
    /// Create `link` pointing at `target`.
    fn symlink(&self, target: &Path, link: &Path) -> io::Result<()>;
    fn read_link(&self, path: &Path) -> io::Result<PathBuf>;
    /// Remove a file, a symlink (not its target) or a directory tree. Absent paths are fine.
    fn remove_all(&self, path: &Path) -> io::Result<()>;
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    fn list_dir(&self, path: &Path) -> io::Result<Vec<String>>;
    /// Create or truncate `path` and fill it from `contents`.
    fn write_file(&self, path: &Path, contents: &mut dyn io::Read) -> io::Result<u64>;
    /// Apply unix permission bits; a no-op where the platform has none.
    fn set_mode(&self, path: &Path, mode: u32) -> io::Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OsFileSystem;

impl FileSystem for OsFileSystem {
    fn mkdir_all(&self, path: &Path, mode: u32) -> io::Result<()> {
        let mut builder = std::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(mode);
        }
        #[cfg(not(unix))]
        let _ = mode;
        builder.create(path)
    }

    fn chown(&self, path: &Path, owner: Ownership) -> io::Result<()> {
        if owner.uid.is_none() && owner.gid.is_none() {
            return Ok(());
        }
        platform_chown(path, owner)
    }

    fn file_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn symlink(&self, target: &Path, link: &Path) -> io::Result<()> {
        platform_symlink(target, link)
    }

    fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
        std::fs::read_link(path)
    }

    fn remove_all(&self, path: &Path) -> io::Result<()> {
        let meta = match std::fs::symlink_metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        if meta.is_dir() {
            std::fs::remove_dir_all(path)
        } else {
            std::fs::remove_file(path)
        }
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        std::fs::rename(from, to)
    }

    fn list_dir(&self, path: &Path) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            if let Ok(name) = entry.file_name().into_string() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    fn write_file(&self, path: &Path, contents: &mut dyn io::Read) -> io::Result<u64> {
        let mut file = std::fs::File::create(path)?;
        io::copy(contents, &mut file)
    }

    fn set_mode(&self, path: &Path, mode: u32) -> io::Result<()> {
        platform_set_mode(path, mode)
    }
}

#[cfg(unix)]
fn platform_set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn platform_set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn platform_chown(path: &Path, owner: Ownership) -> io::Result<()> {
    std::os::unix::fs::chown(path, owner.uid, owner.gid)
}

#[cfg(not(unix))]
fn platform_chown(_path: &Path, _owner: Ownership) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn platform_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn platform_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}

/// Lexically normalise an absolute path: drop `.` and fold `..` without touching the filesystem.
pub fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() && !out.has_root() {
                    out.push(comp);
                }
            }
            other => out.push(other),
        }
    }
    out
}
