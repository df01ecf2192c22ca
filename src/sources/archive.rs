//! Bundle unpacking and copying. Everything here is blocking and runs on
//! the blocking pool.

use flate2::read::GzDecoder;
use std::fs;
use std::io::{self, Cursor};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, EntryType};
use zip::ZipArchive;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    TarGz,
    Zip,
}

impl ArchiveKind {
    /// Detect by file name suffix.
    pub fn from_name(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Some(Self::TarGz)
        } else if lower.ends_with(".zip") {
            Some(Self::Zip)
        } else {
            None
        }
    }
}

pub fn unpack(kind: ArchiveKind, bytes: &[u8], dest: &Path) -> Result<(), String> {
    match kind {
        ArchiveKind::TarGz => unpack_tar_gz(bytes, dest),
        ArchiveKind::Zip => unpack_zip(bytes, dest),
    }
}

/// Reject absolute paths and any `..` component.
fn safe_relative(path: &Path) -> Result<PathBuf, String> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(format!("archive entry escapes bundle: {}", path.display()));
            }
        }
    }
    Ok(clean)
}

pub fn unpack_tar_gz(bytes: &[u8], dest: &Path) -> Result<(), String> {
    fs::create_dir_all(dest).map_err(|e| e.to_string())?;
    let mut archive = Archive::new(GzDecoder::new(Cursor::new(bytes)));
    archive.set_preserve_permissions(true);

    let entries = archive
        .entries()
        .map_err(|e| format!("failed to read tar archive: {e}"))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| format!("failed to read tar entry: {e}"))?;
        let raw = entry
            .path()
            .map_err(|e| format!("failed to read entry path: {e}"))?
            .into_owned();
        let relative = safe_relative(&raw)?;
        if relative.as_os_str().is_empty() {
            continue;
        }

        match entry.header().entry_type() {
            EntryType::Directory | EntryType::Regular | EntryType::Continuous => {}
            EntryType::Symlink => {
                let target = entry
                    .link_name()
                    .map_err(|e| e.to_string())?
                    .ok_or_else(|| format!("symlink without target: {}", raw.display()))?;
                // Resolved against the link's own directory.
                let base = relative.parent().unwrap_or_else(|| Path::new(""));
                safe_relative(&base.join(&target)).map_err(|_| {
                    format!(
                        "symlink {} points outside bundle: {}",
                        raw.display(),
                        target.display()
                    )
                })?;
            }
            EntryType::Link => {
                return Err(format!("hard links are not allowed: {}", raw.display()));
            }
            // pax headers, GNU long names, device nodes and the like
            _ => continue,
        }

        let target = dest.join(&relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        entry
            .unpack(&target)
            .map_err(|e| format!("failed to unpack {}: {e}", raw.display()))?;
    }
    Ok(())
}

pub fn unpack_zip(bytes: &[u8], dest: &Path) -> Result<(), String> {
    fs::create_dir_all(dest).map_err(|e| e.to_string())?;
    let mut archive =
        ZipArchive::new(Cursor::new(bytes)).map_err(|e| format!("failed to read zip archive: {e}"))?;

    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|e| format!("failed to read zip entry: {e}"))?;
        let relative = file
            .enclosed_name()
            .map(Path::to_path_buf)
            .ok_or_else(|| format!("archive entry escapes bundle: {}", file.name()))?;
        let relative = safe_relative(&relative)?;
        let target = dest.join(&relative);

        if file.is_dir() {
            fs::create_dir_all(&target).map_err(|e| e.to_string())?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        let mut out = fs::File::create(&target).map_err(|e| e.to_string())?;
        io::copy(&mut file, &mut out).map_err(|e| format!("failed to write {}: {e}", relative.display()))?;

        #[cfg(unix)]
        if let Some(mode) = file.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&target, fs::Permissions::from_mode(mode & 0o777))
                .map_err(|e| e.to_string())?;
        }
    }
    Ok(())
}

/// When `dir` holds exactly one directory and nothing else, return it.
/// Source archives usually wrap everything in `<repo>-<ref>/`.
pub fn single_root(dir: &Path) -> io::Result<PathBuf> {
    let mut entries = fs::read_dir(dir)?;
    let first = match entries.next() {
        Some(entry) => entry?,
        None => return Ok(dir.to_path_buf()),
    };
    if entries.next().is_some() || !first.file_type()?.is_dir() {
        return Ok(dir.to_path_buf());
    }
    Ok(first.path())
}

/// Recursive copy preserving permissions; symlinks are recreated as links.
pub fn copy_dir(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let target = dst.join(entry.file_name());
        if file_type.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else if file_type.is_symlink() {
            #[cfg(unix)]
            std::os::unix::fs::symlink(fs::read_link(entry.path())?, &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Tighten an installed tree: directories 0750, executables 0750, other
/// files 0640.
#[cfg(unix)]
pub fn harden_permissions(root: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let meta = fs::symlink_metadata(root)?;
    if meta.file_type().is_symlink() {
        return Ok(());
    }
    if meta.is_dir() {
        fs::set_permissions(root, fs::Permissions::from_mode(0o750))?;
        for entry in fs::read_dir(root)? {
            harden_permissions(&entry?.path())?;
        }
    } else {
        let mode = if meta.permissions().mode() & 0o111 != 0 {
            0o750
        } else {
            0o640
        };
        fs::set_permissions(root, fs::Permissions::from_mode(mode))?;
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn harden_permissions(_root: &Path) -> io::Result<()> {
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::fixtures;
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn unpacks_and_finds_single_root() {
        let dir = TempDir::new().expect("tempdir");
        let bytes = fixtures::tar_gz(&[
            ("repo-v1.0.0/infection.yaml", "metadata:\n  name: demo\n"),
            ("repo-v1.0.0/bin/demo", "#!/bin/sh\n"),
        ]);
        unpack_tar_gz(&bytes, dir.path()).expect("unpack");
        let root = single_root(dir.path()).expect("root");
        assert!(root.ends_with("repo-v1.0.0"));
        assert!(root.join("infection.yaml").is_file());
        assert!(root.join("bin/demo").is_file());
    }

    #[test]
    fn flat_archive_keeps_its_root() {
        let dir = TempDir::new().expect("tempdir");
        let bytes = fixtures::tar_gz(&[("infection.yaml", "x"), ("run.sh", "y")]);
        unpack_tar_gz(&bytes, dir.path()).expect("unpack");
        assert_eq!(single_root(dir.path()).expect("root"), dir.path());
    }

    #[test]
    fn tar_slip_is_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let dest = dir.path().join("out");
        let bytes = fixtures::tar_gz(&[("../evil.sh", "boom")]);
        let err = unpack_tar_gz(&bytes, &dest).expect_err("must reject");
        assert!(err.contains("escapes"), "{err}");
        assert!(!dir.path().join("evil.sh").exists());
    }

    #[test]
    fn zip_slip_is_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let bytes = fixtures::zip(&[("../evil.sh", "boom")]);
        assert!(unpack_zip(&bytes, &dir.path().join("out")).is_err());
    }

    #[test]
    fn zip_bundle_unpacks() {
        let dir = TempDir::new().expect("tempdir");
        let bytes = fixtures::zip(&[("bundle/infection.yaml", "metadata: {}\n")]);
        unpack_zip(&bytes, dir.path()).expect("unpack");
        assert!(dir.path().join("bundle/infection.yaml").is_file());
    }

    #[test]
    fn copies_directories() {
        let src = TempDir::new().expect("src");
        let dst = TempDir::new().expect("dst");
        std::fs::create_dir_all(src.path().join("bin")).expect("mkdir");
        std::fs::write(src.path().join("bin/run"), "x").expect("write");
        std::fs::write(src.path().join("infection.yaml"), "y").expect("write");
        copy_dir(src.path(), &dst.path().join("copy")).expect("copy");
        assert!(dst.path().join("copy/bin/run").is_file());
        assert!(dst.path().join("copy/infection.yaml").is_file());
    }

    #[test]
    fn archive_kind_by_suffix() {
        assert_eq!(ArchiveKind::from_name("a.tar.gz"), Some(ArchiveKind::TarGz));
        assert_eq!(ArchiveKind::from_name("A.TGZ"), Some(ArchiveKind::TarGz));
        assert_eq!(ArchiveKind::from_name("a.zip"), Some(ArchiveKind::Zip));
        assert_eq!(ArchiveKind::from_name("a.sh"), None);
    }
}
