//! Filesystem helpers for materialization
//!
//! Link target resolution and metadata preserving copies.

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use filetime::FileTime;
use std::fs;
use walkdir::WalkDir;

use crate::{Error, Result};

/// Upper bound on dangling link hops followed while resolving a missing target
const MAX_LINK_HOPS: usize = 40;

/// Read a symlink and resolve its target relative to the link's directory.
///
/// Existing targets are fully canonicalized. Missing targets are resolved as
/// far as the filesystem allows, see [`resolve_lenient`].
pub fn resolve_link_target(link: &Utf8Path) -> Result<Utf8PathBuf> {
    let raw = read_link_utf8(link)?;
    let parent = link.parent().ok_or_else(|| {
        Error::materialize(
            format!("Cannot resolve symlink without parent directory: {}", link),
            "This is an unexpected path structure",
        )
    })?;

    Ok(resolve_lenient(&parent.join(raw)))
}

/// Resolve `path` to an absolute path without requiring it to exist.
///
/// The deepest existing ancestor is canonicalized and the missing remainder
/// is appended with `.` and `..` folded lexically. Dangling symlinks met at
/// the boundary are followed so the reported path names the real missing
/// entry.
pub fn resolve_lenient(path: &Utf8Path) -> Utf8PathBuf {
    let mut current = path.to_owned();

    for _ in 0..MAX_LINK_HOPS {
        if let Ok(canonical) = current.canonicalize_utf8() {
            return canonical;
        }

        let Some((base, rest)) = split_at_existing(&current) else {
            return normalize_lexically(&current);
        };

        // A dangling link at the boundary: continue from where it points
        let first_missing = rest.components().next().map(|c| base.join(c.as_str()));
        if let Some(candidate) = first_missing
            && candidate.is_symlink()
            && let Ok(next) = read_link_utf8(&candidate)
        {
            let tail: Utf8PathBuf = rest.components().skip(1).map(|c| c.as_str()).collect();
            current = base.join(next);
            if !tail.as_str().is_empty() {
                current.push(tail);
            }
            continue;
        }

        return normalize_lexically(&base.join(rest));
    }

    tracing::debug!(path = %path, "Gave up following dangling symlinks");
    normalize_lexically(path)
}

/// Split `path` into its deepest canonicalizable ancestor and the remainder
fn split_at_existing(path: &Utf8Path) -> Option<(Utf8PathBuf, Utf8PathBuf)> {
    for ancestor in path.ancestors().skip(1) {
        if ancestor.as_str().is_empty() {
            continue;
        }
        if let Ok(canonical) = ancestor.canonicalize_utf8() {
            let rest = path.strip_prefix(ancestor).ok()?.to_owned();
            return Some((canonical, rest));
        }
    }
    None
}

/// Fold `.` and `..` components without touching the filesystem
fn normalize_lexically(path: &Utf8Path) -> Utf8PathBuf {
    let mut result = Utf8PathBuf::new();
    for component in path.components() {
        match component {
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                if !result.pop() {
                    result.push("..");
                }
            }
            other => result.push(other.as_str()),
        }
    }
    result
}

fn read_link_utf8(link: &Utf8Path) -> Result<Utf8PathBuf> {
    let raw = fs::read_link(link).map_err(|e| {
        Error::materialize(
            format!("Failed to read symlink {}: {}", link, e),
            "Check directory permissions",
        )
    })?;
    Utf8PathBuf::try_from(raw).map_err(|e| {
        Error::materialize(
            format!("Symlink target is not valid UTF-8: {:?}", e),
            "Ensure all paths are valid UTF-8",
        )
    })
}

/// Copy a regular file, keeping its permissions and timestamps.
///
/// Anything that is not a regular file (FIFOs, sockets, devices) is refused
/// before it is opened, since reading a FIFO blocks until a writer shows up.
pub fn copy_file_with_metadata(src: &Utf8Path, dst: &Utf8Path) -> Result<()> {
    let metadata = fs::metadata(src)?;
    if !metadata.is_file() {
        return Err(Error::materialize(
            format!("{} is not a regular file or directory", src),
            "Only files and directories can be materialized",
        ));
    }

    fs::copy(src, dst).map_err(|e| copy_error(src, dst, e))?;
    apply_times(dst, &metadata)
}

/// Recursively copy a directory, dereferencing nested symlinks.
///
/// The copy holds no links into the original tree. Nested links whose target
/// is missing cannot be dereferenced and are recreated verbatim. Permissions
/// and timestamps of files and directories are carried over. Directory
/// metadata is applied after the contents so that writing the children does
/// not bump the copied mtime.
pub fn copy_dir_recursive(src: &Utf8Path, dst: &Utf8Path) -> Result<()> {
    let mut directories: Vec<(Utf8PathBuf, fs::Metadata)> = Vec::new();

    for entry in WalkDir::new(src).follow_links(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                copy_dangling_link(src, dst, &e)?;
                continue;
            }
        };

        let src_path = utf8_path(entry.path())?;
        let dst_path = dst.join(relative_to(src, src_path)?);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&dst_path).map_err(|e| copy_error(src_path, &dst_path, e))?;
            let metadata = entry.metadata().map_err(|e| {
                Error::walk(
                    format!("Failed to read metadata of {}: {}", src_path, e),
                    "Check directory permissions",
                )
            })?;
            directories.push((dst_path, metadata));
        } else {
            copy_file_with_metadata(src_path, &dst_path)?;
        }
    }

    // Deepest first, so parents are stamped after their children
    for (dir, metadata) in directories.iter().rev() {
        fs::set_permissions(dir, metadata.permissions())?;
        apply_times(dir, metadata)?;
    }

    Ok(())
}

/// Recreate a broken nested link as-is, or turn the walk error into a failure
fn copy_dangling_link(src: &Utf8Path, dst: &Utf8Path, err: &walkdir::Error) -> Result<()> {
    let walk_error = || {
        Error::walk(
            format!("Failed to read directory entry: {}", err),
            "Check directory permissions and look for symlink loops",
        )
    };

    let Some(path) = err.path() else {
        return Err(walk_error());
    };
    if err.loop_ancestor().is_some() || !path.is_symlink() || path.exists() {
        return Err(walk_error());
    }

    let src_path = utf8_path(path)?;
    let dst_path = dst.join(relative_to(src, src_path)?);
    let target = fs::read_link(src_path)?;
    std::os::unix::fs::symlink(&target, &dst_path)
        .map_err(|e| copy_error(src_path, &dst_path, e))?;

    tracing::warn!(
        path = %src_path,
        target = ?target,
        "Nested symlink target does not exist, copying link as-is"
    );
    Ok(())
}

fn utf8_path(path: &std::path::Path) -> Result<&Utf8Path> {
    Utf8Path::from_path(path).ok_or_else(|| {
        Error::walk(
            format!("Path is not valid UTF-8: {:?}", path),
            "Ensure all file paths contain only valid UTF-8 characters",
        )
    })
}

fn relative_to<'a>(base: &Utf8Path, path: &'a Utf8Path) -> Result<&'a Utf8Path> {
    path.strip_prefix(base).map_err(|_| {
        Error::walk(
            format!("Failed to strip source prefix from {}", path),
            "This is an unexpected internal error",
        )
    })
}

fn apply_times(dst: &Utf8Path, metadata: &fs::Metadata) -> Result<()> {
    filetime::set_file_times(
        dst,
        FileTime::from_last_access_time(metadata),
        FileTime::from_last_modification_time(metadata),
    )?;
    Ok(())
}

fn copy_error(src: &Utf8Path, dst: &Utf8Path, e: std::io::Error) -> Error {
    Error::materialize(
        format!("Failed to copy {} to {}: {}", src, dst, e),
        "Check free disk space and permissions on the staging directory",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::{PermissionsExt, symlink};
    use tempfile::TempDir;

    fn utf8_root(temp_dir: &TempDir) -> Utf8PathBuf {
        Utf8Path::from_path(temp_dir.path())
            .unwrap()
            .canonicalize_utf8()
            .unwrap()
    }

    #[test]
    fn test_resolve_relative_link() {
        let temp_dir = TempDir::new().unwrap();
        let root = utf8_root(&temp_dir);
        fs::create_dir_all(root.join("a")).unwrap();
        fs::write(root.join("a/real.txt"), "hi").unwrap();
        symlink("real.txt", root.join("a/link.txt")).unwrap();

        let target = resolve_link_target(&root.join("a/link.txt")).unwrap();

        assert_eq!(target, root.join("a/real.txt"));
    }

    #[test]
    fn test_resolve_follows_link_chain() {
        let temp_dir = TempDir::new().unwrap();
        let root = utf8_root(&temp_dir);
        fs::create_dir_all(root.join("share/data")).unwrap();
        symlink("share/data", root.join("first")).unwrap();
        symlink("first", root.join("second")).unwrap();

        let target = resolve_link_target(&root.join("second")).unwrap();

        assert_eq!(target, root.join("share/data"));
    }

    #[test]
    fn test_resolve_missing_target() {
        let temp_dir = TempDir::new().unwrap();
        let root = utf8_root(&temp_dir);
        fs::create_dir_all(root.join("lib")).unwrap();
        symlink("../gone/./ghost.txt", root.join("lib/broken")).unwrap();

        let target = resolve_link_target(&root.join("lib/broken")).unwrap();

        assert_eq!(target, root.join("gone/ghost.txt"));
        assert!(!target.exists());
    }

    #[test]
    fn test_resolve_missing_through_dangling_link() {
        let temp_dir = TempDir::new().unwrap();
        let root = utf8_root(&temp_dir);
        symlink("ghost.txt", root.join("middle")).unwrap();
        symlink("middle", root.join("outer")).unwrap();

        let target = resolve_link_target(&root.join("outer")).unwrap();

        assert_eq!(target, root.join("ghost.txt"));
    }

    #[test]
    fn test_resolve_gives_up_on_cycle() {
        let temp_dir = TempDir::new().unwrap();
        let root = utf8_root(&temp_dir);
        symlink("loop_b", root.join("loop_a")).unwrap();
        symlink("loop_a", root.join("loop_b")).unwrap();

        let target = resolve_link_target(&root.join("loop_a")).unwrap();

        assert!(target.starts_with(&root));
        assert!(!target.exists());
    }

    #[test]
    fn test_normalize_lexically() {
        assert_eq!(
            normalize_lexically(Utf8Path::new("/a/b/../c/./d")),
            Utf8PathBuf::from("/a/c/d")
        );
        assert_eq!(
            normalize_lexically(Utf8Path::new("/a/missing/../x")),
            Utf8PathBuf::from("/a/x")
        );
    }

    #[test]
    fn test_copy_file_preserves_metadata() {
        let temp_dir = TempDir::new().unwrap();
        let root = utf8_root(&temp_dir);
        let src = root.join("tool.sh");
        let dst = root.join("copy.sh");
        fs::write(&src, "#!/bin/sh\necho ok\n").unwrap();
        fs::set_permissions(&src, fs::Permissions::from_mode(0o750)).unwrap();
        filetime::set_file_mtime(&src, FileTime::from_unix_time(1_600_000_000, 0)).unwrap();

        copy_file_with_metadata(&src, &dst).unwrap();

        let meta = fs::metadata(&dst).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o750);
        assert_eq!(
            FileTime::from_last_modification_time(&meta),
            FileTime::from_unix_time(1_600_000_000, 0)
        );
        assert_eq!(fs::read(&dst).unwrap(), fs::read(&src).unwrap());
    }

    #[test]
    fn test_copy_dir_recursive() {
        let temp_dir = TempDir::new().unwrap();
        let root = utf8_root(&temp_dir);
        let src = root.join("src");
        let dst = root.join("dst");

        fs::create_dir_all(src.join("subdir")).unwrap();
        fs::write(src.join("file1.txt"), "content1").unwrap();
        fs::write(src.join("subdir/file2.txt"), "content2").unwrap();
        filetime::set_file_mtime(&src.join("subdir"), FileTime::from_unix_time(1_500_000_000, 0))
            .unwrap();

        copy_dir_recursive(&src, &dst).unwrap();

        assert_eq!(fs::read_to_string(dst.join("file1.txt")).unwrap(), "content1");
        assert_eq!(
            fs::read_to_string(dst.join("subdir/file2.txt")).unwrap(),
            "content2"
        );
        let subdir_meta = fs::metadata(dst.join("subdir")).unwrap();
        assert_eq!(
            FileTime::from_last_modification_time(&subdir_meta),
            FileTime::from_unix_time(1_500_000_000, 0)
        );
    }

    #[test]
    fn test_copy_dir_dereferences_nested_links() {
        let temp_dir = TempDir::new().unwrap();
        let root = utf8_root(&temp_dir);
        let src = root.join("src");
        let dst = root.join("dst");
        let external = root.join("external");

        fs::create_dir_all(&src).unwrap();
        fs::create_dir_all(external.join("conf.d")).unwrap();
        fs::write(src.join("file1.txt"), "content1").unwrap();
        fs::write(external.join("conf.d/app.conf"), "port = 80").unwrap();
        symlink("file1.txt", src.join("alias.txt")).unwrap();
        symlink(external.join("conf.d"), src.join("conf.d")).unwrap();

        copy_dir_recursive(&src, &dst).unwrap();

        assert!(!dst.join("alias.txt").is_symlink());
        assert_eq!(fs::read_to_string(dst.join("alias.txt")).unwrap(), "content1");
        assert!(!dst.join("conf.d").is_symlink());
        assert_eq!(
            fs::read_to_string(dst.join("conf.d/app.conf")).unwrap(),
            "port = 80"
        );

        // The copy does not share storage with the original
        fs::write(external.join("conf.d/app.conf"), "port = 8080").unwrap();
        assert_eq!(
            fs::read_to_string(dst.join("conf.d/app.conf")).unwrap(),
            "port = 80"
        );
    }

    #[test]
    fn test_copy_dir_keeps_dangling_nested_link() {
        let temp_dir = TempDir::new().unwrap();
        let root = utf8_root(&temp_dir);
        let src = root.join("src");
        let dst = root.join("dst");

        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("data.bin"), [1u8, 2, 3]).unwrap();
        symlink("ghost.txt", src.join("broken")).unwrap();

        copy_dir_recursive(&src, &dst).unwrap();

        assert_eq!(fs::read(dst.join("data.bin")).unwrap(), vec![1u8, 2, 3]);
        assert!(dst.join("broken").is_symlink());
        assert_eq!(
            fs::read_link(dst.join("broken")).unwrap(),
            std::path::PathBuf::from("ghost.txt")
        );
    }

    #[test]
    fn test_copy_file_refuses_fifo() {
        let temp_dir = TempDir::new().unwrap();
        let root = utf8_root(&temp_dir);
        let fifo = root.join("pipe");
        let status = std::process::Command::new("mkfifo")
            .arg(fifo.as_str())
            .status()
            .expect("mkfifo should be available");
        assert!(status.success());

        let err = copy_file_with_metadata(&fifo, &root.join("copy")).unwrap_err();

        assert!(matches!(err, Error::Materialize { .. }));
        assert!(!root.join("copy").exists());
    }
}
