// Packed archive (.tgz) inspection and extraction

use flate2::read::GzDecoder;
use serde::Deserialize;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

use crate::manifest::MANIFEST_FILE;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("No package.json found in {}", .0.display())]
    ManifestNotFound(PathBuf),

    #[error("Failed to parse package.json in {}: {message}", .path.display())]
    ManifestParseError { path: PathBuf, message: String },

    #[error("Unsafe path in archive entry: {0}")]
    UnsafeEntry(String),

    #[error("Failed to read archive {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Deserialize)]
struct DeclaredName {
    name: String,
}

fn open_archive(path: &Path) -> Result<tar::Archive<GzDecoder<BufReader<File>>>, ArchiveError> {
    let file = File::open(path).map_err(|source| io_error(path, source))?;
    Ok(tar::Archive::new(GzDecoder::new(BufReader::new(file))))
}

fn io_error(path: &Path, source: std::io::Error) -> ArchiveError {
    ArchiveError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Read the package name declared by the manifest embedded in an archive.
///
/// Streams entries until `<wrapper>/package.json` shows up; nothing else is
/// decompressed to disk.
pub fn read_declared_name(archive_path: &Path) -> Result<String, ArchiveError> {
    let mut archive = open_archive(archive_path)?;
    let entries = archive
        .entries()
        .map_err(|source| io_error(archive_path, source))?;

    for entry in entries {
        let mut entry = entry.map_err(|source| io_error(archive_path, source))?;
        let entry_path = entry
            .path()
            .map_err(|source| io_error(archive_path, source))?
            .into_owned();

        if !is_wrapped_manifest(&entry_path) {
            continue;
        }

        let mut content = String::new();
        entry
            .read_to_string(&mut content)
            .map_err(|e| ArchiveError::ManifestParseError {
                path: archive_path.to_path_buf(),
                message: e.to_string(),
            })?;

        let declared: DeclaredName =
            serde_json::from_str(&content).map_err(|e| ArchiveError::ManifestParseError {
                path: archive_path.to_path_buf(),
                message: e.to_string(),
            })?;

        return Ok(declared.name);
    }

    Err(ArchiveError::ManifestNotFound(archive_path.to_path_buf()))
}

/// `package/package.json`, i.e. the manifest directly under the single wrapper directory
fn is_wrapped_manifest(path: &Path) -> bool {
    let parts: Vec<_> = path
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect();

    matches!(parts.as_slice(), [Component::Normal(_), Component::Normal(file)] if *file == MANIFEST_FILE)
}

/// Extract an archive into `dest`, dropping its top-level wrapper directory.
///
/// Hard links, symlinks pointing outside `dest` and entries that would be
/// written through a symlink are refused. Returns the number of entries written.
pub fn extract_stripped(archive_path: &Path, dest: &Path) -> Result<usize, ArchiveError> {
    fs::create_dir_all(dest).map_err(|source| io_error(dest, source))?;

    let mut archive = open_archive(archive_path)?;
    let entries = archive
        .entries()
        .map_err(|source| io_error(archive_path, source))?;

    let mut written = 0;
    for entry in entries {
        let mut entry = entry.map_err(|source| io_error(archive_path, source))?;
        let entry_path = entry
            .path()
            .map_err(|source| io_error(archive_path, source))?
            .into_owned();

        let Some(relative) = strip_wrapper(&entry_path)? else {
            continue;
        };

        match entry.header().entry_type() {
            tar::EntryType::Link => {
                return Err(ArchiveError::UnsafeEntry(format!(
                    "{} (hard link)",
                    entry_path.display()
                )));
            }
            tar::EntryType::Symlink => {
                let link = entry
                    .link_name()
                    .map_err(|source| io_error(archive_path, source))?
                    .map(|l| l.into_owned())
                    .unwrap_or_default();
                if !link_stays_inside(&relative, &link) {
                    return Err(ArchiveError::UnsafeEntry(format!(
                        "{} -> {}",
                        entry_path.display(),
                        link.display()
                    )));
                }
            }
            _ => {}
        }

        ensure_no_symlink_ancestors(dest, &relative)?;

        let target = dest.join(&relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|source| io_error(parent, source))?;
        }
        entry
            .unpack(&target)
            .map_err(|source| io_error(&target, source))?;
        written += 1;
    }

    Ok(written)
}

/// Whether a symlink at `relative` (inside the extraction root) resolving to
/// `link` stays inside that root
fn link_stays_inside(relative: &Path, link: &Path) -> bool {
    let mut depth = relative.components().count().saturating_sub(1);

    for component in link.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return false;
                }
                depth -= 1;
            }
            Component::Prefix(_) | Component::RootDir => return false,
        }
    }

    !link.as_os_str().is_empty()
}

/// Refuse to write below a symlink that already exists under `dest`
fn ensure_no_symlink_ancestors(dest: &Path, relative: &Path) -> Result<(), ArchiveError> {
    let mut current = dest.to_path_buf();
    let Some(parent) = relative.parent() else {
        return Ok(());
    };

    for component in parent.components() {
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(ArchiveError::UnsafeEntry(format!(
                    "{} is written through the symlink {}",
                    relative.display(),
                    current.display()
                )));
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }

    Ok(())
}

/// Drop the first path component; None for the wrapper directory itself
fn strip_wrapper(path: &Path) -> Result<Option<PathBuf>, ArchiveError> {
    let mut out = PathBuf::new();
    let mut seen_wrapper = false;

    for component in path.components() {
        match component {
            Component::Normal(segment) => {
                if seen_wrapper {
                    out.push(segment);
                } else {
                    seen_wrapper = true;
                }
            }
            Component::CurDir => {}
            Component::Prefix(_) | Component::RootDir | Component::ParentDir => {
                return Err(ArchiveError::UnsafeEntry(path.display().to_string()));
            }
        }
    }

    if out.as_os_str().is_empty() {
        Ok(None)
    } else {
        Ok(Some(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn write_archive(path: &Path, files: &[(&str, &str)]) {
        let file = File::create(path).unwrap();
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, content.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn test_read_declared_name() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("demo-core-1.0.0.tgz");
        write_archive(
            &archive,
            &[
                ("package/lib/index.js", "module.exports = 1;"),
                ("package/node_modules/dep/package.json", r#"{"name":"dep"}"#),
                ("package/package.json", r#"{"name":"@demo/core","version":"1.0.0"}"#),
            ],
        );

        assert_eq!(read_declared_name(&archive).unwrap(), "@demo/core");
    }

    #[test]
    fn test_manifest_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("empty.tgz");
        write_archive(&archive, &[("package/README.md", "hi")]);

        assert!(matches!(
            read_declared_name(&archive),
            Err(ArchiveError::ManifestNotFound(_))
        ));
    }

    #[test]
    fn test_manifest_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("bad.tgz");
        write_archive(&archive, &[("package/package.json", "{ not json")]);

        assert!(matches!(
            read_declared_name(&archive),
            Err(ArchiveError::ManifestParseError { .. })
        ));
    }

    #[test]
    fn test_extract_strips_wrapper() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("pkg.tgz");
        write_archive(
            &archive,
            &[
                ("package/package.json", r#"{"name":"x","version":"1.0.0"}"#),
                ("package/dist/index.js", "export {}"),
            ],
        );

        let dest = dir.path().join("out").join("x");
        let written = extract_stripped(&archive, &dest).unwrap();

        assert_eq!(written, 2);
        assert!(dest.join("package.json").is_file());
        assert!(dest.join("dist").join("index.js").is_file());
        assert!(!dest.join("package").exists());
    }

    fn write_archive_with_link(path: &Path, link_path: &str, link_target: &str, then: &str) {
        let file = File::create(path).unwrap();
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));

        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        header.set_mode(0o777);
        header.set_link_name(link_target).unwrap();
        header.set_cksum();
        builder
            .append_data(&mut header, link_path, std::io::empty())
            .unwrap();

        let mut header = tar::Header::new_gnu();
        header.set_size(5);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, then, "pwned".as_bytes()).unwrap();

        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn test_extract_refuses_symlink_out_of_dest() {
        let dir = tempfile::tempdir().unwrap();
        let outside = dir.path().join("outside");
        fs::create_dir_all(&outside).unwrap();

        let archive = dir.path().join("evil.tgz");
        write_archive_with_link(
            &archive,
            "package/evil",
            outside.to_str().unwrap(),
            "package/evil/pwned.txt",
        );

        let dest = dir.path().join("out");
        assert!(matches!(
            extract_stripped(&archive, &dest),
            Err(ArchiveError::UnsafeEntry(_))
        ));
        assert!(!outside.join("pwned.txt").exists());
    }

    #[test]
    fn test_extract_refuses_relative_symlink_escape() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("evil.tgz");
        write_archive_with_link(&archive, "package/lib/up", "../../..", "package/lib/up/pwned.txt");

        let dest = dir.path().join("out").join("pkg");
        assert!(matches!(
            extract_stripped(&archive, &dest),
            Err(ArchiveError::UnsafeEntry(_))
        ));
        assert!(!dir.path().join("pwned.txt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_extract_refuses_writing_through_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("inside.tgz");
        // The link itself stays inside, but the next entry writes through it
        write_archive_with_link(&archive, "package/bin", "lib", "package/bin/tool.js");

        let dest = dir.path().join("out");
        assert!(matches!(
            extract_stripped(&archive, &dest),
            Err(ArchiveError::UnsafeEntry(_))
        ));
        assert!(!dest.join("lib").join("tool.js").exists());
    }

    #[test]
    fn test_link_stays_inside() {
        assert!(link_stays_inside(Path::new("bin/cli"), Path::new("../lib/cli.js")));
        assert!(link_stays_inside(Path::new("cli"), Path::new("lib/cli.js")));
        assert!(!link_stays_inside(Path::new("cli"), Path::new("../outside")));
        assert!(!link_stays_inside(Path::new("a/b"), Path::new("../../x")));
        assert!(!link_stays_inside(Path::new("a"), Path::new("/etc/passwd")));
    }

    #[test]
    fn test_strip_wrapper_rejects_parent_dirs() {
        assert!(strip_wrapper(Path::new("package/../../etc/passwd")).is_err());
        assert_eq!(strip_wrapper(Path::new("package/")).unwrap(), None);
        assert_eq!(
            strip_wrapper(Path::new("package/a/b.js")).unwrap(),
            Some(PathBuf::from("a/b.js"))
        );
    }
}
