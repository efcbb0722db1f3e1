//! Deterministic tar archives for components and packages
//!
//! Every entry is written with mtime 0, uid/gid 0 and sorted paths, so the
//! same inputs always produce byte-identical tarballs.

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Component as PathComponent, Path, PathBuf};
use tar::{Archive, Builder, EntryType, Header};
use walkdir::WalkDir;

use crate::checksums::relative_slash_path;
use crate::error::{CoreError, Result};
use crate::layout::PackagePaths;
use crate::package::{PACKAGE_YAML, PackageDefinition};
use crate::split;

/// Archive one component directory into `components/<name>.tar`
///
/// The directory is removed afterwards. A component with no files produces no
/// tarball and `None` is returned.
pub fn archive_component(paths: &PackagePaths, name: &str) -> Result<Option<PathBuf>> {
    let dir = paths.component(name).base;
    if !dir.exists() {
        return Ok(None);
    }

    let has_files = WalkDir::new(&dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .any(|e| !e.file_type().is_dir());

    let tarball = paths.component_tarball(name);
    if has_files {
        let file = File::create(&tarball).map_err(|e| CoreError::io(&tarball, e))?;
        let mut builder = Builder::new(file);
        append_tree(&mut builder, &dir, Some(name))?;
        builder.into_inner().map_err(|e| CoreError::io(&tarball, e))?;
        tracing::debug!(component = %name, tarball = %tarball.display(), "archived component");
    } else {
        tracing::debug!(component = %name, "component is empty, skipping archive");
    }

    std::fs::remove_dir_all(&dir).map_err(|e| CoreError::io(&dir, e))?;
    Ok(has_files.then_some(tarball))
}

/// Write the whole build directory into a single archive
///
/// Compressed with gzip unless `uncompressed` is set.
pub fn create_package_archive(base: &Path, output: &Path, uncompressed: bool) -> Result<PathBuf> {
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent).map_err(|e| CoreError::io(parent, e))?;
    }
    let file = File::create(output).map_err(|e| CoreError::io(output, e))?;

    if uncompressed {
        let mut builder = Builder::new(file);
        append_tree(&mut builder, base, None)?;
        builder.into_inner().map_err(|e| CoreError::io(output, e))?;
    } else {
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = Builder::new(encoder);
        append_tree(&mut builder, base, None)?;
        let encoder = builder.into_inner().map_err(|e| CoreError::io(output, e))?;
        encoder.finish().map_err(|e| CoreError::io(output, e))?;
    }

    Ok(output.to_path_buf())
}

/// Archive a directory with every entry under `<prefix>/`
pub fn archive_dir(src: &Path, output: &Path, prefix: &str, gzip: bool) -> Result<()> {
    let file = File::create(output).map_err(|e| CoreError::io(output, e))?;
    if gzip {
        let mut builder = Builder::new(GzEncoder::new(file, Compression::default()));
        append_tree(&mut builder, src, Some(prefix))?;
        let encoder = builder.into_inner().map_err(|e| CoreError::io(output, e))?;
        encoder.finish().map_err(|e| CoreError::io(output, e))?;
    } else {
        let mut builder = Builder::new(file);
        append_tree(&mut builder, src, Some(prefix))?;
        builder.into_inner().map_err(|e| CoreError::io(output, e))?;
    }
    Ok(())
}

/// Extract a tar or tar.gz archive into `dest`
pub fn extract_archive(archive_path: &Path, dest: &Path) -> Result<()> {
    extract_stripped(archive_path, dest, 0)
}

/// Extract an archive dropping the first `strip` path components of every entry
pub fn extract_stripped(archive_path: &Path, dest: &Path, strip: usize) -> Result<()> {
    std::fs::create_dir_all(dest).map_err(|e| CoreError::io(dest, e))?;
    let mut archive = open_archive(archive_path)?;

    let entries = archive.entries().map_err(|e| CoreError::io(archive_path, e))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| CoreError::io(archive_path, e))?;
        let path = entry
            .path()
            .map_err(|e| CoreError::io(archive_path, e))?
            .into_owned();

        let stripped: PathBuf = path.components().skip(strip).collect();
        if stripped.as_os_str().is_empty() {
            continue;
        }
        if stripped
            .components()
            .any(|c| !matches!(c, PathComponent::Normal(_)))
        {
            return Err(CoreError::Archive {
                message: format!("refusing to extract unsafe path {}", path.display()),
            });
        }

        let target = dest.join(&stripped);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::io(parent, e))?;
        }
        entry
            .unpack(&target)
            .map_err(|e| CoreError::io(&target, e))?;
    }

    Ok(())
}

/// Extract a single entry (or a subtree) of an archive to `dest`
///
/// Returns an error when nothing in the archive matches `entry_path`.
pub fn extract_entry(archive_path: &Path, entry_path: &str, dest: &Path) -> Result<()> {
    let wanted = entry_path.trim_start_matches("./").trim_end_matches('/');
    let mut archive = open_archive(archive_path)?;
    let mut found = false;

    let entries = archive.entries().map_err(|e| CoreError::io(archive_path, e))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| CoreError::io(archive_path, e))?;
        let path = entry
            .path()
            .map_err(|e| CoreError::io(archive_path, e))?
            .to_string_lossy()
            .trim_start_matches("./")
            .trim_end_matches('/')
            .to_string();

        let target = if path == wanted {
            dest.to_path_buf()
        } else if let Some(rest) = path.strip_prefix(&format!("{}/", wanted)) {
            if Path::new(rest)
                .components()
                .any(|c| !matches!(c, PathComponent::Normal(_)))
            {
                return Err(CoreError::Archive {
                    message: format!("refusing to extract unsafe path {}", path),
                });
            }
            dest.join(rest)
        } else {
            continue;
        };

        let kind = entry.header().entry_type();
        if !(kind.is_file() || kind.is_dir()) {
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::io(parent, e))?;
        }
        entry.unpack(&target).map_err(|e| CoreError::io(&target, e))?;
        found = true;
    }

    if !found {
        return Err(CoreError::Archive {
            message: format!(
                "{} does not contain {}",
                archive_path.display(),
                entry_path
            ),
        });
    }
    Ok(())
}

/// Read a specific file from a tar or tar.gz archive
pub fn read_file_from_archive(archive_path: &Path, file_path: &str) -> Result<Vec<u8>> {
    let mut archive = open_archive(archive_path)?;

    let entries = archive.entries().map_err(|e| CoreError::io(archive_path, e))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| CoreError::io(archive_path, e))?;
        let path = entry
            .path()
            .map_err(|e| CoreError::io(archive_path, e))?
            .to_string_lossy()
            .trim_start_matches("./")
            .to_string();

        if path == file_path {
            let mut content = Vec::new();
            entry
                .read_to_end(&mut content)
                .map_err(|e| CoreError::io(archive_path, e))?;
            return Ok(content);
        }
    }

    Err(CoreError::Archive {
        message: format!("File not found in archive: {}", file_path),
    })
}

/// Read the package definition from an archive without extracting it
///
/// Split archives are addressed through their `.part000` metadata file.
pub fn read_package_definition(archive_path: &Path) -> Result<PackageDefinition> {
    if split::is_split_metadata(archive_path) {
        let tmp = tempfile::Builder::new()
            .prefix("airpack-inspect-")
            .tempdir()
            .map_err(CoreError::Io)?;
        let joined = split::reassemble(archive_path, tmp.path())?;
        return read_package_definition(&joined);
    }

    let content = read_file_from_archive(archive_path, PACKAGE_YAML)?;
    let text = String::from_utf8(content).map_err(|e| CoreError::Archive {
        message: format!("Invalid UTF-8 in {}: {}", PACKAGE_YAML, e),
    })?;
    PackageDefinition::parse(&text)
}

/// Information about a file in an archive
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub path: String,
    pub size: u64,
    pub is_dir: bool,
}

/// List entries of a tar or tar.gz archive
pub fn list_archive(archive_path: &Path) -> Result<Vec<ArchiveEntry>> {
    let mut archive = open_archive(archive_path)?;
    let mut entries = Vec::new();

    for entry in archive.entries().map_err(|e| CoreError::io(archive_path, e))? {
        let entry = entry.map_err(|e| CoreError::io(archive_path, e))?;
        let path = entry
            .path()
            .map_err(|e| CoreError::io(archive_path, e))?
            .to_string_lossy()
            .to_string();
        let size = entry.header().size().map_err(|e| CoreError::io(archive_path, e))?;
        let is_dir = entry.header().entry_type().is_dir();
        entries.push(ArchiveEntry { path, size, is_dir });
    }

    Ok(entries)
}

/// File name of the package archive
///
/// `airpack-package-<name>-<arch>[-<version>].tar.gz`, with a
/// `-<base>-differential-<version>` suffix for differential builds and the
/// `airpack-init-<arch>-<version>` form for init packages.
pub fn archive_name(pkg: &PackageDefinition) -> String {
    let arch = pkg.architecture();
    let suffix = if pkg.metadata.uncompressed {
        "tar"
    } else {
        "tar.gz"
    };

    if pkg.is_init() {
        return format!("airpack-init-{}-{}.{}", arch, pkg.metadata.version, suffix);
    }

    let mut name = format!("airpack-package-{}-{}", pkg.metadata.name, arch);
    if pkg.build.differential {
        name.push_str(&format!(
            "-{}-differential-{}",
            pkg.build.differential_package_version, pkg.metadata.version
        ));
    } else if !pkg.metadata.version.is_empty() {
        name.push('-');
        name.push_str(&pkg.metadata.version);
    }
    format!("{}.{}", name, suffix)
}

fn open_archive(archive_path: &Path) -> Result<Archive<Box<dyn Read>>> {
    let mut file = File::open(archive_path).map_err(|e| CoreError::io(archive_path, e))?;
    let mut magic = [0u8; 2];
    let read = file
        .read(&mut magic)
        .map_err(|e| CoreError::io(archive_path, e))?;
    file.seek(SeekFrom::Start(0))
        .map_err(|e| CoreError::io(archive_path, e))?;

    let reader: Box<dyn Read> = if read == 2 && magic == [0x1f, 0x8b] {
        Box::new(GzDecoder::new(BufReader::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };
    Ok(Archive::new(reader))
}

/// Append a directory tree in sorted order with normalized headers
fn append_tree<W: Write>(builder: &mut Builder<W>, root: &Path, prefix: Option<&str>) -> Result<()> {
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .min_depth(if prefix.is_some() { 0 } else { 1 });

    for entry in walker {
        let entry = entry.map_err(|e| CoreError::Archive {
            message: format!("failed to walk {}: {}", root.display(), e),
        })?;

        let rel = relative_slash_path(root, entry.path());
        let name = match (prefix, rel.is_empty()) {
            (Some(p), true) => format!("{}/", p),
            (Some(p), false) => format!("{}/{}", p, rel),
            (None, _) => rel,
        };

        let file_type = entry.file_type();
        let meta = entry
            .metadata()
            .map_err(|e| CoreError::Archive {
                message: format!("failed to stat {}: {}", entry.path().display(), e),
            })?;

        let mut header = Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mode(file_mode(&meta));

        if file_type.is_dir() {
            header.set_entry_type(EntryType::Directory);
            header.set_size(0);
            header.set_cksum();
            let dir_name = if name.ends_with('/') {
                name
            } else {
                format!("{}/", name)
            };
            builder
                .append_data(&mut header, &dir_name, std::io::empty())
                .map_err(|e| CoreError::io(entry.path(), e))?;
        } else if file_type.is_symlink() {
            let target =
                std::fs::read_link(entry.path()).map_err(|e| CoreError::io(entry.path(), e))?;
            header.set_entry_type(EntryType::Symlink);
            header.set_size(0);
            builder
                .append_link(&mut header, &name, &target)
                .map_err(|e| CoreError::io(entry.path(), e))?;
        } else {
            let file = File::open(entry.path()).map_err(|e| CoreError::io(entry.path(), e))?;
            header.set_entry_type(EntryType::Regular);
            header.set_size(meta.len());
            header.set_cksum();
            builder
                .append_data(&mut header, &name, BufReader::new(file))
                .map_err(|e| CoreError::io(entry.path(), e))?;
        }
    }

    Ok(())
}

#[cfg(unix)]
fn file_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(meta: &std::fs::Metadata) -> u32 {
    if meta.is_dir() { 0o755 } else { 0o644 }
}
