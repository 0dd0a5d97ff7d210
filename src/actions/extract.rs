//! Archive extraction with leading-directory stripping.
//!
//! Entries that would escape the destination (absolute paths, `..`) are
//! rejected rather than silently skipped.

use crate::core::error::{Error, Result};
use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Tar,
    TarGz,
    TarBz2,
    TarZst,
    Zip,
}

impl ArchiveFormat {
    /// Parse an explicit `format` param. `auto` defers to the file name.
    pub fn parse(format: &str, file_name: &str) -> Result<Self> {
        match format {
            "" | "auto" => Self::detect(file_name).ok_or_else(|| {
                Error::action("extract", format!("cannot detect archive format of {}", file_name))
            }),
            "tar" => Ok(Self::Tar),
            "tar.gz" | "tgz" => Ok(Self::TarGz),
            "tar.bz2" | "tbz2" | "tbz" => Ok(Self::TarBz2),
            "tar.zst" | "tzst" => Ok(Self::TarZst),
            "zip" => Ok(Self::Zip),
            other => Err(Error::action(
                "extract",
                format!("unsupported archive format: {}", other),
            )),
        }
    }

    pub fn detect(file_name: &str) -> Option<Self> {
        let name = file_name.to_ascii_lowercase();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(Self::TarGz)
        } else if name.ends_with(".tar.bz2") || name.ends_with(".tbz2") || name.ends_with(".tbz") {
            Some(Self::TarBz2)
        } else if name.ends_with(".tar.zst") || name.ends_with(".tzst") {
            Some(Self::TarZst)
        } else if name.ends_with(".tar") {
            Some(Self::Tar)
        } else if name.ends_with(".zip") {
            Some(Self::Zip)
        } else {
            None
        }
    }
}

/// Extract `archive` into `dest`, dropping `strip_dirs` leading path
/// components from every entry. Returns the number of entries written.
pub fn extract_archive(
    archive: &Path,
    dest: &Path,
    format: ArchiveFormat,
    strip_dirs: usize,
) -> Result<usize> {
    std::fs::create_dir_all(dest).map_err(|e| Error::io(dest, e))?;
    let file = File::open(archive).map_err(|e| Error::io(archive, e))?;

    match format {
        ArchiveFormat::Tar => unpack_tar(file, archive, dest, strip_dirs),
        ArchiveFormat::TarGz => unpack_tar(
            flate2::read::GzDecoder::new(file),
            archive,
            dest,
            strip_dirs,
        ),
        ArchiveFormat::TarBz2 => unpack_tar(
            bzip2::read::BzDecoder::new(file),
            archive,
            dest,
            strip_dirs,
        ),
        ArchiveFormat::TarZst => {
            let decoder = zstd::stream::read::Decoder::new(file).map_err(|e| Error::io(archive, e))?;
            unpack_tar(decoder, archive, dest, strip_dirs)
        }
        ArchiveFormat::Zip => unpack_zip(file, archive, dest, strip_dirs),
    }
}

fn unpack_tar<R: Read>(reader: R, archive: &Path, dest: &Path, strip: usize) -> Result<usize> {
    let mut tar = tar::Archive::new(reader);
    tar.set_preserve_permissions(true);

    let mut written = 0;
    for entry in tar.entries().map_err(|e| Error::io(archive, e))? {
        let mut entry = entry.map_err(|e| Error::io(archive, e))?;
        let path = entry.path().map_err(|e| Error::io(archive, e))?.into_owned();
        let Some(rel) = stripped_relative(&path, strip)? else {
            continue;
        };
        let target = dest.join(rel);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        entry.unpack(&target).map_err(|e| Error::io(&target, e))?;
        written += 1;
    }
    Ok(written)
}

fn unpack_zip(file: File, archive: &Path, dest: &Path, strip: usize) -> Result<usize> {
    let mut zip = zip::ZipArchive::new(file)
        .map_err(|e| Error::action("extract", format!("{}: {}", archive.display(), e)))?;

    let mut written = 0;
    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|e| Error::action("extract", format!("{}: {}", archive.display(), e)))?;
        let name = entry.enclosed_name().ok_or_else(|| {
            Error::action("extract", format!("unsafe path in archive: {}", entry.name()))
        })?;
        let Some(rel) = stripped_relative(&name, strip)? else {
            continue;
        };
        let target = dest.join(rel);

        if entry.is_dir() {
            std::fs::create_dir_all(&target).map_err(|e| Error::io(&target, e))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        let mut out = File::create(&target).map_err(|e| Error::io(&target, e))?;
        std::io::copy(&mut entry, &mut out).map_err(|e| Error::io(&target, e))?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode))
                .map_err(|e| Error::io(&target, e))?;
        }
        written += 1;
    }
    Ok(written)
}

/// Relative path after dropping `strip` leading components. `None` when
/// nothing is left (the stripped directories themselves).
fn stripped_relative(path: &Path, strip: usize) -> Result<Option<PathBuf>> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::CurDir => {}
            _ => {
                return Err(Error::action(
                    "extract",
                    format!("unsafe path in archive: {}", path.display()),
                ))
            }
        }
    }
    if parts.len() <= strip {
        return Ok(None);
    }
    Ok(Some(parts[strip..].iter().collect()))
}
