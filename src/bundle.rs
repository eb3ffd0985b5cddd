//! Contains format detection and extraction of XAPK / APKS / APKM bundles.
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Seek};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use zip::ZipArchive;
use crate::error::{InstallError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageFormat {
    Apk,
    Xapk,
    Apks,
    Apkm,
    Unknown,
}

impl PackageFormat {
    pub fn detect(path: &Path) -> Self {
        let lower = path.to_string_lossy().to_lowercase();
        if lower.ends_with(".apk") {
            PackageFormat::Apk
        } else if lower.ends_with(".xapk") {
            PackageFormat::Xapk
        } else if lower.ends_with(".apks") {
            PackageFormat::Apks
        } else if lower.ends_with(".apkm") {
            PackageFormat::Apkm
        } else {
            PackageFormat::Unknown
        }
    }

    pub fn is_bundle(self) -> bool {
        matches!(self, PackageFormat::Xapk | PackageFormat::Apks | PackageFormat::Apkm)
    }

    pub fn description(self) -> &'static str {
        match self {
            PackageFormat::Apk => "APK (Standard Installation Package)",
            PackageFormat::Xapk => "XAPK (APKPure Format)",
            PackageFormat::Apks => "APKS (App Bundle)",
            PackageFormat::Apkm => "APKM (APKMirror Format)",
            PackageFormat::Unknown => "Unknown Format",
        }
    }
}

/// One APK extracted from a bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleEntry {
    /// Base file name, as passed to `pm install-write`
    pub name: String,
    pub size: u64,
    pub path: PathBuf,
}

/// APKs extracted into a private temporary directory. The files and the
/// directory are removed by [`ExtractedBundle::cleanup`] or on drop.
#[derive(Debug)]
pub struct ExtractedBundle {
    dir: PathBuf,
    entries: Vec<BundleEntry>,
    cleaned: bool,
}

impl ExtractedBundle {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn entries(&self) -> &[BundleEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Best-effort removal of every extracted file, then of the directory.
    pub fn cleanup(&mut self) {
        if self.cleaned {
            return;
        }
        self.cleaned = true;
        for entry in &self.entries {
            if let Err(e) = fs::remove_file(&entry.path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("could not remove {}: {}", entry.path.display(), e);
                }
            }
        }
        match fs::remove_dir(&self.dir) {
            Ok(()) => debug!("removed {}", self.dir.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("could not remove {}: {}", self.dir.display(), e),
        }
    }
}

impl Drop for ExtractedBundle {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn is_apk_entry(name: &str) -> bool {
    name.to_lowercase().ends_with(".apk")
}

/// Last path component of a ZIP entry name.
fn base_name(entry_name: &str) -> Option<&str> {
    entry_name.rsplit(['/', '\\']).find(|part| !part.is_empty())
}

fn open_archive(bundle: &Path) -> Result<ZipArchive<BufReader<File>>> {
    let file = File::open(bundle).map_err(|e| InstallError::io(format!("failed to open {}", bundle.display()), e))?;
    ZipArchive::new(BufReader::new(file)).map_err(|source| InstallError::Zip { path: bundle.to_path_buf(), source })
}

/// File entry names in archive order; `ZipArchive::file_names` has no
/// defined order.
pub(crate) fn file_names_in_order<R: Read + Seek>(archive: &mut ZipArchive<R>, path: &Path) -> Result<Vec<String>> {
    let mut names = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let entry = archive
            .by_index(i)
            .map_err(|source| InstallError::Zip { path: path.to_path_buf(), source })?;
        if !entry.is_dir() {
            names.push(entry.name().to_string());
        }
    }
    Ok(names)
}

/// Creates `<cache_dir>/xapk_temp_<unix-ms>`, adding a numeric suffix when
/// that name is already taken.
fn create_extract_dir(cache_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(cache_dir)
        .map_err(|e| InstallError::io(format!("failed to create {}", cache_dir.display()), e))?;
    let stamp = chrono::Utc::now().timestamp_millis();
    let mut attempt = 0u32;
    loop {
        let name = match attempt {
            0 => format!("xapk_temp_{}", stamp),
            n => format!("xapk_temp_{}_{}", stamp, n),
        };
        let dir = cache_dir.join(name);
        match fs::create_dir(&dir) {
            Ok(()) => return Ok(dir),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => attempt += 1,
            Err(e) => return Err(InstallError::io(format!("failed to create {}", dir.display()), e)),
        }
    }
}

/// Extracts every `.apk` entry of `bundle` into a fresh directory under
/// `cache_dir`, in archive order. Other entries are skipped.
pub fn extract(bundle: &Path, cache_dir: &Path) -> Result<ExtractedBundle> {
    let mut archive = open_archive(bundle)?;
    let dir = create_extract_dir(cache_dir)?;
    debug!("extracting {} into {}", bundle.display(), dir.display());
    let mut extracted = ExtractedBundle { dir, entries: Vec::new(), cleaned: false };
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|source| InstallError::Zip { path: bundle.to_path_buf(), source })?;
        if entry.is_dir() || !is_apk_entry(entry.name()) {
            continue;
        }
        let Some(name) = base_name(entry.name()).map(str::to_string) else {
            continue;
        };
        let dest = extracted.dir.join(&name);
        let mut out = File::create(&dest).map_err(|e| InstallError::io(format!("failed to create {}", dest.display()), e))?;
        let size = match io::copy(&mut entry, &mut out) {
            Ok(size) => size,
            Err(e) => {
                // Not in `entries` yet, so cleanup on drop would miss it.
                drop(out);
                if let Err(rm) = fs::remove_file(&dest) {
                    warn!("could not remove {}: {}", dest.display(), rm);
                }
                return Err(InstallError::io(format!("failed to extract {}", name), e));
            }
        };
        debug!("extracted {} ({} bytes)", name, size);
        match extracted.entries.iter().position(|e| e.name == name) {
            Some(i) => {
                warn!("{} appears more than once in {}, later copy wins", name, bundle.display());
                extracted.entries[i].size = size;
            }
            None => extracted.entries.push(BundleEntry { name, size, path: dest }),
        }
    }
    if extracted.is_empty() {
        return Err(InstallError::EmptyBundle(bundle.to_path_buf()));
    }
    Ok(extracted)
}

/// Base names of the `.apk` entries in `bundle`, without extracting anything.
/// Duplicates collapse onto the first occurrence, as [`extract`] does.
pub fn apk_entry_names(bundle: &Path) -> Result<Vec<String>> {
    let mut archive = open_archive(bundle)?;
    let mut names: Vec<String> = Vec::new();
    for entry_name in file_names_in_order(&mut archive, bundle)? {
        if !is_apk_entry(&entry_name) {
            continue;
        }
        if let Some(name) = base_name(&entry_name) {
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
    }
    Ok(names)
}

pub fn count_apks(bundle: &Path) -> Result<usize> {
    Ok(apk_entry_names(bundle)?.len())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::FileOptions;

    pub(crate) fn write_bundle(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let opts = FileOptions::default();
        for (name, data) in entries {
            zip.start_file(*name, opts).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }

    fn temp_dirs(cache: &Path) -> Vec<PathBuf> {
        fs::read_dir(cache)
            .map(|rd| rd.filter_map(|e| e.ok()).map(|e| e.path()).collect())
            .unwrap_or_default()
    }

    #[test]
    fn detects_formats_case_insensitively() {
        assert_eq!(PackageFormat::detect(Path::new("/sdcard/App.XAPK")), PackageFormat::Xapk);
        assert_eq!(PackageFormat::detect(Path::new("a.apks")), PackageFormat::Apks);
        assert_eq!(PackageFormat::detect(Path::new("a.apkm")), PackageFormat::Apkm);
        assert_eq!(PackageFormat::detect(Path::new("a.apk")), PackageFormat::Apk);
        assert_eq!(PackageFormat::detect(Path::new("a.zip")), PackageFormat::Unknown);
        assert!(PackageFormat::Apkm.is_bundle());
        assert!(!PackageFormat::Apk.is_bundle());
    }

    #[test]
    fn extracts_only_apks_in_archive_order() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("app.xapk");
        write_bundle(
            &bundle,
            &[
                ("icon.png", b"png"),
                ("base.apk", b"base-bytes"),
                ("manifest.json", b"{}"),
                ("config/split_config.arm64_v8a.apk", b"abi"),
                ("Android/obb/x.obb", b"obb"),
                ("SPLIT_CONFIG.EN.APK", b"locale"),
            ],
        );
        let cache = dir.path().join("cache");
        let extracted = extract(&bundle, &cache).unwrap();
        let names: Vec<_> = extracted.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["base.apk", "split_config.arm64_v8a.apk", "SPLIT_CONFIG.EN.APK"]);
        assert_eq!(extracted.entries()[0].size, 10);
        assert_eq!(fs::read(&extracted.entries()[1].path).unwrap(), b"abi");
        assert!(extracted.dir().file_name().unwrap().to_string_lossy().starts_with("xapk_temp_"));
        assert_eq!(count_apks(&bundle).unwrap(), 3);
    }

    #[test]
    fn duplicate_base_names_keep_the_later_copy() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("dup.xapk");
        write_bundle(&bundle, &[("a/base.apk", b"first"), ("split.apk", b"s"), ("b/base.apk", b"second!")]);
        let extracted = extract(&bundle, &dir.path().join("cache")).unwrap();
        assert_eq!(extracted.len(), 2);
        assert_eq!(extracted.entries()[0].name, "base.apk");
        assert_eq!(extracted.entries()[0].size, 7);
        assert_eq!(fs::read(&extracted.entries()[0].path).unwrap(), b"second!");
    }

    #[test]
    fn bundle_without_apks_fails_and_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("empty.apks");
        write_bundle(&bundle, &[("icon.png", b"png"), ("manifest.json", b"{}")]);
        let cache = dir.path().join("cache");
        let err = extract(&bundle, &cache).unwrap_err();
        assert!(matches!(err, InstallError::EmptyBundle(_)));
        assert!(temp_dirs(&cache).is_empty());
        assert_eq!(count_apks(&bundle).unwrap(), 0);
    }

    #[test]
    fn repeated_extraction_uses_separate_directories() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("app.apkm");
        write_bundle(&bundle, &[("base.apk", b"1")]);
        let cache = dir.path().join("cache");
        let first = extract(&bundle, &cache).unwrap();
        let second = extract(&bundle, &cache).unwrap();
        assert_ne!(first.dir(), second.dir());
        assert_eq!(temp_dirs(&cache).len(), 2);
        assert!(first.entries()[0].path.exists());
        assert!(second.entries()[0].path.exists());
    }

    #[test]
    fn cleanup_removes_files_and_directory() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("app.xapk");
        write_bundle(&bundle, &[("base.apk", b"1"), ("split.apk", b"2")]);
        let cache = dir.path().join("cache");
        let mut extracted = extract(&bundle, &cache).unwrap();
        let extract_dir = extracted.dir().to_path_buf();
        extracted.cleanup();
        assert!(!extract_dir.exists());
        drop(extracted);
        assert!(temp_dirs(&cache).is_empty());
    }

    #[test]
    fn drop_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("app.xapk");
        write_bundle(&bundle, &[("base.apk", b"1")]);
        let cache = dir.path().join("cache");
        {
            let _extracted = extract(&bundle, &cache).unwrap();
            assert_eq!(temp_dirs(&cache).len(), 1);
        }
        assert!(temp_dirs(&cache).is_empty());
    }

    #[test]
    fn corrupted_entry_leaves_no_partial_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("corrupt.xapk");
        let payload: &[u8] = b"SPLIT-PAYLOAD-BYTES";
        {
            let file = File::create(&bundle).unwrap();
            let mut zip = zip::ZipWriter::new(file);
            let opts = FileOptions::default().compression_method(zip::CompressionMethod::Stored);
            zip.start_file("base.apk", opts).unwrap();
            zip.write_all(b"base-bytes").unwrap();
            zip.start_file("split.apk", opts).unwrap();
            zip.write_all(payload).unwrap();
            zip.finish().unwrap();
        }
        let mut raw = fs::read(&bundle).unwrap();
        let at = raw.windows(payload.len()).position(|w| w == payload).unwrap();
        raw[at + 3] ^= 0xFF;
        fs::write(&bundle, raw).unwrap();

        let cache = dir.path().join("cache");
        assert!(extract(&bundle, &cache).is_err());
        assert!(temp_dirs(&cache).is_empty());
    }

    #[test]
    fn entry_count_matches_what_extraction_produces() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("dup.apks");
        write_bundle(
            &bundle,
            &[("a/base.apk", b"first"), ("splits/", b""), ("split.apk", b"s"), ("b/base.apk", b"second")],
        );
        assert_eq!(apk_entry_names(&bundle).unwrap(), ["base.apk", "split.apk"]);
        let extracted = extract(&bundle, &dir.path().join("cache")).unwrap();
        assert_eq!(count_apks(&bundle).unwrap(), extracted.len());
    }

    #[test]
    fn not_a_zip_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("broken.xapk");
        fs::write(&bundle, b"not a zip").unwrap();
        assert!(matches!(extract(&bundle, dir.path()), Err(InstallError::Zip { .. })));
    }
}
