//! Contains local inspection of APK and bundle files for the `info` command.
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use colored::*;
use md5::Md5;
use serde::Deserialize;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tracing::warn;
use zip::ZipArchive;
use crate::axml::{self, ManifestInfo};
use crate::bundle::{self, PackageFormat};
use crate::error::{InstallError, Result};
use crate::pkcs7;

/// Metadata from the `manifest.json` an XAPK carries at its root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct XapkManifest {
    #[serde(default)]
    pub package_name: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "text_or_number")]
    pub version_name: Option<String>,
    #[serde(default, deserialize_with = "text_or_number")]
    pub version_code: Option<String>,
    #[serde(default, deserialize_with = "text_or_number")]
    pub min_sdk_version: Option<String>,
}

fn text_or_number<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Fingerprints of a signing certificate's DER encoding, in upper hex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateFingerprints {
    pub md5: String,
    pub sha1: String,
    pub sha256: String,
}

impl CertificateFingerprints {
    pub fn of(der: &[u8]) -> Self {
        Self {
            md5: hex::encode_upper(Md5::digest(der)),
            sha1: hex::encode_upper(Sha1::digest(der)),
            sha256: hex::encode_upper(Sha256::digest(der)),
        }
    }
}

/// A v1 (JAR) signature block found under `META-INF/`. `certificate` is
/// `None` when the block could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureBlock {
    pub name: String,
    pub certificate: Option<CertificateFingerprints>,
}

#[derive(Debug, Clone)]
pub struct ApkInfo {
    pub path: PathBuf,
    pub format: PackageFormat,
    pub size: u64,
    pub md5: String,
    pub sha256: String,
    pub apk_entries: Vec<String>,
    pub manifest: Option<XapkManifest>,
    /// Identity read from a plain APK's compiled `AndroidManifest.xml`
    pub package: Option<ManifestInfo>,
    pub signatures: Vec<SignatureBlock>,
}

/// Whole-file digests, computed in one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigests {
    pub md5: String,
    pub sha256: String,
}

pub fn format_size(size: u64) -> String {
    const KB: f64 = 1024.0;
    let bytes = size as f64;
    if bytes < KB {
        format!("{} B", size)
    } else if bytes < KB * KB {
        format!("{:.2} KB", bytes / KB)
    } else if bytes < KB * KB * KB {
        format!("{:.2} MB", bytes / (KB * KB))
    } else {
        format!("{:.2} GB", bytes / (KB * KB * KB))
    }
}

fn digest_reader<R: Read>(mut reader: R) -> std::io::Result<FileDigests> {
    let mut md5 = Md5::new();
    let mut sha256 = Sha256::new();
    let mut buf = [0u8; 8 * 1024];
    loop {
        let read = reader.read(&mut buf)?;
        if read == 0 {
            break;
        }
        md5.update(&buf[..read]);
        sha256.update(&buf[..read]);
    }
    Ok(FileDigests { md5: hex::encode_upper(md5.finalize()), sha256: hex::encode_upper(sha256.finalize()) })
}

pub fn digest_file(path: &Path) -> Result<FileDigests> {
    let file = File::open(path).map_err(|e| InstallError::io(format!("failed to open {}", path.display()), e))?;
    digest_reader(file).map_err(|e| InstallError::io(format!("failed to hash {}", path.display()), e))
}

fn open_zip(path: &Path) -> Result<ZipArchive<BufReader<File>>> {
    let file = File::open(path).map_err(|e| InstallError::io(format!("failed to open {}", path.display()), e))?;
    ZipArchive::new(BufReader::new(file)).map_err(|source| InstallError::Zip { path: path.to_path_buf(), source })
}

fn is_signature_block(name: &str) -> bool {
    let upper = name.to_uppercase();
    upper.starts_with("META-INF/") && (upper.ends_with(".RSA") || upper.ends_with(".DSA") || upper.ends_with(".EC"))
}

pub fn signature_blocks(apk: &Path) -> Result<Vec<SignatureBlock>> {
    let mut archive = open_zip(apk)?;
    let names: Vec<String> = bundle::file_names_in_order(&mut archive, apk)?
        .into_iter()
        .filter(|n| is_signature_block(n))
        .collect();
    let mut blocks = Vec::with_capacity(names.len());
    for name in names {
        let mut entry = archive
            .by_name(&name)
            .map_err(|source| InstallError::Zip { path: apk.to_path_buf(), source })?;
        let mut block = Vec::new();
        entry
            .read_to_end(&mut block)
            .map_err(|e| InstallError::io(format!("failed to read {}", name), e))?;
        let certificate = match pkcs7::signing_certificate(&block) {
            Ok(der) => Some(CertificateFingerprints::of(der)),
            Err(e) => {
                warn!("could not read the certificate in {}: {}", name, e);
                None
            }
        };
        blocks.push(SignatureBlock { name, certificate });
    }
    Ok(blocks)
}

/// Package identity from the compiled `AndroidManifest.xml` of a plain APK.
/// A missing or undecodable manifest gives `None`.
pub fn read_apk_manifest(apk: &Path) -> Result<Option<ManifestInfo>> {
    let mut archive = open_zip(apk)?;
    let mut entry = match archive.by_name("AndroidManifest.xml") {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(source) => return Err(InstallError::Zip { path: apk.to_path_buf(), source }),
    };
    let mut data = Vec::new();
    entry
        .read_to_end(&mut data)
        .map_err(|e| InstallError::io("failed to read AndroidManifest.xml", e))?;
    match axml::parse_manifest(&data) {
        Ok(info) => Ok(Some(info)),
        Err(e) => {
            warn!("ignoring unreadable AndroidManifest.xml in {}: {}", apk.display(), e);
            Ok(None)
        }
    }
}

pub fn read_xapk_manifest(bundle: &Path) -> Result<Option<XapkManifest>> {
    let mut archive = open_zip(bundle)?;
    let entry = match archive.by_name("manifest.json") {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(source) => return Err(InstallError::Zip { path: bundle.to_path_buf(), source }),
    };
    match serde_json::from_reader(entry) {
        Ok(manifest) => Ok(Some(manifest)),
        Err(e) => {
            warn!("ignoring unreadable manifest.json in {}: {}", bundle.display(), e);
            Ok(None)
        }
    }
}

pub fn analyze(path: &Path) -> Result<ApkInfo> {
    if !path.is_file() {
        return Err(InstallError::NotFound(path.to_path_buf()));
    }
    let format = PackageFormat::detect(path);
    let size = path
        .metadata()
        .map_err(|e| InstallError::io(format!("failed to read {}", path.display()), e))?
        .len();
    let FileDigests { md5, sha256 } = digest_file(path)?;
    let mut info = ApkInfo {
        path: path.to_path_buf(),
        format,
        size,
        md5,
        sha256,
        apk_entries: Vec::new(),
        manifest: None,
        package: None,
        signatures: Vec::new(),
    };
    if format.is_bundle() {
        info.apk_entries = bundle::apk_entry_names(path)?;
        info.manifest = read_xapk_manifest(path)?;
    } else {
        info.package = read_apk_manifest(path)?;
        info.signatures = signature_blocks(path)?;
    }
    Ok(info)
}

impl ApkInfo {
    pub fn print(&self) {
        println!("{}", "\nPackage Info".bold().underline().yellow());
        println!("{}: {}", "File".cyan(), self.path.display().to_string().green());
        println!("{}: {}", "Type".cyan(), self.format.description().green());
        println!("{}: {}", "Size".cyan(), format_size(self.size).green());
        println!("{}: {}", "MD5".cyan(), self.md5.green());
        println!("{}: {}", "SHA-256".cyan(), self.sha256.green());
        let field = |v: &Option<String>| v.clone().unwrap_or_else(|| "N/A".to_string());
        if let Some(package) = &self.package {
            println!("{}: {}", "Package Name".cyan(), field(&package.package).green());
            println!(
                "{}: {} ({})",
                "Version".cyan(),
                field(&package.version_name).green(),
                field(&package.version_code).green()
            );
            println!("{}: {}", "Min SDK".cyan(), field(&package.min_sdk_version).green());
        }
        if let Some(manifest) = &self.manifest {
            println!("{}: {}", "App Name".cyan(), field(&manifest.name).green());
            println!("{}: {}", "Package Name".cyan(), field(&manifest.package_name).green());
            println!(
                "{}: {} ({})",
                "Version".cyan(),
                field(&manifest.version_name).green(),
                field(&manifest.version_code).green()
            );
            println!("{}: {}", "Min SDK".cyan(), field(&manifest.min_sdk_version).green());
        }
        if self.format.is_bundle() {
            println!("{}: {}", "APK Count".cyan(), self.apk_entries.len().to_string().green());
            for name in &self.apk_entries {
                println!("  {}", name.blue());
            }
        } else {
            println!("{}:", "Signature Blocks".cyan());
            if self.signatures.is_empty() {
                println!("  {}", "None (v2+ signing only or unsigned)".red());
            }
            for block in &self.signatures {
                println!("  {}", block.name.blue());
                match &block.certificate {
                    Some(cert) => {
                        println!("    {}: {}", "MD5".cyan(), cert.md5);
                        println!("    {}: {}", "SHA-1".cyan(), cert.sha1);
                        println!("    {}: {}", "SHA-256".cyan(), cert.sha256);
                    }
                    None => println!("    {}", "Certificate could not be read".red()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axml::tests::compiled_manifest;
    use crate::bundle::tests::write_bundle;
    use crate::pkcs7::tests::{fake_certificate, signed_data_block};

    #[test]
    fn formats_sizes_with_units() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.00 KB");
        assert_eq!(format_size(5 * 1024 * 1024 + 512 * 1024), "5.50 MB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.00 GB");
    }

    #[test]
    fn hashes_file_contents_in_upper_hex() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc.apk");
        std::fs::write(&path, b"abc").unwrap();
        let digests = digest_file(&path).unwrap();
        assert_eq!(digests.md5, "900150983CD24FB0D6963F7D28E17F72");
        assert_eq!(digests.sha256, "BA7816BF8F01CFEA414140DE5DAE2223B00361A396177A9CB410FF61F20015AD");
    }

    #[test]
    fn fingerprints_cover_md5_sha1_and_sha256() {
        let fingerprints = CertificateFingerprints::of(b"abc");
        assert_eq!(fingerprints.md5, "900150983CD24FB0D6963F7D28E17F72");
        assert_eq!(fingerprints.sha1, "A9993E364706816ABA3E25717850C26C9CD0D89D");
        assert!(fingerprints.sha256.starts_with("BA7816BF"));
    }

    #[test]
    fn reads_xapk_manifest_and_apk_entries() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("app.xapk");
        let manifest = br#"{"package_name":"com.example.app","name":"Example","version_name":"1.2.3","version_code":"45","min_sdk_version":24}"#;
        write_bundle(&bundle, &[("manifest.json", manifest), ("com.example.app.apk", b"base"), ("config.arm64_v8a.apk", b"abi")]);
        let info = analyze(&bundle).unwrap();
        let manifest = info.manifest.unwrap();
        assert_eq!(manifest.package_name.as_deref(), Some("com.example.app"));
        assert_eq!(manifest.version_code.as_deref(), Some("45"));
        assert_eq!(manifest.min_sdk_version.as_deref(), Some("24"));
        assert_eq!(info.apk_entries, ["com.example.app.apk", "config.arm64_v8a.apk"]);
    }

    #[test]
    fn fingerprints_the_signing_certificate_not_the_whole_block() {
        let dir = tempfile::tempdir().unwrap();
        let apk = dir.path().join("app.apk");
        let certificate = fake_certificate();
        let block = signed_data_block(&certificate);
        write_bundle(&apk, &[("META-INF/CERT.RSA", &block), ("META-INF/CERT.SF", b"sf"), ("META-INF/OLD.DSA", b"junk")]);
        let info = analyze(&apk).unwrap();
        assert_eq!(info.format, PackageFormat::Apk);
        assert_eq!(info.signatures.len(), 2);
        assert_eq!(info.signatures[0].name, "META-INF/CERT.RSA");
        let fingerprints = info.signatures[0].certificate.clone().unwrap();
        assert_eq!(fingerprints, CertificateFingerprints::of(&certificate));
        assert_ne!(fingerprints, CertificateFingerprints::of(&block));
        assert_eq!(info.signatures[1].certificate, None);
    }

    #[test]
    fn reads_package_identity_of_plain_apk() {
        let dir = tempfile::tempdir().unwrap();
        let apk = dir.path().join("app.apk");
        let manifest = compiled_manifest("com.example.app", 42, "1.4.2");
        write_bundle(&apk, &[("AndroidManifest.xml", &manifest), ("classes.dex", b"dex")]);
        let info = analyze(&apk).unwrap();
        let package = info.package.unwrap();
        assert_eq!(package.package.as_deref(), Some("com.example.app"));
        assert_eq!(package.version_name.as_deref(), Some("1.4.2"));
        assert_eq!(package.version_code.as_deref(), Some("42"));
        assert!(info.signatures.is_empty());

        let text = dir.path().join("text.apk");
        write_bundle(&text, &[("AndroidManifest.xml", b"<manifest/>")]);
        assert_eq!(analyze(&text).unwrap().package, None);
    }
}
