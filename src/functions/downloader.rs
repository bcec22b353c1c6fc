//! # Edge Runtime Downloader
//!
//! Fetches the pinned edge-runtime release for the host platform, verifies
//! the archive against its SHA-256 pin, and unpacks it next to the other
//! cached versions. Releases without a pin are refused unless explicitly
//! allowed.
//!
//! Archive layout: one `.tar.gz` per (version, os, arch) holding the binary
//! and an optional `libs/` directory.
//!
//! Pins cover the archive, not the binary inside it. A verified install
//! records the binary's own digest in `<binary>.sha256`; later checks of the
//! cached binary compare against that record.
//!
//! Not internally synchronized; callers serialize `download`.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use tar::Archive;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::errors::{FunctionError, FunctionResult, MANUAL_INSTALL_HINT};

/// Binary identifier inside release archives and on PATH
pub const BINARY_NAME: &str = "edge-runtime";

/// Release pinned by this build
pub const DEFAULT_VERSION: &str = "1.67.4";

/// Release download root
pub const DEFAULT_BASE_URL: &str = "https://github.com/supabase/edge-runtime/releases/download";

/// Archive pins as (version, platform key, sha256). Deployments add their
/// own through `runtime.checksums`; pins from config win.
pub const PINNED_CHECKSUMS: &[(&str, &str, &str)] = &[];

/// Suffix of the record holding a verified binary's digest
const DIGEST_SUFFIX: &str = ".sha256";

/// Suffix of a binary while it is being extracted
const STAGING_SUFFIX: &str = ".tmp";

/// Progress callback: (bytes downloaded, total bytes)
pub type Progress<'a> = &'a (dyn Fn(u64, u64) + Send + Sync);

/// A platform with a published runtime build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Platform {
    pub os: &'static str,
    pub arch: &'static str,
}

impl Platform {
    /// Map Rust's `std::env::consts` names onto release names
    pub fn from_rust(os: &str, arch: &str) -> FunctionResult<Self> {
        let release_os = match os {
            "linux" => "linux",
            "macos" => "darwin",
            _ => return Err(unsupported(os, arch)),
        };
        let release_arch = match arch {
            "x86_64" => "x64",
            "aarch64" => "arm64",
            _ => return Err(unsupported(os, arch)),
        };
        Ok(Self {
            os: release_os,
            arch: release_arch,
        })
    }

    /// The platform this process runs on
    pub fn current() -> FunctionResult<Self> {
        Self::from_rust(std::env::consts::OS, std::env::consts::ARCH)
    }

    /// `"<os>-<arch>"`, as used in archive names and checksum tables
    pub fn key(&self) -> String {
        format!("{}-{}", self.os, self.arch)
    }

    /// Archive size used for progress when the server omits Content-Length
    pub fn estimated_size(&self) -> u64 {
        match (self.os, self.arch) {
            ("linux", "x64") => 48 * 1024 * 1024,
            ("linux", "arm64") => 45 * 1024 * 1024,
            ("darwin", "x64") => 44 * 1024 * 1024,
            _ => 42 * 1024 * 1024,
        }
    }
}

fn unsupported(os: &str, arch: &str) -> FunctionError {
    FunctionError::UnsupportedPlatform {
        os: os.to_string(),
        arch: arch.to_string(),
        hint: MANUAL_INSTALL_HINT,
    }
}

/// What to do with one archive entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryAction {
    /// Shared library, extracted verbatim under the download directory
    Lib(PathBuf),
    /// The runtime binary, renamed to the canonical path
    Binary,
    Skip,
}

/// Entry names with `..` anywhere, or absolute names, are never extracted
pub fn is_unsafe_entry_name(name: &str) -> bool {
    name.contains("..") || name.starts_with('/') || name.starts_with('\\')
}

/// Decide what an entry becomes. Callers check `is_unsafe_entry_name` first.
pub fn classify_entry(name: &str) -> EntryAction {
    let trimmed = name.trim_start_matches("./");
    if trimmed.starts_with("libs/") {
        EntryAction::Lib(PathBuf::from(trimmed))
    } else if trimmed.contains(BINARY_NAME) {
        EntryAction::Binary
    } else {
        EntryAction::Skip
    }
}

/// `path` with `suffix` appended to its file name. Unlike `with_extension`
/// this keeps `edge-runtime-1.67.4` and `edge-runtime-1.67.5` apart.
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Unpack a runtime archive into `download_dir`, writing the binary to
/// `binary_path`. The binary is staged next to its final path and never
/// left behind on failure.
pub fn extract_tarball(archive: &Path, download_dir: &Path, binary_path: &Path) -> FunctionResult<()> {
    let staged_binary = with_suffix(binary_path, STAGING_SUFFIX);
    let result = unpack(archive, download_dir, binary_path, &staged_binary);
    if result.is_err() {
        let _ = fs::remove_file(&staged_binary);
    }
    result
}

fn unpack(
    archive: &Path,
    download_dir: &Path,
    binary_path: &Path,
    staged_binary: &Path,
) -> FunctionResult<()> {
    let extraction = |e: io::Error| FunctionError::Extraction(e.to_string());

    let file = File::open(archive).map_err(extraction)?;
    let mut tarball = Archive::new(GzDecoder::new(BufReader::new(file)));
    let mut found_binary = false;

    for entry in tarball.entries().map_err(extraction)? {
        let mut entry = entry.map_err(extraction)?;
        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();

        if is_unsafe_entry_name(&name) {
            warn!(op = "runtime.extract.rejected", entry = %name, "Skipping unsafe archive entry");
            continue;
        }

        let entry_type = entry.header().entry_type();
        let mode = entry.header().mode().ok();

        match classify_entry(&name) {
            EntryAction::Lib(relative) => {
                let target = download_dir.join(relative);
                if entry_type.is_dir() {
                    fs::create_dir_all(&target).map_err(extraction)?;
                } else if entry_type.is_file() {
                    write_entry(&mut entry, &target, mode).map_err(extraction)?;
                }
            }
            EntryAction::Binary if entry_type.is_file() => {
                write_entry(&mut entry, staged_binary, mode).map_err(extraction)?;
                found_binary = true;
            }
            _ => debug!(op = "runtime.extract.skip", entry = %name),
        }
    }

    if !found_binary {
        return Err(FunctionError::Extraction(format!(
            "archive {} does not contain {}",
            archive.display(),
            BINARY_NAME
        )));
    }

    fs::rename(staged_binary, binary_path).map_err(extraction)?;
    set_mode(binary_path, 0o755).map_err(extraction)?;
    Ok(())
}

fn write_entry(reader: &mut impl io::Read, target: &Path, mode: Option<u32>) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut out = File::create(target)?;
    io::copy(reader, &mut out)?;
    if let Some(mode) = mode {
        set_mode(target, mode)?;
    }
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

/// Hex SHA-256 of a file, streamed
pub fn file_sha256(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Unpack `archive` and, for a pin-verified archive, record the binary's
/// digest. Any record from an earlier install is dropped first.
fn install(
    archive: &Path,
    download_dir: &Path,
    binary_path: &Path,
    digest_path: &Path,
    verified: bool,
) -> FunctionResult<()> {
    match fs::remove_file(digest_path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    extract_tarball(archive, download_dir, binary_path)?;
    if verified {
        let digest = file_sha256(binary_path)?;
        fs::write(digest_path, format!("{}\n", digest))?;
    }
    Ok(())
}

/// Resolves and caches the edge-runtime binary
pub struct Downloader {
    version: String,
    download_dir: PathBuf,
    base_url: String,
    os: String,
    arch: String,
    checksums: HashMap<String, String>,
    allow_unpinned: bool,
    client: reqwest::Client,
}

impl Downloader {
    /// Downloader for `version`, caching under `download_dir`
    pub fn new(version: impl Into<String>, download_dir: impl Into<PathBuf>) -> Self {
        let version = version.into();
        let checksums = PINNED_CHECKSUMS
            .iter()
            .filter(|(v, _, _)| *v == version)
            .map(|(_, platform, sha)| (platform.to_string(), sha.to_string()))
            .collect();

        Self {
            version,
            download_dir: download_dir.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            checksums,
            allow_unpinned: false,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Add or override checksum pins, keyed by platform key
    pub fn with_checksums(mut self, checksums: HashMap<String, String>) -> Self {
        for (platform, sha) in checksums {
            self.checksums.insert(platform, sha.to_ascii_lowercase());
        }
        self
    }

    /// Install releases that have no pin for this platform, unverified
    pub fn with_allow_unpinned(mut self, allow: bool) -> Self {
        self.allow_unpinned = allow;
        self
    }

    /// Pretend to run on another platform (Rust `consts` names)
    pub fn with_platform(mut self, os: &str, arch: &str) -> Self {
        self.os = os.to_string();
        self.arch = arch.to_string();
        self
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    pub fn platform(&self) -> FunctionResult<Platform> {
        Platform::from_rust(&self.os, &self.arch)
    }

    /// `<download_dir>/edge-runtime-<version>`
    pub fn binary_path(&self) -> PathBuf {
        self.download_dir
            .join(format!("{}-{}", BINARY_NAME, self.version))
    }

    /// Archive URL for a platform
    pub fn archive_url(&self, platform: &Platform) -> String {
        format!(
            "{}/v{}/{}-{}.tar.gz",
            self.base_url,
            self.version,
            BINARY_NAME,
            platform.key()
        )
    }

    /// `<binary_path>.sha256`, written after a pin-verified install
    pub fn digest_path(&self) -> PathBuf {
        with_suffix(&self.binary_path(), DIGEST_SUFFIX)
    }

    fn expected_checksum(&self) -> Option<&str> {
        let platform = self.platform().ok()?;
        self.checksums.get(&platform.key()).map(String::as_str)
    }

    /// Binary exists and, when the platform is pinned, still matches the
    /// digest recorded when its verified archive was unpacked
    pub fn is_installed(&self) -> bool {
        let path = self.binary_path();
        if !path.is_file() {
            return false;
        }
        if self.expected_checksum().is_none() {
            return true;
        }

        let recorded = match fs::read_to_string(self.digest_path()) {
            Ok(recorded) => recorded,
            Err(_) => {
                debug!(op = "runtime.binary.unverified", path = %path.display());
                return false;
            }
        };
        match file_sha256(&path) {
            Ok(actual) => actual.eq_ignore_ascii_case(recorded.trim()),
            Err(e) => {
                warn!(op = "runtime.binary.hash_failed", path = %path.display(), error = %e);
                false
            }
        }
    }

    /// Path to a verified binary, downloading if needed
    pub async fn ensure_binary(&self, progress: Option<Progress<'_>>) -> FunctionResult<PathBuf> {
        if self.is_installed() {
            return Ok(self.binary_path());
        }
        if self.binary_path().exists() {
            warn!(
                op = "runtime.binary.corrupt",
                path = %self.binary_path().display(),
                "Cached binary failed verification, downloading again"
            );
        }
        self.download(progress).await
    }

    /// Download, verify and extract the release for this platform
    pub async fn download(&self, progress: Option<Progress<'_>>) -> FunctionResult<PathBuf> {
        let platform = self.platform()?;
        let url = self.archive_url(&platform);
        let expected = self.expected_checksum();

        if expected.is_none() && !self.allow_unpinned {
            warn!(
                op = "runtime.download.refused",
                version = %self.version,
                platform = %platform.key(),
                "No checksum pinned for this platform"
            );
            return Err(FunctionError::UnpinnedDownload {
                version: self.version.clone(),
                platform: platform.key(),
            });
        }

        tokio::fs::create_dir_all(&self.download_dir).await?;
        let archive_path = self.download_dir.join(format!(
            ".{}-{}-{}.tar.gz.part",
            BINARY_NAME,
            self.version,
            platform.key()
        ));

        info!(op = "runtime.download.start", url = %url, "Downloading edge runtime");

        let result = self.fetch(&url, &archive_path, &platform, progress).await;
        let actual = match result {
            Ok(sha) => sha,
            Err(e) => {
                let _ = tokio::fs::remove_file(&archive_path).await;
                return Err(e);
            }
        };

        if let Some(expected) = expected {
            if !actual.eq_ignore_ascii_case(expected) {
                let _ = tokio::fs::remove_file(&archive_path).await;
                warn!(
                    op = "runtime.download.checksum_mismatch",
                    platform = %platform.key(),
                    expected = %expected,
                    actual = %actual
                );
                return Err(FunctionError::ChecksumMismatch {
                    platform: platform.key(),
                    expected: expected.to_string(),
                    actual,
                });
            }
        } else {
            warn!(
                op = "runtime.download.unpinned",
                platform = %platform.key(),
                sha256 = %actual,
                "No checksum pinned for this platform; skipping verification"
            );
        }

        let binary_path = self.binary_path();
        let extracted = {
            let archive = archive_path.clone();
            let dir = self.download_dir.clone();
            let binary = binary_path.clone();
            let digest = self.digest_path();
            let verified = expected.is_some();
            tokio::task::spawn_blocking(move || {
                install(&archive, &dir, &binary, &digest, verified)
            })
            .await
            .map_err(|e| FunctionError::Internal(format!("extraction task failed: {}", e)))
        };
        let _ = tokio::fs::remove_file(&archive_path).await;
        extracted??;

        info!(op = "runtime.download.done", path = %binary_path.display(), "Edge runtime installed");
        Ok(binary_path)
    }

    /// Stream `url` into `dest`, returning the hex SHA-256 of the bytes
    async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        platform: &Platform,
        progress: Option<Progress<'_>>,
    ) -> FunctionResult<String> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FunctionError::Download(format!("GET {}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(FunctionError::Download(format!(
                "GET {} returned {}",
                url,
                response.status()
            )));
        }

        let total = response
            .content_length()
            .filter(|len| *len > 0)
            .unwrap_or_else(|| platform.estimated_size());

        let mut file = tokio::fs::File::create(dest).await?;
        let mut hasher = Sha256::new();
        let mut downloaded: u64 = 0;

        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| FunctionError::Download(format!("reading {}: {}", url, e)))?
        {
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            if let Some(report) = progress {
                report(downloaded, total);
            }
        }
        file.flush().await?;

        Ok(hex::encode(hasher.finalize()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Arc;

    use axum::{routing::get, Router};
    use flate2::{write::GzEncoder, Compression};
    use tar::{Builder, EntryType, Header};
    use tempfile::TempDir;

    fn raw_header(name: &str, size: u64, mode: u32, kind: EntryType) -> Header {
        let mut header = Header::new_gnu();
        {
            let gnu = header.as_gnu_mut().unwrap();
            gnu.name[..name.len()].copy_from_slice(name.as_bytes());
        }
        header.set_size(size);
        header.set_mode(mode);
        header.set_entry_type(kind);
        header.set_cksum();
        header
    }

    fn build_archive(entries: &[(&str, &[u8], u32)]) -> Vec<u8> {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = Builder::new(encoder);
        for (name, data, mode) in entries {
            let kind = if name.ends_with('/') {
                EntryType::Directory
            } else {
                EntryType::Regular
            };
            let header = raw_header(name, data.len() as u64, *mode, kind);
            builder.append(&header, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    fn write_archive(dir: &Path, bytes: &[u8]) -> PathBuf {
        let path = dir.join("runtime.tar.gz");
        fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn test_platform_mapping() {
        let linux = Platform::from_rust("linux", "x86_64").unwrap();
        assert_eq!(linux.key(), "linux-x64");
        assert_eq!(Platform::from_rust("macos", "aarch64").unwrap().key(), "darwin-arm64");

        let err = Platform::from_rust("windows", "x86_64").unwrap_err();
        assert!(matches!(err, FunctionError::UnsupportedPlatform { .. }));
        assert!(Platform::from_rust("linux", "riscv64").is_err());
    }

    #[test]
    fn test_binary_path_is_deterministic() {
        let a = Downloader::new("1.2.3", "/opt/edge");
        let b = Downloader::new("1.2.3", "/opt/edge");
        assert_eq!(a.binary_path(), b.binary_path());
        assert_eq!(a.binary_path(), PathBuf::from("/opt/edge/edge-runtime-1.2.3"));
        assert_ne!(a.binary_path(), Downloader::new("1.2.4", "/opt/edge").binary_path());
    }

    #[test]
    fn test_archive_url() {
        let d = Downloader::new("1.2.3", "/tmp").with_base_url("https://mirror.local/rel/");
        let url = d.archive_url(&Platform::from_rust("linux", "aarch64").unwrap());
        assert_eq!(url, "https://mirror.local/rel/v1.2.3/edge-runtime-linux-arm64.tar.gz");
    }

    #[test]
    fn test_unsafe_entry_names() {
        for name in ["../evil", "libs/../../etc/passwd", "a/..", "..", "x..y", "/abs/path"] {
            assert!(is_unsafe_entry_name(name), "{} should be unsafe", name);
        }
        for name in ["edge-runtime", "libs/libfoo.so", "./libs/a.so", "README.md"] {
            assert!(!is_unsafe_entry_name(name), "{} should be safe", name);
        }
    }

    #[test]
    fn test_classify_entry() {
        assert_eq!(
            classify_entry("libs/libonnx.so"),
            EntryAction::Lib(PathBuf::from("libs/libonnx.so"))
        );
        assert_eq!(
            classify_entry("./libs/x/y.so"),
            EntryAction::Lib(PathBuf::from("libs/x/y.so"))
        );
        assert_eq!(classify_entry("edge-runtime"), EntryAction::Binary);
        assert_eq!(classify_entry("dist/edge-runtime-linux"), EntryAction::Binary);
        assert_eq!(classify_entry("LICENSE"), EntryAction::Skip);
    }

    #[test]
    fn test_is_installed_without_pin() {
        let temp = TempDir::new().unwrap();
        let d = Downloader::new("1.0.0", temp.path()).with_platform("linux", "x86_64");
        assert!(!d.is_installed());

        fs::write(d.binary_path(), b"anything").unwrap();
        assert!(d.is_installed());
    }

    #[test]
    fn test_pinned_binary_needs_recorded_digest() {
        let temp = TempDir::new().unwrap();
        let contents = b"#!/bin/sh\necho edge\n".to_vec();

        // The pin is an archive digest; it never matches the binary itself
        let d = Downloader::new("1.0.0", temp.path())
            .with_platform("linux", "x86_64")
            .with_checksums(HashMap::from([("linux-x64".to_string(), "cd".repeat(32))]));

        fs::write(d.binary_path(), &contents).unwrap();
        assert!(!d.is_installed());

        let sha = crate::auth::crypto::sha256_hex(&contents);
        fs::write(d.digest_path(), format!("{}\n", sha)).unwrap();
        assert!(d.is_installed());

        let mut corrupted = contents.clone();
        corrupted[3] ^= 0x01;
        fs::write(d.binary_path(), &corrupted).unwrap();
        assert!(!d.is_installed());
    }

    #[test]
    fn test_digest_and_staging_paths_keep_versions_apart() {
        let a = Downloader::new("1.67.4", "/opt/edge");
        let b = Downloader::new("1.67.5", "/opt/edge");
        assert_eq!(a.digest_path(), PathBuf::from("/opt/edge/edge-runtime-1.67.4.sha256"));
        assert_ne!(a.digest_path(), b.digest_path());
        assert_ne!(
            with_suffix(&a.binary_path(), STAGING_SUFFIX),
            with_suffix(&b.binary_path(), STAGING_SUFFIX)
        );
        assert_eq!(
            with_suffix(&a.binary_path(), STAGING_SUFFIX),
            PathBuf::from("/opt/edge/edge-runtime-1.67.4.tmp")
        );
    }

    #[test]
    fn test_pin_for_other_platform_ignored() {
        let temp = TempDir::new().unwrap();
        let d = Downloader::new("1.0.0", temp.path())
            .with_platform("linux", "x86_64")
            .with_checksums(HashMap::from([("darwin-arm64".to_string(), "00".repeat(32))]));
        fs::write(d.binary_path(), b"bin").unwrap();
        assert!(d.is_installed());
    }

    #[test]
    fn test_extract_places_binary_and_libs() {
        let temp = TempDir::new().unwrap();
        let bytes = build_archive(&[
            ("edge-runtime", b"\x7fELFbinary", 0o700),
            ("libs/", b"", 0o755),
            ("libs/libonnxruntime.so", b"lib", 0o644),
            ("README.md", b"docs", 0o644),
        ]);
        let archive = write_archive(temp.path(), &bytes);
        let dir = temp.path().join("cache");
        fs::create_dir_all(&dir).unwrap();
        let binary = dir.join("edge-runtime-1.0.0");

        extract_tarball(&archive, &dir, &binary).unwrap();

        assert_eq!(fs::read(&binary).unwrap(), b"\x7fELFbinary");
        assert_eq!(fs::read(dir.join("libs/libonnxruntime.so")).unwrap(), b"lib");
        assert!(!dir.join("README.md").exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&binary).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
            let lib_mode = fs::metadata(dir.join("libs/libonnxruntime.so"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(lib_mode & 0o777, 0o644);
        }
    }

    #[test]
    fn test_extract_rejects_traversal_but_keeps_safe_entries() {
        let temp = TempDir::new().unwrap();
        let bytes = build_archive(&[
            ("../escaped.txt", b"evil", 0o644),
            ("libs/../../escaped.so", b"evil", 0o644),
            ("libs/ok.so", b"ok", 0o644),
            ("edge-runtime", b"bin", 0o755),
        ]);
        let archive = write_archive(temp.path(), &bytes);
        let dir = temp.path().join("cache");
        fs::create_dir_all(&dir).unwrap();
        let binary = dir.join("edge-runtime-1.0.0");

        extract_tarball(&archive, &dir, &binary).unwrap();

        assert!(!temp.path().join("escaped.txt").exists());
        assert!(!temp.path().join("escaped.so").exists());
        assert!(dir.join("libs/ok.so").exists());
        assert!(binary.exists());
    }

    #[test]
    fn test_extract_fails_without_binary() {
        let temp = TempDir::new().unwrap();
        let bytes = build_archive(&[("libs/only.so", b"lib", 0o644)]);
        let archive = write_archive(temp.path(), &bytes);
        let binary = temp.path().join("edge-runtime-1.0.0");

        let err = extract_tarball(&archive, temp.path(), &binary).unwrap_err();
        assert!(matches!(err, FunctionError::Extraction(_)));
        assert!(!binary.exists());
    }

    #[test]
    fn test_extract_failure_removes_staged_binary() {
        let temp = TempDir::new().unwrap();
        let bytes = build_archive(&[
            ("edge-runtime", b"bin", 0o755),
            ("libs/blocked.so", b"lib", 0o644),
        ]);
        let archive = write_archive(temp.path(), &bytes);
        let dir = temp.path().join("cache");
        fs::create_dir_all(&dir).unwrap();
        // A plain file where `libs/` must go fails the second entry
        fs::write(dir.join("libs"), b"in the way").unwrap();
        let binary = dir.join("edge-runtime-1.0.0");

        let err = extract_tarball(&archive, &dir, &binary).unwrap_err();
        assert!(matches!(err, FunctionError::Extraction(_)));
        assert!(!binary.exists());
        assert!(!dir.join("edge-runtime-1.0.0.tmp").exists());
    }

    #[test]
    fn test_extract_rejects_non_gzip() {
        let temp = TempDir::new().unwrap();
        let archive = write_archive(temp.path(), b"definitely not gzip");
        let binary = temp.path().join("edge-runtime-1.0.0");
        assert!(extract_tarball(&archive, temp.path(), &binary).is_err());
    }

    /// Serves `bytes` as the 1.0.0 linux-x64 archive, counting requests
    async fn serve_counted(bytes: Vec<u8>) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/v1.0.0/edge-runtime-linux-x64.tar.gz",
            get(move || {
                let bytes = bytes.clone();
                counter.fetch_add(1, Ordering::SeqCst);
                async move { bytes }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), hits)
    }

    async fn serve_archive(bytes: Vec<u8>) -> String {
        serve_counted(bytes).await.0
    }

    #[tokio::test]
    async fn test_download_verifies_and_extracts() {
        let bytes = build_archive(&[("edge-runtime", b"bin", 0o755)]);
        let sha = crate::auth::crypto::sha256_hex(&bytes);
        let base = serve_archive(bytes.clone()).await;
        let temp = TempDir::new().unwrap();

        let d = Downloader::new("1.0.0", temp.path().join("cache"))
            .with_base_url(base)
            .with_platform("linux", "x86_64")
            .with_checksums(HashMap::from([("linux-x64".to_string(), sha)]));

        let seen = Arc::new(AtomicU64::new(0));
        let seen_in_cb = seen.clone();
        let progress = move |done: u64, total: u64| {
            assert!(total > 0);
            seen_in_cb.store(done, Ordering::SeqCst);
        };

        let path = d.ensure_binary(Some(&progress)).await.unwrap();
        assert_eq!(path, d.binary_path());
        assert!(d.is_installed());
        assert!(d.digest_path().is_file());
        assert_eq!(seen.load(Ordering::SeqCst), bytes.len() as u64);

        let leftovers: Vec<_> = fs::read_dir(d.download_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".part"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_verified_install_is_reused() {
        let bytes = build_archive(&[("edge-runtime", b"bin", 0o755)]);
        let sha = crate::auth::crypto::sha256_hex(&bytes);
        let (base, hits) = serve_counted(bytes).await;
        let temp = TempDir::new().unwrap();

        let d = Downloader::new("1.0.0", temp.path())
            .with_base_url(base)
            .with_platform("linux", "x86_64")
            .with_checksums(HashMap::from([("linux-x64".to_string(), sha)]));

        d.ensure_binary(None).await.unwrap();
        d.ensure_binary(None).await.unwrap();
        assert!(d.is_installed());
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // A tampered binary is fetched again
        fs::write(d.binary_path(), b"tampered").unwrap();
        assert!(!d.is_installed());
        d.ensure_binary(None).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(fs::read(d.binary_path()).unwrap(), b"bin");
    }

    #[tokio::test]
    async fn test_unpinned_download_refused_before_fetch() {
        let bytes = build_archive(&[("edge-runtime", b"bin", 0o755)]);
        let (base, hits) = serve_counted(bytes).await;
        let temp = TempDir::new().unwrap();

        let d = Downloader::new("1.0.0", temp.path().join("cache"))
            .with_base_url(base)
            .with_platform("linux", "x86_64");

        let err = d.ensure_binary(None).await.unwrap_err();
        assert!(matches!(
            &err,
            FunctionError::UnpinnedDownload { platform, .. } if platform == "linux-x64"
        ));
        assert!(!err.is_retryable());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(!d.binary_path().exists());
    }

    #[tokio::test]
    async fn test_unpinned_download_when_allowed() {
        let bytes = build_archive(&[("edge-runtime", b"bin", 0o755)]);
        let (base, hits) = serve_counted(bytes).await;
        let temp = TempDir::new().unwrap();

        let d = Downloader::new("1.0.0", temp.path())
            .with_base_url(base)
            .with_platform("linux", "x86_64")
            .with_allow_unpinned(true);

        let path = d.ensure_binary(None).await.unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"bin");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(d.is_installed());
        assert!(!d.digest_path().exists());
    }

    #[tokio::test]
    async fn test_download_checksum_mismatch_cleans_up() {
        let bytes = build_archive(&[("edge-runtime", b"bin", 0o755)]);
        let base = serve_archive(bytes).await;
        let temp = TempDir::new().unwrap();

        let d = Downloader::new("1.0.0", temp.path())
            .with_base_url(base)
            .with_platform("linux", "x86_64")
            .with_checksums(HashMap::from([("linux-x64".to_string(), "ab".repeat(32))]));

        let err = d.download(None).await.unwrap_err();
        assert!(matches!(err, FunctionError::ChecksumMismatch { .. }));
        assert!(err.is_retryable());
        assert!(!d.binary_path().exists());
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_download_http_error() {
        let base = serve_archive(Vec::new()).await;
        let temp = TempDir::new().unwrap();

        let d = Downloader::new("9.9.9", temp.path())
            .with_base_url(base)
            .with_platform("linux", "x86_64")
            .with_allow_unpinned(true);

        assert!(matches!(
            d.download(None).await,
            Err(FunctionError::Download(_))
        ));
    }

    #[tokio::test]
    async fn test_download_unsupported_platform() {
        let temp = TempDir::new().unwrap();
        let d = Downloader::new("1.0.0", temp.path()).with_platform("windows", "x86_64");
        assert!(matches!(
            d.ensure_binary(None).await,
            Err(FunctionError::UnsupportedPlatform { .. })
        ));
    }
}
