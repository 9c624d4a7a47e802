//! Native-messaging host manifests.
//!
//! Each browser looks for `com.devlog.host.json` in its own directory and
//! launches whatever executable the manifest's `path` names. A logging
//! session points every manifest at a per-session wrapper and points them
//! back at the stable host binary when it ends.

use crate::config::Config;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::{error, info, warn};

pub const HOST_NAME: &str = "com.devlog.host";
pub const HOST_DESCRIPTION: &str = "devlog Native Messaging Host for Browser Log Capture";
pub const FIREFOX_EXTENSION_ID: &str = "devlog@devlog.local";

const MANIFEST_FILE: &str = "com.devlog.host.json";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("--extension-id is required when registering for {0}")]
    MissingExtensionId(Vendor),
    #[error("failed to create native messaging directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode manifest: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to write manifest to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("no native messaging manifests found (run 'devlog register' first)")]
    NotRegistered,
    #[error("failed to update native messaging manifests: {}", .0.join("; "))]
    UpdateFailed(Vec<String>),
    #[error("failed to inspect one or more native messaging manifests: {}", .0.join("; "))]
    InspectFailed(Vec<String>),
    #[error("failed to remove wrapper {path}: {source}")]
    RemoveWrapper {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Browser {
    Chrome,
    Brave,
    Firefox,
    Zen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Chromium,
    Firefox,
}

impl Browser {
    pub const ALL: [Browser; 4] = [Browser::Chrome, Browser::Brave, Browser::Firefox, Browser::Zen];

    pub fn family(self) -> Family {
        match self {
            Browser::Chrome | Browser::Brave => Family::Chromium,
            Browser::Firefox | Browser::Zen => Family::Firefox,
        }
    }

    /// Directory this browser searches for host manifests, relative to the
    /// per-user config root (`~/.config`, `~/Library/Application Support`, `%APPDATA%`).
    pub fn native_messaging_dir(self, config_dir: &Path) -> PathBuf {
        let linux = !cfg!(any(target_os = "macos", windows));
        let parts: &[&str] = match (self, linux) {
            (Browser::Chrome, true) => &["google-chrome", "NativeMessagingHosts"],
            (Browser::Chrome, false) => &["Google", "Chrome", "NativeMessagingHosts"],
            (Browser::Brave, _) => &["BraveSoftware", "Brave-Browser", "NativeMessagingHosts"],
            (Browser::Firefox, true) => &["mozilla", "native-messaging-hosts"],
            (Browser::Firefox, false) => &["Mozilla", "NativeMessagingHosts"],
            (Browser::Zen, true) => &["zen", "native-messaging-hosts"],
            (Browser::Zen, false) => &["zen", "NativeMessagingHosts"],
        };
        parts.iter().fold(config_dir.to_path_buf(), |dir, part| dir.join(part))
    }
}

impl fmt::Display for Browser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Browser::Chrome => "Chrome",
            Browser::Brave => "Brave",
            Browser::Firefox => "Firefox",
            Browser::Zen => "Zen",
        };
        f.pad(name)
    }
}

/// What `register` can be asked to install for. Firefox covers every
/// Firefox-family browser, forks included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vendor {
    Chrome,
    Brave,
    Firefox,
}

impl Vendor {
    fn covers(self, browser: Browser) -> bool {
        match self {
            Vendor::Chrome => browser == Browser::Chrome,
            Vendor::Brave => browser == Browser::Brave,
            Vendor::Firefox => browser.family() == Family::Firefox,
        }
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Vendor::Chrome => "Chrome",
            Vendor::Brave => "Brave",
            Vendor::Firefox => "Firefox",
        };
        f.pad(name)
    }
}

#[derive(Serialize)]
struct ChromiumManifest<'a> {
    name: &'a str,
    description: &'a str,
    path: String,
    #[serde(rename = "type")]
    kind: &'a str,
    allowed_origins: Vec<String>,
}

#[derive(Serialize)]
struct FirefoxManifest<'a> {
    name: &'a str,
    description: &'a str,
    path: String,
    #[serde(rename = "type")]
    kind: &'a str,
    allowed_extensions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestLocation {
    pub browser: Browser,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestOutcome {
    Updated,
    /// No manifest at this location; that browser is simply not registered.
    Missing,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestRewrite {
    pub location: ManifestLocation,
    pub outcome: ManifestOutcome,
}

/// Per-file result of rewriting `path` across every known manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewriteReport {
    pub entries: Vec<ManifestRewrite>,
}

impl RewriteReport {
    pub fn updated(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.outcome == ManifestOutcome::Updated)
            .count()
    }

    pub fn failures(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter_map(|e| match &e.outcome {
                ManifestOutcome::Failed(reason) => {
                    Some(format!("{}: {}", e.location.path.display(), reason))
                }
                _ => None,
            })
            .collect()
    }

    /// Every manifest that exists was updated.
    pub fn success(&self) -> bool {
        self.updated() > 0 && self.failures().is_empty()
    }

    pub fn is_partial(&self) -> bool {
        self.updated() > 0 && !self.failures().is_empty()
    }
}

/// Result of tearing down a session's registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndSession {
    /// A manifest still pointed at this session's wrapper and was restored.
    Restored(RewriteReport),
    /// No manifest references this wrapper (another session took over, or
    /// the browser was never registered); nothing was rewritten.
    NotOwner,
    /// Ownership could not be determined because some manifests were unreadable.
    Unverified(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    Missing,
    Registered { path: String },
    Unreadable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestStatus {
    pub location: ManifestLocation,
    pub registration: Registration,
}

/// Reads and rewrites the manifests of every known browser.
#[derive(Debug, Clone)]
pub struct ManifestRouter {
    locations: Vec<ManifestLocation>,
}

impl ManifestRouter {
    pub fn from_config(config: &Config) -> Self {
        let locations = Browser::ALL
            .iter()
            .map(|browser| ManifestLocation {
                browser: *browser,
                path: browser.native_messaging_dir(&config.config_dir).join(MANIFEST_FILE),
            })
            .collect();
        ManifestRouter { locations }
    }

    pub fn with_locations(locations: Vec<ManifestLocation>) -> Self {
        ManifestRouter { locations }
    }

    pub fn locations(&self) -> &[ManifestLocation] {
        &self.locations
    }

    /// Write a fresh manifest pointing at `host_path` for `vendor`.
    /// Returns the manifest files written.
    pub fn register(
        &self,
        vendor: Vendor,
        host_path: &Path,
        extension_id: Option<&str>,
    ) -> Result<Vec<PathBuf>, ManifestError> {
        let path = host_path.to_string_lossy().into_owned();
        let body = match vendor {
            Vendor::Chrome | Vendor::Brave => {
                let id = extension_id
                    .filter(|id| !id.is_empty())
                    .ok_or(ManifestError::MissingExtensionId(vendor))?;
                serde_json::to_string_pretty(&ChromiumManifest {
                    name: HOST_NAME,
                    description: HOST_DESCRIPTION,
                    path,
                    kind: "stdio",
                    allowed_origins: vec![format!("chrome-extension://{}/", id)],
                })?
            }
            Vendor::Firefox => serde_json::to_string_pretty(&FirefoxManifest {
                name: HOST_NAME,
                description: HOST_DESCRIPTION,
                path,
                kind: "stdio",
                allowed_extensions: vec![FIREFOX_EXTENSION_ID.to_string()],
            })?,
        };

        let mut written = Vec::new();
        for location in self.locations.iter().filter(|l| vendor.covers(l.browser)) {
            if let Some(dir) = location.path.parent() {
                fs::create_dir_all(dir).map_err(|source| ManifestError::CreateDir {
                    path: dir.to_path_buf(),
                    source,
                })?;
            }
            fs::write(&location.path, &body).map_err(|source| ManifestError::Write {
                path: location.path.clone(),
                source,
            })?;
            info!(browser = %location.browser, manifest = %location.path.display(), "registered host");
            written.push(location.path.clone());
        }
        Ok(written)
    }

    /// Point every existing manifest at `new_path`, leaving all other fields
    /// as they were. Never fails as a whole; see the per-file outcomes.
    pub fn rewrite_path(&self, new_path: &Path) -> RewriteReport {
        let new_path = new_path.to_string_lossy().into_owned();
        let entries = self
            .locations
            .iter()
            .map(|location| {
                let outcome = match rewrite_one(&location.path, &new_path) {
                    Ok(true) => ManifestOutcome::Updated,
                    Ok(false) => ManifestOutcome::Missing,
                    Err(reason) => {
                        warn!(manifest = %location.path.display(), %reason, "manifest rewrite failed");
                        ManifestOutcome::Failed(reason)
                    }
                };
                ManifestRewrite {
                    location: location.clone(),
                    outcome,
                }
            })
            .collect();
        RewriteReport { entries }
    }

    /// Retarget every registered browser at a session wrapper.
    ///
    /// Partial success is returned as `Ok` with the failures still listed in
    /// the report; callers should surface them.
    pub fn begin_session(&self, wrapper: &Path) -> Result<RewriteReport, ManifestError> {
        let report = self.rewrite_path(wrapper);
        let failures = report.failures();

        if report.updated() == 0 {
            if failures.is_empty() {
                return Err(ManifestError::NotRegistered);
            }
            return Err(ManifestError::UpdateFailed(failures));
        }

        info!(wrapper = %wrapper.display(), updated = report.updated(), "manifests retargeted");
        Ok(report)
    }

    /// Whether any manifest's `path` currently names `target`, after lexical
    /// normalization of both sides.
    pub fn is_path_in_use(&self, target: &Path) -> Result<bool, ManifestError> {
        let target = normalize(target);
        let mut found = false;
        let mut errors = Vec::new();

        for location in &self.locations {
            let manifest = match read_manifest(&location.path) {
                Ok(Some(manifest)) => manifest,
                Ok(None) => continue,
                Err(reason) => {
                    found = true;
                    errors.push(format!("{}: {}", location.path.display(), reason));
                    continue;
                }
            };
            found = true;

            if let Some(path) = manifest.get("path").and_then(Value::as_str) {
                if normalize(Path::new(path)) == target {
                    return Ok(true);
                }
            }
        }

        if !errors.is_empty() {
            return Err(ManifestError::InspectFailed(errors));
        }
        if !found {
            return Err(ManifestError::NotRegistered);
        }
        Ok(false)
    }

    /// Restore `stable` if, and only if, a manifest still points at this
    /// session's `wrapper`. The wrapper file is removed either way.
    ///
    /// A restore where every existing manifest failed to update is an
    /// `UpdateFailed` error, returned after the wrapper is gone.
    pub fn end_session(&self, wrapper: &Path, stable: &Path) -> Result<EndSession, ManifestError> {
        let outcome = match self.is_path_in_use(wrapper) {
            Ok(true) => {
                let report = self.rewrite_path(stable);
                let failures = report.failures();
                if report.updated() == 0 && !failures.is_empty() {
                    error!(failed = failures.len(), "no manifest could be restored to host binary");
                    Err(ManifestError::UpdateFailed(failures))
                } else {
                    info!(restored = report.updated(), "manifests restored to host binary");
                    Ok(EndSession::Restored(report))
                }
            }
            Ok(false) | Err(ManifestError::NotRegistered) => Ok(EndSession::NotOwner),
            Err(e) => {
                warn!(error = %e, "could not verify manifest ownership; leaving manifests untouched");
                Ok(EndSession::Unverified(e.to_string()))
            }
        };

        match fs::remove_file(wrapper) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(ManifestError::RemoveWrapper {
                    path: wrapper.to_path_buf(),
                    source,
                })
            }
        }

        outcome
    }

    pub fn status(&self) -> Vec<ManifestStatus> {
        self.locations
            .iter()
            .map(|location| {
                let registration = match read_manifest(&location.path) {
                    Ok(None) => Registration::Missing,
                    Ok(Some(manifest)) => Registration::Registered {
                        path: manifest
                            .get("path")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                    },
                    Err(reason) => Registration::Unreadable(reason),
                };
                ManifestStatus {
                    location: location.clone(),
                    registration,
                }
            })
            .collect()
    }
}

/// `Ok(None)` when the file does not exist.
fn read_manifest(path: &Path) -> Result<Option<Map<String, Value>>, String> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.to_string()),
    };

    match serde_json::from_slice::<Value>(&data) {
        Ok(Value::Object(map)) => Ok(Some(map)),
        Ok(_) => Err("invalid JSON: manifest is not an object".to_string()),
        Err(e) => Err(format!("invalid JSON: {}", e)),
    }
}

/// `Ok(false)` when there was nothing to rewrite.
fn rewrite_one(path: &Path, new_path: &str) -> Result<bool, String> {
    let Some(mut manifest) = read_manifest(path)? else {
        return Ok(false);
    };

    manifest.insert("path".to_string(), Value::String(new_path.to_string()));
    let out = serde_json::to_string_pretty(&manifest)
        .map_err(|e| format!("failed to marshal JSON: {}", e))?;
    fs::write(path, out).map_err(|e| format!("failed to write file: {}", e))?;
    Ok(true)
}

/// Lexical clean-up: drops `.`, resolves `..` against preceding components,
/// collapses repeated separators. Does not touch the filesystem.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn router(root: &TempDir) -> ManifestRouter {
        ManifestRouter::from_config(&Config::with_roots(root.path().join("config"), root.path().join("cache")))
    }

    fn read(path: &Path) -> Map<String, Value> {
        read_manifest(path).unwrap().unwrap()
    }

    fn location(router: &ManifestRouter, browser: Browser) -> PathBuf {
        router
            .locations()
            .iter()
            .find(|l| l.browser == browser)
            .unwrap()
            .path
            .clone()
    }

    #[test]
    fn browser_dirs_are_distinct() {
        let root = Path::new("/home/dev/.config");
        let dirs: Vec<PathBuf> = Browser::ALL.iter().map(|b| b.native_messaging_dir(root)).collect();
        for (i, a) in dirs.iter().enumerate() {
            assert!(a.starts_with(root));
            for b in &dirs[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert!(Browser::Brave
            .native_messaging_dir(root)
            .to_string_lossy()
            .contains("Brave"));
    }

    #[test]
    fn register_chrome_writes_origin() {
        let root = tempfile::tempdir().unwrap();
        let router = router(&root);
        let written = router
            .register(Vendor::Chrome, Path::new("/usr/local/bin/devlog-host"), Some("abc123"))
            .unwrap();
        assert_eq!(written, vec![location(&router, Browser::Chrome)]);

        let manifest = read(&written[0]);
        assert_eq!(manifest["name"], json!(HOST_NAME));
        assert_eq!(manifest["path"], json!("/usr/local/bin/devlog-host"));
        assert_eq!(manifest["type"], json!("stdio"));
        assert_eq!(manifest["allowed_origins"], json!(["chrome-extension://abc123/"]));
        assert!(!location(&router, Browser::Brave).exists());
    }

    #[test]
    fn register_chromium_requires_extension_id() {
        let root = tempfile::tempdir().unwrap();
        let err = router(&root)
            .register(Vendor::Brave, Path::new("/bin/devlog-host"), None)
            .unwrap_err();
        assert!(matches!(err, ManifestError::MissingExtensionId(Vendor::Brave)));
    }

    #[test]
    fn register_firefox_covers_forks() {
        let root = tempfile::tempdir().unwrap();
        let router = router(&root);
        let written = router
            .register(Vendor::Firefox, Path::new("/bin/devlog-host"), None)
            .unwrap();
        assert_eq!(
            written,
            vec![
                location(&router, Browser::Firefox),
                location(&router, Browser::Zen)
            ]
        );
        for path in &written {
            assert_eq!(read(path)["allowed_extensions"], json!([FIREFOX_EXTENSION_ID]));
        }
    }

    #[test]
    fn begin_session_without_manifests_is_not_registered() {
        let root = tempfile::tempdir().unwrap();
        let err = router(&root).begin_session(Path::new("/tmp/wrapper.sh")).unwrap_err();
        assert!(matches!(err, ManifestError::NotRegistered));
    }

    #[test]
    fn rewrite_preserves_unknown_fields() {
        let root = tempfile::tempdir().unwrap();
        let router = router(&root);
        let chrome = location(&router, Browser::Chrome);
        fs::create_dir_all(chrome.parent().unwrap()).unwrap();
        fs::write(
            &chrome,
            r#"{"name":"com.devlog.host","path":"/old","vendor_extra":{"keep":true}}"#,
        )
        .unwrap();

        let report = router.begin_session(Path::new("/tmp/w.sh")).unwrap();
        assert!(report.success());

        let manifest = read(&chrome);
        assert_eq!(manifest["path"], json!("/tmp/w.sh"));
        assert_eq!(manifest["vendor_extra"], json!({"keep": true}));
        let keys: Vec<&String> = manifest.keys().collect();
        assert_eq!(keys, ["name", "path", "vendor_extra"]);
    }

    #[test]
    fn partial_failure_is_reported_not_swallowed() {
        let root = tempfile::tempdir().unwrap();
        let router = router(&root);
        router
            .register(Vendor::Firefox, Path::new("/bin/devlog-host"), None)
            .unwrap();
        fs::write(location(&router, Browser::Zen), "{ not json").unwrap();

        let report = router.begin_session(Path::new("/tmp/w.sh")).unwrap();
        assert!(report.is_partial());
        assert_eq!(report.updated(), 1);
        let failures = report.failures();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].contains("invalid JSON"));
    }

    #[test]
    fn total_failure_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        let router = router(&root);
        let chrome = location(&router, Browser::Chrome);
        fs::create_dir_all(chrome.parent().unwrap()).unwrap();
        fs::write(&chrome, "[]").unwrap();

        let err = router.begin_session(Path::new("/tmp/w.sh")).unwrap_err();
        assert!(matches!(err, ManifestError::UpdateFailed(ref f) if f.len() == 1));
    }

    #[test]
    fn path_in_use_normalizes() {
        let root = tempfile::tempdir().unwrap();
        let router = router(&root);
        router
            .register(Vendor::Firefox, Path::new("/cache/wrappers/./w.sh"), None)
            .unwrap();

        assert!(router.is_path_in_use(Path::new("/cache/x/../wrappers/w.sh")).unwrap());
        assert!(!router.is_path_in_use(Path::new("/cache/wrappers/other.sh")).unwrap());
    }

    #[test]
    fn end_session_skips_foreign_owner_but_removes_wrapper() {
        let root = tempfile::tempdir().unwrap();
        let router = router(&root);
        router
            .register(Vendor::Firefox, Path::new("/bin/devlog-host"), None)
            .unwrap();

        let mine = root.path().join("mine.sh");
        let theirs = root.path().join("theirs.sh");
        fs::write(&mine, "#!/bin/sh\n").unwrap();
        router.begin_session(&theirs).unwrap();

        let outcome = router.end_session(&mine, Path::new("/bin/devlog-host")).unwrap();
        assert_eq!(outcome, EndSession::NotOwner);
        assert!(!mine.exists());
        let firefox = location(&router, Browser::Firefox);
        assert_eq!(read(&firefox)["path"], json!(theirs.to_string_lossy()));
    }

    #[cfg(unix)]
    #[test]
    fn end_session_fails_when_nothing_could_be_restored() {
        use std::os::unix::fs::PermissionsExt;

        let root = tempfile::tempdir().unwrap();
        let manifest = root.path().join("hosts").join("com.devlog.host.json");
        let router = ManifestRouter::with_locations(vec![ManifestLocation {
            browser: Browser::Firefox,
            path: manifest.clone(),
        }]);
        router
            .register(Vendor::Firefox, Path::new("/bin/devlog-host"), None)
            .unwrap();

        let wrapper = root.path().join("w.sh");
        fs::write(&wrapper, "#!/bin/sh\n").unwrap();
        router.begin_session(&wrapper).unwrap();

        fs::set_permissions(&manifest, fs::Permissions::from_mode(0o444)).unwrap();
        if fs::OpenOptions::new().write(true).open(&manifest).is_ok() {
            // Running with CAP_DAC_OVERRIDE; the file cannot be made unwritable.
            return;
        }

        let err = router.end_session(&wrapper, Path::new("/bin/devlog-host")).unwrap_err();
        assert!(matches!(err, ManifestError::UpdateFailed(ref f) if f.len() == 1));
        assert!(!wrapper.exists());
        assert_eq!(read(&manifest)["path"], json!(wrapper.to_string_lossy()));
    }

    #[test]
    fn end_session_without_registration_is_quiet() {
        let root = tempfile::tempdir().unwrap();
        let outcome = router(&root)
            .end_session(&root.path().join("missing.sh"), Path::new("/bin/devlog-host"))
            .unwrap();
        assert_eq!(outcome, EndSession::NotOwner);
    }

    #[test]
    fn status_reports_each_location() {
        let root = tempfile::tempdir().unwrap();
        let router = router(&root);
        router
            .register(Vendor::Chrome, Path::new("/bin/devlog-host"), Some("id"))
            .unwrap();

        let status = router.status();
        assert_eq!(status.len(), Browser::ALL.len());
        for entry in status {
            let expected = if entry.location.browser == Browser::Chrome {
                Registration::Registered {
                    path: "/bin/devlog-host".to_string(),
                }
            } else {
                Registration::Missing
            };
            assert_eq!(entry.registration, expected);
        }
    }

    #[test]
    fn normalize_is_lexical() {
        assert_eq!(normalize(Path::new("/a/./b//c/../d")), PathBuf::from("/a/b/d"));
        assert_eq!(normalize(Path::new("/../a")), PathBuf::from("/a"));
        assert_eq!(normalize(Path::new("../a/..")), PathBuf::from(".."));
        assert_eq!(normalize(Path::new("")), PathBuf::from("."));
    }
}
