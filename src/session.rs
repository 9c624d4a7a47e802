use crate::manifest::{EndSession, ManifestError, ManifestRouter, RewriteReport};
use crate::models::SessionState;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{info, warn};

const WRAPPER_PREFIX: &str = "devlog-host-wrapper-";
const DEFAULT_SESSION_NAME: &str = "default";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no active session found at {0}")]
    NoActiveSession(PathBuf),
    #[error("failed to read session state {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse session state {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode session state: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to remove {path}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to resolve log path {path}: {source}")]
    LogPath {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("session store lock poisoned")]
    Poisoned,
    #[error(transparent)]
    Manifest(#[from] ManifestError),
}

/// Storage for the single machine-wide active session record.
pub trait SessionStore {
    fn load(&self) -> Result<SessionState, SessionError>;
    fn save(&self, state: &SessionState) -> Result<(), SessionError>;
    /// Removing an absent record is not an error.
    fn clear(&self) -> Result<(), SessionError>;
}

/// The session record as a JSON file in the cache dir.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileSessionStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self) -> Result<SessionState, SessionError> {
        let data = fs::read(&self.path).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                SessionError::NoActiveSession(self.path.clone())
            } else {
                SessionError::Read {
                    path: self.path.clone(),
                    source,
                }
            }
        })?;

        serde_json::from_slice(&data).map_err(|source| SessionError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    fn save(&self, state: &SessionState) -> Result<(), SessionError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| SessionError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let data = serde_json::to_string_pretty(state).map_err(SessionError::Encode)?;
        fs::write(&self.path, data).map_err(|source| SessionError::Write {
            path: self.path.clone(),
            source,
        })
    }

    fn clear(&self) -> Result<(), SessionError> {
        remove_if_exists(&self.path)
    }
}

/// In-process store, for tests and embedding.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    state: Mutex<Option<SessionState>>,
}

impl MemorySessionStore {
    pub fn new(state: Option<SessionState>) -> Self {
        MemorySessionStore {
            state: Mutex::new(state),
        }
    }

    pub fn current(&self) -> Option<SessionState> {
        self.state.lock().ok().and_then(|s| s.clone())
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self) -> Result<SessionState, SessionError> {
        let slot = self.state.lock().map_err(|_| SessionError::Poisoned)?;
        slot.clone()
            .ok_or_else(|| SessionError::NoActiveSession(PathBuf::from("<memory>")))
    }

    fn save(&self, state: &SessionState) -> Result<(), SessionError> {
        let mut slot = self.state.lock().map_err(|_| SessionError::Poisoned)?;
        *slot = Some(state.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), SessionError> {
        let mut slot = self.state.lock().map_err(|_| SessionError::Poisoned)?;
        *slot = None;
        Ok(())
    }
}

/// Reduce a session identifier to `[A-Za-z0-9._-]`, replacing anything else
/// with `-`. Leading/trailing dashes are trimmed; an empty result becomes
/// `default`.
pub fn sanitize_session_name(session: &str) -> String {
    let replaced: String = session
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();

    let trimmed = replaced.trim_matches('-');
    if trimmed.is_empty() {
        DEFAULT_SESSION_NAME.to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn wrapper_path(wrappers_dir: &Path, session: &str) -> PathBuf {
    let ext = if cfg!(windows) { "cmd" } else { "sh" };
    wrappers_dir.join(format!(
        "{}{}.{}",
        WRAPPER_PREFIX,
        sanitize_session_name(session),
        ext
    ))
}

/// POSIX single-quote escaping.
pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Batch-file quoting: `%` doubles so it is not expanded as a variable, and
/// `"` doubles so it stays inside the quoted argument.
pub fn cmd_quote(s: &str) -> String {
    format!("\"{}\"", s.replace('%', "%%").replace('"', "\"\""))
}

pub fn wrapper_script(host_binary: &Path, log_path: &Path, levels: &[String]) -> String {
    if cfg!(windows) {
        let mut args = vec![
            cmd_quote(&host_binary.to_string_lossy()),
            cmd_quote(&log_path.to_string_lossy()),
        ];
        args.extend(levels.iter().map(|level| cmd_quote(level)));
        return format!("@echo off\r\n{}\r\n", args.join(" "));
    }

    let mut args = vec![
        shell_quote(&host_binary.to_string_lossy()),
        shell_quote(&log_path.to_string_lossy()),
    ];
    args.extend(levels.iter().map(|level| shell_quote(level)));
    format!("#!/bin/sh\nexec {}\n", args.join(" "))
}

/// Write an executable launcher that runs the host with the session's
/// log path and levels baked in.
pub fn write_wrapper(
    path: &Path,
    host_binary: &Path,
    log_path: &Path,
    levels: &[String],
) -> Result<(), SessionError> {
    let write_err = |source: io::Error| SessionError::Write {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_err)?;
    }
    fs::write(path, wrapper_script(host_binary, log_path, levels)).map_err(write_err)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).map_err(write_err)?;
    }

    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<(), SessionError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(SessionError::Remove {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn absolute(path: &Path) -> Result<PathBuf, SessionError> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    env::current_dir()
        .map(|cwd| cwd.join(path))
        .map_err(|source| SessionError::LogPath {
            path: path.to_path_buf(),
            source,
        })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedSession {
    pub wrapper: PathBuf,
    pub state: SessionState,
    pub report: RewriteReport,
}

/// Starts and stops browser logging sessions: wrapper script, manifest
/// retargeting and the active-session record, in that order.
pub struct SessionController<S: SessionStore> {
    router: ManifestRouter,
    store: S,
    wrappers_dir: PathBuf,
    host_binary: PathBuf,
}

impl<S: SessionStore> SessionController<S> {
    pub fn new(
        router: ManifestRouter,
        store: S,
        wrappers_dir: impl Into<PathBuf>,
        host_binary: impl Into<PathBuf>,
    ) -> Self {
        SessionController {
            router,
            store,
            wrappers_dir: wrappers_dir.into(),
            host_binary: host_binary.into(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn router(&self) -> &ManifestRouter {
        &self.router
    }

    pub fn wrapper_for(&self, session: &str) -> PathBuf {
        wrapper_path(&self.wrappers_dir, session)
    }

    pub fn start<L: AsRef<str>>(
        &self,
        session: &str,
        log_path: &Path,
        levels: &[L],
    ) -> Result<StartedSession, SessionError> {
        let log_path = absolute(log_path)?;
        let levels: Vec<String> = levels.iter().map(|l| l.as_ref().to_lowercase()).collect();
        let wrapper = self.wrapper_for(session);

        write_wrapper(&wrapper, &self.host_binary, &log_path, &levels)?;

        let report = match self.router.begin_session(&wrapper) {
            Ok(report) => report,
            Err(e) => {
                // Nothing points at the wrapper; don't leave it behind.
                if let Err(cleanup) = remove_if_exists(&wrapper) {
                    warn!(error = %cleanup, "failed to remove unused wrapper");
                }
                return Err(e.into());
            }
        };

        let state = SessionState { log_path, levels };
        self.store.save(&state)?;
        info!(session, wrapper = %wrapper.display(), "browser logging session started");

        Ok(StartedSession {
            wrapper,
            state,
            report,
        })
    }

    /// Tear down `session`. The session record is cleared only when this
    /// session still owned the manifests and at least one was restored;
    /// otherwise it belongs to whichever session retargeted them since, or
    /// is kept so a later `stop` can retry.
    pub fn stop(&self, session: &str) -> Result<EndSession, SessionError> {
        let wrapper = self.wrapper_for(session);
        let outcome = self.router.end_session(&wrapper, &self.host_binary)?;

        if let EndSession::Restored(_) = outcome {
            self.store.clear()?;
        }
        info!(session, ?outcome, "browser logging session stopped");
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_session_names() {
        assert_eq!(sanitize_session_name("my-app"), "my-app");
        assert_eq!(sanitize_session_name("my app/dev"), "my-app-dev");
        assert_eq!(sanitize_session_name("--x--"), "x");
        assert_eq!(sanitize_session_name("v1.2_rc"), "v1.2_rc");
        assert_eq!(sanitize_session_name(""), "default");
        assert_eq!(sanitize_session_name("///"), "default");
        assert_eq!(sanitize_session_name("café"), "caf");
    }

    #[test]
    fn different_sessions_get_different_wrappers() {
        let dir = Path::new("/cache/wrappers");
        assert_ne!(wrapper_path(dir, "web"), wrapper_path(dir, "api"));
        assert!(wrapper_path(dir, "web")
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("devlog-host-wrapper-web."));
    }

    #[test]
    fn quotes_for_posix_shell() {
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("/a b/c"), "'/a b/c'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn quotes_for_batch_files() {
        assert_eq!(cmd_quote(""), "\"\"");
        assert_eq!(cmd_quote(r"C:\Program Files\devlog"), r#""C:\Program Files\devlog""#);
        assert_eq!(cmd_quote("100%done"), "\"100%%done\"");
        assert_eq!(cmd_quote(r#"say "hi""#), r#""say ""hi""""#);
        assert_eq!(cmd_quote("%PATH%"), "\"%%PATH%%\"");
    }

    #[test]
    fn poisoned_memory_store_reports_an_error() {
        let store = std::sync::Arc::new(MemorySessionStore::default());
        let poisoner = std::sync::Arc::clone(&store);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.state.lock().unwrap();
            panic!("poison the lock");
        })
        .join();

        let state = SessionState {
            log_path: PathBuf::from("b.log"),
            levels: Vec::new(),
        };
        assert!(matches!(store.save(&state), Err(SessionError::Poisoned)));
        assert!(matches!(store.clear(), Err(SessionError::Poisoned)));
        assert!(matches!(store.load(), Err(SessionError::Poisoned)));
    }

    #[cfg(unix)]
    #[test]
    fn wrapper_script_execs_host_with_arguments() {
        let script = wrapper_script(
            Path::new("/opt/devlog-host"),
            Path::new("/logs/browser.log"),
            &["error".to_string(), "warn".to_string()],
        );
        assert_eq!(
            script,
            "#!/bin/sh\nexec '/opt/devlog-host' '/logs/browser.log' 'error' 'warn'\n"
        );
    }

    #[cfg(unix)]
    #[test]
    fn written_wrapper_is_executable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wrappers").join("w.sh");
        write_wrapper(&path, Path::new("/bin/devlog-host"), Path::new("/l.log"), &[]).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path().join("devlog").join("active-session.json"));
        assert!(matches!(store.load(), Err(SessionError::NoActiveSession(_))));

        let state = SessionState {
            log_path: PathBuf::from("/logs/browser.log"),
            levels: vec!["error".to_string()],
        };
        store.save(&state).unwrap();
        assert_eq!(store.load().unwrap(), state);

        let raw = fs::read_to_string(store.path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["log_path"], "/logs/browser.log");
        assert_eq!(value["levels"][0], "error");

        store.clear().unwrap();
        store.clear().unwrap();
        assert!(matches!(store.load(), Err(SessionError::NoActiveSession(_))));
    }

    #[test]
    fn file_store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("active-session.json");
        fs::write(&path, "nope").unwrap();
        let err = FileSessionStore::new(&path).load().unwrap_err();
        assert!(matches!(err, SessionError::Parse { .. }));
    }

    #[test]
    fn memory_store_behaves_like_file_store() {
        let store = MemorySessionStore::default();
        assert!(store.load().is_err());
        let state = SessionState {
            log_path: PathBuf::from("b.log"),
            levels: Vec::new(),
        };
        store.save(&state).unwrap();
        assert_eq!(store.load().unwrap(), state);
        store.clear().unwrap();
        assert!(store.current().is_none());
    }
}
