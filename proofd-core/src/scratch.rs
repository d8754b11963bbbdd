//! Per-session scratch space for proof intermediates.
//!
//! Every session gets a private `proofd-<session_id>` directory under the
//! scratch root. The root is `/dev/shm` when the host has one with enough free
//! space, otherwise the system temp dir, unless configured explicitly.
//!
//! A [`ScratchSession`] removes its directory exactly once: on an explicit
//! [`ScratchSession::release`] or, failing that, when it is dropped. Removal
//! errors are logged and never escalated.
//!
//! The root may be shared with other proofd processes. Each live session
//! holds an exclusive lock on `<dir>/.lock` for its whole life, and
//! [`ScratchManager::sweep_stale`] only removes directories whose lock it can
//! take. Directories are prepared under a hidden staging name and renamed
//! into place once locked, so a sweep never sees an unlocked live session.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use fs2::FileExt;
use tracing::{debug, info, warn};

use crate::config::ScratchConfig;
use crate::types::{SessionError, SessionId};

pub const SCRATCH_PREFIX: &str = "proofd-";
pub const SHM_PATH: &str = "/dev/shm";

pub const INPUT_FILENAME: &str = "input.json";
pub const WITNESS_FILENAME: &str = "witness.json";
pub const PROOF_FILENAME: &str = "proof.json";
pub const LOCK_FILENAME: &str = ".lock";

/// Where the scratch root lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScratchBacking {
    Memory,
    Disk,
    Configured,
}

/// Pick the scratch root for this host.
pub fn select_root(config: &ScratchConfig) -> (PathBuf, ScratchBacking) {
    if let Some(path) = &config.scratch_root_path {
        return (path.clone(), ScratchBacking::Configured);
    }

    let shm = Path::new(SHM_PATH);
    if shm.is_dir() {
        let required = config.min_free_space_bytes();
        match fs2::available_space(shm) {
            Ok(free) if free >= required => return (shm.to_path_buf(), ScratchBacking::Memory),
            Ok(free) => warn!(
                free_mib = free / (1024 * 1024),
                required_mib = required / (1024 * 1024),
                "not enough free space in {}, using disk scratch",
                SHM_PATH
            ),
            Err(e) => warn!(error = %e, "cannot stat {}, using disk scratch", SHM_PATH),
        }
    }
    (std::env::temp_dir(), ScratchBacking::Disk)
}

fn is_safe_component(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 128
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Hands out per-session scratch directories.
pub struct ScratchManager {
    root: PathBuf,
    backing: ScratchBacking,
    active: Arc<AtomicUsize>,
}

impl ScratchManager {
    pub fn new(config: &ScratchConfig) -> anyhow::Result<Self> {
        let (root, backing) = select_root(config);
        Self::with_root(root, backing)
    }

    pub fn with_root(root: PathBuf, backing: ScratchBacking) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&root)
            .map_err(|e| anyhow::anyhow!("failed to create scratch root {}: {}", root.display(), e))?;
        info!(root = %root.display(), backing = ?backing, "scratch space ready");
        Ok(Self {
            root,
            backing,
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn backing(&self) -> ScratchBacking {
        self.backing
    }

    /// Sessions acquired and not yet released.
    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Create the private directory for a session.
    pub fn acquire(&self, session_id: &SessionId) -> Result<ScratchSession, SessionError> {
        if !is_safe_component(&session_id.0) {
            return Err(SessionError::Storage(format!(
                "session id {:?} is not usable as a directory name",
                session_id.0
            )));
        }
        let name = format!("{}{}", SCRATCH_PREFIX, session_id);
        let dir = self.root.join(&name);
        if dir.exists() {
            return Err(SessionError::Storage(format!(
                "scratch directory {} already exists",
                dir.display()
            )));
        }
        let staging = self.root.join(format!(".{}", name));
        // create_dir (not create_dir_all): an existing directory means another
        // session owns it.
        std::fs::create_dir(&staging).map_err(|e| {
            SessionError::Storage(format!("failed to create {}: {}", staging.display(), e))
        })?;
        let lock = match lock_session_dir(&staging).and_then(|lock| {
            std::fs::rename(&staging, &dir)?;
            Ok(lock)
        }) {
            Ok(lock) => lock,
            Err(e) => {
                let _ = std::fs::remove_dir_all(&staging);
                return Err(SessionError::Storage(format!(
                    "failed to prepare {}: {}",
                    dir.display(),
                    e
                )));
            }
        };
        self.active.fetch_add(1, Ordering::SeqCst);
        debug!(session_id = %session_id, dir = %dir.display(), "scratch acquired");
        Ok(ScratchSession {
            session_id: session_id.clone(),
            dir,
            files: Vec::new(),
            lock: Some(lock),
            released: false,
            active: Arc::clone(&self.active),
        })
    }

    /// Remove session directories left behind by crashed processes.
    ///
    /// Directories whose lock is held belong to a live session, in this
    /// process or another one sharing the root, and are left alone.
    pub fn sweep_stale(&self) -> usize {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(root = %self.root.display(), error = %e, "cannot list scratch root");
                return 0;
            }
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let is_ours = name.to_string_lossy().starts_with(SCRATCH_PREFIX);
            if !is_ours || !entry.path().is_dir() {
                continue;
            }
            let _guard = match try_lock_stale(&entry.path()) {
                Ok(guard) => guard,
                Err(e) => {
                    debug!(path = %entry.path().display(), error = %e, "scratch directory in use, not sweeping");
                    continue;
                }
            };
            match std::fs::remove_dir_all(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %entry.path().display(), error = %e, "failed to sweep stale scratch"),
            }
        }
        if removed > 0 {
            info!(removed, "swept stale scratch directories");
        }
        removed
    }
}

fn lock_session_dir(dir: &Path) -> io::Result<File> {
    let lock = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(dir.join(LOCK_FILENAME))?;
    lock.try_lock_exclusive()?;
    Ok(lock)
}

/// Take the lock of a directory found by a sweep. A directory without a lock
/// file was never fully set up and counts as stale.
fn try_lock_stale(dir: &Path) -> io::Result<Option<File>> {
    match OpenOptions::new().read(true).write(true).open(dir.join(LOCK_FILENAME)) {
        Ok(lock) => {
            lock.try_lock_exclusive()?;
            Ok(Some(lock))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Outcome of a release, for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReleaseReport {
    pub removed_files: usize,
    pub failures: usize,
    /// False when the session had already been released.
    pub performed: bool,
}

/// A request-private scratch directory.
#[derive(Debug)]
pub struct ScratchSession {
    session_id: SessionId,
    dir: PathBuf,
    files: Vec<PathBuf>,
    lock: Option<File>,
    released: bool,
    active: Arc<AtomicUsize>,
}

impl ScratchSession {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Path for a named file inside the session directory (not recorded).
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Record a file created inside the session by someone else.
    pub fn track(&mut self, path: PathBuf) {
        if !self.files.contains(&path) {
            self.files.push(path);
        }
    }

    /// Write a file into the session directory and record it.
    pub fn write_file(&mut self, name: &str, contents: &[u8]) -> Result<PathBuf, SessionError> {
        let path = self.path(name);
        std::fs::write(&path, contents)
            .map_err(|e| SessionError::Storage(format!("failed to write {}: {}", path.display(), e)))?;
        self.track(path.clone());
        Ok(path)
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Remove every recorded file and the directory. Idempotent.
    pub fn release(&mut self) -> ReleaseReport {
        if self.released {
            return ReleaseReport::default();
        }
        self.released = true;
        self.active.fetch_sub(1, Ordering::SeqCst);

        let mut report = ReleaseReport {
            performed: true,
            ..Default::default()
        };
        for path in self.files.drain(..) {
            match std::fs::remove_file(&path) {
                Ok(()) => report.removed_files += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    report.failures += 1;
                    warn!(session_id = %self.session_id, path = %path.display(), error = %e, "failed to remove scratch file");
                }
            }
        }

        // Unlock before removing the lock file; a concurrent sweep may get
        // there first, which is fine.
        if let Some(lock) = self.lock.take() {
            let _ = lock.unlock();
            drop(lock);
            if let Err(e) = std::fs::remove_file(self.dir.join(LOCK_FILENAME)) {
                if e.kind() != io::ErrorKind::NotFound {
                    debug!(session_id = %self.session_id, error = %e, "failed to remove scratch lock file");
                }
            }
        }

        // Anything the prover left behind without us recording it goes too.
        if let Err(e) = std::fs::remove_dir(&self.dir) {
            match e.kind() {
                io::ErrorKind::NotFound => {}
                _ => {
                    if let Err(e) = std::fs::remove_dir_all(&self.dir) {
                        report.failures += 1;
                        warn!(session_id = %self.session_id, dir = %self.dir.display(), error = %e, "failed to remove scratch directory");
                    }
                }
            }
        }

        debug!(
            session_id = %self.session_id,
            removed_files = report.removed_files,
            failures = report.failures,
            "scratch released"
        );
        report
    }
}

impl Drop for ScratchSession {
    fn drop(&mut self) {
        if !self.released {
            warn!(session_id = %self.session_id, "scratch session dropped without release");
            self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (tempfile::TempDir, ScratchManager) {
        let root = tempfile::tempdir().unwrap();
        let mgr = ScratchManager::with_root(root.path().to_path_buf(), ScratchBacking::Configured).unwrap();
        (root, mgr)
    }

    #[test]
    fn test_acquire_and_release() {
        let (_root, mgr) = manager();
        let id = SessionId("s1".to_string());
        let mut session = mgr.acquire(&id).unwrap();
        assert!(session.dir().is_dir());
        assert_eq!(mgr.active_sessions(), 1);

        let input = session.write_file(INPUT_FILENAME, b"{}").unwrap();
        let proof = session.write_file(PROOF_FILENAME, b"{}").unwrap();
        assert_eq!(session.files().len(), 2);

        let dir = session.dir().to_path_buf();
        let report = session.release();
        assert!(report.performed);
        assert_eq!(report.removed_files, 2);
        assert_eq!(report.failures, 0);
        assert!(!input.exists());
        assert!(!proof.exists());
        assert!(!dir.exists());
        assert_eq!(mgr.active_sessions(), 0);

        // second release is a no-op
        let again = session.release();
        assert!(!again.performed);
        assert_eq!(mgr.active_sessions(), 0);
    }

    #[test]
    fn test_untracked_files_removed() {
        let (_root, mgr) = manager();
        let mut session = mgr.acquire(&SessionId("s2".to_string())).unwrap();
        let stray = session.path(WITNESS_FILENAME);
        std::fs::write(&stray, b"witness").unwrap();
        std::fs::create_dir(session.path("nested")).unwrap();
        std::fs::write(session.path("nested").join("x"), b"x").unwrap();

        let dir = session.dir().to_path_buf();
        session.release();
        assert!(!stray.exists());
        assert!(!dir.exists());
    }

    #[test]
    fn test_drop_releases() {
        let (_root, mgr) = manager();
        let dir = {
            let mut session = mgr.acquire(&SessionId("s3".to_string())).unwrap();
            session.write_file(INPUT_FILENAME, b"[]").unwrap();
            session.dir().to_path_buf()
        };
        assert!(!dir.exists());
        assert_eq!(mgr.active_sessions(), 0);
    }

    #[test]
    fn test_sessions_never_share_a_directory() {
        let (_root, mgr) = manager();
        let id = SessionId("dup".to_string());
        let _first = mgr.acquire(&id).unwrap();
        assert!(matches!(mgr.acquire(&id), Err(SessionError::Storage(_))));
    }

    #[test]
    fn test_unsafe_session_id_rejected() {
        let (_root, mgr) = manager();
        assert!(matches!(
            mgr.acquire(&SessionId("../escape".to_string())),
            Err(SessionError::Storage(_))
        ));
    }

    #[test]
    fn test_sweep_stale() {
        let (root, mgr) = manager();
        std::fs::create_dir(root.path().join("proofd-old")).unwrap();
        std::fs::write(root.path().join("proofd-old").join(PROOF_FILENAME), b"x").unwrap();
        std::fs::create_dir(root.path().join("unrelated")).unwrap();
        std::fs::write(root.path().join("proofd-file"), b"x").unwrap();

        assert_eq!(mgr.sweep_stale(), 1);
        assert!(!root.path().join("proofd-old").exists());
        assert!(root.path().join("unrelated").exists());
        assert!(root.path().join("proofd-file").exists());
    }

    #[test]
    fn test_sweep_spares_live_sessions_of_other_managers() {
        let (root, a) = manager();
        let b = ScratchManager::with_root(root.path().to_path_buf(), ScratchBacking::Configured).unwrap();

        let mut live = a.acquire(&SessionId("live".to_string())).unwrap();
        live.write_file(INPUT_FILENAME, b"{}").unwrap();

        // left by a crashed process: lock file present but nobody holds it
        let crashed = root.path().join("proofd-crashed");
        std::fs::create_dir(&crashed).unwrap();
        std::fs::write(crashed.join(LOCK_FILENAME), b"").unwrap();

        assert_eq!(b.sweep_stale(), 1);
        assert!(live.dir().is_dir());
        assert!(live.path(INPUT_FILENAME).exists());
        assert!(!crashed.exists());

        let dir = live.dir().to_path_buf();
        assert!(live.release().performed);
        assert!(!dir.exists());
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
        assert_eq!(b.sweep_stale(), 0);
    }

    #[test]
    fn test_released_session_is_swept_if_dir_reappears() {
        let (root, mgr) = manager();
        let mut session = mgr.acquire(&SessionId("late".to_string())).unwrap();
        let dir = session.dir().to_path_buf();
        session.release();

        // a prover that was still writing recreated the directory
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(dir.join(PROOF_FILENAME), b"{}").unwrap();
        assert_eq!(mgr.sweep_stale(), 1);
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_select_root_prefers_configured() {
        let config = ScratchConfig {
            scratch_root_path: Some(PathBuf::from("/tmp/proofd-test-root")),
            ..Default::default()
        };
        let (root, backing) = select_root(&config);
        assert_eq!(root, PathBuf::from("/tmp/proofd-test-root"));
        assert_eq!(backing, ScratchBacking::Configured);

        // an impossible free-space requirement forces the disk fallback
        let config = ScratchConfig {
            min_free_space: format!("{}", u64::MAX),
            ..Default::default()
        };
        let (root, backing) = select_root(&config);
        assert_eq!(backing, ScratchBacking::Disk);
        assert_eq!(root, std::env::temp_dir());
    }
}
