//! Self-update: fetch → verify → back up → install → reboot.
//!
//! ```text
//! Idle ─▶ Fetching ─▶ Verifying ─▶ BackingUp ─▶ Installing ─▶ Rebooting
//!            │            │             │            │
//!            └────────────┴─────────────┴────────────┴──▶ Aborted
//! ```
//!
//! The running program is never touched until a complete, non-empty artifact
//! sits next to it. The backup is a copy, and the install is one `rename`
//! over the program path, so at every instant either the old or the new
//! program is complete at that path.
//!
//! The artifact is only integrity-checked when a SHA-256 is configured.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

use crate::ports::{ArtifactSource, ChatLink, Clock};

/// Pause before the reset so the last acknowledgement can leave the node.
pub(crate) const REBOOT_DELAY: Duration = Duration::from_secs(1);

const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UpdatePhase {
    Idle,
    Fetching,
    Verifying,
    BackingUp,
    Installing,
    Rebooting,
    Aborted,
}

#[derive(Debug, Error)]
pub(crate) enum FetchError {
    #[error("update source answered with status {0}")]
    Status(u16),
    #[error("update transfer failed: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub(crate) enum UpdateError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("could not stage artifact: {0}")]
    Stage(#[source] io::Error),
    #[error("downloaded artifact is empty")]
    EmptyArtifact,
    #[error("artifact checksum mismatch (expected {expected}, got {actual})")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("could not back up running program: {0}")]
    Backup(#[source] io::Error),
    #[error("could not install artifact: {0}")]
    Install(#[source] io::Error),
}

impl UpdateError {
    /// The step that was running when the update aborted.
    pub(crate) fn phase(&self) -> UpdatePhase {
        match self {
            Self::Fetch(_) | Self::Stage(_) => UpdatePhase::Fetching,
            Self::EmptyArtifact | Self::ChecksumMismatch { .. } => UpdatePhase::Verifying,
            Self::Backup(_) => UpdatePhase::BackingUp,
            Self::Install(_) => UpdatePhase::Installing,
        }
    }
}

/// Bookkeeping for one update run. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct UpdateAttempt {
    pub source_url: String,
    pub downloaded_bytes: u64,
    pub backup_taken: bool,
    pub installed: bool,
}

/// Where the running program, the staged download, and the backup live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct UpdatePaths {
    pub program: PathBuf,
    pub staging: PathBuf,
    pub backup: PathBuf,
}

impl UpdatePaths {
    /// Fails when any two of program, staging, backup and the backup's temp
    /// copy resolve to the same path.
    pub(crate) fn new(
        program: impl Into<PathBuf>,
        backup: impl Into<PathBuf>,
    ) -> anyhow::Result<Self> {
        let program = program.into();
        let paths = Self {
            staging: sibling(&program, "new"),
            backup: backup.into(),
            program,
        };
        paths.ensure_distinct()?;
        Ok(paths)
    }

    /// `<program>.new` for staging, `<program>.bak` for the backup.
    pub(crate) fn for_program(program: impl Into<PathBuf>) -> Self {
        let program = program.into();
        Self {
            staging: sibling(&program, "new"),
            backup: sibling(&program, "bak"),
            program,
        }
    }

    fn ensure_distinct(&self) -> anyhow::Result<()> {
        let backup_tmp = sibling(&self.backup, "tmp");
        let named = [
            ("program", &self.program),
            ("staging", &self.staging),
            ("backup", &self.backup),
            ("backup temp", &backup_tmp),
        ];
        for (i, (a_name, a)) in named.iter().enumerate() {
            for (b_name, b) in &named[i + 1..] {
                anyhow::ensure!(
                    a != b,
                    "{a_name} and {b_name} paths are both {}",
                    a.display()
                );
            }
        }
        Ok(())
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub(crate) struct UpdateCoordinator<A> {
    source: A,
    url: String,
    paths: UpdatePaths,
    expected_sha256: Option<[u8; 32]>,
}

impl<A: ArtifactSource> UpdateCoordinator<A> {
    pub(crate) fn new(
        source: A,
        url: impl Into<String>,
        paths: UpdatePaths,
        expected_sha256: Option<[u8; 32]>,
    ) -> Self {
        Self {
            source,
            url: url.into(),
            paths,
            expected_sha256,
        }
    }

    #[cfg(test)]
    pub(crate) fn source(&self) -> &A {
        &self.source
    }

    /// Run one update attempt. `Ok` means the new program is installed and
    /// the caller must reset the device; `Err` means the running program is
    /// untouched.
    pub(crate) async fn run<L, C>(
        &self,
        chat: &mut L,
        clock: &C,
    ) -> Result<UpdateAttempt, UpdateError>
    where
        L: ChatLink,
        C: Clock,
    {
        let mut attempt = UpdateAttempt {
            source_url: self.url.clone(),
            downloaded_bytes: 0,
            backup_taken: false,
            installed: false,
        };
        enter(UpdatePhase::Idle);

        if let Err(e) = self.install(&mut attempt).await {
            enter(UpdatePhase::Aborted);
            warn!(step = ?e.phase(), url = %self.url, "update aborted: {e}");
            return Err(e);
        }

        enter(UpdatePhase::Rebooting);
        if let Err(e) = chat.send("Update installed. Rebooting now.").await {
            warn!("chat send failed: {e:#}");
        }
        clock.sleep(REBOOT_DELAY).await;
        Ok(attempt)
    }

    async fn install(&self, attempt: &mut UpdateAttempt) -> Result<(), UpdateError> {
        let paths = &self.paths;

        // Fetching: nothing on disk changes unless the download succeeded.
        enter(UpdatePhase::Fetching);
        info!(url = %self.url, "fetching update artifact");
        let body = self.source.fetch(&self.url).await?;
        if let Err(e) = write_synced(&paths.staging, &body) {
            discard(&paths.staging);
            return Err(UpdateError::Stage(e));
        }

        // Verifying
        enter(UpdatePhase::Verifying);
        let size = match fs::metadata(&paths.staging) {
            Ok(m) => m.len(),
            Err(e) => {
                discard(&paths.staging);
                return Err(UpdateError::Stage(e));
            }
        };
        attempt.downloaded_bytes = size;
        if size == 0 {
            discard(&paths.staging);
            return Err(UpdateError::EmptyArtifact);
        }
        match self.expected_sha256 {
            Some(expected) => {
                let actual: [u8; 32] = Sha256::digest(&body).into();
                if actual != expected {
                    discard(&paths.staging);
                    return Err(UpdateError::ChecksumMismatch {
                        expected: hex::encode(expected),
                        actual: hex::encode(actual),
                    });
                }
                info!(bytes = size, "artifact checksum verified");
            }
            None => warn!(
                bytes = size,
                "no update checksum configured; installing an unverified artifact"
            ),
        }

        // BackingUp: copy to a temp name first so an old backup is only
        // replaced by a complete one.
        enter(UpdatePhase::BackingUp);
        if paths.program.is_file() {
            let tmp = sibling(&paths.backup, "tmp");
            let backed_up = fs::copy(&paths.program, &tmp)
                .and_then(|_| fs::File::open(&tmp)?.sync_all())
                .and_then(|()| fs::rename(&tmp, &paths.backup));
            if let Err(e) = backed_up {
                discard(&tmp);
                discard(&paths.staging);
                return Err(UpdateError::Backup(e));
            }
            sync_parent(&paths.backup);
            attempt.backup_taken = true;
            info!(backup = %paths.backup.display(), "running program backed up");
        } else {
            warn!(program = %paths.program.display(), "no running program to back up");
        }

        // Installing
        enter(UpdatePhase::Installing);
        if let Err(e) = make_executable(&paths.staging)
            .and_then(|()| fs::rename(&paths.staging, &paths.program))
        {
            discard(&paths.staging);
            return Err(UpdateError::Install(e));
        }
        // The rename is done; only its durability is left.
        sync_parent(&paths.program);
        attempt.installed = true;
        info!(
            program = %paths.program.display(),
            bytes = size,
            "update installed"
        );
        Ok(())
    }
}

fn enter(phase: UpdatePhase) {
    info!(?phase, "update phase");
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

/// Flush the directory entry of `path` so a completed rename survives a
/// power cut.
fn sync_parent(path: &Path) {
    let dir = match path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d,
        _ => Path::new("."),
    };
    if let Err(e) = sync_dir(dir) {
        warn!(dir = %dir.display(), "failed to sync directory: {e}");
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

fn discard(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), "failed to remove: {e}"),
    }
}

#[cfg(unix)]
fn make_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}

// ---------------------------------------------------------------------------
// HTTP artifact source
// ---------------------------------------------------------------------------

/// Downloads the artifact with a single GET.
#[derive(Debug, Clone)]
pub(crate) struct HttpSource {
    client: reqwest::Client,
}

impl HttpSource {
    pub(crate) fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self { client })
    }
}

impl ArtifactSource for HttpSource {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        Ok(body.to_vec())
    }
}

/// Parse a hex-encoded SHA-256 digest.
pub(crate) fn parse_sha256(hex_digest: &str) -> anyhow::Result<[u8; 32]> {
    let bytes = hex::decode(hex_digest.trim())?;
    let digest: [u8; 32] = bytes
        .try_into()
        .map_err(|b: Vec<u8>| anyhow::anyhow!("expected 32 bytes, got {}", b.len()))?;
    Ok(digest)
}

// ===========================================================================
// Tests
// ===========================================================================
