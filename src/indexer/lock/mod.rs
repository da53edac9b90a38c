
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, anyhow};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, warn};

use crate::LifelogError;

/// Heartbeats written per staleness window
const HEARTBEATS_PER_WINDOW: u32 = 3;
const MIN_HEARTBEAT_PERIOD: Duration = Duration::from_millis(50);

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(0);

/// Lock file that keeps a second sync process away from the vector index.
///
/// The file holds `<unix millis> <token>`: the time of the last heartbeat and
/// the token of the holder. It is created atomically, refreshed by a
/// background task for as long as the lock lives, and removed on drop only
/// while it still carries this holder's token. A lock whose heartbeat is
/// older than `stale_after` belongs to a process that died without cleaning
/// up and is taken over.
#[derive(Debug)]
pub struct SyncLock {
    path: PathBuf,
    stale_after: Duration,
    token: String,
    heartbeat_task: JoinHandle<()>,
}

/// Parsed contents of a lock file
#[derive(Debug, Clone, PartialEq, Eq)]
struct LockState {
    age: Duration,
    token: Option<String>,
    raw: String,
}

impl SyncLock {
    /// Acquire the lock at `path`, failing if a live sync process holds it
    #[inline]
    pub async fn acquire<P: AsRef<Path>>(path: P, stale_after: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create lock directory: {}", parent.display()))?;
        }

        let token = new_token();
        if !try_create(&path, &token).await? {
            match read_state(&path).await? {
                Some(state) if state.age < stale_after => {
                    return Err(already_running(&path, state.age));
                }
                Some(state) => {
                    warn!(
                        "Taking over stale sync lock {} (last heartbeat {}s ago)",
                        path.display(),
                        state.age.as_secs()
                    );
                    remove_if_unchanged(&path, &state.raw).await?;
                }
                None => {}
            }

            if !try_create(&path, &token).await? {
                return Err(LifelogError::Database(format!(
                    "Another sync process acquired the lock file {} first",
                    path.display()
                ))
                .into());
            }
        }

        let heartbeat_task = start_heartbeat_task(
            path.clone(),
            token.clone(),
            heartbeat_period(stale_after),
        );

        debug!("Acquired sync lock {} ({})", path.display(), token);
        Ok(Self {
            path,
            stale_after,
            token,
            heartbeat_task,
        })
    }

    /// Record that the holder is still alive. Fails once another process
    /// owns the lock file.
    #[inline]
    pub async fn heartbeat(&self) -> Result<()> {
        write_heartbeat(&self.path, &self.token).await
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    #[inline]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Whether the lock file still carries this holder's token
    #[inline]
    pub async fn is_owned(&self) -> Result<bool> {
        Ok(read_state(&self.path)
            .await?
            .is_some_and(|state| state.token.as_deref() == Some(self.token.as_str())))
    }

    /// Whether a live sync process currently holds the lock at `path`
    #[inline]
    pub async fn is_held<P: AsRef<Path>>(path: P, stale_after: Duration) -> Result<bool> {
        Ok(read_state(path.as_ref())
            .await?
            .is_some_and(|state| state.age < stale_after))
    }
}

impl Drop for SyncLock {
    #[inline]
    fn drop(&mut self) {
        self.heartbeat_task.abort();

        match std::fs::read_to_string(&self.path) {
            Ok(content) if parse_token(&content) == Some(self.token.as_str()) => {
                if let Err(e) = std::fs::remove_file(&self.path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!("Failed to remove sync lock {}: {}", self.path.display(), e);
                    }
                }
            }
            Ok(_) => warn!(
                "Sync lock {} was taken over by another process; leaving it in place",
                self.path.display()
            ),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to read sync lock {}: {}", self.path.display(), e),
        }
    }
}

/// Keep the lock fresh independently of how long a sync cycle takes
fn start_heartbeat_task(path: PathBuf, token: String, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately and the file is already fresh
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Err(e) = write_heartbeat(&path, &token).await {
                warn!("Stopping sync lock heartbeat: {:#}", e);
                break;
            }
        }
    })
}

fn heartbeat_period(stale_after: Duration) -> Duration {
    (stale_after / HEARTBEATS_PER_WINDOW).max(MIN_HEARTBEAT_PERIOD)
}

fn already_running(path: &Path, age: Duration) -> anyhow::Error {
    LifelogError::Database(format!(
        "Another sync process is already running (lock file {} updated {}s ago)",
        path.display(),
        age.as_secs()
    ))
    .into()
}

/// Create the lock file if nobody else has; `false` when it already exists
async fn try_create(path: &Path, token: &str) -> Result<bool> {
    let mut file = match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
    {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
        Err(e) => {
            return Err(e)
                .with_context(|| format!("Failed to create sync lock file: {}", path.display()));
        }
    };

    file.write_all(lock_contents(token).as_bytes())
        .await
        .with_context(|| format!("Failed to write sync lock file: {}", path.display()))?;
    file.flush().await?;
    Ok(true)
}

async fn write_heartbeat(path: &Path, token: &str) -> Result<()> {
    let state = read_state(path)
        .await?
        .ok_or_else(|| anyhow!("sync lock file {} was removed", path.display()))?;
    if state.token.as_deref() != Some(token) {
        return Err(anyhow!(
            "sync lock file {} now belongs to another process",
            path.display()
        ));
    }

    fs::write(path, lock_contents(token))
        .await
        .with_context(|| format!("Failed to write sync lock file: {}", path.display()))
}

/// Remove a stale lock unless another process rewrote it since it was read
async fn remove_if_unchanged(path: &Path, seen: &str) -> Result<()> {
    match read_state(path).await? {
        Some(state) if state.raw == seen => match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to remove stale sync lock: {}", path.display())),
        },
        _ => Ok(()),
    }
}

/// Current lock file state, or `None` when no lock file exists.
///
/// A file whose heartbeat cannot be parsed, such as one caught between
/// creation and its first write, is aged by its modification time.
async fn read_state(path: &Path) -> Result<Option<LockState>> {
    let raw = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e)
                .with_context(|| format!("Failed to read sync lock file: {}", path.display()));
        }
    };

    let age = match parse_heartbeat(&raw) {
        Some(written) => Duration::from_millis(unix_millis().saturating_sub(written)),
        None => modified_age(path).await,
    };

    Ok(Some(LockState {
        age,
        token: parse_token(&raw).map(str::to_string),
        raw,
    }))
}

async fn modified_age(path: &Path) -> Duration {
    fs::metadata(path)
        .await
        .and_then(|metadata| metadata.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .unwrap_or(Duration::ZERO)
}

fn lock_contents(token: &str) -> String {
    format!("{} {}\n", unix_millis(), token)
}

fn parse_heartbeat(content: &str) -> Option<u64> {
    content.split_whitespace().next()?.parse().ok()
}

fn parse_token(content: &str) -> Option<&str> {
    content.split_whitespace().nth(1)
}

fn new_token() -> String {
    format!(
        "{}-{}-{}",
        std::process::id(),
        unix_millis(),
        NEXT_TOKEN.fetch_add(1, Ordering::Relaxed)
    )
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}
