use std::path::Path;
use std::time::Duration;

use db::Db;
use models::{RemoteConfig, UploadStatus};
use time::OffsetDateTime;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use utilities::{read_file_with_retry, sha256_hex, FileSystem};

use crate::api::{parse_server_hash, IngestApi};

/// Files that have failed more often than this are left alone until an
/// operator runs reset-history.
const MAX_ERROR_COUNT: i64 = 10;
const UPLOAD_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_secs(2);
const READ_RETRY_ATTEMPTS: usize = 5;
const READ_RETRY_DELAY_MS: u64 = 100;

enum UploadOutcome {
    Delivered { server_hash: Option<String> },
    Failed,
    Cancelled,
}

/// Full per-file processing cycle: file-log consult, stability
/// verification, upload, post-upload accounting, done-move. Bounded
/// concurrency applies from the stability loop onwards.
pub(crate) async fn process_file(
    remote: &RemoteConfig,
    path: &Path,
    db: &Mutex<Db>,
    fs: &dyn FileSystem,
    api: &dyn IngestApi,
    semaphore: &Semaphore,
    token: &CancellationToken,
) {
    let Ok(md) = fs.metadata(path) else {
        // Vanished between the settling timer and now.
        return;
    };

    let record = match db.lock().await.get_record(path) {
        Ok(r) => r,
        Err(e) => {
            error!("[{}] File-log read failed for {}: {e}", remote.name, path.display());
            return;
        }
    };

    if record.error_count > MAX_ERROR_COUNT {
        warn!(
            "[{}] Too many errors ({}) for {}; skipping until history is reset",
            remote.name,
            record.error_count,
            file_name(path)
        );
        return;
    }

    // Self-heal: this byte-epoch was already delivered, but a previous
    // done-move may have failed. Retry the move and stop.
    if record.is_delivered_at(md.modified_ns()) {
        move_to_done(fs, path, remote);
        return;
    }

    let _permit = tokio::select! {
        _ = token.cancelled() => return,
        permit = semaphore.acquire() => match permit {
            Ok(p) => p,
            Err(_) => return,
        },
    };

    if !wait_for_stability(remote, path, fs, md.len, token).await {
        return;
    }

    info!("[{}] Uploading: {}", remote.name, file_name(path));

    // Mod time is captured before hashing; the record ties the delivery to
    // this byte-epoch.
    let Ok(md) = fs.metadata(path) else {
        return;
    };
    let mod_ns = md.modified_ns();
    let size = md.len as i64;

    let bytes = match read_file_with_retry(fs, path, READ_RETRY_ATTEMPTS, READ_RETRY_DELAY_MS) {
        Ok(b) => b,
        Err(e) => {
            warn!("[{}] Could not read {}: {e}", remote.name, file_name(path));
            return;
        }
    };
    let local_hash = sha256_hex(&bytes);

    match upload_with_retry(remote, path, api, bytes, token).await {
        UploadOutcome::Delivered { server_hash } => {
            if let Some(server_hash) = server_hash {
                if !server_hash.eq_ignore_ascii_case(&local_hash) {
                    warn!(
                        "[{}] Integrity mismatch for {}: server {} != local {}",
                        remote.name,
                        file_name(path),
                        server_hash,
                        local_hash
                    );
                    let store = db.lock().await;
                    if let Err(e) = store.mark_corrupt(path) {
                        error!("[{}] File-log write failed for {}: {e}", remote.name, path.display());
                    }
                    if let Err(e) = store.increment_error(path) {
                        error!("[{}] File-log write failed for {}: {e}", remote.name, path.display());
                    }
                    return;
                }
            }

            if let Err(e) = db.lock().await.update_status(
                path,
                UploadStatus::Verified,
                &local_hash,
                mod_ns,
                size,
            ) {
                error!("[{}] File-log write failed for {}: {e}", remote.name, path.display());
            }
            move_to_done(fs, path, remote);
        }
        UploadOutcome::Failed => {
            if let Err(e) = db.lock().await.increment_error(path) {
                error!("[{}] File-log write failed for {}: {e}", remote.name, path.display());
            }
        }
        UploadOutcome::Cancelled => {}
    }
}

/// Final verification that the file has stopped changing: the size must be
/// stable and the lock probe must pass for `stability_threshold`
/// consecutive checks. Returns false when the cycle should be abandoned.
async fn wait_for_stability(
    remote: &RemoteConfig,
    path: &Path,
    fs: &dyn FileSystem,
    initial_size: u64,
    token: &CancellationToken,
) -> bool {
    let threshold = remote.stability_threshold();
    let check_interval = remote.check_interval();
    let max_wait = remote.stability_timeout();

    let mut last_size = initial_size;
    let mut stable_count = 0usize;
    let start = Instant::now();

    while stable_count < threshold {
        if start.elapsed() > max_wait {
            error!(
                "[{}] Stability timeout: {}",
                remote.name,
                file_name(path)
            );
            return false;
        }

        tokio::select! {
            _ = token.cancelled() => return false,
            _ = sleep(check_interval) => {}
        }

        let md = match fs.metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(
                    "[{}] {} vanished during stability check",
                    remote.name,
                    file_name(path)
                );
                return false;
            }
            Err(e) => {
                // Transient stat failure: treat like any other instability.
                debug!(
                    "[{}] Stability check error for {}: {e}",
                    remote.name,
                    file_name(path)
                );
                stable_count = 0;
                continue;
            }
        };

        if md.len != last_size {
            debug!(
                "[{}] Size changed for {} ({} -> {} bytes); resetting stability count",
                remote.name,
                file_name(path),
                last_size,
                md.len
            );
            last_size = md.len;
            stable_count = 0;
            continue;
        }

        if fs.open_rw(path).is_err() {
            debug!(
                "[{}] {} is locked or busy; resetting stability count",
                remote.name,
                file_name(path)
            );
            stable_count = 0;
            continue;
        }

        stable_count += 1;
        debug!(
            "[{}] Stability check passed ({}/{}) for {}",
            remote.name,
            stable_count,
            threshold,
            file_name(path)
        );
    }

    true
}

async fn upload_with_retry(
    remote: &RemoteConfig,
    path: &Path,
    api: &dyn IngestApi,
    bytes: Vec<u8>,
    token: &CancellationToken,
) -> UploadOutcome {
    let name = file_name(path);
    for attempt in 1..=UPLOAD_ATTEMPTS {
        match api.upload(remote, &name, bytes.clone()).await {
            Ok(resp) if resp.is_success() => {
                return UploadOutcome::Delivered {
                    server_hash: parse_server_hash(&resp.body),
                };
            }
            Ok(resp) => warn!(
                "[{}] Upload attempt {}/{} for {} rejected: status {}",
                remote.name, attempt, UPLOAD_ATTEMPTS, name, resp.status
            ),
            Err(e) => warn!(
                "[{}] Upload attempt {}/{} for {} failed: {e:#}",
                remote.name, attempt, UPLOAD_ATTEMPTS, name
            ),
        }

        if attempt < UPLOAD_ATTEMPTS {
            tokio::select! {
                _ = token.cancelled() => return UploadOutcome::Cancelled,
                _ = sleep(RETRY_BACKOFF) => {}
            }
        }
    }
    UploadOutcome::Failed
}

/// Relocate a delivered file into the `.done/` sibling directory. A rename
/// failure is logged and the file stays put; the next processing cycle
/// retries via the self-heal branch.
pub(crate) fn move_to_done(fs: &dyn FileSystem, path: &Path, remote: &RemoteConfig) {
    let Some(parent) = path.parent() else {
        return;
    };
    let done_dir = parent.join(".done");
    if let Err(e) = fs.create_dir_all(&done_dir) {
        warn!(
            "[{}] Could not create {}: {e}",
            remote.name,
            done_dir.display()
        );
        return;
    }

    let base = file_name(path);
    let mut dest = done_dir.join(&base);
    if fs.metadata(&dest).is_ok() {
        let epoch = OffsetDateTime::now_utc().unix_timestamp();
        dest = done_dir.join(format!("{epoch}_{base}"));
    }

    match fs.rename(path, &dest) {
        Ok(()) => info!("[{}] Success: {} moved to .done", remote.name, base),
        Err(e) => warn!(
            "[{}] Could not move {} to .done: {e}",
            remote.name, base
        ),
    }
}

pub(crate) fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
