use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use db::Db;
use models::{FileEvent, RemoteConfig};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use utilities::{FileSystem, RealFileSystem};

use crate::api::{self, HttpIngestApi, IngestApi};
use crate::worker;

/// Sources never block: the funnel is bounded and coalescing happens in
/// the orchestrator.
const EVENT_QUEUE_CAPACITY: usize = 100;

/// Internal control messages. Settling timers and workers never mutate the
/// per-path maps themselves; they message the orchestrator instead.
#[derive(Debug)]
enum Control {
    Start { path: PathBuf, gen: u64 },
    Finish { path: PathBuf },
}

/// Transient per-path tracking while a file settles. Lives from the first
/// observed event until the settling timer promotes the path.
struct FileState {
    size: u64,
    mod_ns: i64,
    gen: u64,
    timer: JoinHandle<()>,
}

/// One agent process: one pipeline plus one heartbeat per configured
/// remote, all stopped by a single cancellation token.
pub struct Agent {
    remotes: Vec<RemoteConfig>,
    db: Arc<Mutex<Db>>,
    fs: Arc<dyn FileSystem>,
    api: Arc<dyn IngestApi>,
}

impl Agent {
    pub fn new(remotes: Vec<RemoteConfig>, db: Db) -> Self {
        Self::with_parts(
            remotes,
            Arc::new(Mutex::new(db)),
            Arc::new(RealFileSystem::new()),
            Arc::new(HttpIngestApi::new()),
        )
    }

    pub fn with_parts(
        remotes: Vec<RemoteConfig>,
        db: Arc<Mutex<Db>>,
        fs: Arc<dyn FileSystem>,
        api: Arc<dyn IngestApi>,
    ) -> Self {
        Self {
            remotes,
            db,
            fs,
            api,
        }
    }

    pub async fn run(self, token: CancellationToken) {
        if self.remotes.is_empty() {
            info!("No remotes configured. Idling...");
            token.cancelled().await;
            return;
        }

        let mut handles = Vec::new();
        for remote in self.remotes {
            handles.push(tokio::spawn(api::pinger(
                self.api.clone(),
                remote.clone(),
                token.clone(),
            )));
            handles.push(tokio::spawn(watch_remote(
                remote,
                self.db.clone(),
                self.fs.clone(),
                self.api.clone(),
                token.clone(),
            )));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }
}

/// One remote's ingestion pipeline: event funnel, orchestrator, sources.
/// Runs until the token is cancelled.
pub async fn watch_remote(
    remote: RemoteConfig,
    db: Arc<Mutex<Db>>,
    fs: Arc<dyn FileSystem>,
    api: Arc<dyn IngestApi>,
    token: CancellationToken,
) {
    info!("[{}] Starting watcher on: {}", remote.name, remote.path.display());

    if fs.metadata(&remote.path).is_err() {
        info!("[{}] Creating directory: {}", remote.name, remote.path.display());
        if let Err(e) = fs.create_dir_all(&remote.path) {
            error!(
                "[{}] Could not create {}: {e}",
                remote.name,
                remote.path.display()
            );
        }
    }

    let remote = Arc::new(remote);
    let (event_tx, event_rx) = mpsc::channel::<FileEvent>(EVENT_QUEUE_CAPACITY);
    let (ctrl_tx, ctrl_rx) = mpsc::channel::<Control>(EVENT_QUEUE_CAPACITY);

    let orchestrator = Orchestrator::new(
        remote.clone(),
        db,
        fs.clone(),
        api,
        ctrl_tx,
        token.clone(),
    );
    let orchestrator_task = tokio::spawn(orchestrator.run(event_rx, ctrl_rx));

    if !remote.disable_fsnotify {
        tokio::spawn(run_notifier(
            remote.clone(),
            event_tx.clone(),
            fs.clone(),
            token.clone(),
        ));
    } else {
        info!(
            "[{}] Real-time events disabled. Running in polling-only mode.",
            remote.name
        );
    }

    tokio::spawn(run_poller(
        remote.clone(),
        event_tx.clone(),
        fs.clone(),
        token.clone(),
    ));

    // Initial sweep of whatever is already sitting in the directory.
    scan_directory(fs.as_ref(), &remote.path, &event_tx);

    token.cancelled().await;
    let _ = orchestrator_task.await;
}

/// Single owner of the per-path state maps. Every transition runs on this
/// task, so no locking is needed for `pending`/`active`.
struct Orchestrator {
    remote: Arc<RemoteConfig>,
    db: Arc<Mutex<Db>>,
    fs: Arc<dyn FileSystem>,
    api: Arc<dyn IngestApi>,
    ctrl_tx: mpsc::Sender<Control>,
    token: CancellationToken,
    semaphore: Arc<Semaphore>,
    pending: HashMap<PathBuf, FileState>,
    active: HashSet<PathBuf>,
}

impl Orchestrator {
    fn new(
        remote: Arc<RemoteConfig>,
        db: Arc<Mutex<Db>>,
        fs: Arc<dyn FileSystem>,
        api: Arc<dyn IngestApi>,
        ctrl_tx: mpsc::Sender<Control>,
        token: CancellationToken,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(remote.concurrency_limit()));
        Self {
            remote,
            db,
            fs,
            api,
            ctrl_tx,
            token,
            semaphore,
            pending: HashMap::new(),
            active: HashSet::new(),
        }
    }

    async fn run(
        mut self,
        mut event_rx: mpsc::Receiver<FileEvent>,
        mut ctrl_rx: mpsc::Receiver<Control>,
    ) {
        let token = self.token.clone();
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                maybe_event = event_rx.recv() => {
                    let Some(event) = maybe_event else {
                        break;
                    };
                    self.handle_event(event);
                }
                maybe_msg = ctrl_rx.recv() => {
                    let Some(msg) = maybe_msg else {
                        break;
                    };
                    self.handle_control(msg);
                }
            }
        }
        // Pending timers are abandoned on shutdown; their Start messages
        // have nowhere to land once this loop exits.
        for (_, state) in self.pending.drain() {
            state.timer.abort();
        }
    }

    fn handle_event(&mut self, event: FileEvent) {
        if self.active.contains(&event.path) {
            debug!(
                "[{}] Ignoring event for {}: already in worker pool",
                self.remote.name,
                worker::file_name(&event.path)
            );
            return;
        }

        let delay = self.remote.settling_delay();
        match self.pending.entry(event.path.clone()) {
            Entry::Occupied(mut entry) => {
                let state = entry.get_mut();
                if event.size != state.size || event.mod_ns != state.mod_ns {
                    debug!(
                        "[{}] Metadata changed for {} ({} -> {} bytes); resetting settling timer",
                        self.remote.name,
                        worker::file_name(&event.path),
                        state.size,
                        event.size
                    );
                    state.timer.abort();
                    state.size = event.size;
                    state.mod_ns = event.mod_ns;
                    state.gen += 1;
                    state.timer = spawn_settling_timer(
                        event.path,
                        state.gen,
                        delay,
                        self.ctrl_tx.clone(),
                    );
                } else {
                    debug!(
                        "[{}] Redundant event for {}: metadata identical, keeping current timer",
                        self.remote.name,
                        worker::file_name(&event.path)
                    );
                }
            }
            Entry::Vacant(entry) => {
                debug!(
                    "[{}] New file discovered: {} ({} bytes); starting settling timer",
                    self.remote.name,
                    worker::file_name(&event.path),
                    event.size
                );
                let timer =
                    spawn_settling_timer(event.path, 0, delay, self.ctrl_tx.clone());
                entry.insert(FileState {
                    size: event.size,
                    mod_ns: event.mod_ns,
                    gen: 0,
                    timer,
                });
            }
        }
    }

    fn handle_control(&mut self, msg: Control) {
        match msg {
            Control::Start { path, gen } => {
                // A Start from a timer that was superseded by a newer event
                // carries a stale generation and must not admit the file.
                let current = self.pending.get(&path).map(|s| s.gen);
                if current != Some(gen) {
                    debug!(
                        "[{}] Stale settling timer for {}; ignoring",
                        self.remote.name,
                        worker::file_name(&path)
                    );
                    return;
                }
                self.pending.remove(&path);
                if !self.active.insert(path.clone()) {
                    return;
                }
                debug!(
                    "[{}] Settling period over for {}; dispatching to worker pool",
                    self.remote.name,
                    worker::file_name(&path)
                );
                self.dispatch(path);
            }
            Control::Finish { path } => {
                self.active.remove(&path);
                debug!(
                    "[{}] Processing cycle complete for {}",
                    self.remote.name,
                    worker::file_name(&path)
                );
            }
        }
    }

    fn dispatch(&self, path: PathBuf) {
        let remote = self.remote.clone();
        let db = self.db.clone();
        let fs = self.fs.clone();
        let api = self.api.clone();
        let semaphore = self.semaphore.clone();
        let ctrl_tx = self.ctrl_tx.clone();
        let token = self.token.clone();

        tokio::spawn(async move {
            worker::process_file(
                &remote,
                &path,
                &db,
                fs.as_ref(),
                api.as_ref(),
                &semaphore,
                &token,
            )
            .await;
            // Always release the active-set entry, whatever the outcome.
            let _ = ctrl_tx.send(Control::Finish { path }).await;
        });
    }
}

fn spawn_settling_timer(
    path: PathBuf,
    gen: u64,
    delay: Duration,
    ctrl_tx: mpsc::Sender<Control>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        sleep(delay).await;
        let _ = ctrl_tx.send(Control::Start { path, gen }).await;
    })
}

/// Probe a candidate path and emit an event if it is eligible: a regular
/// file whose base name does not start with a dot. Failed probes are
/// silently dropped; so are events the bounded queue cannot take.
fn probe_and_send(fs: &dyn FileSystem, path: &Path, tx: &mpsc::Sender<FileEvent>) {
    let Ok(md) = fs.metadata(path) else {
        return;
    };
    if !md.is_file {
        return;
    }
    let Some(name) = path.file_name() else {
        return;
    };
    if name.to_string_lossy().starts_with('.') {
        return;
    }
    let _ = tx.try_send(FileEvent {
        path: path.to_path_buf(),
        size: md.len,
        mod_ns: md.modified_ns(),
    });
}

fn scan_directory(fs: &dyn FileSystem, dir: &Path, tx: &mpsc::Sender<FileEvent>) {
    let Ok(entries) = fs.read_dir(dir) else {
        return;
    };
    for entry in entries {
        probe_and_send(fs, &entry.path, tx);
    }
}

/// Backup scan: re-enumerates the directory every `polling_interval` so
/// files survive missed notifications.
async fn run_poller(
    remote: Arc<RemoteConfig>,
    event_tx: mpsc::Sender<FileEvent>,
    fs: Arc<dyn FileSystem>,
    token: CancellationToken,
) {
    let mut ticker = interval(remote.polling_interval());
    // The first tick completes immediately; the initial scan already ran.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                debug!("[{}] Starting backup directory scan", remote.name);
                scan_directory(fs.as_ref(), &remote.path, &event_tx);
            }
        }
    }
}

async fn run_notifier(
    remote: Arc<RemoteConfig>,
    event_tx: mpsc::Sender<FileEvent>,
    fs: Arc<dyn FileSystem>,
    token: CancellationToken,
) {
    let _ = tokio::task::spawn_blocking(move || {
        watch_blocking(remote, event_tx, fs, token);
    })
    .await;
}

/* Blocking notify drain for a single watched directory */

fn watch_blocking(
    remote: Arc<RemoteConfig>,
    event_tx: mpsc::Sender<FileEvent>,
    fs: Arc<dyn FileSystem>,
    token: CancellationToken,
) {
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration as StdDuration;

    let (tx_notify, rx_notify) = std_mpsc::channel();

    let mut watcher: RecommendedWatcher = match notify::recommended_watcher(move |res| {
        let _ = tx_notify.send(res);
    }) {
        Ok(w) => w,
        Err(e) => {
            error!(
                "[{}] Failed to create watcher for {}: {e}",
                remote.name,
                remote.path.display()
            );
            return;
        }
    };

    if let Err(e) = watcher.watch(&remote.path, RecursiveMode::NonRecursive) {
        error!(
            "[{}] Failed to watch {}: {e}",
            remote.name,
            remote.path.display()
        );
        return;
    }

    info!("[{}] Watching {}", remote.name, remote.path.display());

    loop {
        if token.is_cancelled() {
            break;
        }

        let event = match rx_notify.recv_timeout(StdDuration::from_millis(500)) {
            Ok(Ok(event)) => event,
            Ok(Err(e)) => {
                error!("[{}] Watch error on {}: {e}", remote.name, remote.path.display());
                continue;
            }
            Err(std_mpsc::RecvTimeoutError::Timeout) => continue,
            Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                warn!("[{}] Watcher channel closed for {}", remote.name, remote.path.display());
                break;
            }
        };

        // Only create and write activity feeds the funnel; each path is
        // re-stated so the event carries current metadata.
        if !matches!(
            event.kind,
            notify::EventKind::Create(_) | notify::EventKind::Modify(_)
        ) {
            continue;
        }
        for path in event.paths {
            probe_and_send(fs.as_ref(), &path, &event_tx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{probe_and_send, watch_remote};
    use crate::api::VirtualIngestApi;
    use db::Db;
    use models::{FileEvent, RemoteConfig, UploadStatus};
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::{mpsc, Mutex};
    use tokio_util::sync::CancellationToken;
    use utilities::{FileSystem, VirtualFileSystem};

    fn remote() -> RemoteConfig {
        RemoteConfig {
            name: "r".to_string(),
            path: "/watch".into(),
            endpoint: "https://api.example.com".to_string(),
            key: "k".to_string(),
            stability_threshold: 1,
            check_interval: "10ms".to_string(),
            stability_timeout: "2s".to_string(),
            concurrency_limit: 2,
            polling_interval: "50ms".to_string(),
            settling_delay: "40ms".to_string(),
            disable_fsnotify: true,
        }
    }

    struct TestPipeline {
        remote: RemoteConfig,
        db: Arc<Mutex<Db>>,
        fs: VirtualFileSystem,
        api: Arc<VirtualIngestApi>,
        token: CancellationToken,
    }

    impl TestPipeline {
        fn new(remote: RemoteConfig) -> Self {
            Self {
                remote,
                db: Arc::new(Mutex::new(Db::open_in_memory().unwrap())),
                fs: VirtualFileSystem::new(),
                api: Arc::new(VirtualIngestApi::new()),
                token: CancellationToken::new(),
            }
        }

        fn spawn(&self) -> tokio::task::JoinHandle<()> {
            tokio::spawn(watch_remote(
                self.remote.clone(),
                self.db.clone(),
                Arc::new(self.fs.clone()),
                self.api.clone(),
                self.token.clone(),
            ))
        }

        async fn shutdown(self, handle: tokio::task::JoinHandle<()>) {
            self.token.cancel();
            let _ = handle.await;
        }
    }

    async fn wait_until<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cond()
    }

    #[test]
    fn probe_filters_directories_and_dot_names() {
        let fs = VirtualFileSystem::new();
        fs.write(Path::new("/watch/a.pdf"), b"x").unwrap();
        fs.write(Path::new("/watch/.hidden"), b"x").unwrap();
        fs.create_dir_all(Path::new("/watch/.done")).unwrap();
        fs.create_dir_all(Path::new("/watch/sub")).unwrap();

        let (tx, mut rx) = mpsc::channel::<FileEvent>(10);
        probe_and_send(&fs, Path::new("/watch/a.pdf"), &tx);
        probe_and_send(&fs, Path::new("/watch/.hidden"), &tx);
        probe_and_send(&fs, Path::new("/watch/.done"), &tx);
        probe_and_send(&fs, Path::new("/watch/sub"), &tx);
        probe_and_send(&fs, Path::new("/watch/missing.pdf"), &tx);

        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.path, Path::new("/watch/a.pdf"));
        assert_eq!(ev.size, 1);
        assert!(rx.try_recv().is_err(), "only the regular file is eligible");
    }

    #[tokio::test]
    async fn polling_pipeline_uploads_and_moves_a_settled_file() {
        let pipeline = TestPipeline::new(remote());
        pipeline.fs.write(Path::new("/watch/a.pdf"), b"ten bytes!").unwrap();
        let handle = pipeline.spawn();

        let fs = pipeline.fs.clone();
        let moved = wait_until(
            || fs.read(Path::new("/watch/.done/a.pdf")).is_ok(),
            Duration::from_secs(3),
        )
        .await;
        assert!(moved, "file should be uploaded and moved to .done");
        assert_eq!(pipeline.api.upload_count(), 1);

        let rec = pipeline
            .db
            .lock()
            .await
            .get_record(Path::new("/watch/a.pdf"))
            .unwrap();
        assert_eq!(rec.status, Some(UploadStatus::Verified));
        assert_eq!(rec.error_count, 0);

        pipeline.shutdown(handle).await;
    }

    #[tokio::test]
    async fn repeated_identical_probes_coalesce_into_one_upload() {
        let mut cfg = remote();
        // The poller fires several times within one settling window. If
        // identical probes reset the timer, the file never settles and the
        // wait below times out.
        cfg.polling_interval = "50ms".to_string();
        cfg.settling_delay = "300ms".to_string();
        let pipeline = TestPipeline::new(cfg);
        pipeline.fs.write(Path::new("/watch/c.pdf"), b"storm").unwrap();
        let handle = pipeline.spawn();

        let fs = pipeline.fs.clone();
        let moved = wait_until(
            || fs.read(Path::new("/watch/.done/c.pdf")).is_ok(),
            Duration::from_secs(3),
        )
        .await;
        assert!(moved, "identical probes must keep the original settling timer");
        assert_eq!(pipeline.api.upload_count(), 1);

        pipeline.shutdown(handle).await;
    }

    #[tokio::test]
    async fn file_growing_during_settling_is_uploaded_once_with_final_bytes() {
        let mut cfg = remote();
        // Two checks 50ms apart must both pass; a writer appending every
        // 20ms cannot sneak an upload in between.
        cfg.polling_interval = "25ms".to_string();
        cfg.settling_delay = "60ms".to_string();
        cfg.check_interval = "50ms".to_string();
        cfg.stability_threshold = 2;
        let pipeline = TestPipeline::new(cfg);
        pipeline.fs.write(Path::new("/watch/b.pdf"), b"\x01").unwrap();
        let handle = pipeline.spawn();

        // Keep appending for a while, then stop.
        for i in 2..=8u8 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let data: Vec<u8> = (1..=i).collect();
            pipeline.fs.write(Path::new("/watch/b.pdf"), &data).unwrap();
        }

        let fs = pipeline.fs.clone();
        let moved = wait_until(
            || fs.read(Path::new("/watch/.done/b.pdf")).is_ok(),
            Duration::from_secs(5),
        )
        .await;
        assert!(moved);
        assert_eq!(pipeline.api.upload_count(), 1, "one settled upload only");
        assert_eq!(
            pipeline.api.uploads()[0].bytes,
            (1..=8u8).collect::<Vec<u8>>(),
            "the final byte-epoch is what ships"
        );

        pipeline.shutdown(handle).await;
    }

    #[tokio::test]
    async fn restart_with_verified_record_self_heals_without_upload() {
        let pipeline = TestPipeline::new(remote());
        pipeline.fs.write(Path::new("/watch/e.pdf"), b"delivered").unwrap();
        let mod_ns = pipeline
            .fs
            .metadata(Path::new("/watch/e.pdf"))
            .unwrap()
            .modified_ns();
        pipeline
            .db
            .lock()
            .await
            .update_status(
                Path::new("/watch/e.pdf"),
                UploadStatus::Verified,
                "abc",
                mod_ns,
                9,
            )
            .unwrap();

        let handle = pipeline.spawn();

        let fs = pipeline.fs.clone();
        let moved = wait_until(
            || fs.read(Path::new("/watch/.done/e.pdf")).is_ok(),
            Duration::from_secs(3),
        )
        .await;
        assert!(moved, "self-heal must retry the done-move");
        assert_eq!(pipeline.api.upload_count(), 0, "no re-upload for a delivered epoch");

        pipeline.shutdown(handle).await;
    }

    #[tokio::test]
    async fn finished_path_can_be_admitted_again_after_new_bytes() {
        let pipeline = TestPipeline::new(remote());
        pipeline.fs.write(Path::new("/watch/again.pdf"), b"first").unwrap();
        let handle = pipeline.spawn();

        let fs = pipeline.fs.clone();
        assert!(
            wait_until(
                || fs.read(Path::new("/watch/.done/again.pdf")).is_ok(),
                Duration::from_secs(3),
            )
            .await
        );

        // Same path reappears with new content.
        pipeline.fs.write(Path::new("/watch/again.pdf"), b"second!").unwrap();
        let api = pipeline.api.clone();
        assert!(
            wait_until(|| api.upload_count() == 2, Duration::from_secs(3)).await,
            "a fresh event after FINISH re-admits the path"
        );

        pipeline.shutdown(handle).await;
    }
}
