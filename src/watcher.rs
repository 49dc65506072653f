use std::collections::VecDeque;
use std::future::Future;
use std::path::{Path, PathBuf};

use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::paths;
use crate::snapshot::is_sync_artifact;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
    Renamed,
}

/// A single normalized filesystem change, relative to the watched root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub path: String,
    /// Set only for `Renamed`.
    pub old_path: Option<String>,
}

impl ChangeEvent {
    pub fn created(path: impl Into<String>) -> Self {
        Self::simple(ChangeKind::Created, path)
    }

    pub fn modified(path: impl Into<String>) -> Self {
        Self::simple(ChangeKind::Modified, path)
    }

    pub fn deleted(path: impl Into<String>) -> Self {
        Self::simple(ChangeKind::Deleted, path)
    }

    pub fn renamed(old_path: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            kind: ChangeKind::Renamed,
            path: path.into(),
            old_path: Some(old_path.into()),
        }
    }

    fn simple(kind: ChangeKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            old_path: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Idle,
    Watching,
    Stopped,
    Failed,
}

/// Turns raw notify events into `ChangeEvent`s.
///
/// Renames reported as two halves are paired here: the `From` half is parked
/// until its `To` half shows up.
#[derive(Debug)]
pub struct EventNormalizer {
    roots: Vec<PathBuf>,
    ignore: Vec<String>,
    pending_from: Option<String>,
    last_rename: Option<(String, String)>,
}

impl EventNormalizer {
    pub fn new(root: &Path, ignore: Vec<String>) -> Self {
        let mut roots = vec![root.to_path_buf()];
        // Backends may report canonical paths (/private/var vs /var on macOS).
        if let Ok(canonical) = root.canonicalize() {
            if canonical != root {
                roots.push(canonical);
            }
        }
        Self {
            roots,
            ignore,
            pending_from: None,
            last_rename: None,
        }
    }

    fn root(&self) -> &Path {
        &self.roots[0]
    }

    fn relative(&self, path: &Path) -> Option<String> {
        let wire = self.roots.iter().find_map(|root| paths::to_wire(root, path))?;
        let file_name = wire.rsplit('/').next().unwrap_or(&wire);
        if is_sync_artifact(file_name) || paths::is_ignored(&wire, &self.ignore) {
            debug!("Ignoring change to {}", wire);
            return None;
        }
        Some(wire)
    }

    fn is_directory(&self, wire: &str) -> bool {
        let full = self.root().join(wire);
        if full.is_dir() {
            warn!("Skipping event about directory {:?}", full);
            true
        } else {
            false
        }
    }

    /// A parked `From` that is not followed by its `To` left the tree.
    fn flush_pending(&mut self, out: &mut Vec<ChangeEvent>) {
        if let Some(from) = self.pending_from.take() {
            out.push(ChangeEvent::deleted(from));
        }
    }

    fn rename_to(&mut self, to: String, out: &mut Vec<ChangeEvent>) {
        match self.pending_from.take() {
            Some(from) => {
                self.last_rename = Some((from.clone(), to.clone()));
                out.push(ChangeEvent::renamed(from, to));
            }
            None => out.push(ChangeEvent::created(to)),
        }
    }

    fn rename_from(&mut self, from: String, out: &mut Vec<ChangeEvent>) {
        self.flush_pending(out);
        self.pending_from = Some(from);
    }

    pub fn normalize(&mut self, event: Event) -> Vec<ChangeEvent> {
        let mut out = Vec::new();
        let first = event.paths.first().and_then(|p| self.relative(p));

        match event.kind {
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                if let Some(from) = first {
                    self.rename_from(from, &mut out);
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                if let Some(to) = first {
                    self.rename_to(to, &mut out);
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                let second = event.paths.get(1).and_then(|p| self.relative(p));
                match (first, second) {
                    (Some(from), Some(to)) => {
                        let pair = (from, to);
                        if self.last_rename.as_ref() == Some(&pair) {
                            debug!("Rename {} -> {} already reported", pair.0, pair.1);
                        } else {
                            self.flush_pending(&mut out);
                            out.push(ChangeEvent::renamed(pair.0.clone(), pair.1.clone()));
                            self.last_rename = Some(pair);
                        }
                    }
                    // One side lies outside the tree (or is ignored).
                    (Some(from), None) => {
                        self.flush_pending(&mut out);
                        out.push(ChangeEvent::deleted(from));
                    }
                    (None, Some(to)) => {
                        self.flush_pending(&mut out);
                        out.push(ChangeEvent::created(to));
                    }
                    (None, None) => {}
                }
            }
            EventKind::Modify(ModifyKind::Name(_)) => {
                if let Some(path) = first {
                    if self.root().join(&path).exists() {
                        self.rename_to(path, &mut out);
                    } else {
                        self.rename_from(path, &mut out);
                    }
                }
            }
            EventKind::Modify(ModifyKind::Metadata(_)) | EventKind::Access(_) => {}
            EventKind::Create(_) => {
                if let Some(path) = first {
                    self.flush_pending(&mut out);
                    out.push(ChangeEvent::created(path));
                }
            }
            EventKind::Modify(_) => {
                if let Some(path) = first {
                    self.flush_pending(&mut out);
                    out.push(ChangeEvent::modified(path));
                }
            }
            EventKind::Remove(_) => {
                if let Some(path) = first {
                    self.flush_pending(&mut out);
                    out.push(ChangeEvent::deleted(path));
                }
            }
            EventKind::Any | EventKind::Other => {
                debug!("Ignoring unclassified event {:?}", event);
            }
        }

        // Deletions cannot be checked: the path is already gone.
        out.retain(|change| change.kind == ChangeKind::Deleted || !self.is_directory(&change.path));
        out
    }
}

/// Recursive watcher over one root directory.
pub struct DirectoryWatcher {
    root: PathBuf,
    watcher: RecommendedWatcher,
    rx: mpsc::Receiver<notify::Result<Event>>,
    normalizer: EventNormalizer,
    queue: VecDeque<ChangeEvent>,
    state: WatchState,
}

impl DirectoryWatcher {
    pub fn new(root: &Path, ignore: Vec<String>) -> Result<Self> {
        let (tx, rx) = mpsc::channel(1024);

        let watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let _ = tx.blocking_send(res);
            },
            Config::default(),
        )?;

        Ok(Self {
            root: root.to_path_buf(),
            watcher,
            rx,
            normalizer: EventNormalizer::new(root, ignore),
            queue: VecDeque::new(),
            state: WatchState::Idle,
        })
    }

    pub fn state(&self) -> WatchState {
        self.state
    }

    pub fn start(&mut self) -> Result<()> {
        if let Err(e) = self.watcher.watch(&self.root, RecursiveMode::Recursive) {
            self.state = WatchState::Failed;
            return Err(e.into());
        }
        self.state = WatchState::Watching;
        info!("Monitoring directory {:?}", self.root);
        Ok(())
    }

    pub fn stop(&mut self) {
        if self.state == WatchState::Watching {
            if let Err(e) = self.watcher.unwatch(&self.root) {
                warn!("Failed to unwatch {:?}: {}", self.root, e);
            }
            self.state = WatchState::Stopped;
        }
    }

    fn enqueue(&mut self, change: ChangeEvent) {
        // The content is read when the event is sent, so back-to-back
        // modifications still waiting in the queue collapse into one.
        if change.kind == ChangeKind::Modified && self.queue.back() == Some(&change) {
            return;
        }
        self.queue.push_back(change);
    }

    fn absorb(&mut self, res: notify::Result<Event>) -> Result<()> {
        let event = res?;
        for change in self.normalizer.normalize(event) {
            self.enqueue(change);
        }
        Ok(())
    }

    /// Waits for the next change. `None` means the event source is gone.
    pub async fn next_event(&mut self) -> Option<Result<ChangeEvent>> {
        loop {
            while let Ok(res) = self.rx.try_recv() {
                if let Err(e) = self.absorb(res) {
                    return Some(Err(e));
                }
            }
            if let Some(change) = self.queue.pop_front() {
                return Some(Ok(change));
            }
            let res = self.rx.recv().await?;
            if let Err(e) = self.absorb(res) {
                return Some(Err(e));
            }
        }
    }

    /// Runs `on_event` for every change until `cancel` fires.
    ///
    /// A failing handler or a failing event source stops the loop and the
    /// error is returned. The watcher is then `Failed` until `watch` is
    /// called again. Cancellation also interrupts a handler in progress.
    pub async fn watch<F, Fut>(&mut self, cancel: &CancellationToken, mut on_event: F) -> Result<()>
    where
        F: FnMut(ChangeEvent) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if self.state != WatchState::Watching {
            self.start()?;
        }

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    self.stop();
                    return Ok(());
                }
                next = self.next_event() => next,
            };

            let change = match next {
                Some(Ok(change)) => change,
                Some(Err(e)) => {
                    self.state = WatchState::Failed;
                    return Err(e);
                }
                None => {
                    self.state = WatchState::Failed;
                    return Err(SyncError::Transfer("watch event source closed".into()));
                }
            };

            debug!("Change detected: {:?}", change);
            let handled = tokio::select! {
                _ = cancel.cancelled() => {
                    self.stop();
                    return Ok(());
                }
                handled = on_event(change) => handled,
            };
            if let Err(e) = handled {
                self.stop();
                self.state = WatchState::Failed;
                return Err(e);
            }
        }
    }
}
