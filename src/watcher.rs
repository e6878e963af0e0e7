//! Filesystem watch on the EPG input directory.
//!
//! Bridges `notify` events into the daemon's channel. Create and
//! close-after-write both fire (a create on a half-written document
//! fails XML parsing with a warning; the close-write pass succeeds), and
//! directory events are filtered out here.

use std::path::{Path, PathBuf};

use notify::event::{AccessKind, AccessMode, CreateKind, EventKind};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::warn;

/// Keeps the underlying watcher alive; dropping it stops the watch.
pub struct DirectoryWatcher {
    _watcher: RecommendedWatcher,
}

/// Watch `dir`, sending the full path of every created or close-written
/// file on `tx`.
pub fn watch(dir: &Path, tx: mpsc::UnboundedSender<PathBuf>) -> notify::Result<DirectoryWatcher> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, "Filesystem watch error");
                return;
            }
        };
        if !is_file_written(&event.kind) {
            return;
        }
        for path in event.paths {
            if path.is_dir() {
                continue;
            }
            // Receiver gone means the daemon is shutting down.
            let _ = tx.send(path);
        }
    })?;
    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    Ok(DirectoryWatcher { _watcher: watcher })
}

fn is_file_written(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(CreateKind::File)
            | EventKind::Create(CreateKind::Any)
            | EventKind::Access(AccessKind::Close(AccessMode::Write))
    )
}
