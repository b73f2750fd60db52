use std::path::{Path, PathBuf};

use notify::event::{CreateKind, ModifyKind};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::error::Result;

/// Feeds paths of newly published request files into a channel.
///
/// Dotfiles are skipped, so a client can write `.<name>.tmp` and rename it
/// into place without the half-written file ever being seen.
pub struct MailboxWatcher {
    _watcher: RecommendedWatcher,
    rx: mpsc::UnboundedReceiver<PathBuf>,
}

impl MailboxWatcher {
    /// Start watching `dir`. Files already present are reported first.
    pub fn start(dir: &Path) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();

        let events_tx = tx.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if !is_arrival(&event.kind) {
                    return;
                }
                for path in event.paths {
                    if is_request_file(&path) {
                        let _ = events_tx.send(path);
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "mailbox watch error"),
        })?;
        watcher.watch(dir, RecursiveMode::NonRecursive)?;

        // Scan after the watch is armed so nothing published in between is missed.
        let mut backlog: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| is_request_file(path))
            .collect();
        backlog.sort();
        if !backlog.is_empty() {
            tracing::info!(count = backlog.len(), "Found pending requests in mailbox");
        }
        for path in backlog {
            let _ = tx.send(path);
        }

        tracing::info!(dir = %dir.display(), "Watching mailbox");
        Ok(Self {
            _watcher: watcher,
            rx,
        })
    }

    /// Next arrival. The same path may be reported more than once.
    pub async fn next(&mut self) -> Option<PathBuf> {
        self.rx.recv().await
    }
}

fn is_arrival(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(CreateKind::File)
            | EventKind::Create(CreateKind::Any)
            | EventKind::Modify(ModifyKind::Name(_))
    )
}

fn is_request_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|name| !name.starts_with('.'))
}
