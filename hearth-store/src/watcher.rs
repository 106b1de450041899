use crate::Store;
use notify::{RecursiveMode, Watcher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Watch the backing file for external changes and reload after a quiet
/// window, unless the store itself is writing.
///
/// The parent directory is watched (an atomic rename replaces the file
/// inode) and events are filtered to the store's file name.
pub(crate) fn spawn(store: Arc<Store>) -> anyhow::Result<()> {
    let path = store.path().clone();
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| std::path::PathBuf::from("."));
    let file_name = path.file_name().map(|n| n.to_os_string());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
        if let Ok(event) = result {
            let ours = event
                .paths
                .iter()
                .any(|p| p.file_name().map(|n| Some(n.to_os_string()) == file_name).unwrap_or(false));
            if ours {
                let _ = tx.send(());
            }
        }
    })?;
    watcher.watch(&parent, RecursiveMode::NonRecursive)?;

    tokio::spawn(async move {
        // Watcher must stay alive as long as the task runs.
        let _watcher = watcher;
        let quiet = Duration::from_millis(500);

        while rx.recv().await.is_some() {
            // Quiet window: absorb the event burst a file rewrite produces.
            loop {
                match tokio::time::timeout(quiet, rx.recv()).await {
                    Ok(Some(())) => continue,
                    Ok(None) => return,
                    Err(_) => break,
                }
            }

            if store.inhibited() || store.recently_written() {
                tracing::debug!(store = %store.name(), "Ignoring self-inflicted change event");
                continue;
            }
            match store.load() {
                Ok(()) => tracing::info!(store = %store.name(), "Reloaded after external change"),
                Err(e) => {
                    tracing::warn!(store = %store.name(), error = %e, "External reload failed")
                }
            }
        }
    });
    Ok(())
}
