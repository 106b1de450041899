use crate::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Single-writer persistence task.
///
/// Every mutation sends one unit on the channel; the task collapses bursts
/// by waiting for the debounce window to go quiet before writing. A write
/// failure leaves the store dirty, so the next mutation re-arms the timer.
pub(crate) fn spawn(store: Arc<Store>, mut rx: mpsc::UnboundedReceiver<()>) {
    tokio::spawn(async move {
        while rx.recv().await.is_some() {
            let window = Duration::from_millis(store.debounce_ms().max(10));

            // Re-arm while mutations keep arriving inside the window.
            loop {
                match tokio::time::timeout(window, rx.recv()).await {
                    Ok(Some(())) => continue,
                    Ok(None) => return,
                    Err(_) => break,
                }
            }

            if store.take_dirty() {
                let _ = store.write_now().await;
            }
        }
    });
}
