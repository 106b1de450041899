use arc_swap::ArcSwap;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

type FilterHandle = reload::Handle<EnvFilter, Registry>;

/// The in-process logger and its verbosity knob.
///
/// Initialized once at startup; the `@scribe` action reads and rewrites
/// the mask at runtime through the reload handle.
pub struct Scribe {
    mask: ArcSwap<String>,
    handle: Option<FilterHandle>,
}

impl Scribe {
    /// Install the global tracing subscriber with a reloadable filter.
    pub fn init(level: &str) -> Arc<Scribe> {
        let (filter, handle) = reload::Layer::new(parse_filter(level));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();

        Arc::new(Scribe { mask: ArcSwap::from_pointee(level.to_string()), handle: Some(handle) })
    }

    /// A scribe with no installed subscriber, for tests and embedding.
    pub fn detached(level: &str) -> Arc<Scribe> {
        Arc::new(Scribe { mask: ArcSwap::from_pointee(level.to_string()), handle: None })
    }

    /// Current verbosity mask.
    pub fn mask(&self) -> String {
        self.mask.load().as_ref().clone()
    }

    /// Replace the verbosity mask; the live filter updates immediately.
    pub fn set_mask(&self, mask: &str) -> anyhow::Result<()> {
        if let Some(handle) = &self.handle {
            handle
                .reload(parse_filter(mask))
                .map_err(|e| anyhow::anyhow!("scribe reload failed: {e}"))?;
        }
        self.mask.store(Arc::new(mask.to_string()));
        tracing::info!(mask, "Scribe verbosity changed");
        Ok(())
    }
}

fn parse_filter(mask: &str) -> EnvFilter {
    EnvFilter::try_new(mask).unwrap_or_else(|_| EnvFilter::new("info"))
}
