//! TLS certificate bundle with SNI resolution and hot reload.
//!
//! The SNI callback is a stable resolver over an `ArcSwap` cell; a file
//! watcher on the certificate path debounces change events, compares
//! mtimes, and atomically swaps in the rebuilt key material. A busy flag
//! keeps a single revalidation in flight.

use arc_swap::ArcSwap;
use notify::{RecursiveMode, Watcher};
use rustls::crypto::aws_lc_rs::sign::any_supported_type;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;

pub struct CertBundle {
    cert_path: PathBuf,
    key_path: PathBuf,
    current: ArcSwap<CertifiedKey>,
    busy: AtomicBool,
    mtime: Mutex<Option<SystemTime>>,
}

impl CertBundle {
    /// Load key material at startup; failure here is fatal to the proxy.
    pub fn load(cert_path: &Path, key_path: &Path) -> anyhow::Result<Arc<CertBundle>> {
        let certified = load_certified_key(cert_path, key_path)?;
        let mtime = std::fs::metadata(cert_path).and_then(|m| m.modified()).ok();
        Ok(Arc::new(CertBundle {
            cert_path: cert_path.to_path_buf(),
            key_path: key_path.to_path_buf(),
            current: ArcSwap::from_pointee(certified),
            busy: AtomicBool::new(false),
            mtime: Mutex::new(mtime),
        }))
    }

    /// Server config whose SNI callback always reads the current cell.
    pub fn server_config(self: &Arc<Self>) -> Arc<ServerConfig> {
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(Resolver(Arc::clone(self))));
        Arc::new(config)
    }

    /// Watch the certificate file; a changed mtime rebuilds and swaps the
    /// bundle. Reload-in-progress prevents overlap.
    pub fn spawn_watcher(self: &Arc<Self>) -> anyhow::Result<()> {
        let parent = self
            .cert_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        let file_name = self.cert_path.file_name().map(|n| n.to_os_string());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher =
            notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
                if let Ok(event) = result {
                    let ours = event.paths.iter().any(|p| {
                        p.file_name().map(|n| Some(n.to_os_string()) == file_name).unwrap_or(false)
                    });
                    if ours {
                        let _ = tx.send(());
                    }
                }
            })?;
        watcher.watch(&parent, RecursiveMode::NonRecursive)?;

        let bundle = Arc::clone(self);
        tokio::spawn(async move {
            let _watcher = watcher;
            let quiet = Duration::from_secs(1);

            while rx.recv().await.is_some() {
                loop {
                    match tokio::time::timeout(quiet, rx.recv()).await {
                        Ok(Some(())) => continue,
                        Ok(None) => return,
                        Err(_) => break,
                    }
                }
                bundle.maybe_reload();
            }
        });
        Ok(())
    }

    /// Reload when the on-disk mtime moved; idempotent under event
    /// storms.
    fn maybe_reload(&self) {
        let Ok(modified) = std::fs::metadata(&self.cert_path).and_then(|m| m.modified()) else {
            return;
        };
        {
            let remembered = self.mtime.lock().expect("mtime lock");
            if *remembered == Some(modified) {
                return;
            }
        }
        if self.busy.swap(true, Ordering::AcqRel) {
            return;
        }

        match load_certified_key(&self.cert_path, &self.key_path) {
            Ok(certified) => {
                self.current.store(Arc::new(certified));
                *self.mtime.lock().expect("mtime lock") = Some(modified);
                tracing::info!(cert = %self.cert_path.display(), "TLS certificate reloaded");
            }
            Err(e) => {
                tracing::error!(cert = %self.cert_path.display(), error = %e, "TLS reload failed; keeping previous certificate");
            }
        }
        self.busy.store(false, Ordering::Release);
    }
}

struct Resolver(Arc<CertBundle>);

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CertBundleResolver")
    }
}

impl ResolvesServerCert for Resolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.0.current.load_full())
    }
}

fn load_certified_key(cert_path: &Path, key_path: &Path) -> anyhow::Result<CertifiedKey> {
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
            .collect::<Result<_, _>>()
            .map_err(|e| anyhow::anyhow!("bad certificate {}: {e}", cert_path.display()))?;
    if certs.is_empty() {
        anyhow::bail!("no certificates in {}", cert_path.display());
    }

    let key: PrivateKeyDer<'static> =
        rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
            .ok_or_else(|| anyhow::anyhow!("no private key in {}", key_path.display()))?;
    let signing = any_supported_type(&key)
        .map_err(|e| anyhow::anyhow!("unsupported key in {}: {e}", key_path.display()))?;

    Ok(CertifiedKey::new(certs, signing))
}
