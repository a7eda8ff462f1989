//! Backend resolution by discovery URI.
//!
//! A [`BackendRegistry`] maps URI schemes to factories. The daemon builds
//! one at startup with [`BackendRegistry::with_defaults`] and opens its
//! [`Store`] through it; tests can register their own schemes.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ovgrid_client::TlsOptions;
use tracing::info;

use crate::backend::KvBackend;
use crate::error::{StoreError, StoreResult};
use crate::etcd::EtcdBackend;
use crate::keys;
use crate::memory::MemoryBackend;
use crate::redb_backend::RedbBackend;
use crate::store::Store;

/// Parsed `<scheme>://<addr>[,<addr>...][/<prefix>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryUri {
    pub scheme: String,
    pub addrs: Vec<String>,
    pub prefix: String,
    /// Everything after `://`, untouched. File-based backends use it as a path.
    pub raw: String,
}

impl DiscoveryUri {
    pub fn parse(uri: &str) -> StoreResult<Self> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| StoreError::InvalidUri(format!("{uri}: missing scheme")))?;
        if scheme.is_empty() {
            return Err(StoreError::InvalidUri(format!("{uri}: empty scheme")));
        }

        let (hosts, prefix) = match rest.split_once('/') {
            Some((hosts, prefix)) => (hosts, keys::normalize(prefix)),
            None => (rest, String::new()),
        };
        let addrs = hosts
            .split(',')
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(String::from)
            .collect();

        Ok(Self {
            scheme: scheme.to_ascii_lowercase(),
            addrs,
            prefix,
            raw: rest.to_string(),
        })
    }
}

/// Options passed as `--discovery-opt key=value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendOptions {
    /// Root path under the URI prefix used by [`Store::register`].
    pub path: String,
    pub tls: Option<TlsOptions>,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            path: keys::GATEWAYS.to_string(),
            tls: None,
        }
    }
}

impl BackendOptions {
    /// Build options from `key=value` pairs. Unknown keys are rejected.
    /// TLS is enabled only when CA, certificate and key are all given.
    pub fn from_pairs<'a, I>(pairs: I) -> StoreResult<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut opts = Self::default();
        let (mut ca, mut cert, mut key) = (None, None, None);

        for (k, v) in pairs {
            match k {
                "kv.path" => opts.path = keys::normalize(v),
                "kv.cacertfile" => ca = Some(v.to_string()),
                "kv.certfile" => cert = Some(v.to_string()),
                "kv.keyfile" => key = Some(v.to_string()),
                other => {
                    return Err(StoreError::InvalidUri(format!(
                        "unknown discovery option: {other}"
                    )));
                }
            }
        }

        if let (Some(ca), Some(cert), Some(key)) = (ca, cert, key) {
            opts.tls = Some(TlsOptions {
                ca_file: ca.into(),
                cert_file: Some(cert.into()),
                key_file: Some(key.into()),
            });
        }
        Ok(opts)
    }
}

/// Constructor for a backend kind.
pub type BackendFactory =
    Box<dyn Fn(&DiscoveryUri, &BackendOptions) -> StoreResult<Arc<dyn KvBackend>> + Send + Sync>;

/// Scheme → backend factory table.
pub struct BackendRegistry {
    factories: HashMap<String, BackendFactory>,
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl BackendRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with `memory`, `redb` and `etcd` installed.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("memory", |_, _| Ok(Arc::new(MemoryBackend::new())));
        registry.register("redb", |uri, _| {
            if uri.raw.is_empty() {
                return Err(StoreError::InvalidUri("redb:// needs a file path".into()));
            }
            Ok(Arc::new(RedbBackend::open(Path::new(&uri.raw))?))
        });
        registry.register("etcd", |uri, opts| {
            Ok(Arc::new(EtcdBackend::connect(&uri.addrs, opts.tls.as_ref())?))
        });
        registry
    }

    /// Install (or replace) the factory for `scheme`.
    pub fn register<F>(&mut self, scheme: &str, factory: F)
    where
        F: Fn(&DiscoveryUri, &BackendOptions) -> StoreResult<Arc<dyn KvBackend>>
            + Send
            + Sync
            + 'static,
    {
        self.factories
            .insert(scheme.to_ascii_lowercase(), Box::new(factory));
    }

    /// Registered schemes, sorted.
    pub fn schemes(&self) -> Vec<&str> {
        let mut schemes: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        schemes.sort_unstable();
        schemes
    }

    /// Resolve `uri` and wrap the backend in a [`Store`].
    pub fn open(
        &self,
        uri: &str,
        options: &BackendOptions,
        heartbeat: Duration,
        ttl: Duration,
    ) -> StoreResult<Store> {
        let parsed = DiscoveryUri::parse(uri)?;
        let factory = self
            .factories
            .get(&parsed.scheme)
            .ok_or_else(|| StoreError::UnsupportedScheme(parsed.scheme.clone()))?;
        let backend = factory(&parsed, options)?;

        // A file path is not a key prefix.
        let prefix = if parsed.scheme == "redb" {
            String::new()
        } else {
            parsed.prefix.clone()
        };

        info!(
            scheme = %parsed.scheme,
            backend = backend.name(),
            %prefix,
            path = %options.path,
            "coordination backend opened"
        );
        Ok(Store::new(backend, &prefix, &options.path, heartbeat, ttl))
    }
}
