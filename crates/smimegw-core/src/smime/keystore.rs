//! Recipient key store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cms::enveloped_data::RecipientIdentifier;
use der::asn1::OctetString;
use der::Decode;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::RsaPrivateKey;
use rustls_pemfile::Item;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::SystemTime;
use thiserror::Error;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info, warn};
use x509_cert::Certificate;

/// id-ce-subjectKeyIdentifier
const SUBJECT_KEY_IDENTIFIER: der::asn1::ObjectIdentifier =
    der::asn1::ObjectIdentifier::new_unwrap("2.5.29.14");

/// Key material could not be loaded
#[derive(Debug, Error)]
pub enum KeyLoadError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No private key found in {0}")]
    MissingKey(PathBuf),

    #[error("Malformed key material in {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },

    #[error("Key directory {0} does not exist")]
    MissingDirectory(PathBuf),
}

impl KeyLoadError {
    fn malformed(path: &Path, reason: impl ToString) -> Self {
        KeyLoadError::Malformed {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }
}

/// One private key plus what is known about it. Immutable once loaded.
#[derive(Clone)]
pub struct KeyMaterial {
    private_key: RsaPrivateKey,
    certificate: Option<Certificate>,
    issued_at: DateTime<Utc>,
    source: PathBuf,
}

impl KeyMaterial {
    pub fn new(
        private_key: RsaPrivateKey,
        certificate: Option<Certificate>,
        issued_at: DateTime<Utc>,
        source: impl Into<PathBuf>,
    ) -> Self {
        Self {
            private_key,
            certificate,
            issued_at,
            source: source.into(),
        }
    }

    /// Parse a PEM file holding a PKCS#8 or PKCS#1 RSA key and optionally a
    /// certificate. The certificate's notBefore wins over `modified`.
    pub fn from_pem(data: &[u8], source: &Path, modified: DateTime<Utc>) -> Result<Self, KeyLoadError> {
        let mut private_key = None;
        let mut certificate = None;

        for item in rustls_pemfile::read_all(&mut &data[..]) {
            let item = item.map_err(|e| KeyLoadError::malformed(source, e))?;
            match item {
                Item::Pkcs8Key(key) if private_key.is_none() => {
                    let key = RsaPrivateKey::from_pkcs8_der(key.secret_pkcs8_der())
                        .map_err(|e| KeyLoadError::malformed(source, e))?;
                    private_key = Some(key);
                }
                Item::Pkcs1Key(key) if private_key.is_none() => {
                    let key = RsaPrivateKey::from_pkcs1_der(key.secret_pkcs1_der())
                        .map_err(|e| KeyLoadError::malformed(source, e))?;
                    private_key = Some(key);
                }
                Item::X509Certificate(cert) if certificate.is_none() => {
                    let cert = Certificate::from_der(&cert).map_err(|e| KeyLoadError::malformed(source, e))?;
                    certificate = Some(cert);
                }
                Item::Sec1Key(_) => {
                    return Err(KeyLoadError::malformed(source, "EC keys are not supported"));
                }
                _ => {}
            }
        }

        let private_key = private_key.ok_or_else(|| KeyLoadError::MissingKey(source.to_path_buf()))?;
        let issued_at = certificate
            .as_ref()
            .map(not_before)
            .unwrap_or(modified);

        Ok(Self::new(private_key, certificate, issued_at, source))
    }

    /// Parse a DER PKCS#8 private key
    pub fn from_der(data: &[u8], source: &Path, modified: DateTime<Utc>) -> Result<Self, KeyLoadError> {
        let private_key = RsaPrivateKey::from_pkcs8_der(data).map_err(|e| KeyLoadError::malformed(source, e))?;
        Ok(Self::new(private_key, None, modified, source))
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }

    pub fn certificate(&self) -> Option<&Certificate> {
        self.certificate.as_ref()
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Whether this key may open the recipient info named by `rid`.
    ///
    /// Without a certificate there is nothing to compare against, so every
    /// recipient info is a candidate.
    pub fn matches(&self, rid: &RecipientIdentifier) -> bool {
        let Some(cert) = &self.certificate else {
            return true;
        };
        let tbs = &cert.tbs_certificate;

        match rid {
            RecipientIdentifier::IssuerAndSerialNumber(ias) => {
                ias.issuer == tbs.issuer && ias.serial_number == tbs.serial_number
            }
            RecipientIdentifier::SubjectKeyIdentifier(ski) => tbs
                .extensions
                .iter()
                .flatten()
                .filter(|ext| ext.extn_id == SUBJECT_KEY_IDENTIFIER)
                .filter_map(|ext| OctetString::from_der(ext.extn_value.as_bytes()).ok())
                .any(|id| id.as_bytes() == ski.0.as_bytes()),
        }
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("source", &self.source)
            .field("issued_at", &self.issued_at)
            .field("has_certificate", &self.certificate.is_some())
            .finish_non_exhaustive()
    }
}

fn not_before(cert: &Certificate) -> DateTime<Utc> {
    DateTime::<Utc>::from(cert.tbs_certificate.validity.not_before.to_system_time())
}

/// All keys of one identity, newest first
#[derive(Debug, Clone)]
pub struct KeyRing {
    identity: String,
    keys: Vec<KeyMaterial>,
}

impl KeyRing {
    pub fn new(identity: impl Into<String>, mut keys: Vec<KeyMaterial>) -> Self {
        // Stable sort keeps source order for equal issue times
        keys.sort_by(|a, b| b.issued_at.cmp(&a.issued_at));
        Self {
            identity: identity.into(),
            keys,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn keys(&self) -> &[KeyMaterial] {
        &self.keys
    }

    pub fn newest(&self) -> Option<&KeyMaterial> {
        self.keys.first()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Where key material comes from
#[async_trait]
pub trait KeySource: Send + Sync {
    /// Load every key for a lower-cased identity; empty means no key
    async fn load(&self, identity: &str) -> Result<Vec<KeyMaterial>, KeyLoadError>;

    /// Human readable description for logs
    fn describe(&self) -> String;
}

/// Keys on disk.
///
/// `<root>/<identity>.pem`, `<root>/<identity>.der` and every `.pem`/`.der`
/// file in `<root>/<identity>/` belong to `identity`.
#[derive(Debug, Clone)]
pub struct DirectoryKeySource {
    root: PathBuf,
}

impl DirectoryKeySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Open a key directory, failing if it does not exist
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, KeyLoadError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(KeyLoadError::MissingDirectory(root));
        }
        Ok(Self::new(root))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn candidates(&self, identity: &str) -> Result<Vec<PathBuf>, KeyLoadError> {
        let mut paths = Vec::new();
        for ext in ["pem", "der"] {
            let path = self.root.join(format!("{}.{}", identity, ext));
            if tokio::fs::metadata(&path).await.map(|m| m.is_file()).unwrap_or(false) {
                paths.push(path);
            }
        }

        let dir = self.root.join(identity);
        let is_dir = tokio::fs::metadata(&dir).await.map(|m| m.is_dir()).unwrap_or(false);
        if !is_dir {
            return Ok(paths);
        }

        let io_error = |source| KeyLoadError::Io { path: dir.clone(), source };
        let mut entries = tokio::fs::read_dir(&dir).await.map_err(io_error)?;
        let mut rotated = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_error)? {
            let path = entry.path();
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            if is_file && has_key_extension(&path) {
                rotated.push(path);
            }
        }
        rotated.sort();
        paths.extend(rotated);

        Ok(paths)
    }
}

fn has_key_extension(path: &Path) -> bool {
    matches!(path.extension().and_then(|e| e.to_str()), Some("pem") | Some("der"))
}

/// Identities that could name a path outside the key directory
fn is_safe_identity(identity: &str) -> bool {
    !identity.is_empty()
        && !identity.starts_with('.')
        && !identity.contains("..")
        && !identity
            .chars()
            .any(|c| c == '/' || c == '\\' || c == '\0' || c.is_control())
}

#[async_trait]
impl KeySource for DirectoryKeySource {
    async fn load(&self, identity: &str) -> Result<Vec<KeyMaterial>, KeyLoadError> {
        if !is_safe_identity(identity) {
            warn!(identity = %identity, "Refusing key lookup for unsafe identity");
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        for path in self.candidates(identity).await? {
            let data = tokio::fs::read(&path)
                .await
                .map_err(|e| KeyLoadError::Io { path: path.clone(), source: e })?;
            let modified = tokio::fs::metadata(&path)
                .await
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            let modified = DateTime::<Utc>::from(modified);

            let material = match path.extension().and_then(|e| e.to_str()) {
                Some("der") => KeyMaterial::from_der(&data, &path, modified)?,
                _ => KeyMaterial::from_pem(&data, &path, modified)?,
            };
            debug!(identity = %identity, path = %path.display(), "Loaded key");
            keys.push(material);
        }

        Ok(keys)
    }

    fn describe(&self) -> String {
        format!("directory {}", self.root.display())
    }
}

/// Keys held in memory, for embedding and tests
#[derive(Default)]
pub struct MemoryKeySource {
    keys: std::sync::RwLock<HashMap<String, Vec<KeyMaterial>>>,
    loads: AtomicUsize,
}

impl MemoryKeySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key for `identity` (case-insensitive)
    pub fn insert(&self, identity: &str, key: KeyMaterial) {
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(identity.to_ascii_lowercase())
            .or_default()
            .push(key);
    }

    pub fn with_key(self, identity: &str, key: KeyMaterial) -> Self {
        self.insert(identity, key);
        self
    }

    /// Number of `load` calls served so far
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeySource for MemoryKeySource {
    async fn load(&self, identity: &str) -> Result<Vec<KeyMaterial>, KeyLoadError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let keys = self.keys.read().unwrap_or_else(PoisonError::into_inner);
        Ok(keys.get(identity).cloned().unwrap_or_default())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

type CacheSlot = Arc<OnceCell<Option<Arc<KeyRing>>>>;

/// Caching front of a [`KeySource`].
///
/// Each identity with keys is loaded at most once until [`KeyStore::reload`];
/// callers racing on the same identity wait for the one load in flight.
/// Misses and load errors are not kept, so the cache never holds more
/// identities than the source has keys for.
pub struct KeyStore {
    source: Arc<dyn KeySource>,
    cache: RwLock<HashMap<String, CacheSlot>>,
}

impl KeyStore {
    pub fn new(source: impl KeySource + 'static) -> Self {
        Self::from_source(Arc::new(source))
    }

    pub fn from_source(source: Arc<dyn KeySource>) -> Self {
        info!(source = %source.describe(), "Key store opened");
        Self {
            source,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Key store over a directory of PEM/DER files
    pub fn open_directory(path: impl Into<PathBuf>) -> Result<Self, KeyLoadError> {
        Ok(Self::new(DirectoryKeySource::open(path)?))
    }

    /// Resolve an identity to its key ring; `None` when it has no key
    pub async fn resolve(&self, identity: &str) -> Result<Option<Arc<KeyRing>>, KeyLoadError> {
        let identity = identity.trim().to_ascii_lowercase();
        let slot = self.slot(&identity).await;

        let ring = slot
            .get_or_try_init(|| async {
                let keys = self.source.load(&identity).await?;
                debug!(identity = %identity, keys = keys.len(), "Resolved identity");
                Ok::<_, KeyLoadError>(if keys.is_empty() {
                    None
                } else {
                    Some(Arc::new(KeyRing::new(identity.clone(), keys)))
                })
            })
            .await
            .map(|ring| ring.clone());

        if !matches!(ring, Ok(Some(_))) {
            self.forget(&identity, &slot).await;
        }
        ring
    }

    /// Drop `slot` unless a reload already replaced it
    async fn forget(&self, identity: &str, slot: &CacheSlot) {
        let mut cache = self.cache.write().await;
        if cache.get(identity).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            cache.remove(identity);
        }
    }

    async fn slot(&self, identity: &str) -> CacheSlot {
        if let Some(slot) = self.cache.read().await.get(identity) {
            return slot.clone();
        }
        self.cache
            .write()
            .await
            .entry(identity.to_string())
            .or_default()
            .clone()
    }

    /// Drop every cached identity; the next resolve reads the source again
    pub async fn reload(&self) {
        let mut cache = self.cache.write().await;
        let dropped = cache.len();
        cache.clear();
        info!(dropped, "Key store cache cleared");
    }

    /// Identities currently cached
    pub async fn cached_identities(&self) -> usize {
        self.cache.read().await.len()
    }
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore")
            .field("source", &self.source.describe())
            .finish_non_exhaustive()
    }
}
