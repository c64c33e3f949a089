//! Client registry.
//!
//! Durable map of client name to authentication material and policy. Only
//! the Argon2id verifier and its salt are stored; plaintext passwords never
//! leave [`ClientRegistry::register`] and [`ClientRegistry::rotate_password`].
//!
//! Lookups (one per handshake) take a shared lock. Writes are serialized
//! behind the exclusive lock and, for a file-backed registry, behind a lock
//! file next to it, so the server and `phaze-server client ...` can share
//! one file. A write reloads the file, applies its change to that copy,
//! persists it and only then swaps it into memory: a failed write leaves
//! memory untouched and a write from another process is never lost.
//! [`ClientRegistry::refresh`] picks up changes made by other processes.
//!
//! Revocation is a logical delete: the identity stays on file with its
//! `revoked` flag set so historical session records keep resolving.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use phaze_core::{ClientMode, KdfParams, MAX_CLIENT_NAME_LEN};
use phaze_crypto::password::{generate_salt, VERIFIER_SIZE};
use phaze_crypto::{
    CryptoError, Credentials, PasswordVerifier, ServerHandshake, DEFAULT_KDF_PARAMS,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

const REGISTRY_FORMAT_VERSION: u32 = 1;

/// How long a writer waits for another process's lock file.
const LOCK_WAIT: Duration = Duration::from_secs(5);
const LOCK_POLL: Duration = Duration::from_millis(20);
/// A lock file older than this was left by a crashed writer.
const STALE_LOCK: Duration = Duration::from_secs(30);

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("client already exists: {0}")]
    DuplicateClient(String),

    #[error("client not found: {0}")]
    NotFound(String),

    #[error("client is revoked: {0}")]
    Revoked(String),

    #[error("invalid client name: {0:?}")]
    InvalidName(String),

    #[error("password must not be empty")]
    EmptyPassword,

    #[error("corrupt registry entry for {0}")]
    Corrupt(String),

    #[error("unsupported registry version {0}")]
    UnsupportedVersion(u32),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("registry I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("registry serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("registry lock poisoned")]
    Poisoned,

    #[error("registry is locked by another process: {0}")]
    Locked(PathBuf),
}

/// One provisioned client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientIdentity {
    pub name: String,
    /// Hex Argon2id verifier.
    verifier: String,
    /// Hex salt.
    salt: String,
    pub kdf: KdfParams,
    pub mode: ClientMode,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub revoked: bool,
    #[serde(default)]
    pub revoked_at: Option<DateTime<Utc>>,
    /// Tunnel address provisioned for this client.
    #[serde(default)]
    pub tunnel_address: Option<IpAddr>,
}

impl ClientIdentity {
    fn new(
        name: String,
        password: &[u8],
        mode: ClientMode,
        kdf: KdfParams,
    ) -> Result<Self, RegistryError> {
        let mut identity = Self {
            name,
            verifier: String::new(),
            salt: String::new(),
            kdf,
            mode,
            created_at: Utc::now(),
            updated_at: None,
            revoked: false,
            revoked_at: None,
            tunnel_address: None,
        };
        identity.set_password(password, kdf)?;
        Ok(identity)
    }

    fn set_password(&mut self, password: &[u8], kdf: KdfParams) -> Result<(), RegistryError> {
        if password.is_empty() {
            return Err(RegistryError::EmptyPassword);
        }
        let salt = generate_salt();
        let verifier = PasswordVerifier::derive(password, &salt, kdf)?;
        self.verifier = hex::encode(verifier.as_bytes());
        self.salt = hex::encode(&salt);
        self.kdf = kdf;
        Ok(())
    }

    fn copy_password(&mut self, from: &ClientIdentity) {
        self.verifier.clone_from(&from.verifier);
        self.salt.clone_from(&from.salt);
        self.kdf = from.kdf;
    }

    /// Handshake material for this client.
    pub fn credentials(&self) -> Result<Credentials, RegistryError> {
        let corrupt = || RegistryError::Corrupt(self.name.clone());
        let verifier: [u8; VERIFIER_SIZE] = hex::decode(&self.verifier)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(corrupt)?;
        let salt = hex::decode(&self.salt).map_err(|_| corrupt())?;
        Ok(Credentials {
            salt,
            kdf: self.kdf,
            verifier: PasswordVerifier::from_bytes(verifier),
        })
    }

    pub fn is_active(&self) -> bool {
        !self.revoked
    }

    pub fn info(&self) -> ClientInfo {
        ClientInfo {
            name: self.name.clone(),
            mode: self.mode,
            created_at: self.created_at,
            revoked: self.revoked,
            revoked_at: self.revoked_at,
            tunnel_address: self.tunnel_address,
        }
    }
}

/// Public view of a client, without authentication material.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientInfo {
    pub name: String,
    pub mode: ClientMode,
    pub created_at: DateTime<Utc>,
    pub revoked: bool,
    pub revoked_at: Option<DateTime<Utc>>,
    pub tunnel_address: Option<IpAddr>,
}

#[derive(Serialize, Deserialize)]
struct RegistryFile {
    version: u32,
    clients: Vec<ClientIdentity>,
}

/// Check a client name: 1..=64 characters of `[A-Za-z0-9_.-]`.
pub fn validate_name(name: &str) -> Result<(), RegistryError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_CLIENT_NAME_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'));
    if valid {
        Ok(())
    } else {
        Err(RegistryError::InvalidName(name.to_string()))
    }
}

/// Exclusive claim on a registry file, held across reload and persist.
struct FileLock {
    path: PathBuf,
}

impl FileLock {
    fn acquire(registry: &Path) -> Result<Self, RegistryError> {
        if let Some(parent) = registry.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let path = registry.with_extension("json.lock");
        let deadline = std::time::Instant::now() + LOCK_WAIT;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let _ = writeln!(file, "{}", std::process::id());
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if lock_is_stale(&path) {
                        warn!("Removing stale registry lock {}", path.display());
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                    if std::time::Instant::now() >= deadline {
                        return Err(RegistryError::Locked(path));
                    }
                    std::thread::sleep(LOCK_POLL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to remove registry lock {}: {}", self.path.display(), e);
        }
    }
}

fn lock_is_stale(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .is_some_and(|age| age > STALE_LOCK)
}

/// What the file looked like when this process last read or wrote it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: SystemTime,
    len: u64,
}

impl FileStamp {
    fn of(path: &Path) -> Result<Option<Self>, RegistryError> {
        match fs::metadata(path) {
            Ok(meta) => Ok(Some(Self {
                modified: meta.modified()?,
                len: meta.len(),
            })),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

type ClientMap = HashMap<String, ClientIdentity>;

/// Reader-biased store of client identities.
#[derive(Debug)]
pub struct ClientRegistry {
    clients: RwLock<ClientMap>,
    path: Option<PathBuf>,
    kdf: KdfParams,
    stamp: Mutex<Option<FileStamp>>,
}

impl ClientRegistry {
    /// In-memory registry using `kdf` for new verifiers.
    pub fn new(kdf: KdfParams) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            path: None,
            kdf,
            stamp: Mutex::new(None),
        }
    }

    /// Registry backed by a JSON file; loads it if present.
    pub fn open(path: impl Into<PathBuf>, kdf: KdfParams) -> Result<Self, RegistryError> {
        let path = path.into();
        let stamp = FileStamp::of(&path)?;
        let clients = if stamp.is_some() {
            Self::load(&path)?
        } else {
            HashMap::new()
        };
        info!("Loaded {} clients from {}", clients.len(), path.display());
        Ok(Self {
            clients: RwLock::new(clients),
            path: Some(path),
            kdf,
            stamp: Mutex::new(stamp),
        })
    }

    /// Registry file with production Argon2 costs.
    pub fn open_default(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        Self::open(path, DEFAULT_KDF_PARAMS)
    }

    fn load(path: &Path) -> Result<ClientMap, RegistryError> {
        let raw = fs::read(path)?;
        let file: RegistryFile = serde_json::from_slice(&raw)?;
        if file.version != REGISTRY_FORMAT_VERSION {
            return Err(RegistryError::UnsupportedVersion(file.version));
        }
        let mut clients = HashMap::with_capacity(file.clients.len());
        for identity in file.clients {
            validate_name(&identity.name)?;
            identity.credentials()?;
            clients.insert(identity.name.clone(), identity);
        }
        Ok(clients)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, ClientMap>, RegistryError> {
        self.clients.read().map_err(|_| RegistryError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, ClientMap>, RegistryError> {
        self.clients.write().map_err(|_| RegistryError::Poisoned)
    }

    fn set_stamp(&self, stamp: Option<FileStamp>) -> Result<(), RegistryError> {
        *self.stamp.lock().map_err(|_| RegistryError::Poisoned)? = stamp;
        Ok(())
    }

    /// Reload the file if another process has changed it since this
    /// registry last read or wrote it. Returns whether anything was loaded.
    pub fn refresh(&self) -> Result<bool, RegistryError> {
        let Some(path) = &self.path else {
            return Ok(false);
        };
        let mut clients = self.write()?;
        let stamp = FileStamp::of(path)?;
        let known = *self.stamp.lock().map_err(|_| RegistryError::Poisoned)?;
        if stamp.is_none() || stamp == known {
            return Ok(false);
        }
        *clients = Self::load(path)?;
        self.set_stamp(stamp)?;
        info!("Reloaded {} clients from {}", clients.len(), path.display());
        Ok(true)
    }

    /// Apply `change` to the current registry and persist the result
    /// before it becomes visible. For a file-backed registry the change is
    /// applied to the file's contents, not to this process's copy.
    fn mutate<T>(
        &self,
        change: impl FnOnce(&mut ClientMap) -> Result<T, RegistryError>,
    ) -> Result<T, RegistryError> {
        let mut clients = self.write()?;
        let Some(path) = &self.path else {
            let mut next = clients.clone();
            let result = change(&mut next)?;
            *clients = next;
            return Ok(result);
        };

        let _lock = FileLock::acquire(path)?;
        let mut next = if path.exists() {
            Self::load(path)?
        } else {
            clients.clone()
        };
        let result = change(&mut next)?;
        self.persist(path, &next)?;
        *clients = next;
        self.set_stamp(FileStamp::of(path)?)?;
        Ok(result)
    }

    fn persist(&self, path: &Path, clients: &ClientMap) -> Result<(), RegistryError> {
        let mut entries: Vec<ClientIdentity> = clients.values().cloned().collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        let file = RegistryFile {
            version: REGISTRY_FORMAT_VERSION,
            clients: entries,
        };
        let json = serde_json::to_vec_pretty(&file)?;

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;
        debug!("Registry saved to {}", path.display());
        Ok(())
    }

    /// Provision a new client. Runs Argon2id; call off the receive path.
    pub fn register(
        &self,
        name: &str,
        password: &[u8],
        mode: ClientMode,
    ) -> Result<ClientIdentity, RegistryError> {
        validate_name(name)?;
        if self.read()?.contains_key(name) {
            return Err(RegistryError::DuplicateClient(name.to_string()));
        }

        let identity = ClientIdentity::new(name.to_string(), password, mode, self.kdf)?;
        self.mutate(|clients| {
            if clients.contains_key(name) {
                return Err(RegistryError::DuplicateClient(name.to_string()));
            }
            clients.insert(name.to_string(), identity.clone());
            Ok(())
        })?;
        info!("Client {} provisioned (mode {})", name, mode);
        Ok(identity)
    }

    /// Handshake material for an active client.
    pub fn credentials(&self, name: &str) -> Option<Credentials> {
        let clients = self.read().ok()?;
        let identity = clients.get(name).filter(|c| c.is_active())?;
        identity.credentials().ok()
    }

    /// Whether a pending handshake was answered with `name`'s current
    /// verifier. Fails once the client is revoked or its password rotated;
    /// the proof itself is checked by [`ServerHandshake::on_confirm`].
    pub fn authenticate(&self, name: &str, handshake: &ServerHandshake) -> bool {
        self.credentials(name)
            .is_some_and(|current| handshake.issued_for(&current))
    }

    pub fn lookup(&self, name: &str) -> Option<ClientIdentity> {
        self.read().ok()?.get(name).cloned()
    }

    /// Whether `name` is active and still provisioned for `mode`.
    pub fn permits(&self, name: &str, mode: ClientMode) -> bool {
        self.read()
            .ok()
            .and_then(|clients| clients.get(name).map(|c| c.is_active() && c.mode == mode))
            .unwrap_or(false)
    }

    /// Revoke a client. Returns `false` if it was already revoked.
    pub fn revoke(&self, name: &str) -> Result<bool, RegistryError> {
        let revoked = self.mutate(|clients| {
            let identity = clients
                .get_mut(name)
                .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
            if identity.revoked {
                return Ok(false);
            }
            identity.revoked = true;
            identity.revoked_at = Some(Utc::now());
            Ok(true)
        })?;
        if revoked {
            info!("Client {} revoked", name);
        }
        Ok(revoked)
    }

    /// Replace a client's password. Runs Argon2id; call off the receive path.
    pub fn rotate_password(&self, name: &str, password: &[u8]) -> Result<(), RegistryError> {
        let mut fresh = self.active(name)?;
        fresh.set_password(password, self.kdf)?;

        self.update(name, |identity| identity.copy_password(&fresh))?;
        info!("Client {} password rotated", name);
        Ok(())
    }

    pub fn set_mode(&self, name: &str, mode: ClientMode) -> Result<(), RegistryError> {
        self.update(name, |identity| identity.mode = mode)?;
        info!("Client {} mode set to {}", name, mode);
        Ok(())
    }

    /// Assign (or clear) the client's tunnel address.
    pub fn set_tunnel_address(
        &self,
        name: &str,
        address: Option<IpAddr>,
    ) -> Result<(), RegistryError> {
        self.update(name, |identity| identity.tunnel_address = address)?;
        info!("Client {} tunnel address set to {:?}", name, address);
        Ok(())
    }

    /// All clients, revoked ones included, sorted by name.
    pub fn list(&self) -> Vec<ClientInfo> {
        let Ok(clients) = self.read() else {
            return Vec::new();
        };
        let mut infos: Vec<ClientInfo> = clients.values().map(ClientIdentity::info).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub fn len(&self) -> usize {
        self.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn active(&self, name: &str) -> Result<ClientIdentity, RegistryError> {
        match self.lookup(name) {
            Some(identity) if identity.is_active() => Ok(identity),
            Some(_) => Err(RegistryError::Revoked(name.to_string())),
            None => Err(RegistryError::NotFound(name.to_string())),
        }
    }

    fn update(
        &self,
        name: &str,
        apply: impl FnOnce(&mut ClientIdentity),
    ) -> Result<(), RegistryError> {
        self.mutate(|clients| {
            let identity = clients
                .get_mut(name)
                .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
            if identity.revoked {
                return Err(RegistryError::Revoked(name.to_string()));
            }
            apply(identity);
            identity.updated_at = Some(Utc::now());
            Ok(())
        })
    }
}
