//! Durable device identity and human-readable device labels.
//!
//! A device id is generated once per installation and persisted through a
//! [`DeviceIdStore`]. Every later run reads the same id back, so the
//! authority can tell "this device again" apart from "another device".

use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use pinlock_protocol::DeviceId;
use rand::Rng;

use crate::ClientError;

/// Longest identifier accepted from a store.
const MAX_DEVICE_ID_LEN: usize = 128;

// ---------------------------------------------------------------------------
// Stores
// ---------------------------------------------------------------------------

/// Somewhere a device id survives restarts.
pub trait DeviceIdStore {
    /// Reads the stored id. `Ok(None)` means none has been stored yet.
    fn load(&self) -> Result<Option<DeviceId>, ClientError>;

    /// Persists `id`, replacing whatever was stored.
    fn save(&self, id: &DeviceId) -> Result<(), ClientError>;
}

/// Keeps the device id in a small text file.
#[derive(Debug, Clone)]
pub struct FileDeviceIdStore {
    path: PathBuf,
}

impl FileDeviceIdStore {
    /// Uses the file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The platform's per-user data directory, e.g.
    /// `~/.local/share/pinlock/device-id` on Linux.
    ///
    /// Returns `None` when the platform has no such directory.
    pub fn default_location() -> Option<Self> {
        dirs::data_local_dir()
            .map(|dir| Self::new(dir.join("pinlock").join("device-id")))
    }

    /// The file this store reads and writes.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DeviceIdStore for FileDeviceIdStore {
    fn load(&self) -> Result<Option<DeviceId>, ClientError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) if e.kind() == ErrorKind::InvalidData => {
                return Err(ClientError::CorruptIdentity(self.path.clone()));
            }
            Err(e) => return Err(ClientError::Identity(e)),
        };

        let id = raw.trim();
        if !is_usable_device_id(id) {
            return Err(ClientError::CorruptIdentity(self.path.clone()));
        }
        Ok(Some(DeviceId::new(id)))
    }

    fn save(&self, id: &DeviceId) -> Result<(), ClientError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        // Write-then-rename so a crash never leaves a half-written id.
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, id.as_str())?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Keeps the device id in memory only. Used in tests and by embedders
/// that manage persistence themselves.
#[derive(Debug, Default)]
pub struct MemoryDeviceIdStore {
    slot: Mutex<Option<DeviceId>>,
}

impl MemoryDeviceIdStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that already holds `id`.
    pub fn with_id(id: DeviceId) -> Self {
        Self {
            slot: Mutex::new(Some(id)),
        }
    }
}

impl DeviceIdStore for MemoryDeviceIdStore {
    fn load(&self) -> Result<Option<DeviceId>, ClientError> {
        let slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        Ok(slot.clone())
    }

    fn save(&self, id: &DeviceId) -> Result<(), ClientError> {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(id.clone());
        Ok(())
    }
}

fn is_usable_device_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_DEVICE_ID_LEN
        && !id.chars().any(|c| c.is_whitespace() || c.is_control())
}

/// Returns the stored device id, generating and persisting one on first
/// use.
///
/// A stored id that cannot be parsed is reported as
/// [`ClientError::CorruptIdentity`] rather than silently replaced, since
/// a new id would make the authority treat this installation as a
/// different device.
pub fn get_or_create_device_id(
    store: &impl DeviceIdStore,
) -> Result<DeviceId, ClientError> {
    if let Some(id) = store.load()? {
        return Ok(id);
    }
    let id = generate_device_id();
    store.save(&id)?;
    tracing::info!(device_id = %id.short(), "generated new device id");
    Ok(id)
}

/// 128 random bits as 32 lowercase hex characters.
pub fn generate_device_id() -> DeviceId {
    let bytes: [u8; 16] = rand::rng().random();
    DeviceId::new(bytes.iter().map(|b| format!("{b:02x}")).collect::<String>())
}

// ---------------------------------------------------------------------------
// Device details
// ---------------------------------------------------------------------------

/// Coarse form factor of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Mobile,
    Desktop,
    Unknown,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Mobile => "Mobile",
            Self::Desktop => "Desktop",
            Self::Unknown => "Unknown",
        })
    }
}

/// What a device tells other devices about itself.
///
/// Every field degrades to `"Unknown"` rather than failing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDetails {
    pub device_type: DeviceType,
    pub os: String,
    pub client: String,
}

impl DeviceDetails {
    /// Details for the running process.
    pub fn detect() -> Self {
        Self::from_platform(std::env::consts::OS, "pinlock")
    }

    /// Details from a Rust target OS name (`std::env::consts::OS`).
    pub fn from_platform(os: &str, client: &str) -> Self {
        let (device_type, os) = match os {
            "android" => (DeviceType::Mobile, "Android"),
            "ios" => (DeviceType::Mobile, "iOS"),
            "windows" => (DeviceType::Desktop, "Windows"),
            "macos" => (DeviceType::Desktop, "MacOS"),
            "linux" => (DeviceType::Desktop, "Linux"),
            "freebsd" | "openbsd" | "netbsd" => (DeviceType::Desktop, "BSD"),
            _ => (DeviceType::Unknown, "Unknown"),
        };
        Self {
            device_type,
            os: os.to_string(),
            client: if client.is_empty() {
                "Unknown".to_string()
            } else {
                client.to_string()
            },
        }
    }

    /// Details from a browser user-agent string.
    pub fn from_user_agent(user_agent: &str) -> Self {
        let ua = user_agent.to_ascii_lowercase();
        let has = |needle: &str| ua.contains(needle);

        let (device_type, os) = if has("android") {
            (DeviceType::Mobile, "Android")
        } else if has("iphone") || has("ipad") || has("ipod") {
            (DeviceType::Mobile, "iOS")
        } else if has("windows") {
            (DeviceType::Desktop, "Windows")
        } else if has("macintosh") || has("mac os") {
            (DeviceType::Desktop, "MacOS")
        } else if has("linux") {
            (DeviceType::Desktop, "Linux")
        } else {
            (DeviceType::Unknown, "Unknown")
        };

        // Edge and Opera also advertise "Chrome"; Chrome also advertises
        // "Safari". Check the more specific tokens first.
        let client = if has("edg/") || has("edge") {
            "Edge"
        } else if has("opr/") || has("opera") {
            "Opera"
        } else if has("firefox") {
            "Firefox"
        } else if has("chrome") {
            "Chrome"
        } else if has("safari") {
            "Safari"
        } else {
            "Unknown"
        };

        Self {
            device_type,
            os: os.to_string(),
            client: client.to_string(),
        }
    }

    /// `"<type> (<os>, <client>)"`, e.g. `"Desktop (Linux, Firefox)"`.
    pub fn label(&self) -> String {
        format!("{} ({}, {})", self.device_type, self.os, self.client)
    }
}

impl fmt::Display for DeviceDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// Label for the running process.
pub fn device_label() -> String {
    DeviceDetails::detect().label()
}

/// Everything a device presents when it registers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_id: DeviceId,
    pub details: DeviceDetails,
}

impl DeviceIdentity {
    /// Loads (or creates) the id from `store` and detects local details.
    pub fn load(store: &impl DeviceIdStore) -> Result<Self, ClientError> {
        Ok(Self {
            device_id: get_or_create_device_id(store)?,
            details: DeviceDetails::detect(),
        })
    }

    /// The label sent with registrations.
    pub fn label(&self) -> String {
        self.details.label()
    }
}
