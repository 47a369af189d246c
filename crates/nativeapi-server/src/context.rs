//! Services a connection needs from its host device.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use nativeapi_log::LogTap;
use nativeapi_net::NOISE_PSK_LEN;
use nativeapi_scheduler::Clock;
use parking_lot::Mutex;

use crate::entity::{EntityRegistry, StateBus};

/// Default idle time before the server pings a client.
pub const KEEPALIVE_TIMEOUT_MS: u32 = 60_000;

/// Identity reported in hello and device-info responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub name: String,
    pub friendly_name: String,
    pub mac_address: String,
    pub model: String,
    pub manufacturer: String,
    pub suggested_area: String,
    pub project_name: String,
    pub project_version: String,
    pub version: String,
    pub compilation_time: String,
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        Self {
            name: "nativeapi-device".to_string(),
            friendly_name: String::new(),
            mac_address: "00:00:00:00:00:00".to_string(),
            model: "host".to_string(),
            manufacturer: "Host".to_string(),
            suggested_area: String::new(),
            project_name: String::new(),
            project_version: String::new(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            compilation_time: String::new(),
        }
    }
}

/// Persists a new key. Returns `false` if it could not be stored.
pub type PskSaver = Box<dyn Fn(&[u8; NOISE_PSK_LEN]) -> bool + Send + Sync>;

/// The active Noise pre-shared key plus a key saved but not yet in use.
pub struct PskStore {
    active: Mutex<Option<[u8; NOISE_PSK_LEN]>>,
    pending: Mutex<Option<[u8; NOISE_PSK_LEN]>>,
    saver: Option<PskSaver>,
}

impl std::fmt::Debug for PskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PskStore")
            .field("has_psk", &self.has_psk())
            .field("pending", &self.pending.lock().is_some())
            .finish_non_exhaustive()
    }
}

impl PskStore {
    pub fn new(active: Option<[u8; NOISE_PSK_LEN]>) -> Self {
        Self {
            active: Mutex::new(active),
            pending: Mutex::new(None),
            saver: None,
        }
    }

    pub fn with_saver(mut self, saver: PskSaver) -> Self {
        self.saver = Some(saver);
        self
    }

    pub fn get(&self) -> Option<[u8; NOISE_PSK_LEN]> {
        *self.active.lock()
    }

    pub fn has_psk(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Persist `psk`. With `make_active` the key is also queued for
    /// activation, which the server applies on its next tick.
    pub fn save(&self, psk: [u8; NOISE_PSK_LEN], make_active: bool) -> bool {
        if self.get() == Some(psk) {
            tracing::warn!("New PSK matches old");
            return true;
        }
        if let Some(saver) = &self.saver
            && !saver(&psk)
        {
            tracing::warn!("Failed to save Noise PSK");
            return false;
        }
        tracing::debug!("Noise PSK saved");
        if make_active {
            *self.pending.lock() = Some(psk);
        }
        true
    }

    /// Promote the pending key, if any. Returns the newly active key.
    pub fn activate_pending(&self) -> Option<[u8; NOISE_PSK_LEN]> {
        let psk = self.pending.lock().take()?;
        *self.active.lock() = Some(psk);
        Some(psk)
    }
}

/// Everything shared by the server and its connections.
pub struct ApiContext {
    pub device: DeviceIdentity,
    /// Empty means no password is required.
    pub password: String,
    pub psk: PskStore,
    pub keepalive_ms: u32,
    pub registry: Arc<dyn EntityRegistry>,
    pub clock: Arc<dyn Clock>,
    pub states: StateBus,
    pub log_tap: Option<LogTap>,
    network_connected: AtomicBool,
}

impl ApiContext {
    pub fn new(
        device: DeviceIdentity,
        registry: Arc<dyn EntityRegistry>,
        states: StateBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            device,
            password: String::new(),
            psk: PskStore::new(None),
            keepalive_ms: KEEPALIVE_TIMEOUT_MS,
            registry,
            clock,
            states,
            log_tap: None,
            network_connected: AtomicBool::new(true),
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    pub fn with_psk(mut self, psk: PskStore) -> Self {
        self.psk = psk;
        self
    }

    pub fn with_keepalive_ms(mut self, keepalive_ms: u32) -> Self {
        self.keepalive_ms = keepalive_ms;
        self
    }

    pub fn with_log_tap(mut self, tap: LogTap) -> Self {
        self.log_tap = Some(tap);
        self
    }

    pub fn uses_password(&self) -> bool {
        !self.password.is_empty()
    }

    /// Compare against the configured password in time independent of
    /// where the first mismatch is. Always true when no password is set.
    pub fn check_password(&self, password: &str) -> bool {
        if !self.uses_password() {
            return true;
        }
        let expected = self.password.as_bytes();
        let given = password.as_bytes();
        let mut diff = expected.len() ^ given.len();
        for (i, &b) in given.iter().enumerate() {
            let e = expected.get(i).copied().unwrap_or(0);
            diff |= usize::from(e ^ b);
        }
        diff == 0
    }

    pub fn is_network_connected(&self) -> bool {
        self.network_connected.load(Ordering::Relaxed)
    }

    /// Report link state. While down, every connection is dropped.
    pub fn set_network_connected(&self, connected: bool) {
        self.network_connected.store(connected, Ordering::Relaxed);
    }

    pub fn now(&self) -> u32 {
        self.clock.millis()
    }
}
