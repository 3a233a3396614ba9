//! Abstract BLE central adapter consumed by the bridge.
//!
//! The adapter accepts commands (scan, connect, discover, write) and reports
//! their outcomes as [`AdapterEvent`]s on a single ordered stream. The bridge
//! never assumes a command has taken effect until the matching event arrives.

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::{BridgeError, Result};

/// Ordered stream of adapter events.
pub type EventStream = BoxStream<'static, AdapterEvent>;

/// Identifier of a remote peripheral as the host platform exposes it.
///
/// CoreBluetooth-style stacks identify peripherals by a UUID, BlueZ and
/// WinRT by the 48-bit device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeripheralId {
    Uuid(Uuid),
    Mac([u8; 6]),
}

impl PeripheralId {
    /// Parse an address string in UUID or `AA:BB:CC:DD:EE:FF` form.
    ///
    /// `-` is accepted as the MAC separator. Anything else is rejected.
    pub fn parse(address: &str) -> Result<Self> {
        let trimmed = address.trim();
        if let Ok(uuid) = Uuid::parse_str(trimmed) {
            return Ok(Self::Uuid(uuid));
        }
        parse_mac(trimmed)
            .map(Self::Mac)
            .ok_or_else(|| BridgeError::InvalidAddress(address.to_string()))
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uuid(uuid) => write!(f, "{uuid:X}"),
            Self::Mac(bytes) => write!(
                f,
                "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5]
            ),
        }
    }
}

fn parse_mac(raw: &str) -> Option<[u8; 6]> {
    let sep = if raw.contains(':') { ':' } else { '-' };
    let mut out = [0u8; 6];
    let mut parts = raw.split(sep);
    for byte in out.iter_mut() {
        let part = parts.next()?;
        if part.len() != 2 {
            return None;
        }
        *byte = u8::from_str_radix(part, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(out)
}

/// Power/authorization state reported by the host radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl AdapterState {
    pub fn is_powered_on(self) -> bool {
        self == Self::PoweredOn
    }
}

/// Delivery mode for characteristic writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Acknowledged write; the adapter reports [`AdapterEvent::WriteCompleted`].
    WithResponse,
    /// Write command without link-layer confirmation.
    WithoutResponse,
}

/// Events emitted by the adapter, in the order it generates them.
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterEvent {
    StateChanged(AdapterState),
    DeviceDiscovered {
        id: PeripheralId,
        name: Option<String>,
    },
    Connected(PeripheralId),
    ConnectFailed {
        id: PeripheralId,
        reason: String,
    },
    Disconnected {
        id: PeripheralId,
        reason: Option<String>,
    },
    ServicesDiscovered {
        id: PeripheralId,
        services: Vec<Uuid>,
        error: Option<String>,
    },
    CharacteristicsDiscovered {
        id: PeripheralId,
        service: Uuid,
        characteristics: Vec<Uuid>,
        error: Option<String>,
    },
    WriteCompleted {
        id: PeripheralId,
        characteristic: Uuid,
        error: Option<String>,
    },
}

/// BLE central capability the bridge depends on.
///
/// Command methods return once the command has been issued; their effects
/// are reported through [`BleAdapter::events`].
#[async_trait]
pub trait BleAdapter: Send + Sync + 'static {
    /// Current radio state.
    async fn state(&self) -> AdapterState;

    /// Start scanning. `None` means no service filter.
    async fn start_scan(&self, services: Option<&[Uuid]>) -> Result<()>;

    async fn stop_scan(&self) -> Result<()>;

    /// Whether the adapter knows a peripheral with this identifier.
    async fn resolve_peripheral(&self, id: &PeripheralId) -> bool;

    async fn connect(&self, id: &PeripheralId) -> Result<()>;

    async fn cancel_connection(&self, id: &PeripheralId) -> Result<()>;

    /// Discover the given services on a connected peripheral.
    async fn discover_services(&self, id: &PeripheralId, services: &[Uuid]) -> Result<()>;

    /// Discover the given characteristics inside `service`.
    async fn discover_characteristics(
        &self,
        id: &PeripheralId,
        service: Uuid,
        characteristics: &[Uuid],
    ) -> Result<()>;

    async fn write(
        &self,
        id: &PeripheralId,
        characteristic: Uuid,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<()>;

    /// Take the adapter's event stream. Only the first caller gets events.
    async fn events(&self) -> Result<EventStream>;
}
