//! Bluetooth LE bridge for thermal receipt printers.
//!
//! Exposes scan, connect, raw byte writes and string printing over a BLE
//! central adapter, turning the adapter's asynchronous events back into a
//! single result per invocation.

pub mod adapter;
pub mod bridge;
pub mod btleplug_adapter;
pub mod config;
pub mod coordinator;
pub mod correlator;
pub mod dispatch;
pub mod pipeline;
pub mod registry;

#[cfg(test)]
mod testing;

// Re-exports for convenience
pub use adapter::{AdapterEvent, AdapterState, BleAdapter, PeripheralId, WriteMode};
pub use bridge::Bridge;
pub use btleplug_adapter::BtleplugAdapter;
pub use config::BridgeConfig;
pub use coordinator::Phase;
pub use dispatch::{MethodCall, MethodResponse};
pub use registry::{DeviceRecord, PrinterKind};

use uuid::Uuid;

/// GATT service exposed by the supported printer family.
pub const PRINTER_SERVICE_UUID: Uuid = Uuid::from_u128(0x4953_5343_fe7d_4ae5_8fa9_9faf_d205_e455);

/// Writable characteristic inside [`PRINTER_SERVICE_UUID`].
pub const PRINTER_WRITE_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x4953_5343_1e4d_4bd9_ba61_23c6_4724_9616);

/// Errors that can occur during bridge operations.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Invalid peripheral address: {0}")]
    InvalidAddress(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("No peripheral known for address {0}")]
    PeripheralNotFound(String),

    #[error("Connection timeout after {0} ms")]
    ConnectionTimeout(u64),

    #[error("BLE connection error: {0}")]
    ConnectionFailed(String),

    #[error("Connect attempt superseded by a newer request")]
    Superseded,

    #[error("Not connected to any device")]
    NotConnected,

    #[error("Printer write characteristic not discovered")]
    MissingCharacteristic,

    #[error("BLE write error: {0}")]
    Write(String),

    #[error("BLE scan error: {0}")]
    Scan(String),

    #[error("BLE adapter error: {0}")]
    Adapter(String),

    #[error("Bluetooth adapter unavailable ({0})")]
    AdapterUnavailable(String),

    #[error("Bridge is shutting down")]
    Shutdown,
}

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;
