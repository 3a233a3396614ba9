//! Connection state machine.
//!
//! The coordinator never talks to the adapter itself. Each transition returns
//! a [`Step`] describing the adapter command to issue and the pending request
//! to complete, and the bridge carries both out.

use uuid::Uuid;

use crate::adapter::PeripheralId;
use crate::correlator::{Completion, RequestToken};
use crate::pipeline::WriteTarget;
use crate::{BridgeError, PRINTER_SERVICE_UUID, PRINTER_WRITE_CHARACTERISTIC_UUID, Result};

/// Lifecycle of the single active connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    Connecting,
    ServiceDiscovery,
    CharacteristicDiscovery,
    Ready,
    Disconnecting,
}

impl Phase {
    /// Whether the link layer is connected.
    pub fn is_link_up(self) -> bool {
        matches!(
            self,
            Self::ServiceDiscovery | Self::CharacteristicDiscovery | Self::Ready
        )
    }
}

/// Adapter work a transition asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterCommand {
    DiscoverServices(PeripheralId, Vec<Uuid>),
    DiscoverCharacteristics(PeripheralId, Uuid, Vec<Uuid>),
    CancelConnection(PeripheralId),
}

/// Outcome of feeding an event into the coordinator.
#[derive(Debug, Default, PartialEq)]
pub struct Step {
    pub command: Option<AdapterCommand>,
    pub completion: Option<(RequestToken, Completion)>,
}

impl Step {
    fn none() -> Self {
        Self::default()
    }
}

/// A connection (or attempt) displaced by a newer connect request.
#[derive(Debug, PartialEq, Eq)]
pub struct Superseded {
    /// Pending connect request that will never complete successfully.
    pub token: Option<RequestToken>,
    /// Link to tear down at the adapter, if it belongs to another peripheral.
    pub cancel: Option<PeripheralId>,
}

/// Owns the connection phase, the peripheral handle and the write target.
#[derive(Debug, Default)]
pub struct ConnectionCoordinator {
    phase: Phase,
    peripheral: Option<PeripheralId>,
    write_characteristic: Option<Uuid>,
    connect_token: Option<RequestToken>,
}

impl ConnectionCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn peripheral(&self) -> Option<PeripheralId> {
        self.peripheral
    }

    pub fn is_connected(&self) -> bool {
        self.phase.is_link_up()
    }

    pub fn is_ready(&self) -> bool {
        self.phase == Phase::Ready && self.write_characteristic.is_some()
    }

    /// Whether `id` is already connected (link up).
    pub fn is_linked_to(&self, id: &PeripheralId) -> bool {
        self.peripheral.as_ref() == Some(id) && self.phase.is_link_up()
    }

    fn is_current(&self, id: &PeripheralId) -> bool {
        self.peripheral.as_ref() == Some(id)
    }

    fn reset(&mut self) {
        self.phase = Phase::Idle;
        self.peripheral = None;
        self.write_characteristic = None;
        self.connect_token = None;
    }

    /// Idle/any → Connecting for `id`, tracked by `token`.
    pub fn begin_connect(&mut self, id: PeripheralId, token: RequestToken) -> Option<Superseded> {
        let superseded = self.peripheral.map(|previous| Superseded {
            token: self.connect_token.take(),
            cancel: (previous != id).then_some(previous),
        });
        if let Some(ref s) = superseded {
            tracing::info!(
                previous_token = ?s.token,
                cancel = ?s.cancel,
                "New connect supersedes the previous connection"
            );
        }

        self.phase = Phase::Connecting;
        self.peripheral = Some(id);
        self.write_characteristic = None;
        self.connect_token = Some(token);
        superseded
    }

    /// Undo `begin_connect` when the adapter refused the command.
    pub fn abort_connect(&mut self, token: RequestToken) {
        if self.connect_token == Some(token) {
            self.reset();
        }
    }

    /// The connect deadline for `token` passed. Returns the peripheral whose
    /// attempt should be cancelled, or `None` if `token` is no longer current.
    pub fn connect_timed_out(&mut self, token: RequestToken) -> Option<PeripheralId> {
        if self.connect_token != Some(token) || self.phase != Phase::Connecting {
            return None;
        }
        let peripheral = self.peripheral;
        tracing::warn!(?peripheral, "Failed to connect to peripheral before the deadline");
        self.reset();
        peripheral
    }

    pub fn on_connected(&mut self, id: PeripheralId) -> Step {
        if !self.is_current(&id) {
            tracing::info!(%id, "Stray connection for a peripheral nobody is waiting on, cancelling");
            return Step {
                command: Some(AdapterCommand::CancelConnection(id)),
                completion: None,
            };
        }
        if self.phase != Phase::Connecting {
            tracing::debug!(%id, phase = ?self.phase, "Duplicate connected event ignored");
            return Step::none();
        }

        tracing::info!(%id, "Connected to peripheral");
        self.phase = Phase::ServiceDiscovery;
        Step {
            command: Some(AdapterCommand::DiscoverServices(id, vec![PRINTER_SERVICE_UUID])),
            completion: self.connect_token.take().map(|t| (t, Ok(()))),
        }
    }

    pub fn on_connect_failed(&mut self, id: PeripheralId, reason: &str) -> Step {
        if !self.is_current(&id) || self.phase != Phase::Connecting {
            tracing::debug!(%id, reason, "Connect failure for a stale attempt ignored");
            return Step::none();
        }

        tracing::warn!(%id, reason, "Failed to connect to peripheral");
        let token = self.connect_token.take();
        self.reset();
        Step {
            command: None,
            completion: token.map(|t| (t, Err(reason.to_string()))),
        }
    }

    /// A link to `id` went down. While a fresh attempt is Connecting, the
    /// event belongs to a link that was cancelled earlier (timeout,
    /// disconnect) and is ignored; a failing attempt reports `ConnectFailed`.
    pub fn on_disconnected(&mut self, id: PeripheralId, reason: Option<&str>) -> Step {
        if !self.is_current(&id) {
            tracing::debug!(%id, "Disconnect of a non-current peripheral ignored");
            return Step::none();
        }
        if self.phase == Phase::Connecting {
            tracing::debug!(%id, "Disconnect of a previous link ignored while connecting");
            return Step::none();
        }

        let reason = reason.unwrap_or("peripheral disconnected");
        tracing::info!(%id, reason, "Disconnected from peripheral");
        let token = self.connect_token.take();
        self.reset();
        Step {
            command: None,
            completion: token.map(|t| (t, Err(reason.to_string()))),
        }
    }

    pub fn on_services_discovered(
        &mut self,
        id: PeripheralId,
        services: &[Uuid],
        error: Option<&str>,
    ) -> Step {
        if !self.is_current(&id) || self.phase != Phase::ServiceDiscovery {
            return Step::none();
        }
        if let Some(error) = error {
            tracing::warn!(%id, error, "Error discovering services");
            return Step::none();
        }

        for service in services {
            tracing::debug!(%id, %service, "Discovered service");
        }
        if !services.contains(&PRINTER_SERVICE_UUID) {
            return Step::none();
        }

        tracing::info!(%id, service = %PRINTER_SERVICE_UUID, "Found printer service");
        self.phase = Phase::CharacteristicDiscovery;
        Step {
            command: Some(AdapterCommand::DiscoverCharacteristics(
                id,
                PRINTER_SERVICE_UUID,
                vec![PRINTER_WRITE_CHARACTERISTIC_UUID],
            )),
            completion: None,
        }
    }

    pub fn on_characteristics_discovered(
        &mut self,
        id: PeripheralId,
        service: Uuid,
        characteristics: &[Uuid],
        error: Option<&str>,
    ) -> Step {
        if !self.is_current(&id)
            || self.phase != Phase::CharacteristicDiscovery
            || service != PRINTER_SERVICE_UUID
        {
            return Step::none();
        }
        if let Some(error) = error {
            tracing::warn!(%id, error, "Error discovering characteristics");
            return Step::none();
        }

        if characteristics.contains(&PRINTER_WRITE_CHARACTERISTIC_UUID) {
            tracing::info!(
                %id,
                characteristic = %PRINTER_WRITE_CHARACTERISTIC_UUID,
                "Found printer characteristic"
            );
            self.write_characteristic = Some(PRINTER_WRITE_CHARACTERISTIC_UUID);
            self.phase = Phase::Ready;
        }
        Step::none()
    }

    /// Any → Disconnecting. Returns the peripheral to cancel and the pending
    /// connect request, or `None` when nothing is connected.
    pub fn begin_disconnect(&mut self) -> Option<(PeripheralId, Option<RequestToken>)> {
        let peripheral = self.peripheral?;
        self.phase = Phase::Disconnecting;
        self.write_characteristic = None;
        Some((peripheral, self.connect_token.take()))
    }

    /// Disconnecting → Idle.
    pub fn finish_disconnect(&mut self) {
        if self.phase == Phase::Disconnecting {
            self.reset();
        }
    }

    /// Drop all state, e.g. when the radio goes away. Returns the pending
    /// connect request, if any.
    pub fn abandon(&mut self) -> Option<RequestToken> {
        let token = self.connect_token.take();
        self.reset();
        token
    }

    /// Where writes go, if discovery has completed.
    pub fn write_target(&self) -> Result<WriteTarget> {
        let peripheral = self.peripheral.ok_or(BridgeError::NotConnected)?;
        let characteristic = self
            .write_characteristic
            .ok_or(BridgeError::MissingCharacteristic)?;
        Ok(WriteTarget {
            peripheral,
            characteristic,
        })
    }
}
