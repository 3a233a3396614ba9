//! [`BleAdapter`] over the host Bluetooth stack using btleplug.
//!
//! btleplug's calls are awaitable, so connect and discovery run on spawned
//! tasks and report back through the same event channel as the central's own
//! events. The bridge sees one ordered stream either way.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    BDAddr, Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::adapter::{AdapterEvent, AdapterState, BleAdapter, EventStream, PeripheralId, WriteMode};
use crate::{BridgeError, Result};

/// Bring-up attempts before giving up on a stack that is still starting.
const BRING_UP_ATTEMPTS: usize = 6;
const BRING_UP_RETRY_DELAY: Duration = Duration::from_millis(500);

const PERMISSION_HINT: &str = "check that Bluetooth is on and this app may use it \
     (macOS: System Settings > Privacy & Security > Bluetooth)";

#[derive(Default)]
struct Known {
    peripherals: HashMap<PeripheralId, Peripheral>,
    characteristics: HashMap<(PeripheralId, Uuid), Characteristic>,
    connecting: HashMap<PeripheralId, AbortHandle>,
}

/// BLE central backed by the first adapter btleplug finds.
pub struct BtleplugAdapter {
    adapter: Adapter,
    known: Arc<Mutex<Known>>,
    tx: UnboundedSender<AdapterEvent>,
    rx: Mutex<Option<UnboundedReceiver<AdapterEvent>>>,
}

impl BtleplugAdapter {
    /// Initialize the platform BLE adapter (first available).
    ///
    /// Retries while the macOS central manager is still starting up.
    pub async fn new() -> Result<Self> {
        let adapter = bring_up(|| async {
            first_adapter()
                .await
                .map_err(classify_bring_up)?
                .ok_or_else(|| {
                    BringUp::Fail(BridgeError::AdapterUnavailable("no BLE adapter found".into()))
                })
        })
        .await?;
        Ok(Self::with_adapter(adapter))
    }

    pub fn with_adapter(adapter: Adapter) -> Self {
        let (tx, rx) = mpsc::unbounded();
        Self {
            adapter,
            known: Arc::new(Mutex::new(Known::default())),
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    fn known(&self) -> MutexGuard<'_, Known> {
        lock(&self.known)
    }

    fn emit(&self, event: AdapterEvent) {
        emit(&self.tx, event);
    }

    /// Find the btleplug handle for `id`, refreshing from the adapter's
    /// peripheral list on a miss.
    async fn peripheral(&self, id: &PeripheralId) -> Option<Peripheral> {
        if let Some(peripheral) = self.known().peripherals.get(id) {
            return Some(peripheral.clone());
        }

        let peripherals = match self.adapter.peripherals().await {
            Ok(peripherals) => peripherals,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list peripherals");
                return None;
            }
        };
        let found = peripherals
            .into_iter()
            .find(|p| bridge_id(p).as_ref() == Some(id))?;
        self.known().peripherals.insert(*id, found.clone());
        Some(found)
    }

    async fn require_peripheral(&self, id: &PeripheralId) -> Result<Peripheral> {
        self.peripheral(id)
            .await
            .ok_or_else(|| BridgeError::PeripheralNotFound(id.to_string()))
    }
}

async fn first_adapter() -> std::result::Result<Option<Adapter>, btleplug::Error> {
    let manager = Manager::new().await?;
    Ok(manager.adapters().await?.into_iter().next())
}

/// Verdict on a failed adapter bring-up.
#[derive(Debug)]
enum BringUp {
    /// The host stack is still starting; try again shortly.
    Retry(BridgeError),
    Fail(BridgeError),
}

fn classify_bring_up(err: btleplug::Error) -> BringUp {
    if let btleplug::Error::PermissionDenied = err {
        return BringUp::Fail(BridgeError::AdapterUnavailable(format!(
            "permission denied; {PERMISSION_HINT}"
        )));
    }

    // CoreBluetooth reports its central manager state only as text. State 0
    // (unknown) means it has not finished starting.
    let msg = err.to_string();
    let lower = msg.to_ascii_lowercase();
    if !lower.contains("central manager has invalid state") {
        return BringUp::Fail(BridgeError::Adapter(msg));
    }
    let unavailable = BridgeError::AdapterUnavailable(format!("{msg}; {PERMISSION_HINT}"));
    if lower.contains("have=0") {
        BringUp::Retry(unavailable)
    } else {
        BringUp::Fail(unavailable)
    }
}

/// Run `attempt` until it succeeds, fails for good, or runs out of retries.
async fn bring_up<T, F, Fut>(mut attempt: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, BringUp>>,
{
    let mut tries = 1;
    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(BringUp::Retry(e)) if tries < BRING_UP_ATTEMPTS => {
                tracing::warn!(attempt = tries, error = %e, "BLE adapter not ready, retrying");
                tries += 1;
                tokio::time::sleep(BRING_UP_RETRY_DELAY).await;
            }
            Err(BringUp::Retry(e) | BringUp::Fail(e)) => return Err(e),
        }
    }
}

fn lock(known: &Mutex<Known>) -> MutexGuard<'_, Known> {
    // A panic while holding the lock leaves only cached handles behind.
    known.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn emit(tx: &UnboundedSender<AdapterEvent>, event: AdapterEvent) {
    if tx.unbounded_send(event).is_err() {
        tracing::trace!("Adapter event dropped, no listener");
    }
}

/// Stable identifier for a btleplug peripheral. BlueZ and WinRT expose the
/// device address; CoreBluetooth hides it and hands out a UUID instead.
fn bridge_id(peripheral: &Peripheral) -> Option<PeripheralId> {
    let address = peripheral.address();
    if address != BDAddr::default() {
        return Some(PeripheralId::Mac(address.into_inner()));
    }
    PeripheralId::parse(&peripheral.id().to_string()).ok()
}

fn adapter_state(state: CentralState) -> AdapterState {
    match state {
        CentralState::PoweredOn => AdapterState::PoweredOn,
        CentralState::PoweredOff => AdapterState::PoweredOff,
        CentralState::Unknown => AdapterState::Unknown,
    }
}

fn write_type(mode: WriteMode) -> WriteType {
    match mode {
        WriteMode::WithResponse => WriteType::WithResponse,
        WriteMode::WithoutResponse => WriteType::WithoutResponse,
    }
}

/// Keep only `wanted` entries of `found`; an empty filter keeps everything.
fn filter_uuids(found: impl IntoIterator<Item = Uuid>, wanted: &[Uuid]) -> Vec<Uuid> {
    found
        .into_iter()
        .filter(|uuid| wanted.is_empty() || wanted.contains(uuid))
        .collect()
}

/// Translate the central's own events into adapter events until either side
/// goes away.
async fn forward_central_events(
    adapter: Adapter,
    known: Arc<Mutex<Known>>,
    tx: UnboundedSender<AdapterEvent>,
) {
    let mut events = match adapter.events().await {
        Ok(events) => events,
        Err(e) => {
            tracing::error!(error = %e, "Failed to subscribe to BLE central events");
            return;
        }
    };

    while let Some(event) = events.next().await {
        if tx.is_closed() {
            break;
        }
        match event {
            CentralEvent::DeviceDiscovered(platform_id) | CentralEvent::DeviceUpdated(platform_id) => {
                let Ok(peripheral) = adapter.peripheral(&platform_id).await else {
                    continue;
                };
                let Some(id) = bridge_id(&peripheral) else {
                    tracing::debug!(%platform_id, "Peripheral without usable identifier skipped");
                    continue;
                };
                let name = match peripheral.properties().await {
                    Ok(Some(props)) => props.local_name,
                    _ => None,
                };
                lock(&known).peripherals.insert(id, peripheral);
                emit(&tx, AdapterEvent::DeviceDiscovered { id, name });
            }
            CentralEvent::DeviceDisconnected(platform_id) => {
                let Ok(peripheral) = adapter.peripheral(&platform_id).await else {
                    continue;
                };
                if let Some(id) = bridge_id(&peripheral) {
                    lock(&known).characteristics.retain(|(owner, _), _| *owner != id);
                    emit(&tx, AdapterEvent::Disconnected { id, reason: None });
                }
            }
            CentralEvent::StateUpdate(state) => {
                emit(&tx, AdapterEvent::StateChanged(adapter_state(state)));
            }
            // Connected is reported by the connect task itself.
            _ => {}
        }
    }

    tracing::debug!("BLE central event stream ended");
}

#[async_trait]
impl BleAdapter for BtleplugAdapter {
    async fn state(&self) -> AdapterState {
        match self.adapter.adapter_state().await {
            Ok(state) => adapter_state(state),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read adapter state");
                AdapterState::Unknown
            }
        }
    }

    async fn start_scan(&self, services: Option<&[Uuid]>) -> Result<()> {
        let filter = ScanFilter {
            services: services.map(<[Uuid]>::to_vec).unwrap_or_default(),
        };
        self.adapter
            .start_scan(filter)
            .await
            .map_err(|e| BridgeError::Scan(e.to_string()))
    }

    async fn stop_scan(&self) -> Result<()> {
        self.adapter
            .stop_scan()
            .await
            .map_err(|e| BridgeError::Scan(e.to_string()))
    }

    async fn resolve_peripheral(&self, id: &PeripheralId) -> bool {
        self.peripheral(id).await.is_some()
    }

    async fn connect(&self, id: &PeripheralId) -> Result<()> {
        let peripheral = self.require_peripheral(id).await?;
        let id = *id;
        let tx = self.tx.clone();

        let task = tokio::spawn(async move {
            let event = match peripheral.connect().await {
                Ok(()) => AdapterEvent::Connected(id),
                Err(e) => AdapterEvent::ConnectFailed {
                    id,
                    reason: e.to_string(),
                },
            };
            emit(&tx, event);
        });

        if let Some(previous) = self.known().connecting.insert(id, task.abort_handle()) {
            previous.abort();
        }
        Ok(())
    }

    async fn cancel_connection(&self, id: &PeripheralId) -> Result<()> {
        let peripheral = {
            let mut known = self.known();
            if let Some(attempt) = known.connecting.remove(id) {
                attempt.abort();
            }
            known.characteristics.retain(|(owner, _), _| owner != id);
            known.peripherals.get(id).cloned()
        };
        let Some(peripheral) = peripheral else {
            return Ok(());
        };

        tracing::info!(%id, "Disconnecting BLE device");
        peripheral
            .disconnect()
            .await
            .map_err(|e| BridgeError::ConnectionFailed(e.to_string()))
    }

    async fn discover_services(&self, id: &PeripheralId, services: &[Uuid]) -> Result<()> {
        let peripheral = self.require_peripheral(id).await?;
        let id = *id;
        let wanted = services.to_vec();
        let tx = self.tx.clone();

        tokio::spawn(async move {
            let event = match peripheral.discover_services().await {
                Ok(()) => AdapterEvent::ServicesDiscovered {
                    id,
                    services: filter_uuids(peripheral.services().into_iter().map(|s| s.uuid), &wanted),
                    error: None,
                },
                Err(e) => AdapterEvent::ServicesDiscovered {
                    id,
                    services: Vec::new(),
                    error: Some(e.to_string()),
                },
            };
            emit(&tx, event);
        });
        Ok(())
    }

    async fn discover_characteristics(
        &self,
        id: &PeripheralId,
        service: Uuid,
        characteristics: &[Uuid],
    ) -> Result<()> {
        let peripheral = self.require_peripheral(id).await?;

        // btleplug resolves characteristics together with their services.
        let Some(found) = peripheral.services().into_iter().find(|s| s.uuid == service) else {
            self.emit(AdapterEvent::CharacteristicsDiscovered {
                id: *id,
                service,
                characteristics: Vec::new(),
                error: Some(format!("service {service} not discovered")),
            });
            return Ok(());
        };

        let matching: Vec<Characteristic> = found
            .characteristics
            .into_iter()
            .filter(|c| characteristics.is_empty() || characteristics.contains(&c.uuid))
            .collect();
        let uuids = matching.iter().map(|c| c.uuid).collect();
        {
            let mut known = self.known();
            for characteristic in matching {
                known
                    .characteristics
                    .insert((*id, characteristic.uuid), characteristic);
            }
        }

        self.emit(AdapterEvent::CharacteristicsDiscovered {
            id: *id,
            service,
            characteristics: uuids,
            error: None,
        });
        Ok(())
    }

    async fn write(
        &self,
        id: &PeripheralId,
        characteristic: Uuid,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<()> {
        let (peripheral, target) = {
            let known = self.known();
            let peripheral = known
                .peripherals
                .get(id)
                .cloned()
                .ok_or(BridgeError::NotConnected)?;
            let target = known
                .characteristics
                .get(&(*id, characteristic))
                .cloned()
                .ok_or(BridgeError::MissingCharacteristic)?;
            (peripheral, target)
        };

        peripheral
            .write(&target, data, write_type(mode))
            .await
            .map_err(|e| BridgeError::Write(e.to_string()))?;

        if mode == WriteMode::WithResponse {
            self.emit(AdapterEvent::WriteCompleted {
                id: *id,
                characteristic,
                error: None,
            });
        }
        Ok(())
    }

    async fn events(&self) -> Result<EventStream> {
        let rx = self
            .rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or_else(|| BridgeError::Adapter("event stream already taken".into()))?;

        tokio::spawn(forward_central_events(
            self.adapter.clone(),
            Arc::clone(&self.known),
            self.tx.clone(),
        ));
        Ok(rx.boxed())
    }
}
