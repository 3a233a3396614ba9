//! Scripted in-memory adapter for unit tests.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

use crate::adapter::{AdapterEvent, AdapterState, BleAdapter, EventStream, PeripheralId, WriteMode};
use crate::{BridgeError, PRINTER_SERVICE_UUID, PRINTER_WRITE_CHARACTERISTIC_UUID, Result};

/// Commands the bridge issued, in order.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum MockCommand {
    StartScan(Option<Vec<Uuid>>),
    StopScan,
    Connect(PeripheralId),
    CancelConnection(PeripheralId),
    DiscoverServices(PeripheralId, Vec<Uuid>),
    DiscoverCharacteristics(PeripheralId, Uuid, Vec<Uuid>),
    Write {
        id: PeripheralId,
        characteristic: Uuid,
        data: Vec<u8>,
        mode: WriteMode,
    },
}

/// What the mock does when asked to connect.
#[derive(Debug, Clone)]
pub(crate) enum ConnectBehavior {
    Succeed,
    Fail(String),
    Hang,
}

struct MockState {
    radio: AdapterState,
    known: HashSet<PeripheralId>,
    connect: ConnectBehavior,
    services: Vec<Uuid>,
    characteristics: Vec<Uuid>,
    service_error: Option<String>,
    write_budget: Option<usize>,
    cancel_delay: Duration,
    confirmation_budget: Option<usize>,
    advertisements: Vec<(PeripheralId, Option<String>)>,
    commands: Vec<MockCommand>,
}

pub(crate) struct MockAdapter {
    state: Mutex<MockState>,
    tx: UnboundedSender<AdapterEvent>,
    rx: Mutex<Option<UnboundedReceiver<AdapterEvent>>>,
}

impl MockAdapter {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::unbounded();
        Self {
            state: Mutex::new(MockState {
                radio: AdapterState::PoweredOn,
                known: HashSet::new(),
                connect: ConnectBehavior::Succeed,
                services: vec![PRINTER_SERVICE_UUID],
                characteristics: vec![PRINTER_WRITE_CHARACTERISTIC_UUID],
                service_error: None,
                write_budget: None,
                cancel_delay: Duration::ZERO,
                confirmation_budget: None,
                advertisements: Vec::new(),
                commands: Vec::new(),
            }),
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn add_peripheral(&self, id: PeripheralId) {
        self.lock().known.insert(id);
    }

    pub(crate) fn set_connect_behavior(&self, behavior: ConnectBehavior) {
        self.lock().connect = behavior;
    }

    pub(crate) fn set_services(&self, services: Vec<Uuid>) {
        self.lock().services = services;
    }

    pub(crate) fn fail_service_discovery(&self, reason: &str) {
        self.lock().service_error = Some(reason.to_string());
    }

    pub(crate) fn set_radio_state(&self, radio: AdapterState) {
        self.lock().radio = radio;
    }

    /// Make `cancel_connection` take `delay` before it returns.
    pub(crate) fn set_cancel_delay(&self, delay: Duration) {
        self.lock().cancel_delay = delay;
    }

    /// Confirm only the first `n` acknowledged writes.
    pub(crate) fn limit_confirmations(&self, n: usize) {
        self.lock().confirmation_budget = Some(n);
    }

    /// Allow `n` successful writes, then fail every further write.
    pub(crate) fn fail_writes_after(&self, n: usize) {
        self.lock().write_budget = Some(n);
    }

    /// Reported as discoveries when a scan starts.
    pub(crate) fn advertise(&self, id: PeripheralId, name: Option<&str>) {
        self.lock().advertisements.push((id, name.map(str::to_string)));
    }

    pub(crate) fn emit(&self, event: AdapterEvent) {
        let _ = self.tx.unbounded_send(event);
    }

    pub(crate) fn commands(&self) -> Vec<MockCommand> {
        self.lock().commands.clone()
    }

    pub(crate) fn writes(&self) -> Vec<Vec<u8>> {
        self.commands()
            .into_iter()
            .filter_map(|c| match c {
                MockCommand::Write { data, .. } => Some(data),
                _ => None,
            })
            .collect()
    }

    fn record(&self, command: MockCommand) {
        self.lock().commands.push(command);
    }
}

#[async_trait]
impl BleAdapter for MockAdapter {
    async fn state(&self) -> AdapterState {
        self.lock().radio
    }

    async fn start_scan(&self, services: Option<&[Uuid]>) -> Result<()> {
        self.record(MockCommand::StartScan(services.map(<[Uuid]>::to_vec)));
        let advertisements = self.lock().advertisements.clone();
        for (id, name) in advertisements {
            self.emit(AdapterEvent::DeviceDiscovered { id, name });
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.record(MockCommand::StopScan);
        Ok(())
    }

    async fn resolve_peripheral(&self, id: &PeripheralId) -> bool {
        self.lock().known.contains(id)
    }

    async fn connect(&self, id: &PeripheralId) -> Result<()> {
        self.record(MockCommand::Connect(*id));
        let behavior = self.lock().connect.clone();
        match behavior {
            ConnectBehavior::Succeed => self.emit(AdapterEvent::Connected(*id)),
            ConnectBehavior::Fail(reason) => self.emit(AdapterEvent::ConnectFailed { id: *id, reason }),
            ConnectBehavior::Hang => {}
        }
        Ok(())
    }

    async fn cancel_connection(&self, id: &PeripheralId) -> Result<()> {
        self.record(MockCommand::CancelConnection(*id));
        let delay = self.lock().cancel_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.emit(AdapterEvent::Disconnected {
            id: *id,
            reason: None,
        });
        Ok(())
    }

    async fn discover_services(&self, id: &PeripheralId, services: &[Uuid]) -> Result<()> {
        self.record(MockCommand::DiscoverServices(*id, services.to_vec()));
        let (offered, error) = {
            let state = self.lock();
            (state.services.clone(), state.service_error.clone())
        };
        let services = offered.into_iter().filter(|s| services.contains(s)).collect();
        self.emit(AdapterEvent::ServicesDiscovered {
            id: *id,
            services,
            error,
        });
        Ok(())
    }

    async fn discover_characteristics(
        &self,
        id: &PeripheralId,
        service: Uuid,
        characteristics: &[Uuid],
    ) -> Result<()> {
        self.record(MockCommand::DiscoverCharacteristics(*id, service, characteristics.to_vec()));
        let offered = self.lock().characteristics.clone();
        self.emit(AdapterEvent::CharacteristicsDiscovered {
            id: *id,
            service,
            characteristics: offered
                .into_iter()
                .filter(|c| characteristics.contains(c))
                .collect(),
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
        {
            let mut state = self.lock();
            if let Some(budget) = state.write_budget.as_mut() {
                if *budget == 0 {
                    return Err(BridgeError::Write("mock write failure".into()));
                }
                *budget -= 1;
            }
            state.commands.push(MockCommand::Write {
                id: *id,
                characteristic,
                data: data.to_vec(),
                mode,
            });
        }
        let confirmed = match self.lock().confirmation_budget.as_mut() {
            Some(0) => false,
            Some(budget) => {
                *budget -= 1;
                true
            }
            None => true,
        };
        if mode == WriteMode::WithResponse && confirmed {
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
            .unwrap()
            .take()
            .ok_or_else(|| BridgeError::Adapter("event stream already taken".into()))?;
        Ok(rx.boxed())
    }
}
