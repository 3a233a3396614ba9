//! The bridge context.
//!
//! Owns the adapter handle, the device registry, the connection coordinator
//! and the result correlator for the bridge's lifetime. A single event pump
//! task applies adapter events in order; invocations register a pending slot,
//! issue adapter commands and wait on the slot without holding the lock.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{Mutex, MutexGuard, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::adapter::{AdapterEvent, AdapterState, BleAdapter, EventStream, PeripheralId, WriteMode};
use crate::config::BridgeConfig;
use crate::coordinator::{AdapterCommand, ConnectionCoordinator, Phase, Step};
use crate::correlator::{Completion, InvocationKind, RequestToken, ResultCorrelator};
use crate::pipeline::WritePipeline;
use crate::registry::{self, DeviceRecord, DeviceRegistry, PrinterKind};
use crate::{BridgeError, Result};


/// Mutable state shared by invocations and the event pump.
#[derive(Default)]
struct BridgeContext {
    registry: DeviceRegistry,
    coordinator: ConnectionCoordinator,
    correlator: ResultCorrelator,
}

/// How waiting on a pending slot ended.
enum Wait<'a> {
    Completed(Completion),
    /// The deadline passed and the slot was cancelled. The lock is still held
    /// so the caller can roll state back atomically.
    TimedOut(MutexGuard<'a, BridgeContext>),
    /// The slot's sender went away (bridge shut down).
    Closed,
}

/// Handle to a running bridge. Cheap to clone.
pub struct Bridge<A: BleAdapter> {
    adapter: Arc<A>,
    ctx: Arc<Mutex<BridgeContext>>,
    config: Arc<BridgeConfig>,
    pipeline: WritePipeline,
    shutdown: CancellationToken,
}

impl<A: BleAdapter> Clone for Bridge<A> {
    fn clone(&self) -> Self {
        Self {
            adapter: Arc::clone(&self.adapter),
            ctx: Arc::clone(&self.ctx),
            config: Arc::clone(&self.config),
            pipeline: self.pipeline.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<A: BleAdapter> Bridge<A> {
    /// Take the adapter's event stream and start the event pump.
    pub async fn start(adapter: Arc<A>, config: BridgeConfig) -> Result<(Self, JoinHandle<()>)> {
        let events = adapter.events().await?;
        tracing::info!(?config, "Starting thermal printer bridge");

        let bridge = Self {
            adapter,
            ctx: Arc::new(Mutex::new(BridgeContext::default())),
            pipeline: WritePipeline::from_config(&config),
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
        };

        let pump = bridge.clone();
        let handle = tokio::spawn(async move { pump.run_event_pump(events).await });
        Ok((bridge, handle))
    }

    /// Stop the event pump. Pending requests fail.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    async fn run_event_pump(self, mut events: EventStream) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("Bridge event pump stopped (shutdown)");
                    break;
                }
                event = events.next() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        tracing::warn!("Adapter event stream ended");
                        break;
                    }
                },
            }
        }

        let mut ctx = self.ctx.lock().await;
        ctx.coordinator.abandon();
        ctx.correlator.fail_all(&BridgeError::Shutdown.to_string());
    }

    /// Apply one adapter event.
    pub async fn handle_event(&self, event: AdapterEvent) {
        tracing::trace!(?event, "Adapter event");
        let mut ctx = self.ctx.lock().await;

        let step = match event {
            AdapterEvent::StateChanged(state) => {
                on_state_changed(&mut ctx, state);
                Step::default()
            }
            AdapterEvent::DeviceDiscovered { id, name } => {
                ctx.registry.on_device_discovered(name.as_deref(), &id.to_string());
                Step::default()
            }
            AdapterEvent::Connected(id) => ctx.coordinator.on_connected(id),
            AdapterEvent::ConnectFailed { id, reason } => {
                ctx.coordinator.on_connect_failed(id, &reason)
            }
            AdapterEvent::Disconnected { id, reason } => {
                if ctx.coordinator.is_linked_to(&id) {
                    ctx.correlator.fail_writes("peripheral disconnected");
                }
                ctx.coordinator.on_disconnected(id, reason.as_deref())
            }
            AdapterEvent::ServicesDiscovered {
                id,
                services,
                error,
            } => ctx
                .coordinator
                .on_services_discovered(id, &services, error.as_deref()),
            AdapterEvent::CharacteristicsDiscovered {
                id,
                service,
                characteristics,
                error,
            } => ctx.coordinator.on_characteristics_discovered(
                id,
                service,
                &characteristics,
                error.as_deref(),
            ),
            AdapterEvent::WriteCompleted {
                id,
                characteristic,
                error,
            } => {
                on_write_completed(&mut ctx, id, characteristic, error);
                Step::default()
            }
        };

        if let Some((token, outcome)) = step.completion {
            ctx.correlator.resolve(token, outcome);
        }
        drop(ctx);

        if let Some(command) = step.command {
            self.issue(command).await;
        }
    }

    /// Carry out a coordinator command. Called without the context lock; the
    /// adapter reports the effect as a later event.
    async fn issue(&self, command: AdapterCommand) {
        let result = match &command {
            AdapterCommand::DiscoverServices(id, services) => {
                self.adapter.discover_services(id, services).await
            }
            AdapterCommand::DiscoverCharacteristics(id, service, characteristics) => {
                self.adapter
                    .discover_characteristics(id, *service, characteristics)
                    .await
            }
            AdapterCommand::CancelConnection(id) => self.adapter.cancel_connection(id).await,
        };
        if let Err(e) = result {
            tracing::warn!(?command, error = %e, "Adapter command failed");
        }
    }

    /// Wait for `token` to resolve or `deadline` to pass.
    async fn wait_for(
        &self,
        token: RequestToken,
        rx: &mut oneshot::Receiver<Completion>,
        deadline: Duration,
    ) -> Wait<'_> {
        match tokio::time::timeout(deadline, &mut *rx).await {
            Ok(Ok(outcome)) => Wait::Completed(outcome),
            Ok(Err(_)) => Wait::Closed,
            Err(_) => {
                let mut ctx = self.ctx.lock().await;
                if ctx.correlator.cancel(token) {
                    return Wait::TimedOut(ctx);
                }
                // Resolved between the deadline and taking the lock.
                match rx.try_recv() {
                    Ok(outcome) => Wait::Completed(outcome),
                    Err(_) => Wait::Closed,
                }
            }
        }
    }

    /// `"<os> <arch>"` of the host running the bridge.
    pub fn platform_version(&self) -> String {
        format!("{} {}", std::env::consts::OS, std::env::consts::ARCH)
    }

    pub async fn is_bluetooth_enabled(&self) -> bool {
        self.adapter.state().await.is_powered_on()
    }

    /// Whether the bridge may use the radio. Unauthorized and powered-off
    /// radios both report false.
    pub async fn check_bluetooth_permissions(&self) -> bool {
        let state = self.adapter.state().await;
        tracing::debug!(?state, "Checking Bluetooth permissions");
        state.is_powered_on()
    }

    /// Turning the radio on is left to the platform.
    pub async fn enable_bluetooth(&self) -> bool {
        tracing::debug!("enableBluetooth is not supported by this bridge");
        false
    }

    /// Scan for printers of `kind`. Bluetooth scans run for the configured
    /// window; USB enumeration always comes back empty.
    pub async fn get_printers(&self, kind: PrinterKind) -> Vec<DeviceRecord> {
        if kind == PrinterKind::Usb {
            return registry::usb_printers();
        }

        let (token, mut rx) = {
            let mut ctx = self.ctx.lock().await;
            ctx.registry.begin_scan();
            ctx.correlator.register(InvocationKind::Scan)
        };

        tracing::info!(
            window_ms = self.config.scan_window.as_millis() as u64,
            "Starting BLE scan"
        );
        let wait = match self.adapter.start_scan(None).await {
            Ok(()) => self.wait_for(token, &mut rx, self.config.scan_window).await,
            Err(e) => Wait::Completed(Err(e.to_string())),
        };

        let mut ctx = match wait {
            Wait::TimedOut(ctx) => ctx,
            Wait::Completed(Err(reason)) => {
                tracing::warn!(%reason, "Scan window closed early");
                self.ctx.lock().await
            }
            Wait::Completed(Ok(())) | Wait::Closed => self.ctx.lock().await,
        };
        ctx.correlator.cancel(token);

        if let Err(e) = self.adapter.stop_scan().await {
            tracing::warn!(error = %e, "Failed to stop scan");
        }
        let printers = ctx.registry.close_scan();
        tracing::info!(count = printers.len(), "BLE scan complete");
        printers
    }

    /// Connect to the printer at `address`. True once the link is up and
    /// service discovery has been requested.
    pub async fn connect(&self, address: &str) -> bool {
        match self.try_connect(address).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(address, error = %e, "Connect failed");
                false
            }
        }
    }

    async fn try_connect(&self, address: &str) -> Result<()> {
        let id = PeripheralId::parse(address)?;
        tracing::info!(%id, "Attempting to connect to device");

        if !self.adapter.resolve_peripheral(&id).await {
            return Err(BridgeError::PeripheralNotFound(address.to_string()));
        }

        let (token, mut rx, stale) = {
            let mut ctx = self.ctx.lock().await;
            if ctx.coordinator.is_linked_to(&id) {
                tracing::info!(%id, "Device already connected");
                return Ok(());
            }

            let (token, rx) = ctx.correlator.register(InvocationKind::Connect);
            let mut stale = None;
            if let Some(superseded) = ctx.coordinator.begin_connect(id, token) {
                if let Some(previous) = superseded.token {
                    ctx.correlator
                        .resolve(previous, Err(BridgeError::Superseded.to_string()));
                }
                ctx.correlator.fail_writes("connection superseded");
                stale = superseded.cancel;
            }
            (token, rx, stale)
        };

        if let Some(stale) = stale {
            if let Err(e) = self.adapter.cancel_connection(&stale).await {
                tracing::warn!(%stale, error = %e, "Failed to cancel superseded connection");
            }
        }
        if let Err(e) = self.adapter.connect(&id).await {
            let mut ctx = self.ctx.lock().await;
            ctx.coordinator.abort_connect(token);
            ctx.correlator.cancel(token);
            return Err(e);
        }

        match self.wait_for(token, &mut rx, self.config.connect_timeout).await {
            Wait::Completed(Ok(())) => {
                tracing::info!(%id, "Successfully connected to peripheral");
                Ok(())
            }
            Wait::Completed(Err(reason)) => Err(BridgeError::ConnectionFailed(reason)),
            Wait::Closed => Err(BridgeError::Shutdown),
            Wait::TimedOut(mut ctx) => {
                let stale = ctx.coordinator.connect_timed_out(token);
                drop(ctx);
                if let Some(stale) = stale {
                    if let Err(e) = self.adapter.cancel_connection(&stale).await {
                        tracing::warn!(%stale, error = %e, "Failed to cancel timed-out attempt");
                    }
                }
                Err(BridgeError::ConnectionTimeout(
                    self.config.connect_timeout.as_millis() as u64,
                ))
            }
        }
    }

    /// Whether the link to the printer is up.
    pub async fn is_connected(&self) -> bool {
        let connected = self.ctx.lock().await.coordinator.is_connected();
        tracing::debug!(connected, "Connection status");
        connected
    }

    /// Whether the write characteristic has been discovered.
    pub async fn is_ready(&self) -> bool {
        self.ctx.lock().await.coordinator.is_ready()
    }

    pub async fn phase(&self) -> Phase {
        self.ctx.lock().await.coordinator.phase()
    }

    /// Number of invocations currently waiting on the adapter.
    pub async fn pending_requests(&self) -> usize {
        self.ctx.lock().await.correlator.pending_count()
    }

    /// Drop the current connection. False if there was none.
    pub async fn disconnect(&self) -> bool {
        let id = {
            let mut ctx = self.ctx.lock().await;
            let Some((id, pending)) = ctx.coordinator.begin_disconnect() else {
                tracing::info!("No peripheral to disconnect");
                return false;
            };

            tracing::info!(%id, "Disconnecting from peripheral");
            if let Some(token) = pending {
                ctx.correlator
                    .resolve(token, Err("connect cancelled by disconnect".into()));
            }
            ctx.correlator.fail_writes("disconnected");
            id
        };

        if let Err(e) = self.adapter.cancel_connection(&id).await {
            tracing::warn!(%id, error = %e, "Adapter failed to cancel connection");
        }
        // A connect issued meanwhile owns the coordinator now.
        self.ctx.lock().await.coordinator.finish_disconnect();
        true
    }

    /// Send raw bytes in paced chunks.
    pub async fn write_bytes(&self, payload: &[u8]) -> bool {
        match self.try_write(payload, InvocationKind::WriteBytes).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(bytes = payload.len(), error = %e, "writebytes failed");
                false
            }
        }
    }

    /// Send `text` as UTF-8 in a single write.
    pub async fn print_string(&self, text: &str) -> bool {
        match self.try_write(text.as_bytes(), InvocationKind::PrintString).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(chars = text.chars().count(), error = %e, "printstring failed");
                false
            }
        }
    }

    async fn try_write(&self, data: &[u8], kind: InvocationKind) -> Result<()> {
        let chunked = kind == InvocationKind::WriteBytes;
        let writes = if chunked {
            self.pipeline.chunk_count(data.len())
        } else {
            1
        };

        let (target, confirmation) = {
            let mut ctx = self.ctx.lock().await;
            let target = ctx.coordinator.write_target()?;
            let confirmation = (self.pipeline.mode() == WriteMode::WithResponse && writes > 0)
                .then(|| ctx.correlator.register_counted(kind, writes));
            (target, confirmation)
        };

        tracing::info!(bytes = data.len(), writes, ?kind, "Attempting to write");
        let sent = if chunked {
            self.pipeline
                .write_chunked(self.adapter.as_ref(), &target, data)
                .await
                .map(|_| ())
        } else {
            self.pipeline
                .write_once(self.adapter.as_ref(), &target, data)
                .await
        };

        if let Err(e) = sent {
            if let Some((token, _)) = confirmation {
                self.ctx.lock().await.correlator.cancel(token);
            }
            return Err(e);
        }

        let Some((token, mut rx)) = confirmation else {
            return Ok(());
        };
        match self.wait_for(token, &mut rx, self.config.connect_timeout).await {
            Wait::Completed(Ok(())) => Ok(()),
            Wait::Completed(Err(reason)) => Err(BridgeError::Write(reason)),
            Wait::TimedOut(_) => Err(BridgeError::Write("write confirmation timed out".into())),
            Wait::Closed => Err(BridgeError::Shutdown),
        }
    }
}

fn on_state_changed(ctx: &mut BridgeContext, state: AdapterState) {
    match state {
        AdapterState::PoweredOn => tracing::info!("Bluetooth is enabled"),
        AdapterState::PoweredOff => tracing::warn!("Bluetooth is powered off"),
        AdapterState::Unauthorized => tracing::warn!("Bluetooth is unauthorized"),
        AdapterState::Unsupported => tracing::warn!("Bluetooth is unsupported"),
        AdapterState::Resetting => tracing::info!("Bluetooth is resetting"),
        AdapterState::Unknown => tracing::info!("Bluetooth state is unknown"),
    }

    if !state.is_powered_on() {
        ctx.coordinator.abandon();
        ctx.correlator.fail_all(&format!("adapter state {state:?}"));
    }
}

fn on_write_completed(
    ctx: &mut BridgeContext,
    id: PeripheralId,
    characteristic: Uuid,
    error: Option<String>,
) {
    let outcome = match error {
        Some(error) => {
            tracing::warn!(%id, %characteristic, %error, "Error writing value");
            Err(error)
        }
        None => {
            tracing::debug!(%id, %characteristic, "Successfully wrote value");
            Ok(())
        }
    };
    if ctx.correlator.resolve_oldest_write(outcome).is_none() {
        tracing::debug!(%id, "Write confirmation with no pending write dropped");
    }
}
