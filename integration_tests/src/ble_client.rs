//! btleplug-backed central for talking to the echo server.
//!
//! [`BtleplugTransport`] implements the central transport capability on top
//! of btleplug. btleplug calls complete in place, so each request pushes its
//! completion event onto a channel that [`Session`] feeds back into the
//! [`EchoClient`] one event at a time.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use anyhow::{anyhow, Result};
use ble_chat_transport::ble::{
    CentralEvent, CentralTransport, CharacteristicProperties, LinkHandle, PeerId, TimerToken, TransportError,
};
use ble_chat_transport::ble::ECHO_SERVICE;
use ble_chat_transport::protocol::Packet;
use ble_chat_transport::{EchoClient, EventSink, LinkConfig, LinkEvent};
use btleplug::api::{Central, CentralEvent as AdapterEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use uuid::Uuid;

/// Upper bound on connect plus bootstrap
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Upper bound on one message send
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

fn transport_error(error: btleplug::Error) -> TransportError {
    log::warn!("btleplug: {}", error);
    match error {
        btleplug::Error::NotConnected => TransportError::NotConnected,
        btleplug::Error::PermissionDenied => TransportError::Rejected,
        btleplug::Error::NotSupported(_) => TransportError::NotSupported,
        _ => TransportError::Io,
    }
}

/// Central transport over the first local Bluetooth adapter.
pub struct BtleplugTransport {
    adapter: Adapter,
    discovered: HashMap<PeerId, Peripheral>,
    connected: Option<(LinkHandle, Peripheral)>,
    next_handle: u32,
    events: UnboundedSender<CentralEvent>,
    forwarders: Vec<JoinHandle<()>>,
}

impl BtleplugTransport {
    pub async fn new(events: UnboundedSender<CentralEvent>) -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No Bluetooth adapters found"))?;

        Ok(Self {
            adapter,
            discovered: HashMap::new(),
            connected: None,
            next_handle: 1,
            events,
            forwarders: Vec::new(),
        })
    }

    /// Scan for a device advertising `name` and remember it for `connect`.
    pub async fn scan(&mut self, name: &str, scan_timeout: Duration) -> Result<PeerId> {
        self.adapter.start_scan(ScanFilter::default()).await?;
        let found = self.find_device_by_name(name, scan_timeout).await;
        self.adapter.stop_scan().await?;

        let peripheral = found?;
        let peer = PeerId::new(peripheral.address().into_inner());
        self.discovered.insert(peer, peripheral);
        Ok(peer)
    }

    async fn find_device_by_name(&self, name: &str, scan_timeout: Duration) -> Result<Peripheral> {
        let start = std::time::Instant::now();

        while start.elapsed() < scan_timeout {
            for peripheral in self.adapter.peripherals().await? {
                if let Some(props) = peripheral.properties().await? {
                    if props.local_name.as_deref() == Some(name) {
                        return Ok(peripheral);
                    }
                }
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        Err(anyhow!("Device '{}' not found within timeout", name))
    }

    fn emit(&self, event: CentralEvent) {
        // The receiver lives as long as the session
        let _ = self.events.send(event);
    }

    fn peripheral(&self, link: LinkHandle) -> Result<&Peripheral, TransportError> {
        match &self.connected {
            Some((handle, peripheral)) if *handle == link => Ok(peripheral),
            _ => Err(TransportError::NotConnected),
        }
    }

    fn find_characteristic(&self, link: LinkHandle, service: u128, uuid: u128) -> Option<Characteristic> {
        let peripheral = self.peripheral(link).ok()?;
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == Uuid::from_u128(uuid) && c.service_uuid == Uuid::from_u128(service))
    }

    fn characteristic_or_err(&self, link: LinkHandle, uuid: u128) -> Result<Characteristic, TransportError> {
        self.find_characteristic(link, ECHO_SERVICE.service, uuid)
            .ok_or(TransportError::NotSupported)
    }

    /// Forward notifications and peer-initiated disconnects as events.
    async fn spawn_forwarders(&mut self, peripheral: &Peripheral) -> Result<(), TransportError> {
        let mut notifications = peripheral.notifications().await.map_err(transport_error)?;
        let mut adapter_events = self.adapter.events().await.map_err(transport_error)?;
        let id = peripheral.id();

        let events = self.events.clone();
        self.forwarders.push(tokio::spawn(async move {
            while let Some(data) = notifications.next().await {
                match Packet::from_slice(&data.value) {
                    Ok(value) => {
                        let _ = events.send(CentralEvent::Notified {
                            characteristic: data.uuid.as_u128(),
                            value,
                        });
                    }
                    Err(error) => log::warn!("dropping notification: {}", error),
                }
            }
        }));

        let events = self.events.clone();
        self.forwarders.push(tokio::spawn(async move {
            while let Some(event) = adapter_events.next().await {
                if let AdapterEvent::DeviceDisconnected(disconnected) = event {
                    if disconnected == id {
                        let _ = events.send(CentralEvent::Disconnected);
                        return;
                    }
                }
            }
        }));
        Ok(())
    }

    fn stop_forwarders(&mut self) {
        for forwarder in self.forwarders.drain(..) {
            forwarder.abort();
        }
    }
}

impl CentralTransport for BtleplugTransport {
    async fn connect(&mut self, peer: PeerId) -> Result<LinkHandle, TransportError> {
        let peripheral = self.discovered.get(&peer).cloned().ok_or(TransportError::NotConnected)?;
        peripheral.connect().await.map_err(transport_error)?;
        self.spawn_forwarders(&peripheral).await?;

        let handle = LinkHandle(self.next_handle);
        self.next_handle += 1;
        self.connected = Some((handle, peripheral));
        self.emit(CentralEvent::Connected);
        Ok(handle)
    }

    async fn disconnect(&mut self, link: LinkHandle) -> Result<(), TransportError> {
        let peripheral = self.peripheral(link)?.clone();

        // Requested disconnects are reported below, not by the watcher
        self.stop_forwarders();
        let result = peripheral.disconnect().await.map_err(transport_error);
        self.connected = None;
        // On failure the engine finishes the disconnect itself
        if result.is_ok() {
            self.emit(CentralEvent::Disconnected);
        }
        result
    }

    async fn discover_services(&mut self, link: LinkHandle) -> Result<(), TransportError> {
        let result = self.peripheral(link)?.discover_services().await;
        self.emit(CentralEvent::ServicesDiscovered { success: result.is_ok() });
        Ok(())
    }

    fn has_service(&self, link: LinkHandle, service: u128) -> bool {
        self.peripheral(link)
            .map(|p| p.services().iter().any(|s| s.uuid == Uuid::from_u128(service)))
            .unwrap_or(false)
    }

    fn characteristic(&self, link: LinkHandle, service: u128, characteristic: u128) -> Option<CharacteristicProperties> {
        self.find_characteristic(link, service, characteristic)
            .map(|c| CharacteristicProperties::from_bits_truncate(c.properties.bits()))
    }

    async fn read_characteristic(&mut self, link: LinkHandle, characteristic: u128) -> Result<(), TransportError> {
        let target = self.characteristic_or_err(link, characteristic)?;
        let result = self.peripheral(link)?.read(&target).await;

        let value = result
            .map_err(transport_error)
            .and_then(|bytes| Packet::from_slice(&bytes).map_err(|_| TransportError::Io));
        self.emit(CentralEvent::ReadComplete { characteristic, value });
        Ok(())
    }

    async fn write_characteristic(
        &mut self,
        link: LinkHandle,
        characteristic: u128,
        value: &[u8],
    ) -> Result<(), TransportError> {
        let target = self.characteristic_or_err(link, characteristic)?;
        let result = self
            .peripheral(link)?
            .write(&target, value, WriteType::WithResponse)
            .await;

        if let Err(error) = &result {
            log::warn!("write failed: {}", error);
        }
        self.emit(CentralEvent::WriteComplete {
            characteristic,
            success: result.is_ok(),
        });
        Ok(())
    }

    /// btleplug writes the configuration descriptor itself when subscribing
    async fn set_notification_enabled(
        &mut self,
        link: LinkHandle,
        characteristic: u128,
        enabled: bool,
    ) -> Result<(), TransportError> {
        let target = self.characteristic_or_err(link, characteristic)?;
        let peripheral = self.peripheral(link)?;
        let result = if enabled {
            peripheral.subscribe(&target).await
        } else {
            peripheral.unsubscribe(&target).await
        };

        if let Err(error) = &result {
            log::warn!("subscription change failed: {}", error);
        }
        self.emit(CentralEvent::NotificationEnabled {
            characteristic,
            success: result.is_ok(),
        });
        Ok(())
    }

    /// The descriptor was already written by `set_notification_enabled`
    async fn write_descriptor(
        &mut self,
        link: LinkHandle,
        _characteristic: u128,
        descriptor: u128,
        _value: &[u8],
    ) -> Result<(), TransportError> {
        self.peripheral(link)?;
        self.emit(CentralEvent::DescriptorWritten {
            descriptor,
            success: true,
        });
        Ok(())
    }

    fn start_timer(&mut self, token: TimerToken, after_ms: u32) {
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(u64::from(after_ms))).await;
            let _ = events.send(CentralEvent::TimerFired(token));
        });
    }
}

/// Application events waiting to be consumed
#[derive(Debug, Default)]
pub struct EventQueue(VecDeque<LinkEvent>);

impl EventQueue {
    pub fn pop(&mut self) -> Option<LinkEvent> {
        self.0.pop_front()
    }
}

impl EventSink for EventQueue {
    fn emit(&mut self, event: LinkEvent) {
        log::debug!("event: {:?}", event);
        self.0.push_back(event);
    }
}

pub type Client = EchoClient<BtleplugTransport, EventQueue>;

/// A connected echo client plus the event loop driving it.
pub struct Session {
    client: Client,
    events: UnboundedReceiver<CentralEvent>,
    peer: PeerId,
    backlog: VecDeque<LinkEvent>,
}

impl Session {
    /// Scan for `name`, connect and wait for the link to become ready.
    pub async fn connect_by_name(name: &str, scan_timeout: Duration, config: LinkConfig) -> Result<Self> {
        let (tx, rx) = unbounded_channel();
        let mut transport = BtleplugTransport::new(tx).await?;
        let peer = transport.scan(name, scan_timeout).await?;

        let mut session = Self {
            client: EchoClient::new(transport, EventQueue::default(), config),
            events: rx,
            peer,
            backlog: VecDeque::new(),
        };
        session.open().await?;
        Ok(session)
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut Client {
        &mut self.client
    }

    /// Connect to the remembered peer and wait for `Connected`.
    pub async fn open(&mut self) -> Result<()> {
        self.client
            .connect(Some(self.peer))
            .await
            .map_err(|e| anyhow!("connect failed: {}", e))?;

        match self
            .wait_for(CONNECT_TIMEOUT, |e| {
                matches!(e, LinkEvent::Connected(_) | LinkEvent::BootstrapFailed(_))
            })
            .await?
        {
            LinkEvent::Connected(_) => Ok(()),
            other => Err(anyhow!("bootstrap failed: {:?}", other)),
        }
    }

    /// Disconnect and wait until the link is gone.
    pub async fn close(&mut self) -> Result<()> {
        self.client
            .disconnect()
            .await
            .map_err(|e| anyhow!("disconnect failed: {}", e))?;
        self.wait_for(CONNECT_TIMEOUT, |e| matches!(e, LinkEvent::Disconnected(_)))
            .await?;
        Ok(())
    }

    /// Send text and wait until every packet has been written.
    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        self.client
            .send_text(text)
            .await
            .map_err(|e| anyhow!("send failed: {}", e))?;

        match self
            .wait_for(SEND_TIMEOUT, |e| {
                matches!(e, LinkEvent::MessageSent | LinkEvent::SendFailed(_))
            })
            .await?
        {
            LinkEvent::MessageSent => Ok(()),
            other => Err(anyhow!("send failed: {:?}", other)),
        }
    }

    /// Wait for the next received packet.
    pub async fn next_packet(&mut self, wait: Duration) -> Result<Packet> {
        match self
            .wait_for(wait, |e| matches!(e, LinkEvent::PacketReceived(_)))
            .await?
        {
            LinkEvent::PacketReceived(packet) => Ok(packet),
            other => Err(anyhow!("unexpected event {:?}", other)),
        }
    }

    /// Process transport events until an application event matches.
    ///
    /// Events that do not match are kept for later waits.
    pub async fn wait_for<F>(&mut self, wait: Duration, mut predicate: F) -> Result<LinkEvent>
    where
        F: FnMut(&LinkEvent) -> bool,
    {
        if let Some(index) = self.backlog.iter().position(&mut predicate) {
            if let Some(event) = self.backlog.remove(index) {
                return Ok(event);
            }
        }

        let deadline = Instant::now() + wait;

        loop {
            while let Some(event) = self.client.sink_mut().pop() {
                if predicate(&event) {
                    return Ok(event);
                }
                log::debug!("deferring {:?}", event);
                self.backlog.push_back(event);
            }

            let event = timeout_at(deadline, self.events.recv())
                .await
                .map_err(|_| anyhow!("Timeout waiting for link event"))?
                .ok_or_else(|| anyhow!("transport event channel closed"))?;
            self.client.handle_event(event).await;
        }
    }

    /// Drop every application event not yet consumed.
    pub fn discard_pending(&mut self) {
        self.backlog.clear();
        while self.client.sink_mut().pop().is_some() {}
    }

    /// Handle one pending transport event, if any arrives within `wait`.
    pub async fn poll(&mut self, wait: Duration) -> Option<LinkEvent> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        if let Some(event) = self.client.sink_mut().pop() {
            return Some(event);
        }
        if let Ok(Some(event)) = tokio::time::timeout(wait, self.events.recv()).await {
            self.client.handle_event(event).await;
        }
        self.client.sink_mut().pop()
    }
}
