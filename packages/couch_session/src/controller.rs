//! Session controller: lifecycle, event surface, and public operations.
//!
//! ```text
//! Connecting ──Welcome(+TimeReply)──▶ Ready ──Ready delivered──▶ Active
//!      │                                 │                          │
//!      └──────── Closed / Rejected / transport gone / disconnect ───┴──▶ Terminated
//! ```
//!
//! The controller is driven by [`SessionController::next_event`]. All
//! registry mutation, routing, and notification dispatch happen on the
//! caller's task; the only await points are the transport and the time
//! sync re-probe timer.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::protocol::{ClientFrame, HostFrame, PROTOCOL_VERSION, TransportLink};
use crate::registry::{DeviceRegistry, SlotChange};
use crate::router::MessageRouter;
use crate::time_sync::TimeSyncService;
use crate::types::{DeviceId, DeviceState, Orientation, Role};
use crate::ui::{HeadlessUi, HostUi};

/// Profile picture edge length when none is requested.
pub const DEFAULT_PICTURE_SIZE: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Connecting,
    /// Handshake done, `Ready` notification not yet delivered.
    Ready,
    Active,
    Terminated,
}

/// Notifications delivered to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent<P> {
    /// Fires exactly once, before any other notification.
    Ready { join_code: String },
    Message { from: DeviceId, payload: P },
    /// `state: None` means the device left.
    DeviceStateChange {
        device_id: DeviceId,
        state: Option<DeviceState>,
    },
}

pub struct SessionController<P = serde_json::Value> {
    config: SessionConfig,
    role: Role,
    phase: SessionPhase,
    link: TransportLink,
    registry: DeviceRegistry,
    router: MessageRouter,
    time_sync: TimeSyncService,
    join_code: Option<String>,
    ui: Box<dyn HostUi>,
    orientation: Orientation,
    default_ui_visible: bool,
    /// Device states from the welcome snapshot, delivered right after `Ready`.
    snapshot_events: Vec<SessionEvent<P>>,
    /// Frames that arrived before the handshake finished.
    held: VecDeque<HostFrame>,
    pending: VecDeque<SessionEvent<P>>,
    subscribers: Vec<mpsc::UnboundedSender<SessionEvent<P>>>,
    resync: Option<Interval>,
}

enum Wake {
    Frame(Option<HostFrame>),
    Resync,
}

impl<P> SessionController<P>
where
    P: Serialize + DeserializeOwned + Clone,
{
    /// Open a new session as the screen (device 0).
    pub fn screen(config: SessionConfig, link: TransportLink) -> Self {
        Self::with_collaborators(
            config,
            Role::Screen,
            None,
            link,
            Box::new(HeadlessUi),
            Arc::new(SystemClock),
        )
    }

    /// Join an existing session as a controller.
    pub fn controller(
        config: SessionConfig,
        join_code: impl Into<String>,
        link: TransportLink,
    ) -> Self {
        Self::with_collaborators(
            config,
            Role::Controller,
            Some(join_code.into()),
            link,
            Box::new(HeadlessUi),
            Arc::new(SystemClock),
        )
    }

    pub fn with_collaborators(
        config: SessionConfig,
        role: Role,
        join_code: Option<String>,
        link: TransportLink,
        mut ui: Box<dyn HostUi>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        if config.setup_document {
            ui.setup_document();
        }
        ui.set_orientation(config.orientation);

        let mut controller = Self {
            role,
            phase: SessionPhase::Connecting,
            link,
            registry: DeviceRegistry::new(),
            router: MessageRouter::new(),
            time_sync: TimeSyncService::new(config.synchronize_time, clock),
            join_code: None,
            ui,
            orientation: config.orientation,
            default_ui_visible: true,
            snapshot_events: Vec::new(),
            held: VecDeque::new(),
            pending: VecDeque::new(),
            subscribers: Vec::new(),
            resync: None,
            config,
        };

        let join = ClientFrame::Join {
            version: PROTOCOL_VERSION,
            role,
            join_code,
            nickname: controller.config.nickname.clone(),
        };
        if controller.transmit(join).is_ok() {
            debug!(?role, "join requested");
        }
        controller
    }

    // -------------------------------------------------------------------------
    // Event surface
    // -------------------------------------------------------------------------

    /// Wait for the next notification. Returns `None` once the session is
    /// terminated; no notification is delivered after that.
    pub async fn next_event(&mut self) -> Option<SessionEvent<P>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                if matches!(event, SessionEvent::Ready { .. }) {
                    self.phase = SessionPhase::Active;
                    self.start_resync();
                }
                self.fan_out(&event);
                return Some(event);
            }
            if self.phase == SessionPhase::Terminated {
                return None;
            }

            let wake = tokio::select! {
                frame = self.link.inbound.recv() => Wake::Frame(frame),
                _ = resync_tick(&mut self.resync) => Wake::Resync,
            };
            match wake {
                Wake::Frame(Some(frame)) => self.handle_frame(frame),
                Wake::Frame(None) => self.terminate("transport closed"),
                Wake::Resync => self.send_probe(),
            }
        }
    }

    /// Additional event stream receiving every notification `next_event`
    /// delivers. Drop the receiver to unsubscribe.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<SessionEvent<P>> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.phase != SessionPhase::Terminated {
            self.subscribers.push(tx);
        }
        rx
    }

    fn fan_out(&mut self, event: &SessionEvent<P>) {
        // A subscriber that went away never blocks the others.
        self.subscribers
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    // -------------------------------------------------------------------------
    // Inbound frames
    // -------------------------------------------------------------------------

    fn handle_frame(&mut self, frame: HostFrame) {
        match frame {
            HostFrame::Welcome {
                device_id,
                join_code,
                devices,
            } => self.on_welcome(device_id, join_code, devices),
            HostFrame::TimeReply {
                probe_id,
                server_time,
            } => self.on_time_reply(probe_id, server_time),
            HostFrame::Rejected { reason } => {
                warn!(%reason, "join rejected");
                self.terminate("join rejected");
            }
            HostFrame::Closed { reason } => {
                info!(%reason, "session closed by host");
                self.terminate("closed by host");
            }
            other if self.phase == SessionPhase::Connecting => self.held.push_back(other),
            HostFrame::DeviceState { device_id, state } => self.on_device_state(device_id, state),
            HostFrame::Message { from, seq, data } => self.on_message(from, seq, data),
            HostFrame::NavigateHome => self.ui.navigate_home(),
        }
    }

    fn on_welcome(
        &mut self,
        device_id: DeviceId,
        join_code: String,
        devices: Vec<Option<DeviceState>>,
    ) {
        if self.registry.self_id().is_some() {
            warn!(device = %device_id, "ignoring repeated welcome");
            return;
        }
        if device_id.is_screen() != (self.role == Role::Screen) {
            warn!(device = %device_id, role = ?self.role, "host assigned a slot that contradicts our role");
            self.terminate("protocol violation");
            return;
        }
        if let Err(e) = self.registry.assign_self(device_id) {
            warn!("welcome rejected: {e}");
            self.terminate("protocol violation");
            return;
        }

        for (index, state) in devices.into_iter().enumerate() {
            let Some(state) = state else { continue };
            let id = DeviceId(index as u32);
            match self.registry.upsert(id, state.clone()) {
                Ok(_) if id != device_id => {
                    self.snapshot_events.push(SessionEvent::DeviceStateChange {
                        device_id: id,
                        state: Some(state),
                    });
                }
                Ok(_) => {}
                Err(e) => warn!(device = %id, "skipping snapshot entry: {e}"),
            }
        }

        info!(device = %device_id, %join_code, "joined session");
        self.join_code = Some(join_code);

        if self.time_sync.is_requested() {
            self.send_probe();
        } else {
            self.become_ready();
        }
    }

    fn on_time_reply(&mut self, probe_id: u64, server_time: i64) {
        let Some(measurement) = self.time_sync.complete_probe(probe_id, server_time) else {
            return;
        };
        debug!(offset_ms = measurement.offset_ms, rtt_ms = measurement.rtt_ms, "clock synchronized");
        if self.phase == SessionPhase::Connecting && self.registry.self_id().is_some() {
            self.become_ready();
        }
    }

    fn become_ready(&mut self) {
        let join_code = self.join_code.clone().unwrap_or_default();
        self.phase = SessionPhase::Ready;
        self.pending.push_back(SessionEvent::Ready { join_code });
        self.pending.extend(self.snapshot_events.drain(..));

        let held = std::mem::take(&mut self.held);
        for frame in held {
            self.handle_frame(frame);
        }
    }

    fn on_device_state(&mut self, device_id: DeviceId, state: Option<DeviceState>) {
        match state {
            Some(mut state) => {
                // Our own custom state is authoritative locally; the host may
                // not have seen the latest SetCustom yet.
                if Some(device_id) == self.registry.self_id() {
                    if let Some(own) = self.registry.get(None) {
                        state.custom = own.custom.clone();
                    }
                }
                self.apply_device_state(device_id, state);
            }
            None => {
                if self.registry.remove(device_id).is_some() {
                    debug!(device = %device_id, "device left");
                    self.router.forget_sender(device_id);
                    self.pending.push_back(SessionEvent::DeviceStateChange {
                        device_id,
                        state: None,
                    });
                }
            }
        }
    }

    fn apply_device_state(&mut self, device_id: DeviceId, state: DeviceState) {
        match self.registry.upsert(device_id, state.clone()) {
            Ok(SlotChange::Unchanged) => {}
            Ok(change) => {
                debug!(device = %device_id, ?change, "device state changed");
                self.pending.push_back(SessionEvent::DeviceStateChange {
                    device_id,
                    state: Some(state),
                });
            }
            Err(e) => warn!(device = %device_id, "rejected device state: {e}"),
        }
    }

    fn on_message(&mut self, from: DeviceId, seq: u64, data: serde_json::Value) {
        if !self.router.accept_inbound(from, seq) {
            return;
        }
        match serde_json::from_value::<P>(data) {
            Ok(payload) => self
                .pending
                .push_back(SessionEvent::Message { from, payload }),
            Err(e) => warn!(from = %from, seq, "dropping undecodable message: {e}"),
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    fn transmit(&mut self, frame: ClientFrame) -> Result<()> {
        if self.link.outbound.send(frame).is_err() {
            self.terminate("transport closed");
            return Err(SessionError::SessionClosed);
        }
        Ok(())
    }

    fn send_probe(&mut self) {
        if let Some(probe_id) = self.time_sync.begin_probe() {
            let _ = self.transmit(ClientFrame::TimeProbe { probe_id });
        }
    }

    fn start_resync(&mut self) {
        // A zero period means "probe once", same as no interval.
        let period = self
            .config
            .time_resync_interval
            .filter(|period| !period.is_zero());
        if let (Some(period), true) = (period, self.time_sync.is_requested()) {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            self.resync = Some(interval);
        }
    }

    fn terminate(&mut self, reason: &str) {
        if self.phase == SessionPhase::Terminated {
            return;
        }
        info!(%reason, "session terminated");
        self.phase = SessionPhase::Terminated;
        self.pending.clear();
        self.held.clear();
        self.snapshot_events.clear();
        self.time_sync.cancel();
        self.resync = None;
        self.subscribers.clear();
    }

    /// Leave the session. Pending notifications and in-flight probes are
    /// discarded.
    pub fn disconnect(&mut self) {
        if self.phase == SessionPhase::Terminated {
            return;
        }
        let _ = self.link.outbound.send(ClientFrame::Leave);
        self.terminate("disconnect");
    }

    fn ensure_open(&self) -> Result<()> {
        match self.phase {
            SessionPhase::Terminated => Err(SessionError::SessionClosed),
            _ => Ok(()),
        }
    }

    fn ensure_established(&self, operation: &'static str) -> Result<()> {
        match self.phase {
            SessionPhase::Terminated => Err(SessionError::SessionClosed),
            SessionPhase::Connecting => Err(SessionError::NotReady(operation)),
            SessionPhase::Ready | SessionPhase::Active => Ok(()),
        }
    }

    // -------------------------------------------------------------------------
    // Properties
    // -------------------------------------------------------------------------

    pub fn version(&self) -> &'static str {
        crate::VERSION
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// This device's slot, once assigned.
    pub fn device_id(&self) -> Option<DeviceId> {
        self.registry.self_id()
    }

    pub fn join_code(&self) -> Option<&str> {
        self.join_code.as_deref()
    }

    /// Positional view of the session; `None` marks an absent slot.
    pub fn devices(&self) -> Result<Vec<Option<&DeviceState>>> {
        self.ensure_open()?;
        Ok(self.registry.devices())
    }

    /// Controllers currently connected, in id order.
    pub fn controller_ids(&self) -> Result<Vec<DeviceId>> {
        self.ensure_open()?;
        Ok(self.registry.controller_ids())
    }

    pub fn server_time_offset(&self) -> Result<i64> {
        self.ensure_open()?;
        self.time_sync.offset()
    }

    // -------------------------------------------------------------------------
    // Operations
    // -------------------------------------------------------------------------

    /// Send `payload` to one device, or to every other device when `to` is
    /// `None`. Returns once the frame is handed to the transport.
    pub fn send(&mut self, to: Option<DeviceId>, payload: &P) -> Result<()> {
        self.ensure_established("send")?;
        let route = self.router.resolve(&self.registry, to)?;
        let data = serde_json::to_value(payload)?;
        let seq = self.router.stamp();
        debug!(?route, seq, "send");
        self.transmit(ClientFrame::Message {
            to: route.target(),
            seq,
            data,
        })
    }

    pub fn broadcast(&mut self, payload: &P) -> Result<()> {
        self.send(None, payload)
    }

    /// Host clock estimate in milliseconds. Never decreases between calls.
    pub fn get_server_time(&self) -> Result<i64> {
        self.ensure_open()?;
        if self.time_sync.is_requested() && self.phase == SessionPhase::Connecting {
            return Err(SessionError::NotReady("get_server_time before ready"));
        }
        self.time_sync.server_time()
    }

    pub fn get_custom_state(&self, device_id: Option<DeviceId>) -> Result<Option<&serde_json::Value>> {
        self.ensure_open()?;
        Ok(self.registry.get_custom_state(device_id))
    }

    /// Replace this device's custom state and publish it to the session.
    /// `uid` and `nickname` are untouched.
    pub fn set_custom_state<T: Serialize>(&mut self, custom: &T) -> Result<()> {
        self.ensure_established("set_custom_state")?;
        let custom = serde_json::to_value(custom)?;
        self.registry.set_custom_state(custom.clone())?;
        self.transmit(ClientFrame::SetCustom { custom })
    }

    pub fn get_nickname(&self, device_id: Option<DeviceId>) -> Result<Option<&str>> {
        self.ensure_open()?;
        Ok(self.registry.get_nickname(device_id))
    }

    pub fn get_profile_picture(
        &self,
        device_id: Option<DeviceId>,
        size: Option<u32>,
    ) -> Result<Option<String>> {
        self.ensure_open()?;
        Ok(self.registry.get(device_id).map(|state| {
            format!(
                "{}?uid={}&size={}",
                self.config.profile_picture_base_url,
                state.uid,
                size.unwrap_or(DEFAULT_PICTURE_SIZE)
            )
        }))
    }

    pub fn set_orientation(&mut self, orientation: Orientation) -> Result<()> {
        self.ensure_open()?;
        if self.orientation != orientation {
            self.orientation = orientation;
            self.ui.set_orientation(orientation);
        }
        Ok(())
    }

    pub fn show_default_ui(&mut self, visible: bool) -> Result<()> {
        self.ensure_open()?;
        if self.default_ui_visible != visible {
            self.default_ui_visible = visible;
            self.ui.show_default_ui(visible);
        }
        Ok(())
    }

    /// Ask every device in the session to return to the start screen.
    pub fn navigate_home(&mut self) -> Result<()> {
        self.ensure_established("navigate_home")?;
        self.ui.navigate_home();
        self.transmit(ClientFrame::NavigateHome)
    }
}

async fn resync_tick(resync: &mut Option<Interval>) {
    match resync {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
