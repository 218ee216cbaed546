//! In-process hosting backend.
//!
//! A single actor task owns every session table. Connections are pumped
//! into the actor's command channel, so frames from one device are handled
//! (and relayed) strictly in the order they were sent.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::{Clock, SkewedClock, SystemClock};
use crate::config::{HubFileConfig, MAX_JOIN_CODE_LEN, MIN_JOIN_CODE_LEN};
use crate::error::{Result, SessionError};
use crate::protocol::{ClientFrame, HostFrame, HostLink, PROTOCOL_VERSION, TransportLink, link_pair};
use crate::types::{DeviceId, DeviceState, Role};

/// Join code alphabet: uppercase alphanumerics without look-alikes (0/O, 1/I).
const JOIN_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Fresh codes tried before a screen join is rejected.
const JOIN_CODE_ATTEMPTS: usize = 64;

#[derive(Clone)]
pub struct HubConfig {
    pub join_code_len: usize,
    pub clock: Arc<dyn Clock>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self::from_file(&HubFileConfig::default())
    }
}

impl HubConfig {
    pub fn from_file(fc: &HubFileConfig) -> Self {
        let clock: Arc<dyn Clock> = if fc.clock_skew_ms == 0 {
            Arc::new(SystemClock)
        } else {
            Arc::new(SkewedClock {
                skew_ms: fc.clock_skew_ms,
            })
        };
        Self {
            join_code_len: fc.join_code_len,
            clock,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let len = self.join_code_len;
        if !(MIN_JOIN_CODE_LEN..=MAX_JOIN_CODE_LEN).contains(&len) {
            return Err(SessionError::Configuration(format!(
                "join_code_len must be between {MIN_JOIN_CODE_LEN} and {MAX_JOIN_CODE_LEN}, got {len}"
            )));
        }
        Ok(())
    }
}

type ConnId = u64;

enum HubCommand {
    Register {
        conn: ConnId,
        outbound: mpsc::UnboundedSender<HostFrame>,
    },
    Frame {
        conn: ConnId,
        frame: ClientFrame,
    },
    Disconnected {
        conn: ConnId,
    },
    SetSlowConnection {
        join_code: String,
        device_id: DeviceId,
        slow: bool,
        respond_to: oneshot::Sender<bool>,
    },
    Snapshot {
        join_code: String,
        respond_to: oneshot::Sender<Option<Vec<Option<DeviceState>>>>,
    },
}

/// Handle to a running hub. Cheap to clone.
#[derive(Clone)]
pub struct LocalHub {
    commands: mpsc::UnboundedSender<HubCommand>,
    next_conn: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl LocalHub {
    /// Spawn the hub actor on the current tokio runtime.
    pub fn start(config: HubConfig) -> Result<Self> {
        config.validate()?;
        let (commands, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let actor = HubActor {
            config,
            connections: HashMap::new(),
            sessions: HashMap::new(),
        };
        tokio::spawn(actor.run(rx, cancel.clone()));
        info!("local hub started");
        Ok(Self {
            commands,
            next_conn: Arc::new(AtomicU64::new(1)),
            cancel,
        })
    }

    /// Open a new device connection.
    pub fn connect(&self) -> TransportLink {
        let conn = self.next_conn.fetch_add(1, Ordering::SeqCst);
        let (device, host) = link_pair();
        let HostLink {
            mut inbound,
            outbound,
        } = host;

        let _ = self.commands.send(HubCommand::Register { conn, outbound });

        let commands = self.commands.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = inbound.recv() => match frame {
                        Some(frame) => {
                            if commands.send(HubCommand::Frame { conn, frame }).is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            let _ = commands.send(HubCommand::Disconnected { conn });
        });

        device
    }

    /// Flag (or clear) a device's high-latency marker. Returns false if the
    /// device is not connected.
    pub async fn set_slow_connection(&self, join_code: &str, device_id: DeviceId, slow: bool) -> bool {
        let (tx, rx) = oneshot::channel();
        let sent = self.commands.send(HubCommand::SetSlowConnection {
            join_code: join_code.to_string(),
            device_id,
            slow,
            respond_to: tx,
        });
        sent.is_ok() && rx.await.unwrap_or(false)
    }

    /// Host-side view of a session, or `None` if the code is unknown.
    pub async fn snapshot(&self, join_code: &str) -> Option<Vec<Option<DeviceState>>> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(HubCommand::Snapshot {
                join_code: join_code.to_string(),
                respond_to: tx,
            })
            .ok()?;
        rx.await.ok().flatten()
    }

    /// Close every session and stop the actor.
    pub fn shutdown(&self) {
        info!("shutting down local hub");
        self.cancel.cancel();
    }
}

struct Connection {
    outbound: mpsc::UnboundedSender<HostFrame>,
    membership: Option<(String, DeviceId)>,
}

struct Member {
    conn: ConnId,
    state: DeviceState,
}

#[derive(Default)]
struct HubSession {
    /// Index = device id. Ids are handed out once and never reused.
    members: Vec<Option<Member>>,
}

impl HubSession {
    fn snapshot(&self) -> Vec<Option<DeviceState>> {
        self.members
            .iter()
            .map(|m| m.as_ref().map(|m| m.state.clone()))
            .collect()
    }

    fn member_conns(&self, except: Option<DeviceId>) -> Vec<ConnId> {
        self.members
            .iter()
            .enumerate()
            .filter(|(index, _)| except.map(|id| id.index()) != Some(*index))
            .filter_map(|(_, m)| m.as_ref().map(|m| m.conn))
            .collect()
    }
}

struct HubActor {
    config: HubConfig,
    connections: HashMap<ConnId, Connection>,
    sessions: HashMap<String, HubSession>,
}

impl HubActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<HubCommand>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                command = rx.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
            }
        }

        for conn in self.connections.values() {
            let _ = conn.outbound.send(HostFrame::Closed {
                reason: "hub shutting down".to_string(),
            });
        }
        debug!("hub actor stopped");
    }

    fn handle(&mut self, command: HubCommand) {
        match command {
            HubCommand::Register { conn, outbound } => {
                self.connections.insert(
                    conn,
                    Connection {
                        outbound,
                        membership: None,
                    },
                );
            }
            HubCommand::Frame { conn, frame } => self.on_frame(conn, frame),
            HubCommand::Disconnected { conn } => {
                if let Some(connection) = self.connections.remove(&conn) {
                    if let Some((code, id)) = connection.membership {
                        self.leave(&code, id);
                    }
                }
            }
            HubCommand::SetSlowConnection {
                join_code,
                device_id,
                slow,
                respond_to,
            } => {
                let _ = respond_to.send(self.set_slow(&join_code, device_id, slow));
            }
            HubCommand::Snapshot {
                join_code,
                respond_to,
            } => {
                let _ = respond_to.send(self.sessions.get(&join_code).map(HubSession::snapshot));
            }
        }
    }

    fn send_to(&self, conn: ConnId, frame: HostFrame) {
        if let Some(connection) = self.connections.get(&conn) {
            let _ = connection.outbound.send(frame);
        }
    }

    fn fan_out(&self, conns: Vec<ConnId>, frame: HostFrame) {
        for conn in conns {
            self.send_to(conn, frame.clone());
        }
    }

    fn membership(&self, conn: ConnId) -> Option<(String, DeviceId)> {
        self.connections.get(&conn)?.membership.clone()
    }

    fn on_frame(&mut self, conn: ConnId, frame: ClientFrame) {
        match frame {
            ClientFrame::Join {
                version,
                role,
                join_code,
                nickname,
            } => self.join(conn, version, role, join_code, nickname),
            ClientFrame::TimeProbe { probe_id } => {
                let server_time = self.config.clock.now_millis();
                self.send_to(
                    conn,
                    HostFrame::TimeReply {
                        probe_id,
                        server_time,
                    },
                );
            }
            ClientFrame::Leave => {
                let membership = self
                    .connections
                    .get_mut(&conn)
                    .and_then(|connection| connection.membership.take());
                if let Some((code, id)) = membership {
                    self.leave(&code, id);
                }
            }
            other => {
                let Some((code, from)) = self.membership(conn) else {
                    warn!(conn, "frame from a connection that has not joined");
                    return;
                };
                self.relay(&code, from, other);
            }
        }
    }

    fn join(
        &mut self,
        conn: ConnId,
        version: u32,
        role: Role,
        join_code: Option<String>,
        nickname: Option<String>,
    ) {
        let reject = |hub: &Self, reason: &str| {
            warn!(conn, %reason, "join rejected");
            hub.send_to(
                conn,
                HostFrame::Rejected {
                    reason: reason.to_string(),
                },
            );
        };

        if version != PROTOCOL_VERSION {
            return reject(self, "unsupported protocol version");
        }
        if self.membership(conn).is_some() {
            return reject(self, "already joined");
        }

        let code = match (role, join_code) {
            (Role::Screen, None) => {
                let Some(code) = self.generate_join_code() else {
                    return reject(self, "no join code available");
                };
                self.sessions.insert(code.clone(), HubSession::default());
                info!(%code, "session created");
                code
            }
            (Role::Screen, Some(_)) => return reject(self, "a screen opens its own session"),
            (Role::Controller, Some(code)) if self.sessions.contains_key(&code) => code,
            (Role::Controller, _) => return reject(self, "unknown join code"),
        };

        let Some(session) = self.sessions.get_mut(&code) else {
            return;
        };
        let device_id = DeviceId(session.members.len() as u32);
        let mut state = DeviceState::new(Uuid::new_v4().to_string());
        state.nickname = nickname;
        session.members.push(Some(Member {
            conn,
            state: state.clone(),
        }));
        let devices = session.snapshot();
        let others = session.member_conns(Some(device_id));

        if let Some(connection) = self.connections.get_mut(&conn) {
            connection.membership = Some((code.clone(), device_id));
        }
        info!(%code, device = %device_id, "device joined");

        self.send_to(
            conn,
            HostFrame::Welcome {
                device_id,
                join_code: code,
                devices,
            },
        );
        self.fan_out(
            others,
            HostFrame::DeviceState {
                device_id,
                state: Some(state),
            },
        );
    }

    fn leave(&mut self, code: &str, device_id: DeviceId) {
        let Some(session) = self.sessions.get_mut(code) else {
            return;
        };

        if device_id.is_screen() {
            let Some(session) = self.sessions.remove(code) else {
                return;
            };
            info!(%code, "screen left, closing session");
            for conn in session.member_conns(Some(device_id)) {
                if let Some(connection) = self.connections.get_mut(&conn) {
                    connection.membership = None;
                }
                self.send_to(
                    conn,
                    HostFrame::Closed {
                        reason: "screen left".to_string(),
                    },
                );
            }
            return;
        }

        if let Some(slot) = session.members.get_mut(device_id.index()) {
            *slot = None;
        }
        let others = session.member_conns(None);
        info!(%code, device = %device_id, "device left");
        self.fan_out(
            others,
            HostFrame::DeviceState {
                device_id,
                state: None,
            },
        );
    }

    fn relay(&mut self, code: &str, from: DeviceId, frame: ClientFrame) {
        let Some(session) = self.sessions.get_mut(code) else {
            return;
        };

        match frame {
            ClientFrame::Message { to: Some(to), seq, data } => {
                match session.members.get(to.index()).and_then(Option::as_ref) {
                    Some(member) => {
                        let conn = member.conn;
                        self.send_to(conn, HostFrame::Message { from, seq, data });
                    }
                    None => debug!(%code, from = %from, to = %to, "dropping message to absent device"),
                }
            }
            ClientFrame::Message { to: None, seq, data } => {
                let conns = session.member_conns(Some(from));
                self.fan_out(conns, HostFrame::Message { from, seq, data });
            }
            ClientFrame::SetCustom { custom } => {
                let Some(member) = session.members.get_mut(from.index()).and_then(Option::as_mut)
                else {
                    return;
                };
                member.state.custom = Some(custom);
                let state = member.state.clone();
                let conns = session.member_conns(Some(from));
                self.fan_out(
                    conns,
                    HostFrame::DeviceState {
                        device_id: from,
                        state: Some(state),
                    },
                );
            }
            ClientFrame::NavigateHome => {
                let conns = session.member_conns(Some(from));
                self.fan_out(conns, HostFrame::NavigateHome);
            }
            ClientFrame::Join { .. } | ClientFrame::TimeProbe { .. } | ClientFrame::Leave => {}
        }
    }

    fn set_slow(&mut self, code: &str, device_id: DeviceId, slow: bool) -> bool {
        let Some(session) = self.sessions.get_mut(code) else {
            return false;
        };
        let Some(member) = session
            .members
            .get_mut(device_id.index())
            .and_then(Option::as_mut)
        else {
            return false;
        };
        member.state.slow_connection = Some(slow);
        let state = member.state.clone();
        let conns = session.member_conns(None);
        self.fan_out(
            conns,
            HostFrame::DeviceState {
                device_id,
                state: Some(state),
            },
        );
        true
    }

    fn generate_join_code(&self) -> Option<String> {
        let mut rng = rand::rng();
        for _ in 0..JOIN_CODE_ATTEMPTS {
            let code: String = (0..self.config.join_code_len)
                .map(|_| {
                    let index = rng.random_range(0..JOIN_CODE_ALPHABET.len());
                    JOIN_CODE_ALPHABET[index] as char
                })
                .collect();
            if !self.sessions.contains_key(&code) {
                return Some(code);
            }
        }
        warn!(
            attempts = JOIN_CODE_ATTEMPTS,
            "could not find an unused join code"
        );
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    async fn recv(link: &mut TransportLink) -> HostFrame {
        timeout(TEST_TIMEOUT, link.inbound.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("link closed")
    }

    fn join(role: Role, join_code: Option<&str>) -> ClientFrame {
        ClientFrame::Join {
            version: PROTOCOL_VERSION,
            role,
            join_code: join_code.map(str::to_string),
            nickname: None,
        }
    }

    /// Open a session and return (hub, screen link, join code).
    async fn open_session() -> (LocalHub, TransportLink, String) {
        let hub = LocalHub::start(HubConfig::default()).unwrap();
        let mut screen = hub.connect();
        screen.outbound.send(join(Role::Screen, None)).unwrap();
        let HostFrame::Welcome {
            device_id,
            join_code,
            devices,
        } = recv(&mut screen).await
        else {
            panic!("expected welcome");
        };
        assert_eq!(device_id, DeviceId::SCREEN);
        assert_eq!(devices.len(), 1);
        (hub, screen, join_code)
    }

    async fn join_controller(hub: &LocalHub, code: &str) -> (TransportLink, DeviceId, String) {
        let mut link = hub.connect();
        link.outbound.send(join(Role::Controller, Some(code))).unwrap();
        let HostFrame::Welcome {
            device_id, devices, ..
        } = recv(&mut link).await
        else {
            panic!("expected welcome");
        };
        let uid = devices[device_id.index()].as_ref().unwrap().uid.clone();
        (link, device_id, uid)
    }

    #[tokio::test]
    async fn join_codes_use_configured_alphabet() {
        let (_hub, _screen, code) = open_session().await;
        assert_eq!(code.len(), 6);
        assert!(code.bytes().all(|b| JOIN_CODE_ALPHABET.contains(&b)));
    }

    #[tokio::test]
    async fn controllers_get_monotonic_ids_and_fresh_uids() {
        let (hub, mut screen, code) = open_session().await;
        let (c1, id1, uid1) = join_controller(&hub, &code).await;
        let (_c2, id2, uid2) = join_controller(&hub, &code).await;
        assert_eq!((id1, id2), (DeviceId(1), DeviceId(2)));
        assert_ne!(uid1, uid2);

        assert!(matches!(
            recv(&mut screen).await,
            HostFrame::DeviceState { device_id: DeviceId(1), state: Some(_) }
        ));
        assert!(matches!(
            recv(&mut screen).await,
            HostFrame::DeviceState { device_id: DeviceId(2), state: Some(_) }
        ));

        drop(c1);
        assert_eq!(
            recv(&mut screen).await,
            HostFrame::DeviceState {
                device_id: DeviceId(1),
                state: None
            }
        );

        let (_c3, id3, uid3) = join_controller(&hub, &code).await;
        assert_eq!(id3, DeviceId(3));
        assert_ne!(uid3, uid1);

        let snapshot = hub.snapshot(&code).await.unwrap();
        assert_eq!(snapshot.len(), 4);
        assert!(snapshot[1].is_none());
    }

    #[tokio::test]
    async fn unknown_code_is_rejected() {
        let hub = LocalHub::start(HubConfig::default()).unwrap();
        let mut link = hub.connect();
        link.outbound.send(join(Role::Controller, Some("NOPE"))).unwrap();
        assert!(matches!(recv(&mut link).await, HostFrame::Rejected { .. }));
    }

    #[tokio::test]
    async fn version_mismatch_is_rejected() {
        let hub = LocalHub::start(HubConfig::default()).unwrap();
        let mut link = hub.connect();
        link.outbound
            .send(ClientFrame::Join {
                version: PROTOCOL_VERSION + 1,
                role: Role::Screen,
                join_code: None,
                nickname: None,
            })
            .unwrap();
        assert!(matches!(recv(&mut link).await, HostFrame::Rejected { .. }));
    }

    #[tokio::test]
    async fn broadcast_reaches_everyone_but_the_sender() {
        let (hub, mut screen, code) = open_session().await;
        let (mut c1, _, _) = join_controller(&hub, &code).await;
        let (mut c2, _, _) = join_controller(&hub, &code).await;
        // Drain join notifications.
        recv(&mut screen).await;
        recv(&mut screen).await;
        recv(&mut c1).await;

        c1.outbound
            .send(ClientFrame::Message {
                to: None,
                seq: 1,
                data: json!("hello"),
            })
            .unwrap();

        let expected = HostFrame::Message {
            from: DeviceId(1),
            seq: 1,
            data: json!("hello"),
        };
        assert_eq!(recv(&mut screen).await, expected);
        assert_eq!(recv(&mut c2).await, expected);
        assert!(
            timeout(Duration::from_millis(50), c1.inbound.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn custom_state_fans_out_to_others() {
        let (hub, mut screen, code) = open_session().await;
        let (c1, _, _) = join_controller(&hub, &code).await;
        recv(&mut screen).await;

        c1.outbound
            .send(ClientFrame::SetCustom {
                custom: json!({ "team": "blue" }),
            })
            .unwrap();
        let HostFrame::DeviceState {
            device_id,
            state: Some(state),
        } = recv(&mut screen).await
        else {
            panic!("expected device state");
        };
        assert_eq!(device_id, DeviceId(1));
        assert_eq!(state.custom, Some(json!({ "team": "blue" })));
    }

    #[tokio::test]
    async fn time_probe_answers_with_hub_clock() {
        let clock = ManualClock::new(123_456);
        let hub = LocalHub::start(HubConfig::default().with_clock(Arc::new(clock)))
            .unwrap();
        let mut link = hub.connect();
        link.outbound
            .send(ClientFrame::TimeProbe { probe_id: 9 })
            .unwrap();
        assert_eq!(
            recv(&mut link).await,
            HostFrame::TimeReply {
                probe_id: 9,
                server_time: 123_456
            }
        );
    }

    #[tokio::test]
    async fn screen_leaving_closes_the_session() {
        let (hub, screen, code) = open_session().await;
        let (mut c1, _, _) = join_controller(&hub, &code).await;

        drop(screen);
        assert!(matches!(recv(&mut c1).await, HostFrame::Closed { .. }));
        assert!(hub.snapshot(&code).await.is_none());
    }

    #[tokio::test]
    async fn slow_connection_flag_reaches_everyone() {
        let (hub, mut screen, code) = open_session().await;
        let (mut c1, id, _) = join_controller(&hub, &code).await;
        recv(&mut screen).await;

        assert!(hub.set_slow_connection(&code, id, true).await);
        assert!(!hub.set_slow_connection(&code, DeviceId(9), true).await);

        for link in [&mut screen, &mut c1] {
            let HostFrame::DeviceState {
                state: Some(state), ..
            } = recv(link).await
            else {
                panic!("expected device state");
            };
            assert!(state.is_slow());
        }
    }

    #[test]
    fn join_code_length_is_validated() {
        for len in [0, 1, MIN_JOIN_CODE_LEN - 1, MAX_JOIN_CODE_LEN + 1] {
            let config = HubConfig {
                join_code_len: len,
                ..HubConfig::default()
            };
            assert!(matches!(
                config.validate(),
                Err(SessionError::Configuration(_))
            ));
        }
        assert!(HubConfig::default().validate().is_ok());
    }

    #[tokio::test]
    async fn start_rejects_empty_join_codes() {
        let config = HubConfig {
            join_code_len: 0,
            ..HubConfig::default()
        };
        assert!(LocalHub::start(config).is_err());
    }

    #[test]
    fn exhausted_code_space_rejects_screen() {
        let mut actor = HubActor {
            config: HubConfig {
                join_code_len: 1,
                ..HubConfig::default()
            },
            connections: HashMap::new(),
            sessions: HashMap::new(),
        };
        for &b in JOIN_CODE_ALPHABET {
            actor
                .sessions
                .insert((b as char).to_string(), HubSession::default());
        }
        assert_eq!(actor.generate_join_code(), None);

        let (outbound, mut rx) = mpsc::unbounded_channel();
        actor.handle(HubCommand::Register { conn: 1, outbound });
        actor.on_frame(1, join(Role::Screen, None));
        assert!(matches!(rx.try_recv(), Ok(HostFrame::Rejected { .. })));
        assert_eq!(actor.sessions.len(), JOIN_CODE_ALPHABET.len());
    }

    #[tokio::test]
    async fn shutdown_closes_connections() {
        let (hub, mut screen, _code) = open_session().await;
        hub.shutdown();
        assert!(matches!(recv(&mut screen).await, HostFrame::Closed { .. }));
    }
}
