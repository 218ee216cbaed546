//! Frames exchanged with the hosting backend.
//!
//! Payloads cross this boundary as `serde_json::Value`; typed application
//! payloads are encoded/decoded by the controller only here.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::types::{DeviceId, DeviceState, Role};

/// Protocol version sent with every join.
pub const PROTOCOL_VERSION: u32 = 1;

/// Frames sent FROM a device TO the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    Join {
        version: u32,
        role: Role,
        /// Required for controllers; a screen without a code opens a new session.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        join_code: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        nickname: Option<String>,
    },
    Message {
        /// `None` broadcasts to every other device.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<DeviceId>,
        seq: u64,
        data: serde_json::Value,
    },
    SetCustom {
        custom: serde_json::Value,
    },
    TimeProbe {
        probe_id: u64,
    },
    NavigateHome,
    Leave,
}

/// Frames sent FROM the host TO a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HostFrame {
    Welcome {
        device_id: DeviceId,
        join_code: String,
        /// Positional snapshot of the session, own slot included.
        devices: Vec<Option<DeviceState>>,
    },
    Rejected {
        reason: String,
    },
    DeviceState {
        device_id: DeviceId,
        /// `None` means the device left.
        state: Option<DeviceState>,
    },
    Message {
        from: DeviceId,
        seq: u64,
        data: serde_json::Value,
    },
    TimeReply {
        probe_id: u64,
        server_time: i64,
    },
    NavigateHome,
    Closed {
        reason: String,
    },
}

/// Device side of a connection: frames out, frames in.
///
/// Dropping the link disconnects the device from the host.
#[derive(Debug)]
pub struct TransportLink {
    pub outbound: mpsc::UnboundedSender<ClientFrame>,
    pub inbound: mpsc::UnboundedReceiver<HostFrame>,
}

/// Host side of a connection.
#[derive(Debug)]
pub struct HostLink {
    pub inbound: mpsc::UnboundedReceiver<ClientFrame>,
    pub outbound: mpsc::UnboundedSender<HostFrame>,
}

/// Create a connected device/host link pair.
pub fn link_pair() -> (TransportLink, HostLink) {
    let (client_tx, client_rx) = mpsc::unbounded_channel();
    let (host_tx, host_rx) = mpsc::unbounded_channel();
    (
        TransportLink {
            outbound: client_tx,
            inbound: host_rx,
        },
        HostLink {
            inbound: client_rx,
            outbound: host_tx,
        },
    )
}
