//! Couch Session - multi-device session protocol
//!
//! One screen device and any number of controller devices share a session
//! identified by a join code. Devices exchange directed or broadcast
//! messages and observe each other joining, leaving, and updating state.
//!
//! # Example
//!
//! ```no_run
//! use couch_session::{LocalHub, HubConfig, SessionConfig, SessionController, SessionEvent};
//! use serde_json::{Value, json};
//!
//! #[tokio::main]
//! async fn main() {
//!     let hub = LocalHub::start(HubConfig::default()).unwrap();
//!     let mut screen: SessionController<Value> =
//!         SessionController::screen(SessionConfig::default(), hub.connect());
//!
//!     while let Some(event) = screen.next_event().await {
//!         match event {
//!             SessionEvent::Ready { join_code } => println!("join with {join_code}"),
//!             SessionEvent::DeviceStateChange { device_id, state: Some(_) } => {
//!                 screen.send(Some(device_id), &json!({ "welcome": true })).unwrap();
//!             }
//!             SessionEvent::DeviceStateChange { device_id, state: None } => {
//!                 println!("{device_id} left");
//!             }
//!             SessionEvent::Message { from, payload } => println!("{from}: {payload}"),
//!         }
//!     }
//! }
//! ```

pub mod clock;
pub mod config;
mod controller;
mod error;
pub mod hub;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod time_sync;
mod types;
pub mod ui;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{FileConfig, SessionConfig, load_config};
pub use controller::{DEFAULT_PICTURE_SIZE, SessionController, SessionEvent, SessionPhase};
pub use error::SessionError;
pub use hub::{HubConfig, LocalHub};
pub use protocol::TransportLink;
pub use types::{DeviceId, DeviceState, Orientation, Role};
pub use ui::{HeadlessUi, HostUi};

/// Crate version reported by [`SessionController::version`].
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
