//! Rendering collaborator.
//!
//! The session never renders anything itself. Display toggles are forwarded
//! to a [`HostUi`]; the controller only forwards actual changes.

use tracing::info;

use crate::types::Orientation;

pub trait HostUi: Send {
    /// Lock the document down for game use (no selection, fixed zoom, no scrolling).
    fn setup_document(&mut self) {}

    fn set_orientation(&mut self, orientation: Orientation);

    fn show_default_ui(&mut self, visible: bool);

    /// Return to the start screen.
    fn navigate_home(&mut self);
}

/// UI for headless clients: logs every request.
#[derive(Debug, Default)]
pub struct HeadlessUi;

impl HostUi for HeadlessUi {
    fn setup_document(&mut self) {
        info!("ui: setup document");
    }

    fn set_orientation(&mut self, orientation: Orientation) {
        info!(%orientation, "ui: set orientation");
    }

    fn show_default_ui(&mut self, visible: bool) {
        info!(visible, "ui: default ui");
    }

    fn navigate_home(&mut self) {
        info!("ui: navigate home");
    }
}
