//! Voice-channel state: membership directory, screen-share viewer sets, and
//! controller passthrough pairings.

mod controller;
mod directory;
mod viewers;

pub use controller::{CollapsedPairing, ControllerSessions, MAX_SLOTS};
pub use directory::{StateUpdate, VoiceDirectory};
pub use viewers::ScreenShareViewerSet;
