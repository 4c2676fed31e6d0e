//! SFU (Selective Forwarding Unit) for voice and video.
//!
//! Raw RTP in, raw RTP out: each participant's packets are re-emitted to
//! every other participant in the channel (screen media only to opted-in
//! viewers) with no transcoding, mixing or repacketization.

mod registry;
mod room;
mod session;

pub(crate) use registry::build_media_api;
pub use registry::{SfuEvent, SfuRegistry};
pub use room::{Room, SsrcEntry};
pub use session::{Session, SessionEvent, SessionState};
