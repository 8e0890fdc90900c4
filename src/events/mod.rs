//! # Runtime events and the broadcast bus.
//!
//! Every externally observable thing the supervisor does is mirrored as an
//! [`Event`] on the [`Bus`]: service lifecycle edges, condition flips,
//! runlevel changes, reload and shutdown. Observers subscribe for logging;
//! the supervisor itself never consumes its own events.

mod bus;
mod event;

pub use bus::Bus;
pub use event::{Event, EventKind};
