//! Streaming client core for GRBL-family CNC controllers.
//!
//! A [`session::ControllerSession`] owns one transport -- serial, TCP, or the
//! built-in [`simulator`] -- and runs a dedicated IO thread implementing the
//! character-counting streaming engine in [`streaming`] against the wire
//! grammar in [`protocol`]. Consumers reach the IO thread only through
//! [`queues`]' lock-free real-time mailbox and mutex-guarded command queues,
//! and receive everything back as [`events::SessionEvent`] over a channel.

pub mod commands;
pub mod config;
pub mod events;
pub mod protocol;
pub mod queues;
pub mod session;
pub mod simulator;
pub mod streaming;
pub mod transport;

pub use config::Config;
pub use session::{ControllerSession, SessionError};
