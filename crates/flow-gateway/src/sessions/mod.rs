//! Client session supervision.
//!
//! [`ConnectionRegistry`] owns every [`ClientSession`] and runs the periodic
//! sweep that refreshes tokens, detects silent clients and releases the
//! broker consumers of dead ones.

pub mod messages;
pub mod registry;
pub mod session;
pub mod socket;

pub use messages::{Command, Message, RefreshTokenPayload};
pub use registry::{ConnectionRegistry, ConsumerReleaser, SweepReport};
pub use session::{ClientSession, SessionSnapshot};
pub use socket::SocketTransport;
