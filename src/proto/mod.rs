pub mod handshake;
pub mod session;
pub mod streams;

pub use session::{Incoming, Session, SessionState};
