//! In-memory registry of connected agents.

mod session;


pub use session::{AgentSession, SessionRegistry};
