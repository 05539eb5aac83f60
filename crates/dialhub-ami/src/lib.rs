//! Asterisk Manager Interface (AMI) client session
//!
//! A single long-lived duplex TCP session to an Asterisk-compatible switch:
//! - Line-oriented `Key: Value` wire codec (`CRLF CRLF` message terminator)
//! - Login handshake
//! - Action/response correlation by ActionID
//! - Asynchronous event demultiplex to registered handlers
//!
//! Reconnection policy is deliberately left to the caller: the session
//! reports its own death (failed waiters plus a synthetic `SessionClosed`
//! event) and the owning engine decides what to do about it.

pub mod errors;
pub mod message;
pub mod session;

pub use errors::{AmiError, Result};
pub use message::AmiMessage;
pub use session::{AmiConfig, AmiSession, EVENT_SESSION_CLOSED};
