//! Framed transport, wire messages and the session loop.

pub mod framing;
pub mod message;
pub mod session;
