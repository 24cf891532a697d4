//! In-band stream protocol
//!
//! Defines the five frame kinds exchanged as the first bytes of every
//! tunnel stream (PING, PONG, TCPF, TCP, UDP) and their wire codec.

mod codec;
mod types;

pub use types::{Frame, TcpFlags, P_PING, P_PONG, P_TCP, P_TCPF, P_UDP};
