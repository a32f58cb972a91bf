//! Parlor Gateway - WebSocket chat hub
//!
//! Accepts WebSocket connections, identifies each client by username and
//! relays chat lines, join/leave notices and private messages between all
//! connected clients through a single in-process [`Hub`].

mod commands;
mod connection;
mod gateway;
mod hub;
mod session;

pub use commands::{Command, Outcome};
pub use connection::{ConnectionError, Frame, FrameSink, FrameStream};
pub use gateway::{Gateway, GatewayConfig, GatewayError};
pub use hub::{ActiveMember, BroadcastReport, Delivery, Hub, HubError};
pub use session::{
    admit, serve_connection, AdmissionError, Outbound, ReaderExit, Session, SessionId,
    SessionSettings,
};
