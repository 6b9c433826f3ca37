//! Couche temps réel: registre de connexions et pompes par socket

pub mod bucket;
pub mod connection;
pub mod server;

pub use bucket::ConnManager;
pub use connection::{Dispatch, WsConn};
pub use server::WsServer;
