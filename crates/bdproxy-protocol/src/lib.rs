//! The wire protocol and dispatch loop a transport hands a connected
//! stream to, and the logical device it's dispatched against.

pub mod logical;
pub mod session;
pub mod wire;

pub use logical::LogicalDevice;
pub use session::run_session;
pub use wire::{DeviceInfo, RequestCode, ResponseHeader, RwRequest};
