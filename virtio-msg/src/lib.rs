//! A message-oriented transport for the virtio device model: a packed wire
//! protocol, two SPSC bus carriers, an out-of-order event queue, a software
//! IOMMU, and a device-proxy/driver-proxy pair built on top of them.
//!
//! See each module for the piece of the system it owns; `proxy` is usually
//! the right entry point for a caller wiring a device or driver endpoint.

pub mod bus;
pub mod codec;
pub mod config;
pub mod device;
pub mod error;
pub mod iommu;
pub mod msg;
pub mod ooo;
pub mod proxy;
pub mod spsc;

pub use error::{Error, Result};
pub use msg::Msg;
