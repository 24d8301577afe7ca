//! The proxy pair (spec.md §1 item 3, §4.6-§4.7): mirror images connected
//! back-to-back by one bus, the device proxy answering requests and the
//! driver proxy issuing them.

pub mod device_proxy;
pub mod driver_proxy;

pub use device_proxy::DeviceProxy;
pub use driver_proxy::DriverProxy;
