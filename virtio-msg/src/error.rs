//! Error kinds for the transport (spec.md §7).
//!
//! The codec and SPSC layer never abort; every fallible path returns one of
//! these. A `TransportTimeout` or `PeerProtocolViolation` is fatal only to
//! the proxy that raised it, never to the host process (REDESIGN FLAGS: the
//! original QEMU source calls `abort()` on a send timeout; we surface a
//! typed error instead and let the caller isolate the failure).

use crate::msg::Msg;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unsupported message id {0:#04x}")]
    UnsupportedMessageId(u8),

    #[error("transport timed out waiting for a response")]
    TransportTimeout,

    #[error("peer protocol violation: {0}")]
    PeerProtocolViolation(String),

    #[error("IOMMU translation failed for va {va:#x}")]
    TranslationFailed { va: u64 },

    #[error("out-of-order queue overflow (depth > 128)")]
    RingOverflow,

    #[error("carrier closed")]
    CarrierClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A short, user-visible trace of an offending message: id, type, dev_id and
/// the first 32 payload bytes (spec.md §7 "User-visible").
pub fn trace_msg(msg: &Msg) -> String {
    let n = msg.payload.len().min(32);
    format!(
        "id={:#04x} type={:#04x} dev_id={} payload={:02x?}",
        msg.id,
        msg.ty,
        msg.dev_id,
        &msg.payload[..n]
    )
}
