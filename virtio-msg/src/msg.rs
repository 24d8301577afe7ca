//! The virtio-msg wire message: a fixed 40-byte, little-endian, packed
//! envelope shared by requests, responses and events.

use bitflags::bitflags;

/// Fixed on-wire size of a [`Msg`], in bytes.
pub const MSG_SIZE: usize = 40;

/// Size of the variant-specific payload, in bytes.
pub const PAYLOAD_SIZE: usize = 36;

bitflags! {
    /// Bits of [`Msg::ty`].
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct MsgFlags: u8 {
        /// Set on a message that is the reply to an earlier request.
        const RESPONSE = 0x01;
        /// Set on messages that never cross the wire: bus-local control
        /// traffic reserved for future use (see [`id::CONNECT`]/[`id::DISCONNECT`]).
        const BUS_LOCAL = 0x02;
        /// Set on a response that carries an error code instead of a payload
        /// (see [`crate::error::Error::UnsupportedMessageId`]).
        const ERROR = 0x04;
    }
}

/// Message-id taxonomy (spec.md §3). Ids `>= N_HANDLERS` are rejected by the
/// device-side dispatch table rather than indexed into it (Open Question (a)
/// in spec.md §9: the original's `id > ARRAY_SIZE` check is off-by-one).
pub mod id {
    /// Reserved: bus-local connect handshake. Never dispatched; a
    /// forward-compatibility slot carried over from the original protocol
    /// (spec.md §9 Open Question (c), SPEC_FULL.md §F.1).
    pub const CONNECT: u8 = 0x01;
    /// Reserved: bus-local disconnect notice. See [`CONNECT`].
    pub const DISCONNECT: u8 = 0x02;

    pub const DEVICE_INFO: u8 = 0x03;
    pub const GET_FEATURES: u8 = 0x04;
    pub const SET_FEATURES: u8 = 0x05;
    pub const GET_CONFIG: u8 = 0x06;
    pub const SET_CONFIG: u8 = 0x07;
    pub const GET_CONFIG_GEN: u8 = 0x08;
    pub const GET_DEVICE_STATUS: u8 = 0x09;
    pub const SET_DEVICE_STATUS: u8 = 0x0a;
    pub const GET_VQUEUE: u8 = 0x0b;
    pub const SET_VQUEUE: u8 = 0x0c;
    pub const RESET_VQUEUE: u8 = 0x0d;

    pub const EVENT_CONFIG: u8 = 0x10;
    pub const EVENT_AVAIL: u8 = 0x11;
    pub const EVENT_USED: u8 = 0x12;

    pub const IOMMU_ENABLE: u8 = 0x20;
    pub const IOMMU_TRANSLATE: u8 = 0x21;
    pub const IOMMU_INVALIDATE: u8 = 0x22;

    /// One past the highest id the device-side dispatch table indexes.
    /// `msg.id >= N_HANDLERS` must be rejected before it ever reaches the
    /// table (see [`crate::proxy::device_proxy`]).
    pub const N_HANDLERS: usize = IOMMU_INVALIDATE as usize + 1;
}

/// An EVENT_* id must be parked in the out-of-order queue rather than
/// delivered inline while a response is being awaited (spec.md §4.5).
pub fn is_event(id: u8) -> bool {
    matches!(id, id::EVENT_CONFIG | id::EVENT_AVAIL | id::EVENT_USED)
}

/// IOMMU access protection bits used by `IOMMU_TRANSLATE` (spec.md §4.10).
pub const IOMMU_PROT_READ: u8 = 0x1;
pub const IOMMU_PROT_WRITE: u8 = 0x2;
pub const IOMMU_PROT_RW: u8 = IOMMU_PROT_READ | IOMMU_PROT_WRITE;

/// 4 KiB software-IOMMU page size (spec.md §3 invariants).
pub const IOMMU_PAGE_SIZE: u64 = 4096;
pub const IOMMU_PAGE_MASK: u64 = IOMMU_PAGE_SIZE - 1;

/// A virtio-msg wire message. `payload` is always little-endian on the wire;
/// [`crate::codec`] provides the only sanctioned way to read or write it.
#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub struct Msg {
    pub ty: u8,
    pub id: u8,
    pub dev_id: u16,
    pub payload: [u8; PAYLOAD_SIZE],
}

impl Default for Msg {
    fn default() -> Self {
        Msg {
            ty: 0,
            id: 0,
            dev_id: 0,
            payload: [0; PAYLOAD_SIZE],
        }
    }
}

impl Msg {
    pub fn flags(&self) -> MsgFlags {
        MsgFlags::from_bits_truncate(self.ty)
    }

    pub fn is_response(&self) -> bool {
        self.flags().contains(MsgFlags::RESPONSE)
    }

    pub fn is_error(&self) -> bool {
        self.flags().contains(MsgFlags::ERROR)
    }

    /// Serialize to the 40-byte wire representation.
    pub fn to_bytes(&self) -> [u8; MSG_SIZE] {
        let mut out = [0u8; MSG_SIZE];
        out[0] = self.ty;
        out[1] = self.id;
        out[2..4].copy_from_slice(&self.dev_id.to_le_bytes());
        out[4..MSG_SIZE].copy_from_slice(&self.payload);
        out
    }

    /// Parse the 40-byte wire representation.
    pub fn from_bytes(buf: &[u8; MSG_SIZE]) -> Self {
        let mut payload = [0u8; PAYLOAD_SIZE];
        payload.copy_from_slice(&buf[4..MSG_SIZE]);
        Msg {
            ty: buf[0],
            id: buf[1],
            dev_id: u16::from_le_bytes([buf[2], buf[3]]),
            payload,
        }
    }
}

/// `is_response_for(req, resp)` (spec.md §4.1): the only signal that a
/// received message answers an in-flight request. Sequence-number
/// fingerprinting is left as a forward-compatibility slot, not used here.
pub fn is_response_for(req: &Msg, resp: &Msg) -> bool {
    resp.id == req.id && resp.is_response()
}
