//! Bit-exact little-endian pack/unpack for every message variant
//! (spec.md §4.1).
//!
//! `pack_*` always zeroes the payload first, then writes the header
//! (`id`, `type`, `dev_id`) and finally the variant fields, so the unused
//! tail of the payload is zero on the wire as §3 requires. Unpacking an
//! unknown id is a no-op: [`decode`] returns [`Payload::Unknown`] and leaves
//! the caller to surface [`crate::error::Error::UnsupportedMessageId`].

use crate::msg::{id, Msg, MsgFlags, PAYLOAD_SIZE};

#[inline]
fn w8(buf: &mut [u8; PAYLOAD_SIZE], off: usize, v: u8) {
    buf[off] = v;
}

#[inline]
fn w16(buf: &mut [u8; PAYLOAD_SIZE], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

#[inline]
fn w32(buf: &mut [u8; PAYLOAD_SIZE], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

#[inline]
fn w64(buf: &mut [u8; PAYLOAD_SIZE], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

#[inline]
fn r8(buf: &[u8; PAYLOAD_SIZE], off: usize) -> u8 {
    buf[off]
}

#[inline]
fn r16(buf: &[u8; PAYLOAD_SIZE], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

#[inline]
fn r32(buf: &[u8; PAYLOAD_SIZE], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

#[inline]
fn r64(buf: &[u8; PAYLOAD_SIZE], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}

/// Split a 24-bit config offset into the wire's `u16 low + u8 msb` pair.
/// Reconstruction MUST satisfy `(msb << 16) | low == offset` (spec.md §3).
fn write_offset24(buf: &mut [u8; PAYLOAD_SIZE], low_off: usize, msb_off: usize, offset: u32) {
    w16(buf, low_off, (offset & 0xffff) as u16);
    w8(buf, msb_off, ((offset >> 16) & 0xff) as u8);
}

fn read_offset24(buf: &[u8; PAYLOAD_SIZE], low_off: usize, msb_off: usize) -> u32 {
    (r16(buf, low_off) as u32) | ((r8(buf, msb_off) as u32) << 16)
}

/// Header packer (spec.md §4.1): zeroes the payload, then writes
/// `id`/`type`/`dev_id` last-writer-wins.
fn pack_header(id: u8, flags: MsgFlags, dev_id: u16) -> Msg {
    Msg {
        ty: flags.bits(),
        id,
        dev_id,
        payload: [0; PAYLOAD_SIZE],
    }
}

fn request(id: u8, dev_id: u16) -> Msg {
    pack_header(id, MsgFlags::empty(), dev_id)
}

fn response(id: u8, dev_id: u16) -> Msg {
    pack_header(id, MsgFlags::RESPONSE, dev_id)
}

pub fn pack_error_response(req: &Msg) -> Msg {
    pack_header(req.id, MsgFlags::RESPONSE | MsgFlags::ERROR, req.dev_id)
}

pub fn pack_device_info_req(dev_id: u16) -> Msg {
    request(id::DEVICE_INFO, dev_id)
}

pub fn pack_device_info_resp(
    dev_id: u16,
    device_version: u32,
    device_id: u32,
    vendor_id: u32,
) -> Msg {
    let mut m = response(id::DEVICE_INFO, dev_id);
    w32(&mut m.payload, 0, device_version);
    w32(&mut m.payload, 4, device_id);
    w32(&mut m.payload, 8, vendor_id);
    m
}

pub fn pack_get_features(dev_id: u16) -> Msg {
    request(id::GET_FEATURES, dev_id)
}

pub fn pack_get_features_resp(dev_id: u16, features: u64) -> Msg {
    let mut m = response(id::GET_FEATURES, dev_id);
    w64(&mut m.payload, 0, features);
    m
}

pub fn pack_set_features(dev_id: u16, features: u64) -> Msg {
    let mut m = request(id::SET_FEATURES, dev_id);
    w64(&mut m.payload, 0, features);
    m
}

pub fn pack_set_features_resp(dev_id: u16, features: u64) -> Msg {
    let mut m = response(id::SET_FEATURES, dev_id);
    w64(&mut m.payload, 0, features);
    m
}

pub fn pack_get_config(dev_id: u16, offset: u32, size: u8) -> Msg {
    let mut m = request(id::GET_CONFIG, dev_id);
    write_offset24(&mut m.payload, 0, 2, offset);
    w8(&mut m.payload, 3, size);
    m
}

pub fn pack_get_config_resp(dev_id: u16, offset: u32, size: u8, data: u64) -> Msg {
    let mut m = response(id::GET_CONFIG, dev_id);
    write_offset24(&mut m.payload, 0, 2, offset);
    w8(&mut m.payload, 3, size);
    w64(&mut m.payload, 8, data);
    m
}

pub fn pack_set_config(dev_id: u16, offset: u32, size: u8, data: u64) -> Msg {
    let mut m = request(id::SET_CONFIG, dev_id);
    write_offset24(&mut m.payload, 0, 2, offset);
    w8(&mut m.payload, 3, size);
    w64(&mut m.payload, 8, data);
    m
}

pub fn pack_set_config_resp(dev_id: u16, offset: u32, size: u8, data: u64) -> Msg {
    let mut m = response(id::SET_CONFIG, dev_id);
    write_offset24(&mut m.payload, 0, 2, offset);
    w8(&mut m.payload, 3, size);
    w64(&mut m.payload, 8, data);
    m
}

pub fn pack_get_config_gen(dev_id: u16) -> Msg {
    request(id::GET_CONFIG_GEN, dev_id)
}

pub fn pack_get_config_gen_resp(dev_id: u16, generation: u32) -> Msg {
    let mut m = response(id::GET_CONFIG_GEN, dev_id);
    w32(&mut m.payload, 0, generation);
    m
}

pub fn pack_get_device_status(dev_id: u16) -> Msg {
    request(id::GET_DEVICE_STATUS, dev_id)
}

pub fn pack_get_device_status_resp(dev_id: u16, status: u32) -> Msg {
    let mut m = response(id::GET_DEVICE_STATUS, dev_id);
    w32(&mut m.payload, 0, status);
    m
}

pub fn pack_set_device_status(dev_id: u16, status: u32) -> Msg {
    let mut m = request(id::SET_DEVICE_STATUS, dev_id);
    w32(&mut m.payload, 0, status);
    m
}

pub fn pack_get_vqueue(dev_id: u16, index: u32) -> Msg {
    let mut m = request(id::GET_VQUEUE, dev_id);
    w32(&mut m.payload, 0, index);
    m
}

pub fn pack_get_vqueue_resp(dev_id: u16, index: u32, max_size: u32) -> Msg {
    let mut m = response(id::GET_VQUEUE, dev_id);
    w32(&mut m.payload, 0, index);
    w32(&mut m.payload, 4, max_size);
    m
}

pub fn pack_set_vqueue(
    dev_id: u16,
    index: u32,
    size: u32,
    desc: u64,
    drv: u64,
    dev: u64,
) -> Msg {
    let mut m = request(id::SET_VQUEUE, dev_id);
    w32(&mut m.payload, 0, index);
    w32(&mut m.payload, 4, size);
    w64(&mut m.payload, 8, desc);
    w64(&mut m.payload, 16, drv);
    w64(&mut m.payload, 24, dev);
    m
}

pub fn pack_reset_vqueue(dev_id: u16, index: u32) -> Msg {
    let mut m = request(id::RESET_VQUEUE, dev_id);
    w32(&mut m.payload, 0, index);
    m
}

pub fn pack_event_config(dev_id: u16, status: u32, cfg_offset: u32, cfg_size: u8, value: &[u8]) -> Msg {
    let mut m = request(id::EVENT_CONFIG, dev_id);
    w32(&mut m.payload, 0, status);
    write_offset24(&mut m.payload, 4, 6, cfg_offset);
    w8(&mut m.payload, 7, cfg_size);
    let n = value.len().min(16);
    m.payload[8..8 + n].copy_from_slice(&value[..n]);
    m
}

pub fn pack_event_avail(dev_id: u16, index: u32, next_offset: u64, next_wrap: u64) -> Msg {
    let mut m = request(id::EVENT_AVAIL, dev_id);
    w32(&mut m.payload, 0, index);
    w64(&mut m.payload, 4, next_offset);
    w64(&mut m.payload, 12, next_wrap);
    m
}

pub fn pack_event_used(dev_id: u16, index: u32) -> Msg {
    let mut m = request(id::EVENT_USED, dev_id);
    w32(&mut m.payload, 0, index);
    m
}

pub fn pack_iommu_enable(dev_id: u16, enable: bool) -> Msg {
    let mut m = request(id::IOMMU_ENABLE, dev_id);
    w8(&mut m.payload, 0, enable as u8);
    m
}

pub fn pack_iommu_translate(dev_id: u16, va: u64, prot: u8) -> Msg {
    let mut m = request(id::IOMMU_TRANSLATE, dev_id);
    w64(&mut m.payload, 0, va);
    w8(&mut m.payload, 8, prot);
    m
}

pub fn pack_iommu_translate_resp(dev_id: u16, va: u64, pa: u64, prot: u8) -> Msg {
    let mut m = response(id::IOMMU_TRANSLATE, dev_id);
    w64(&mut m.payload, 0, va);
    w64(&mut m.payload, 8, pa);
    w8(&mut m.payload, 16, prot);
    m
}

/// Decoded variant-specific fields, keyed by `(id, is_response)`. This is
/// the single `unpack` entry point the codec contract calls for: given a
/// message, return its typed payload, or [`Payload::Unknown`] for an id the
/// codec doesn't recognise.
#[derive(Copy, Clone, Debug)]
pub enum Payload {
    DeviceInfoResp {
        device_version: u32,
        device_id: u32,
        vendor_id: u32,
    },
    GetFeatures,
    GetFeaturesResp {
        features: u64,
    },
    SetFeatures {
        features: u64,
    },
    SetFeaturesResp {
        features: u64,
    },
    GetConfig {
        offset: u32,
        size: u8,
    },
    GetConfigResp {
        offset: u32,
        size: u8,
        data: u64,
    },
    SetConfig {
        offset: u32,
        size: u8,
        data: u64,
    },
    SetConfigResp {
        offset: u32,
        size: u8,
        data: u64,
    },
    GetConfigGenResp {
        generation: u32,
    },
    GetDeviceStatusResp {
        status: u32,
    },
    SetDeviceStatus {
        status: u32,
    },
    GetVqueue {
        index: u32,
    },
    GetVqueueResp {
        index: u32,
        max_size: u32,
    },
    SetVqueue {
        index: u32,
        size: u32,
        desc: u64,
        drv: u64,
        dev: u64,
    },
    ResetVqueue {
        index: u32,
    },
    EventConfig {
        status: u32,
        cfg_offset: u32,
        cfg_size: u8,
        value: [u8; 16],
    },
    EventAvail {
        index: u32,
        next_offset: u64,
        next_wrap: u64,
    },
    EventUsed {
        index: u32,
    },
    IommuEnable {
        enable: bool,
    },
    IommuTranslate {
        va: u64,
        prot: u8,
    },
    IommuTranslateResp {
        va: u64,
        pa: u64,
        prot: u8,
    },
    /// No handlers/ids recognise this; fields beyond `dev_id` are untouched.
    Unknown,
}

pub fn decode(msg: &Msg) -> Payload {
    let p = &msg.payload;
    let is_resp = msg.is_response();
    match (msg.id, is_resp) {
        (id::DEVICE_INFO, true) => Payload::DeviceInfoResp {
            device_version: r32(p, 0),
            device_id: r32(p, 4),
            vendor_id: r32(p, 8),
        },
        (id::GET_FEATURES, false) => Payload::GetFeatures,
        (id::GET_FEATURES, true) => Payload::GetFeaturesResp {
            features: r64(p, 0),
        },
        (id::SET_FEATURES, false) => Payload::SetFeatures {
            features: r64(p, 0),
        },
        (id::SET_FEATURES, true) => Payload::SetFeaturesResp {
            features: r64(p, 0),
        },
        (id::GET_CONFIG, false) => Payload::GetConfig {
            offset: read_offset24(p, 0, 2),
            size: r8(p, 3),
        },
        (id::GET_CONFIG, true) => Payload::GetConfigResp {
            offset: read_offset24(p, 0, 2),
            size: r8(p, 3),
            data: r64(p, 8),
        },
        (id::SET_CONFIG, false) => Payload::SetConfig {
            offset: read_offset24(p, 0, 2),
            size: r8(p, 3),
            data: r64(p, 8),
        },
        (id::SET_CONFIG, true) => Payload::SetConfigResp {
            offset: read_offset24(p, 0, 2),
            size: r8(p, 3),
            data: r64(p, 8),
        },
        (id::GET_CONFIG_GEN, true) => Payload::GetConfigGenResp {
            generation: r32(p, 0),
        },
        (id::GET_DEVICE_STATUS, true) => Payload::GetDeviceStatusResp { status: r32(p, 0) },
        (id::SET_DEVICE_STATUS, false) => Payload::SetDeviceStatus { status: r32(p, 0) },
        (id::GET_VQUEUE, false) => Payload::GetVqueue { index: r32(p, 0) },
        (id::GET_VQUEUE, true) => Payload::GetVqueueResp {
            index: r32(p, 0),
            max_size: r32(p, 4),
        },
        (id::SET_VQUEUE, false) => Payload::SetVqueue {
            index: r32(p, 0),
            size: r32(p, 4),
            desc: r64(p, 8),
            drv: r64(p, 16),
            dev: r64(p, 24),
        },
        (id::RESET_VQUEUE, false) => Payload::ResetVqueue { index: r32(p, 0) },
        (id::EVENT_CONFIG, false) => {
            let mut value = [0u8; 16];
            value.copy_from_slice(&p[8..24]);
            Payload::EventConfig {
                status: r32(p, 0),
                cfg_offset: read_offset24(p, 4, 6),
                cfg_size: r8(p, 7),
                value,
            }
        }
        (id::EVENT_AVAIL, false) => Payload::EventAvail {
            index: r32(p, 0),
            next_offset: r64(p, 4),
            next_wrap: r64(p, 12),
        },
        (id::EVENT_USED, false) => Payload::EventUsed { index: r32(p, 0) },
        (id::IOMMU_ENABLE, false) => Payload::IommuEnable {
            enable: r8(p, 0) != 0,
        },
        (id::IOMMU_TRANSLATE, false) => Payload::IommuTranslate {
            va: r64(p, 0),
            prot: r8(p, 8),
        },
        (id::IOMMU_TRANSLATE, true) => Payload::IommuTranslateResp {
            va: r64(p, 0),
            pa: r64(p, 8),
            prot: r8(p, 16),
        },
        _ => Payload::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_zeroes_payload() {
        let req = pack_set_config(7, 0x123456, 1, 0x7f);
        assert_eq!(req.dev_id, 7);
        assert_eq!(req.id, id::SET_CONFIG);
        // bytes beyond the fields we wrote stay zero.
        assert_eq!(req.payload[9..], [0u8; 27]);
    }

    #[test]
    fn config_offset_24bit_roundtrip() {
        let req = pack_set_config(0, 0x123456, 1, 0x7f);
        match decode(&req) {
            Payload::SetConfig { offset, size, data } => {
                assert_eq!(offset, 0x123456);
                assert_eq!(size, 1);
                assert_eq!(data, 0x7f);
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn response_matching() {
        let req = pack_get_vqueue(0, 1);
        let resp = pack_get_vqueue_resp(0, 1, 64);
        assert!(crate::msg::is_response_for(&req, &resp));
        let unrelated = pack_event_used(0, 1);
        assert!(!crate::msg::is_response_for(&req, &unrelated));
    }

    #[test]
    fn unknown_id_is_noop() {
        let mut m = Msg::default();
        m.id = 0xff;
        assert!(matches!(decode(&m), Payload::Unknown));
    }

    #[test]
    fn wire_roundtrip() {
        let req = pack_set_vqueue(3, 0, 64, 0xA000, 0xB000, 0xC000);
        let bytes = req.to_bytes();
        assert_eq!(bytes.len(), crate::msg::MSG_SIZE);
        let back = Msg::from_bytes(&bytes);
        match decode(&back) {
            Payload::SetVqueue {
                index,
                size,
                desc,
                drv,
                dev,
            } => {
                assert_eq!((index, size, desc, drv, dev), (0, 64, 0xA000, 0xB000, 0xC000));
            }
            other => panic!("unexpected decode: {other:?}"),
        }
        assert_eq!(back.dev_id, 3);
    }

    #[test]
    fn feature_get_resp_carries_version_1() {
        const VERSION_1: u64 = 1 << 32;
        let resp = pack_get_features_resp(0, VERSION_1 | 0x3);
        match decode(&resp) {
            Payload::GetFeaturesResp { features } => {
                assert_ne!(features & VERSION_1, 0);
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }
}
