//! Device-side proxy (spec.md §4.6): the *server*. Answers bus requests on
//! behalf of a local [`VirtioDevice`], dispatching by message id, and pushes
//! `EVENT_USED`/`EVENT_CONFIG` upward when the device's own state changes.
//!
//! Grounded on `virtio_msg_receive_msg` and the handler table in
//! `examples/original_source/hw/virtio/virtio-msg.c`.

use crate::bus::{BusDevice, Carrier};
use crate::codec::{
    self, pack_device_info_resp, pack_error_response, pack_event_config, pack_event_used,
    pack_get_config_gen_resp, pack_get_config_resp, pack_get_device_status_resp,
    pack_get_features_resp, pack_get_vqueue_resp, pack_iommu_translate_resp, pack_set_config_resp,
    pack_set_features_resp, Payload,
};
use crate::device::{DeviceEventSink, DeviceStatus, VirtioDevice, DEVICE_VERSION, VENDOR_ID_QEMU};
use crate::error::{trace_msg, Error, Result};
use crate::iommu::{self, IommuStrategy};
use crate::msg::{id, Msg};

pub struct DeviceProxy<C: Carrier, D: VirtioDevice> {
    bus: BusDevice<C>,
    device: D,
    dev_id: u16,
    guest_features: u64,
    iommu_enabled: bool,
    iommu: IommuStrategy,
}

impl<C: Carrier, D: VirtioDevice> DeviceProxy<C, D> {
    pub fn new(carrier: C, device: D, dev_id: u16, iommu: IommuStrategy) -> Self {
        let mut bus = BusDevice::new(carrier);
        bus.connect();
        DeviceProxy {
            bus,
            device,
            dev_id,
            guest_features: 0,
            iommu_enabled: false,
            iommu,
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Drain and answer whatever's pending on the bus (spec.md §4.4
    /// `process()`); call this from the host event loop whenever the
    /// carrier's notifier fires.
    pub fn poll(&mut self) -> Result<()> {
        let device = &mut self.device;
        let guest_features = &mut self.guest_features;
        let iommu_enabled = &mut self.iommu_enabled;
        let iommu = &self.iommu;
        let dev_id = self.dev_id;
        let mut soft_reset = false;
        self.bus.process(|msg| {
            dispatch(
                device,
                guest_features,
                iommu_enabled,
                iommu,
                dev_id,
                &mut soft_reset,
                msg,
            )
        })?;
        if soft_reset {
            self.bus.reset_ooo();
        }
        Ok(())
    }
}

impl<C: Carrier, D: VirtioDevice> DeviceEventSink for DeviceProxy<C, D> {
    fn notify_queue(&mut self, index: u32) -> Result<()> {
        let msg = pack_event_used(self.dev_id, index);
        self.bus.send(&msg, false)?;
        Ok(())
    }

    fn notify_config(&mut self) -> Result<()> {
        let msg = pack_event_config(self.dev_id, self.device.status(), 0, 0, &[]);
        self.bus.send(&msg, false)?;
        Ok(())
    }
}

/// Handle one inbound message, returning the response to ship (if any).
/// Free function rather than a method so `poll()` can split `self` into
/// disjoint borrows for the `BusDevice::process` closure.
fn dispatch<D: VirtioDevice>(
    device: &mut D,
    guest_features: &mut u64,
    iommu_enabled: &mut bool,
    iommu: &IommuStrategy,
    dev_id: u16,
    soft_reset: &mut bool,
    req: &Msg,
) -> Result<Option<Msg>> {
    if (req.id as usize) >= id::N_HANDLERS {
        log::warn!("unsupported message id: {}", trace_msg(req));
        return Ok(Some(pack_error_response(req)));
    }

    match (req.id, codec::decode(req)) {
        (id::DEVICE_INFO, _) => Ok(Some(pack_device_info_resp(
            dev_id,
            DEVICE_VERSION,
            device.device_id(),
            VENDOR_ID_QEMU,
        ))),

        (id::GET_FEATURES, Payload::GetFeatures) => {
            let features = device.host_features();
            Ok(Some(pack_get_features_resp(dev_id, features)))
        }

        (id::SET_FEATURES, Payload::SetFeatures { features }) => {
            *guest_features = features;
            Ok(Some(pack_set_features_resp(dev_id, features)))
        }

        (id::GET_CONFIG, Payload::GetConfig { offset, size }) => {
            if !matches!(size, 1 | 2 | 4) {
                return Err(Error::PeerProtocolViolation(format!(
                    "GET_CONFIG size {size} not in {{1,2,4}}"
                )));
            }
            let data = device.read_config(offset, size)?;
            Ok(Some(pack_get_config_resp(dev_id, offset, size, data)))
        }

        (id::SET_CONFIG, Payload::SetConfig { offset, size, data }) => {
            if !matches!(size, 1 | 2 | 4) {
                return Err(Error::PeerProtocolViolation(format!(
                    "SET_CONFIG size {size} not in {{1,2,4}}"
                )));
            }
            device.write_config(offset, size, data)?;
            Ok(Some(pack_set_config_resp(dev_id, offset, size, data)))
        }

        (id::GET_CONFIG_GEN, _) => Ok(Some(pack_get_config_gen_resp(
            dev_id,
            device.config_generation(),
        ))),

        (id::GET_DEVICE_STATUS, _) => {
            Ok(Some(pack_get_device_status_resp(dev_id, device.status())))
        }

        (id::SET_DEVICE_STATUS, Payload::SetDeviceStatus { status }) => {
            *soft_reset |= apply_status_state_machine(device, guest_features, status)?;
            Ok(None)
        }

        (id::GET_VQUEUE, Payload::GetVqueue { index }) => {
            let max_size = device.queue_max_size(index);
            Ok(Some(pack_get_vqueue_resp(dev_id, index, max_size)))
        }

        (id::SET_VQUEUE, Payload::SetVqueue {
            index,
            size,
            desc,
            drv,
            dev,
        }) => {
            device.set_queue(index, size, desc, drv, dev);
            Ok(None)
        }

        (id::RESET_VQUEUE, Payload::ResetVqueue { index }) => {
            device.reset_queue(index);
            Ok(None)
        }

        (id::EVENT_AVAIL, Payload::EventAvail { index, .. }) => {
            let status = DeviceStatus::from_bits_truncate(device.status());
            if status.contains(DeviceStatus::DRIVER_OK) {
                device.queue_notify(index);
            } else {
                log::debug!("EVENT_AVAIL({index}) dropped: driver not ok");
                return Ok(Some(pack_event_config(dev_id, device.status(), 0, 0, &[])));
            }
            Ok(None)
        }

        (id::IOMMU_ENABLE, Payload::IommuEnable { enable }) => {
            *iommu_enabled = enable;
            Ok(None)
        }

        (id::IOMMU_TRANSLATE, Payload::IommuTranslate { va, prot }) if *iommu_enabled => {
            let (pa, prot) = match iommu {
                IommuStrategy::Disabled => iommu::identity(va),
                // `va` already names a host-visible address on this side,
                // so the guest-physical-to-host-virtual map step collapses
                // to identity; only the pagemap lookup itself is real.
                IommuStrategy::Pagemap(translator) => {
                    translator.translate(&iommu::IdentityAddressSpace, va, prot)?
                }
                IommuStrategy::Remote => {
                    return Err(Error::PeerProtocolViolation(
                        "peer sent IOMMU_TRANSLATE but local strategy is itself remote".into(),
                    ))
                }
            };
            Ok(Some(pack_iommu_translate_resp(dev_id, va, pa, prot)))
        }

        _ => {
            log::warn!("unexpected payload for message: {}", trace_msg(req));
            Ok(Some(pack_error_response(req)))
        }
    }
}

/// Status transitions on `SET_DEVICE_STATUS(s)` (spec.md §4.8). Returns
/// `true` if this write was a soft reset, so the caller can also drop
/// whatever's parked in the bus's OOO queue (SPEC_FULL.md §F.4).
fn apply_status_state_machine<D: VirtioDevice>(
    device: &mut D,
    guest_features: &mut u64,
    status: u32,
) -> Result<bool> {
    let old = DeviceStatus::from_bits_truncate(device.status());
    let new = DeviceStatus::from_bits_truncate(status);

    // 1. DRIVER_OK clearing stops host-side polling; nothing to release
    //    here beyond what `apply_status` below encodes into the device.
    let _driver_ok_cleared = old.contains(DeviceStatus::DRIVER_OK) && !new.contains(DeviceStatus::DRIVER_OK);

    // 2. FEATURES_OK set commits negotiated features.
    if new.contains(DeviceStatus::FEATURES_OK) && !old.contains(DeviceStatus::FEATURES_OK) {
        device.set_guest_features(*guest_features);
    }

    // 3. Apply and assert echo.
    let applied = device.apply_status(status);
    if applied != status {
        return Err(Error::PeerProtocolViolation(format!(
            "device echoed status {applied:#x}, requested {status:#x}"
        )));
    }

    // 4. DRIVER_OK newly set starts host-side polling — no-op here; the
    //    device implementation owns its own ioeventfd/polling state.

    // 5. status == 0 is a soft reset.
    if status == 0 {
        device.soft_reset();
        *guest_features = 0;
        return Ok(true);
    }

    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::local::LocalCarrier;
    use crate::codec::{pack_device_info_req, pack_get_features, pack_set_device_status};
    use crate::device::test_support::StubDevice;
    use crate::device::VIRTIO_ID_NET;

    fn new_proxy() -> (DeviceProxy<LocalCarrier, StubDevice>, LocalCarrier) {
        let (driver_carrier, device_carrier) =
            LocalCarrier::new_pair(&crate::config::LocalConfig::default()).unwrap();
        let device = StubDevice::new(VIRTIO_ID_NET, 1, 64);
        let proxy = DeviceProxy::new(device_carrier, device, 0, IommuStrategy::Disabled);
        (proxy, driver_carrier)
    }

    #[test]
    fn device_info_reports_wrapped_device_id() {
        let (mut proxy, driver) = new_proxy();
        let req = pack_device_info_req(0);
        driver.try_send(&req);
        driver.notify();
        proxy.poll().unwrap();
        driver.drain_notifications();

        let mut resp = Msg::default();
        assert!(driver.try_recv(&mut resp));
        match codec::decode(&resp) {
            Payload::DeviceInfoResp {
                device_id,
                vendor_id,
                ..
            } => {
                assert_eq!(device_id, VIRTIO_ID_NET);
                assert_eq!(vendor_id, VENDOR_ID_QEMU);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn get_features_reflects_version_1() {
        let (mut proxy, driver) = new_proxy();
        driver.try_send(&pack_get_features(0));
        driver.notify();
        proxy.poll().unwrap();
        let mut resp = Msg::default();
        assert!(driver.try_recv(&mut resp));
        match codec::decode(&resp) {
            Payload::GetFeaturesResp { features } => assert_ne!(features & (1 << 32), 0),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn soft_reset_zeroes_guest_features() {
        let (mut proxy, driver) = new_proxy();
        driver.try_send(&pack_set_device_status(0, DeviceStatus::ACKNOWLEDGE.bits()));
        proxy.poll().unwrap();
        driver.try_send(&pack_set_device_status(0, 0));
        proxy.poll().unwrap();
        assert_eq!(proxy.device().status, 0);
    }

    #[test]
    fn status_mismatch_is_a_protocol_violation() {
        struct LyingDevice(StubDevice);
        impl VirtioDevice for LyingDevice {
            fn device_id(&self) -> u32 {
                self.0.device_id()
            }
            fn host_features(&self) -> u64 {
                self.0.host_features()
            }
            fn set_guest_features(&mut self, f: u64) {
                self.0.set_guest_features(f)
            }
            fn status(&self) -> u32 {
                self.0.status()
            }
            fn apply_status(&mut self, _status: u32) -> u32 {
                // always reports FAILED regardless of what was requested.
                self.0.apply_status(DeviceStatus::FAILED.bits())
            }
            fn config_generation(&self) -> u32 {
                self.0.config_generation()
            }
            fn read_config(&self, o: u32, s: u8) -> Result<u64> {
                self.0.read_config(o, s)
            }
            fn write_config(&mut self, o: u32, s: u8, d: u64) -> Result<()> {
                self.0.write_config(o, s, d)
            }
            fn queue_max_size(&self, i: u32) -> u32 {
                self.0.queue_max_size(i)
            }
            fn set_queue(&mut self, i: u32, s: u32, d: u64, dr: u64, de: u64) {
                self.0.set_queue(i, s, d, dr, de)
            }
            fn reset_queue(&mut self, i: u32) {
                self.0.reset_queue(i)
            }
            fn queue_notify(&mut self, i: u32) {
                self.0.queue_notify(i)
            }
            fn soft_reset(&mut self) {
                self.0.soft_reset()
            }
        }

        let mut guest_features = 0u64;
        let mut device = LyingDevice(StubDevice::new(VIRTIO_ID_NET, 1, 64));
        let err = apply_status_state_machine(&mut device, &mut guest_features, DeviceStatus::ACKNOWLEDGE.bits());
        assert!(matches!(err, Err(Error::PeerProtocolViolation(_))));
    }
}
