//! Driver-side proxy (spec.md §4.7): the *client*. Drives a remote device
//! over the bus and presents a synthesized local virtio device to a local
//! guest via the [`VirtioHost`] capability.
//!
//! Grounded on `examples/original_source/hw/virtio/virtio-msg-proxy-driver.c`:
//! `virtio_msg_pd_reset_hold` (connect + `DEVICE_INFO` + `GET_FEATURES` +
//! probe), `virtio_msg_pd_probe_queue[s]` (delete-then-readd), and
//! `virtio_msg_pd_set_status` (re-probe on `FEATURES_OK`, then sync status
//! by reading it back). The original's `vmb_receive_msg` never answers an
//! incoming `IOMMU_TRANSLATE` request even though the device side can issue
//! one over the "remote" strategy; this proxy answers it using its own
//! [`PagemapTranslator`], since it's the side fronting real guest memory.

use crate::bus::{BusDevice, Carrier};
use crate::codec::{
    self, pack_device_info_req, pack_get_config, pack_get_device_status, pack_get_features,
    pack_get_vqueue, pack_iommu_translate_resp, pack_set_config, pack_set_device_status,
    pack_set_features, pack_set_vqueue, Payload,
};
use crate::config::DriverProxyConfig;
use crate::device::{DeviceStatus, VirtioHost, VIRTIO_QUEUE_MAX};
use crate::error::{trace_msg, Error, Result};
use crate::iommu::{self, IommuStrategy, PagemapTranslator};
use crate::msg::{id, Msg};

pub struct DriverProxy<C: Carrier, H: VirtioHost> {
    bus: BusDevice<C>,
    host: H,
    dev_id: u16,
    expected_device_id: u32,
    host_features: u64,
    status: u32,
    iommu: IommuStrategy,
}

impl<C: Carrier, H: VirtioHost> DriverProxy<C, H> {
    pub fn new(
        carrier: C,
        host: H,
        dev_id: u16,
        cfg: DriverProxyConfig,
        iommu: IommuStrategy,
    ) -> Self {
        DriverProxy {
            bus: BusDevice::new(carrier),
            host,
            dev_id,
            expected_device_id: cfg.expected_device_id,
            host_features: 0,
            status: 0,
            iommu,
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn status(&self) -> u32 {
        self.status
    }

    pub fn host_features(&self) -> u64 {
        self.host_features
    }

    fn request(&mut self, req: Msg) -> Result<Msg> {
        self.bus.send(&req, true)?.ok_or(Error::TransportTimeout)
    }

    /// Connect and run the reset-hold sequence (spec.md §4.7): query
    /// `DEVICE_INFO`, assert the device id matches configuration (spec.md
    /// §9 Open Question (b), §6 `virtio-id`), merge in `GET_FEATURES`, then
    /// probe queues.
    pub fn reset_hold(&mut self) -> Result<()> {
        self.bus.connect();

        let info = self.request(pack_device_info_req(self.dev_id))?;
        match codec::decode(&info) {
            Payload::DeviceInfoResp { device_id, .. } if device_id == self.expected_device_id => {}
            Payload::DeviceInfoResp { device_id, .. } => {
                return Err(Error::PeerProtocolViolation(format!(
                    "device_id mismatch: expected {:#x}, peer reports {:#x}",
                    self.expected_device_id, device_id
                )));
            }
            _ => return Err(Error::PeerProtocolViolation("malformed DEVICE_INFO reply".into())),
        }

        self.refresh_host_features()?;
        self.probe_queues()?;
        Ok(())
    }

    fn refresh_host_features(&mut self) -> Result<()> {
        let resp = self.request(pack_get_features(self.dev_id))?;
        match codec::decode(&resp) {
            Payload::GetFeaturesResp { features } => {
                self.host_features = features;
                Ok(())
            }
            _ => Err(Error::PeerProtocolViolation("malformed GET_FEATURES reply".into())),
        }
    }

    /// Delete every existing local queue, then re-probe from 0 until a
    /// `max_size` of 0 is seen (spec.md §4.9). Idempotent; required after
    /// `FEATURES_OK` since feature negotiation can change queue count.
    pub fn probe_queues(&mut self) -> Result<()> {
        for i in 0..VIRTIO_QUEUE_MAX {
            self.host.remove_queue(i);
        }
        for i in 0..VIRTIO_QUEUE_MAX {
            let resp = self.request(pack_get_vqueue(self.dev_id, i))?;
            match codec::decode(&resp) {
                Payload::GetVqueueResp { max_size, .. } if max_size > 0 => {
                    self.host.create_queue(i, max_size);
                }
                Payload::GetVqueueResp { .. } => break,
                _ => {
                    return Err(Error::PeerProtocolViolation(
                        "malformed GET_VQUEUE reply".into(),
                    ))
                }
            }
        }
        Ok(())
    }

    pub fn set_features(&mut self, features: u64) -> Result<()> {
        self.request(pack_set_features(self.dev_id, features))?;
        Ok(())
    }

    /// Set status, re-probing queues if `FEATURES_OK` just got set, then
    /// read status back so the local mirror matches the peer exactly
    /// (spec.md §4.7, grounded on `virtio_msg_pd_set_status`'s
    /// `SET_DEVICE_STATUS` followed by `GET_DEVICE_STATUS`).
    pub fn set_status(&mut self, status: u32) -> Result<()> {
        self.bus.send(&pack_set_device_status(self.dev_id, status), false)?;

        if DeviceStatus::from_bits_truncate(status).contains(DeviceStatus::FEATURES_OK) {
            self.probe_queues()?;
        }

        let resp = self.request(pack_get_device_status(self.dev_id))?;
        match codec::decode(&resp) {
            Payload::GetDeviceStatusResp { status } => {
                self.status = status;
                Ok(())
            }
            _ => Err(Error::PeerProtocolViolation(
                "malformed GET_DEVICE_STATUS reply".into(),
            )),
        }
    }

    pub fn read_config(&mut self, offset: u32, size: u8) -> Result<u64> {
        let resp = self.request(pack_get_config(self.dev_id, offset, size))?;
        match codec::decode(&resp) {
            Payload::GetConfigResp { data, .. } => Ok(data),
            _ => Err(Error::PeerProtocolViolation("malformed GET_CONFIG reply".into())),
        }
    }

    pub fn write_config(&mut self, offset: u32, size: u8, data: u64) -> Result<()> {
        self.request(pack_set_config(self.dev_id, offset, size, data))?;
        Ok(())
    }

    /// Send `SET_VQUEUE`: no response is defined for this id (spec.md §3
    /// taxonomy lists it request-only).
    pub fn queue_enable(
        &mut self,
        index: u32,
        size: u32,
        desc: u64,
        driver: u64,
        device: u64,
    ) -> Result<()> {
        self.bus.send(
            &pack_set_vqueue(self.dev_id, index, size, desc, driver, device),
            false,
        )?;
        Ok(())
    }

    /// The local guest rang the avail doorbell for queue `index`
    /// (grounded on `virtio_msg_pd_handle_output`).
    pub fn notify_avail(&mut self, index: u32, next_offset: u64, next_wrap: u64) -> Result<()> {
        self.bus.send(
            &crate::codec::pack_event_avail(self.dev_id, index, next_offset, next_wrap),
            false,
        )?;
        Ok(())
    }

    /// Drain and answer whatever's pending on the bus (spec.md §4.4
    /// `process()`). Forwards `EVENT_USED`/`EVENT_CONFIG` to the
    /// [`VirtioHost`] and answers any `IOMMU_TRANSLATE` request locally.
    pub fn poll(&mut self) -> Result<()> {
        let host = &mut self.host;
        let iommu = &self.iommu;
        let dev_id = self.dev_id;
        self.bus.process(|msg| dispatch(host, iommu, dev_id, msg))
    }
}

fn dispatch<H: VirtioHost>(
    host: &mut H,
    iommu: &IommuStrategy,
    dev_id: u16,
    msg: &Msg,
) -> Result<Option<Msg>> {
    match (msg.id, codec::decode(msg)) {
        (id::EVENT_USED, Payload::EventUsed { index }) => {
            host.notify_queue(index);
            Ok(None)
        }
        (id::EVENT_CONFIG, Payload::EventConfig { .. }) => {
            host.notify_config();
            Ok(None)
        }
        (id::IOMMU_TRANSLATE, Payload::IommuTranslate { va, prot }) => {
            let (pa, prot) = match iommu {
                IommuStrategy::Disabled => iommu::identity(va),
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
        (_, Payload::Unknown) => {
            log::warn!("driver proxy: {}", trace_msg(msg));
            Ok(None)
        }
        _ => {
            log::debug!("driver proxy ignoring stray message: {}", trace_msg(msg));
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::local::LocalCarrier;
    use crate::device::test_support::StubHost;
    use crate::device::VIRTIO_ID_NET;
    use crate::proxy::device_proxy::DeviceProxy;
    use crate::device::test_support::StubDevice;

    fn new_pair() -> (
        DriverProxy<LocalCarrier, StubHost>,
        DeviceProxy<LocalCarrier, StubDevice>,
    ) {
        let (driver_carrier, device_carrier) =
            LocalCarrier::new_pair(&crate::config::LocalConfig::default()).unwrap();
        let driver = DriverProxy::new(
            driver_carrier,
            StubHost::new(),
            0,
            crate::config::DriverProxyConfig {
                expected_device_id: VIRTIO_ID_NET,
            },
            IommuStrategy::Disabled,
        );
        let device = DeviceProxy::new(
            device_carrier,
            StubDevice::new(VIRTIO_ID_NET, 1, 64),
            0,
            IommuStrategy::Disabled,
        );
        (driver, device)
    }

    #[test]
    fn reset_hold_probes_queues_and_rejects_mismatch() {
        let (mut driver, mut device) = new_pair();
        // `reset_hold` blocks on each round trip; answer it from a
        // background poll loop, the same shape a real host event loop runs
        // the device proxy in.
        let handle = std::thread::spawn(move || {
            for _ in 0..64 {
                let _ = device.poll();
                std::thread::sleep(std::time::Duration::from_micros(50));
            }
        });
        driver.reset_hold().unwrap();
        handle.join().unwrap();
        assert_eq!(driver.host().queues.get(&0), Some(&64));
    }
}
