//! Host-local SPSC carrier (spec.md §4.3), grounded on
//! `examples/original_source/hw/virtio/virtio-msg-bus-linux-user.c`: same
//! ring semantics as the shared-memory carrier, but notification is a
//! single byte (`0xED`) over a character device instead of a doorbell MMIO
//! write and an INTx line.
//!
//! The original binds the notification channel to a QEMU chardev backed by
//! a unix-domain socket. Here it's a connected [`UnixDatagram`] pair, the
//! same primitive `std::os::unix::net` exposes for exactly this case.

use std::io;
use std::os::unix::net::UnixDatagram;
use std::sync::Arc;

use crate::bus::Carrier;
use crate::config::LocalConfig;
use crate::msg::Msg;
use crate::spsc::SpscRing;

const RING_REGION_LEN: usize = 4096;

/// How many piled-up notification bytes one `drain_notifications` call
/// coalesces before giving the event loop back control (spec.md §4.3
/// `can_receive()`).
const NOTIFY_CREDIT: usize = 128;

struct Regions {
    driver_ring: Box<[u8]>,
    device_ring: Box<[u8]>,
}

/// One endpoint of a host-local bus. `name` namespaces the pair of shared
/// ring regions (spec.md §6 `name` option); here that's just a label, since
/// the regions are a local heap allocation rather than a named shm object.
pub struct LocalCarrier {
    is_driver: bool,
    name: String,
    tx: SpscRing,
    rx: SpscRing,
    regions: Arc<Regions>,
    chardev: UnixDatagram,
}

impl LocalCarrier {
    /// Build a connected pair sharing one set of ring regions and one
    /// notification socketpair (spec.md §6 `chardev`).
    pub fn new_pair(cfg: &LocalConfig) -> io::Result<(LocalCarrier, LocalCarrier)> {
        let name = cfg.name.clone();
        let regions = Arc::new(Regions {
            driver_ring: vec![0u8; RING_REGION_LEN].into_boxed_slice(),
            device_ring: vec![0u8; RING_REGION_LEN].into_boxed_slice(),
        });

        let (driver_sock, device_sock) = UnixDatagram::pair()?;
        driver_sock.set_nonblocking(true)?;
        device_sock.set_nonblocking(true)?;

        let driver = LocalCarrier {
            is_driver: true,
            name: name.clone(),
            tx: unsafe {
                SpscRing::new(
                    regions.driver_ring.as_ptr() as *mut u8,
                    regions.driver_ring.len(),
                )
            },
            rx: unsafe {
                SpscRing::new(
                    regions.device_ring.as_ptr() as *mut u8,
                    regions.device_ring.len(),
                )
            },
            regions: Arc::clone(&regions),
            chardev: driver_sock,
        };
        let device = LocalCarrier {
            is_driver: false,
            name,
            tx: unsafe {
                SpscRing::new(
                    regions.device_ring.as_ptr() as *mut u8,
                    regions.device_ring.len(),
                )
            },
            rx: unsafe {
                SpscRing::new(
                    regions.driver_ring.as_ptr() as *mut u8,
                    regions.driver_ring.len(),
                )
            },
            regions,
            chardev: device_sock,
        };
        if cfg.reset_queues {
            driver.reset_queues();
            device.reset_queues();
        }
        Ok((driver, device))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn reset_queues(&self) {
        self.tx.reset();
        self.rx.reset();
    }

    /// Drain up to [`NOTIFY_CREDIT`] pending poke bytes so a burst of
    /// notifications collapses into one `process()` instead of one per
    /// byte (spec.md §4.3). Returns `true` if at least one poke arrived.
    pub fn drain_notifications(&self) -> bool {
        let mut buf = [0u8; 1];
        let mut got_any = false;
        for _ in 0..NOTIFY_CREDIT {
            match self.chardev.recv(&mut buf) {
                Ok(_) => got_any = true,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
        got_any
    }
}

/// Wire value of a notification poke (spec.md §6).
const POKE_BYTE: u8 = 0xed;

impl Carrier for LocalCarrier {
    fn is_driver(&self) -> bool {
        self.is_driver
    }

    fn try_send(&self, msg: &Msg) -> bool {
        self.tx.try_enqueue(msg)
    }

    fn notify(&self) {
        let _ = self.chardev.send(&[POKE_BYTE]);
    }

    fn try_recv(&self, out: &mut Msg) -> bool {
        self.rx.try_dequeue(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::pack_get_vqueue;

    #[test]
    fn notification_poke_is_coalesced() {
        let cfg = LocalConfig {
            name: "test".to_string(),
            ..LocalConfig::default()
        };
        let (driver, device) = LocalCarrier::new_pair(&cfg).unwrap();
        for i in 0..5u32 {
            assert!(driver.try_send(&pack_get_vqueue(0, i)));
            driver.notify();
        }
        // one drain call consumes all 5 piled-up pokes.
        assert!(device.drain_notifications());
        assert!(!device.drain_notifications());

        let mut out = Msg::default();
        for i in 0..5u32 {
            assert!(device.try_recv(&mut out));
            match crate::codec::decode(&out) {
                crate::codec::Payload::GetVqueue { index } => assert_eq!(index, i),
                other => panic!("unexpected decode: {other:?}"),
            }
        }
    }
}
