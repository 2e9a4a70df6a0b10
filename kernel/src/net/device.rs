/// smoltcp PHY adapter over any `NetLink`.
///
/// smoltcp pulls frames through `receive` and pushes them through
/// transmit tokens; both end up as `NetLink::recv` / `NetLink::send` on
/// the card's link.
use alloc::vec;
use alloc::vec::Vec;
use smoltcp::phy::{self, Device, DeviceCapabilities, Medium};
use smoltcp::time::Instant;
use smoltcp::wire::EthernetAddress;

use super::card::NetLink;
use crate::drivers::virtio::{NetHeader, FRAME_SIZE};
use crate::serial_println;

/// Largest Ethernet frame the link carries (no FCS).
pub const MTU: usize = 1514;

static_assertions::const_assert!(MTU + core::mem::size_of::<NetHeader>() <= FRAME_SIZE);

pub struct LinkDevice<'l, L: NetLink + ?Sized> {
    link: &'l L,
}

impl<'l, L: NetLink + ?Sized> LinkDevice<'l, L> {
    pub fn new(link: &'l L) -> Self {
        Self { link }
    }

    pub fn ethernet_address(&self) -> EthernetAddress {
        self.link.ethernet_address()
    }
}

impl<'l, L: NetLink + ?Sized> Device for LinkDevice<'l, L> {
    type RxToken<'a> = RxToken where Self: 'a;
    type TxToken<'a> = TxToken<'l, L> where Self: 'a;

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let mut frame = vec![0u8; FRAME_SIZE];
        match self.link.recv(&mut frame) {
            Ok(Some(len)) => {
                frame.truncate(len);
                Some((RxToken { frame }, TxToken { link: self.link }))
            }
            Ok(None) => None,
            Err(e) => {
                serial_println!("[net] receive failed: {}", e);
                None
            }
        }
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        // Ring backpressure shows up as a failed send in the token
        Some(TxToken { link: self.link })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ethernet;
        caps.max_transmission_unit = MTU;
        caps.max_burst_size = Some(1);
        caps
    }
}

/// A received Ethernet frame.
pub struct RxToken {
    frame: Vec<u8>,
}

impl phy::RxToken for RxToken {
    fn consume<R, F>(mut self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        f(&mut self.frame)
    }
}

pub struct TxToken<'l, L: NetLink + ?Sized> {
    link: &'l L,
}

impl<L: NetLink + ?Sized> phy::TxToken for TxToken<'_, L> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buf = vec![0u8; len];
        let result = f(&mut buf);
        if let Err(e) = self.link.send(&buf) {
            serial_println!("[net] transmit of {} bytes failed: {}", len, e);
        }
        result
    }
}
