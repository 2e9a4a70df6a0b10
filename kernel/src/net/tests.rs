/// Unit tests for the card registry, the smoltcp adapter and the boot
/// path that ties PCI, virtio and the card table together.
use super::*;
use crate::drivers::io::mock::RecordingIrqs;
use crate::drivers::pci::mock::{virtio_layout, FakeConfigSpace};
use crate::drivers::pci::{Bdf, VIRTIO_NET_TRANSITIONAL};
use crate::drivers::virtio::mock::FakeVirtioNet;
use crate::drivers::virtio::{VirtioError, FRAME_SIZE};
use crate::mem::mock::HeapFrames;
use crate::slab::OutOfCapacity;
use alloc::collections::VecDeque;
use alloc::vec;
use alloc::vec::Vec;
use smoltcp::phy::{Device, Medium, RxToken as _, TxToken as _};
use smoltcp::time::Instant;
use smoltcp::wire::{EthernetAddress, Ipv4Address};
use spin::Mutex;

const MAC: [u8; 6] = [0x52, 0x54, 0x00, 0xAB, 0xCD, 0xEF];
const MEM_BASE: u64 = 0xFEB0_0000;
const IO_BASE: u16 = 0xC040;

/// In-memory link: frames pushed into `inbox` come out of `recv`.
#[derive(Default)]
struct QueueLink {
    inbox: Mutex<VecDeque<Vec<u8>>>,
    sent: Mutex<Vec<Vec<u8>>>,
    busy: bool,
}

impl NetLink for QueueLink {
    fn mac(&self) -> [u8; 6] {
        MAC
    }

    fn send(&self, frame: &[u8]) -> Result<(), LinkError> {
        if self.busy {
            return Err(LinkError::Busy);
        }
        self.sent.lock().push(frame.to_vec());
        Ok(())
    }

    fn recv(&self, out: &mut [u8]) -> Result<Option<usize>, LinkError> {
        let Some(frame) = self.inbox.lock().pop_front() else {
            return Ok(None);
        };
        out[..frame.len()].copy_from_slice(&frame);
        Ok(Some(frame.len()))
    }
}

fn nic_bus() -> FakeConfigSpace {
    let cfg = FakeConfigSpace::new();
    cfg.add_function(Bdf::new(0, 0, 0), 0x8086, 0x1237, 0x06, 0x00);
    cfg.add_virtio_net(Bdf::new(0, 4, 0), VIRTIO_NET_TRANSITIONAL, MEM_BASE, Some(IO_BASE as u32));
    cfg
}

// ---- Card table ----

#[test]
fn card_table_holds_ncards() {
    let mut cards = CardTable::new();
    for _ in 0..NCARDS {
        cards.register_device(QueueLink::default()).unwrap();
    }
    assert!(cards.is_full());
    assert_eq!(cards.register_device(QueueLink::default()).err(), Some(OutOfCapacity));
    assert_eq!(cards.iter().count(), NCARDS);
}

#[test]
fn new_card_has_empty_configuration() {
    let mut cards = CardTable::new();
    let handle = cards.register_device(QueueLink::default()).unwrap();

    let card = cards.get(handle).unwrap();
    assert_eq!(card.conf, NetConf::default());
    assert_eq!(card.conf.ip, Ipv4Address::UNSPECIFIED);
    assert_eq!(card.link().ethernet_address(), EthernetAddress(MAC));

    cards.get_mut(handle).unwrap().conf = NetConf {
        ip: Ipv4Address::new(10, 0, 2, 15),
        subnetmask: Ipv4Address::new(255, 255, 255, 0),
        gateway: Ipv4Address::new(10, 0, 2, 2),
        vlan: 0,
    };
    assert_eq!(cards.get(handle).unwrap().conf.prefix_len(), 24);
}

#[test]
fn driver_errors_map_to_link_errors() {
    let full = VirtioNetError::Virtio(VirtioError::QueueFull);
    assert_eq!(LinkError::from(full), LinkError::Busy);

    let short = VirtioNetError::BufferTooSmall { needed: 90, available: 60 };
    assert_eq!(LinkError::from(short), LinkError::Truncated { needed: 90 });

    assert_eq!(LinkError::from(VirtioNetError::MissingQueue(1)), LinkError::Device);
}

// ---- smoltcp adapter ----

#[test]
fn receive_hands_frame_to_smoltcp() {
    let link = QueueLink::default();
    link.inbox.lock().push_back(vec![0xEE; 42]);
    let mut device = LinkDevice::new(&link);

    let (rx, _tx) = device.receive(Instant::from_millis(0)).unwrap();
    let len = rx.consume(|frame| {
        assert!(frame.iter().all(|&b| b == 0xEE));
        frame.len()
    });
    assert_eq!(len, 42);

    assert!(device.receive(Instant::from_millis(1)).is_none());
}

#[test]
fn transmit_token_sends_on_link() {
    let link = QueueLink::default();
    let mut device = LinkDevice::new(&link);

    let tx = device.transmit(Instant::from_millis(0)).unwrap();
    tx.consume(60, |buf| buf[..6].copy_from_slice(&[0xFF; 6]));

    let sent = link.sent.lock();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].len(), 60);
    assert_eq!(&sent[0][..6], &[0xFF; 6]);
}

#[test]
fn busy_link_drops_transmit() {
    let link = QueueLink {
        busy: true,
        ..QueueLink::default()
    };
    let mut device = LinkDevice::new(&link);
    let tx = device.transmit(Instant::from_millis(0)).unwrap();
    let value = tx.consume(14, |_| 7);
    assert_eq!(value, 7);
    assert!(link.sent.lock().is_empty());
}

#[test]
fn capabilities_describe_ethernet() {
    let link = QueueLink::default();
    let device = LinkDevice::new(&link);
    let caps = device.capabilities();
    assert_eq!(caps.medium, Medium::Ethernet);
    assert_eq!(caps.max_transmission_unit, MTU);
    assert_eq!(device.ethernet_address(), EthernetAddress(MAC));
}

// ---- Boot path ----

#[test]
fn net_init_registers_virtio_card() {
    let cfg = nic_bus();
    let fake = FakeVirtioNet::new(MEM_BASE, IO_BASE, MAC, 32);
    let frames = HeapFrames::new();
    let irqs = RecordingIrqs::default();
    let mut pci = PciTable::new();
    let mut virtio = VirtioTable::new();
    let mut cards = CardTable::new();

    let card = net_init(&cfg, &mut pci, &mut virtio, &mut cards, &fake, &fake, &frames, &irqs).unwrap();

    assert_eq!(pci.len(), 2);
    assert_eq!(irqs.enabled(), vec![virtio_layout::IRQ_LINE]);
    assert_eq!(cards.len(), 1);

    let link = cards.get(card).unwrap().link();
    assert_eq!(link.mac(), MAC);

    link.send(&[0x42; 64]).unwrap();
    let sent = fake.consume(1);
    assert_eq!(sent[0].segments[1], vec![0x42; 64]);

    assert!(fake.deliver(&[0x24; 80]));
    let mut out = [0u8; FRAME_SIZE];
    assert_eq!(link.recv(&mut out), Ok(Some(80)));
    assert_eq!(&out[..80], &[0x24; 80]);
}

#[test]
fn smoltcp_device_over_virtio_link() {
    let cfg = nic_bus();
    let fake = FakeVirtioNet::new(MEM_BASE, IO_BASE, MAC, 32);
    let frames = HeapFrames::new();
    let irqs = RecordingIrqs::default();
    let mut pci = PciTable::new();
    let mut virtio = VirtioTable::new();
    let mut cards = CardTable::new();
    let card = net_init(&cfg, &mut pci, &mut virtio, &mut cards, &fake, &fake, &frames, &irqs).unwrap();

    let mut device = LinkDevice::new(cards.get(card).unwrap().link());
    assert!(device.receive(Instant::from_millis(0)).is_none());

    let frame: Vec<u8> = (0..MTU).map(|i| i as u8).collect();
    fake.deliver(&frame);
    let (rx, _) = device.receive(Instant::from_millis(1)).unwrap();
    rx.consume(|got| assert_eq!(&got[..], &frame[..]));
}

#[test]
fn net_init_without_network_function() {
    let cfg = FakeConfigSpace::new();
    cfg.add_function(Bdf::new(0, 0, 0), 0x8086, 0x1237, 0x06, 0x00);
    let fake = FakeVirtioNet::new(MEM_BASE, 0, MAC, 32);
    let frames = HeapFrames::new();
    let irqs = RecordingIrqs::default();
    let mut pci = PciTable::new();
    let mut virtio = VirtioTable::new();
    let mut cards = CardTable::new();

    let err = net_init(&cfg, &mut pci, &mut virtio, &mut cards, &fake, &fake, &frames, &irqs).err();
    assert_eq!(err, Some(NetInitError::NoNetworkDevice));
    assert!(irqs.enabled().is_empty());
    assert!(fake.status_log().is_empty());
}

#[test]
fn net_init_needs_a_free_card_slot() {
    let cfg = nic_bus();
    let fake = FakeVirtioNet::new(MEM_BASE, IO_BASE, MAC, 32);
    let frames = HeapFrames::new();
    let irqs = RecordingIrqs::default();
    let mut pci = PciTable::new();
    let mut virtio = VirtioTable::new();
    let mut cards = CardTable::new();
    for _ in 0..NCARDS {
        cards.register_device(QueueLink::default()).unwrap();
    }

    let err = net_init(&cfg, &mut pci, &mut virtio, &mut cards, &fake, &fake, &frames, &irqs).err();
    assert_eq!(err, Some(NetInitError::NoCardSlot));
    assert!(fake.status_log().is_empty());
}

#[test]
fn net_init_reports_driver_failure() {
    let cfg = nic_bus();
    let fake = FakeVirtioNet::new(MEM_BASE, IO_BASE, MAC, 32);
    fake.reject_features();
    let frames = HeapFrames::new();
    let irqs = RecordingIrqs::default();
    let mut pci = PciTable::new();
    let mut virtio = VirtioTable::new();
    let mut cards = CardTable::new();

    let err = net_init(&cfg, &mut pci, &mut virtio, &mut cards, &fake, &fake, &frames, &irqs).err();
    assert_eq!(
        err,
        Some(NetInitError::Driver(VirtioNetError::Virtio(VirtioError::FeaturesRejected)))
    );
    assert!(cards.is_empty());
}
