/// Unit tests for PCI enumeration, BAR sizing and the capability walk.
///
/// Everything runs against `FakeConfigSpace`; no port I/O happens.
use super::mock::{virtio_layout, FakeConfigSpace};
use super::*;
use crate::drivers::io::mock::{PortWrite, RecordingPorts};
use alloc::format;

const NET: Bdf = Bdf::new(0, 3, 0);

fn virtio_net_bus() -> FakeConfigSpace {
    let cfg = FakeConfigSpace::new();
    // Host bridge and a disk controller around the NIC
    cfg.add_function(Bdf::new(0, 0, 0), 0x8086, 0x1237, 0x06, 0x00);
    cfg.add_function(Bdf::new(0, 1, 0), 0x8086, 0x7010, 0x01, 0x01);
    cfg.add_virtio_net(NET, VIRTIO_NET_TRANSITIONAL, 0xFE00_0000, Some(0xC000));
    cfg
}

// ---- Configuration mechanism 1 ----

#[test]
fn config_address_encodes_bdf_and_dword_offset() {
    let bdf = Bdf::new(1, 3, 2);
    assert_eq!(bdf.config_address(0x3E), 0x8000_0000 | 1 << 16 | 3 << 11 | 2 << 8 | 0x3C);
}

#[test]
fn mechanism1_selects_byte_lane() {
    let ports = RecordingPorts::new();
    ports.set_bytes(0xCFC, &[0x11, 0x22, 0x33, 0x44]);
    let cfg = Mechanism1::new(&ports);

    assert_eq!(cfg.read8(NET, 0x06), 0x33);
    assert_eq!(cfg.read16(NET, 0x06), 0x4433);
    cfg.write8(NET, 0x05, 0xAB);

    let writes = ports.writes();
    assert_eq!(writes[0], PortWrite::Dword(0xCF8, NET.config_address(0x06)));
    assert_eq!(writes.last(), Some(&PortWrite::Byte(0xCFD, 0xAB)));
}

// ---- Enumeration ----

#[test]
fn enumerate_records_present_functions() {
    let cfg = virtio_net_bus();
    let mut table = PciTable::new();

    assert_eq!(table.enumerate(&cfg, PciBus::root()), Ok(3));
    assert_eq!(table.len(), 3);

    let nic = table.get(table.find_class(CLASS_NETWORK).unwrap()).unwrap();
    assert_eq!(nic.bdf, NET);
    assert_eq!(nic.vendor_id, VIRTIO_VENDOR);
    assert_eq!(nic.irq_line, virtio_layout::IRQ_LINE);
    assert_eq!(nic.irq_pin, 1);
}

#[test]
fn absent_functions_leave_table_unchanged() {
    let cfg = FakeConfigSpace::new();
    cfg.add_function(Bdf::new(0, 2, 0), 0x8086, 0x100E, 0x02, 0x00);
    cfg.set_multifunction(0, 2);
    let mut table = PciTable::new();

    // Functions 1..7 are probed and read back 0xFFFF
    assert_eq!(table.enumerate(&cfg, PciBus::root()), Ok(1));
    assert_eq!(table.len(), 1);
    assert_eq!(table.iter().count(), 1);
}

#[test]
fn multifunction_device_exposes_every_function() {
    let cfg = FakeConfigSpace::new();
    cfg.add_function(Bdf::new(0, 1, 0), 0x8086, 0x7000, 0x06, 0x01);
    cfg.add_function(Bdf::new(0, 1, 1), 0x8086, 0x7010, 0x01, 0x01);
    cfg.add_function(Bdf::new(0, 1, 3), 0x8086, 0x7113, 0x06, 0x80);
    cfg.set_multifunction(0, 1);
    let mut table = PciTable::new();

    assert_eq!(table.enumerate(&cfg, PciBus::root()), Ok(3));
}

#[test]
fn function_zero_without_multifunction_bit_hides_others() {
    let cfg = FakeConfigSpace::new();
    cfg.add_function(Bdf::new(0, 1, 0), 0x8086, 0x7000, 0x06, 0x01);
    cfg.add_function(Bdf::new(0, 1, 1), 0x8086, 0x7010, 0x01, 0x01);
    let mut table = PciTable::new();

    assert_eq!(table.enumerate(&cfg, PciBus::root()), Ok(1));
}

#[test]
fn unknown_header_type_is_skipped() {
    let cfg = FakeConfigSpace::new();
    cfg.add_function(Bdf::new(0, 4, 0), 0x104C, 0xAC1A, 0x06, 0x07);
    cfg.set_header_type(Bdf::new(0, 4, 0), 2);
    let mut table = PciTable::new();

    assert_eq!(table.enumerate(&cfg, PciBus::root()), Ok(0));
    assert!(table.is_empty());
}

#[test]
fn class_index_keeps_first_device() {
    let cfg = FakeConfigSpace::new();
    cfg.add_function(Bdf::new(0, 2, 0), 0x8086, 0x100E, 0x02, 0x00);
    cfg.add_function(Bdf::new(0, 5, 0), 0x10EC, 0x8139, 0x02, 0x00);
    let mut table = PciTable::new();
    table.enumerate(&cfg, PciBus::root()).unwrap();

    let first = table.get(table.find_class(0x02).unwrap()).unwrap();
    assert_eq!(first.bdf, Bdf::new(0, 2, 0));
    assert_eq!(table.find_class(0x03), None);
}

#[test]
fn table_overflow_keeps_existing_entries() {
    let cfg = FakeConfigSpace::new();
    for device in 0..5 {
        for function in 0..8 {
            let bdf = Bdf::new(0, device, function);
            cfg.add_function(bdf, 0x8086, (device as u16) << 8 | function as u16, 0x08, 0x80);
        }
        cfg.set_multifunction(0, device);
    }
    let mut table = PciTable::new();

    // 40 functions, 32 slots: the rest are logged and skipped
    assert_eq!(table.enumerate(&cfg, PciBus::root()), Ok(PCI_TABLE_CAPACITY));
    assert_eq!(table.len(), PCI_TABLE_CAPACITY);
    for (_, dev) in table.iter() {
        let expected = (dev.bdf.device as u16) << 8 | dev.bdf.function as u16;
        assert_eq!(dev.product_id, expected);
        assert!(dev.bdf.device < 4);
    }
}

#[test]
fn full_table_fails_enumeration_with_nothing_recorded() {
    let cfg = FakeConfigSpace::new();
    cfg.add_function(Bdf::new(0, 0, 0), 0x8086, 0x1237, 0x06, 0x00);
    let mut table = PciTable::new();
    table.enumerate(&cfg, PciBus::root()).unwrap();

    let mut second = FakeConfigSpace::new();
    for device in 0..4 {
        for function in 0..8 {
            second.add_function(Bdf::new(0, device, function), 0x8086, 0x2000, 0x08, 0x80);
        }
        second.set_multifunction(0, device);
    }
    assert_eq!(table.enumerate(&second, PciBus::root()), Ok(31));
    second = FakeConfigSpace::new();
    second.add_function(Bdf::new(0, 9, 0), 0x8086, 0x3000, 0x08, 0x80);
    assert_eq!(table.enumerate(&second, PciBus::root()), Err(PciError::OutOfCapacity));
}

#[test]
fn release_recycles_slot_and_rejects_stale_handle() {
    let cfg = virtio_net_bus();
    let mut table = PciTable::new();
    table.enumerate(&cfg, PciBus::root()).unwrap();

    let nic = table.find_class(CLASS_NETWORK).unwrap();
    assert!(table.release(nic).is_some());
    assert_eq!(table.find_class(CLASS_NETWORK), None);
    assert_eq!(table.get(nic).map(|d| d.bdf), None);
    assert!(table.release(nic).is_none());
    assert_eq!(table.len(), 2);
}

#[test]
fn device_log_line_format() {
    let cfg = virtio_net_bus();
    let mut table = PciTable::new();
    table.enumerate(&cfg, PciBus::root()).unwrap();

    let nic = table.get(table.find_class(CLASS_NETWORK).unwrap()).unwrap();
    assert_eq!(
        format!("{}", nic),
        "0:3.0: 0x1af4:0x1000: class: 2.0 (Network controller) irq: 11",
    );
    assert_eq!(class_name(0x11), "Signal processing controller");
    assert_eq!(class_name(0x40), "Unknown");
}

// ---- BAR sizing ----

#[test]
fn bar_sizing_restores_registers() {
    let cfg = virtio_net_bus();
    let before: alloc::vec::Vec<u32> = (0..6).map(|i| cfg.peek32(NET, 0x10 + 4 * i)).collect();

    let mut dev = PciDevice::new(PciBus::root(), 3, 0);
    read_bars(&cfg, &mut dev);

    let after: alloc::vec::Vec<u32> = (0..6).map(|i| cfg.peek32(NET, 0x10 + 4 * i)).collect();
    assert_eq!(before, after);
}

#[test]
fn bar_sizing_decodes_io_and_64bit_memory() {
    let cfg = virtio_net_bus();
    let mut dev = PciDevice::new(PciBus::root(), 3, 0);
    read_bars(&cfg, &mut dev);

    assert_eq!(
        dev.bar(0),
        Some(&Bar { base: 0xC000, size: 0x20, kind: BarKind::Io })
    );
    assert_eq!(
        dev.bar(4),
        Some(&Bar { base: 0xFE00_0000, size: virtio_layout::MEM_SIZE, kind: BarKind::Memory64 })
    );
    // BAR 5 is the upper half of BAR 4
    assert_eq!(dev.bar(5), None);
    assert_eq!(dev.bar(1), None);
    assert_eq!(dev.iobase, 0xC000);
    assert_eq!(dev.membase, 0xFE00_0000);
}

#[test]
fn bar_above_4g_keeps_high_bits() {
    let cfg = FakeConfigSpace::new();
    let bdf = Bdf::new(0, 6, 0);
    cfg.add_function(bdf, 0x1B36, 0x0010, 0x01, 0x08);
    cfg.add_mem64_bar(bdf, 0, 0x8_0000_0000, 0x10_0000);
    cfg.add_mem_bar(bdf, 2, 0xFEB0_0000, 0x1000);

    let mut dev = PciDevice::new(PciBus::root(), 6, 0);
    read_bars(&cfg, &mut dev);

    let bar = dev.bar(0).unwrap();
    assert_eq!(bar.base, 0x8_0000_0000);
    assert_eq!(bar.size, 0x10_0000);
    assert_eq!(dev.bar(2).map(|b| (b.base, b.size, b.kind)), Some((0xFEB0_0000, 0x1000, BarKind::Memory32)));
}

#[test]
fn unassigned_bar_is_flagged_misconfigured() {
    let cfg = FakeConfigSpace::new();
    let bdf = Bdf::new(0, 7, 0);
    cfg.add_function(bdf, 0x1234, 0x1111, 0x03, 0x00);
    cfg.add_mem_bar(bdf, 0, 0, 0x100_0000);

    let mut dev = PciDevice::new(PciBus::root(), 7, 0);
    read_bars(&cfg, &mut dev);

    let bar = dev.bar(0).unwrap();
    assert_eq!(bar.size, 0x100_0000);
    assert!(bar.misconfigured());
}

// ---- Capability walk ----

#[test]
fn walk_records_only_present_virtio_types() {
    let cfg = FakeConfigSpace::new();
    cfg.add_function(NET, VIRTIO_VENDOR, VIRTIO_NET_MODERN, 0x02, 0x00);
    cfg.add_virtio_cap(NET, 0x40, cap_type::COMMON_CFG, 4, 0x0, 0x38);
    // MSI-X in the middle is followed but not recorded
    cfg.add_capability(NET, 0x50, 0x11, &[0; 10]);
    cfg.add_notify_cap(NET, 0x60, 4, 0x3000, 0x1000, 4);
    cfg.add_virtio_cap(NET, 0x78, cap_type::PCI_CFG, 0, 0, 0);

    let mut dev = PciDevice::new(PciBus::root(), 3, 0);
    assert_eq!(walk_capabilities(&cfg, &mut dev), Ok(3));

    assert_eq!(dev.caps.len(), 3);
    assert_eq!(dev.caps.get(cap_type::COMMON_CFG).map(|c| c.pointer), Some(0x40));
    assert_eq!(dev.caps.get(cap_type::NOTIFY_CFG).map(|c| (c.bar, c.offset)), Some((4, 0x3000)));
    assert!(dev.caps.get(cap_type::PCI_CFG).is_some());
    assert!(dev.caps.get(cap_type::ISR_CFG).is_none());
    assert!(dev.caps.get(cap_type::DEVICE_CFG).is_none());
    assert_eq!(dev.caps.notify_off_multiplier(), 4);
}

#[test]
fn first_capability_of_a_type_wins() {
    let cfg = FakeConfigSpace::new();
    cfg.add_function(NET, VIRTIO_VENDOR, VIRTIO_NET_MODERN, 0x02, 0x00);
    cfg.add_virtio_cap(NET, 0x40, cap_type::COMMON_CFG, 4, 0x0, 0x38);
    cfg.add_virtio_cap(NET, 0x50, cap_type::COMMON_CFG, 2, 0x800, 0x38);

    let mut dev = PciDevice::new(PciBus::root(), 3, 0);
    assert_eq!(walk_capabilities(&cfg, &mut dev), Ok(1));
    assert_eq!(dev.caps.get(cap_type::COMMON_CFG).map(|c| c.bar), Some(4));
}

#[test]
fn walk_without_capability_list() {
    let cfg = FakeConfigSpace::new();
    cfg.add_function(NET, VIRTIO_VENDOR, VIRTIO_NET_TRANSITIONAL, 0x02, 0x00);

    let mut dev = PciDevice::new(PciBus::root(), 3, 0);
    assert_eq!(walk_capabilities(&cfg, &mut dev), Err(PciError::NoCapabilities));
}

#[test]
fn looping_capability_list_is_malformed() {
    let cfg = FakeConfigSpace::new();
    cfg.add_function(NET, VIRTIO_VENDOR, VIRTIO_NET_TRANSITIONAL, 0x02, 0x00);
    cfg.add_virtio_cap(NET, 0x40, cap_type::COMMON_CFG, 4, 0, 0x38);
    cfg.add_virtio_cap(NET, 0x50, cap_type::ISR_CFG, 4, 0x1000, 4);
    // 0x50 -> 0x40
    cfg.poke(NET, 0x51, &[0x40]);

    let mut dev = PciDevice::new(PciBus::root(), 3, 0);
    assert_eq!(walk_capabilities(&cfg, &mut dev), Err(PciError::MalformedCapabilityList));
}

#[test]
fn pointer_into_header_is_malformed() {
    let cfg = FakeConfigSpace::new();
    cfg.add_function(NET, VIRTIO_VENDOR, VIRTIO_NET_TRANSITIONAL, 0x02, 0x00);
    cfg.add_virtio_cap(NET, 0x40, cap_type::COMMON_CFG, 4, 0, 0x38);
    cfg.poke(NET, 0x41, &[0x20]);

    let mut dev = PciDevice::new(PciBus::root(), 3, 0);
    assert_eq!(walk_capabilities(&cfg, &mut dev), Err(PciError::MalformedCapabilityList));
}

#[test]
fn virtio_net_gets_bus_mastering_and_capabilities() {
    let cfg = virtio_net_bus();
    let mut table = PciTable::new();
    table.enumerate(&cfg, PciBus::root()).unwrap();

    let command = Command::from_bits_retain(cfg.command(NET));
    assert!(command.contains(Command::IO_SPACE | Command::MEMORY_SPACE | Command::BUS_MASTER));
    // Status half untouched by the command write
    assert_ne!(cfg.peek32(NET, regs::COMMAND) >> 16 & regs::STATUS_CAP_LIST as u32, 0);

    let nic = table.get(table.find_class(CLASS_NETWORK).unwrap()).unwrap();
    assert_eq!(nic.caps.len(), 5);
    assert_eq!(nic.caps.notify_off_multiplier(), virtio_layout::NOTIFY_MULTIPLIER);

    // Other functions are left alone
    assert_eq!(cfg.command(Bdf::new(0, 1, 0)), 0);
}

#[test]
fn virtio_net_with_broken_list_is_kept_but_not_indexed() {
    let cfg = FakeConfigSpace::new();
    cfg.add_function(NET, VIRTIO_VENDOR, VIRTIO_NET_TRANSITIONAL, 0x02, 0x00);
    cfg.add_virtio_cap(NET, 0x40, cap_type::COMMON_CFG, 4, 0, 0x38);
    cfg.poke(NET, 0x41, &[0x10]);
    let mut table = PciTable::new();

    assert_eq!(table.enumerate(&cfg, PciBus::root()), Ok(1));
    assert_eq!(table.find_class(CLASS_NETWORK), None);
    assert_eq!(table.len(), 1);
}

#[test]
fn absent_probe_slot_is_recycled() {
    let cfg = FakeConfigSpace::new();
    cfg.add_function(Bdf::new(0, 2, 0), 0x8086, 0x100E, 0x02, 0x00);
    cfg.set_multifunction(0, 2);
    let mut table = PciTable::new();
    table.enumerate(&cfg, PciBus::root()).unwrap();

    // Slot 1 was taken and handed back by each of the 7 empty probes
    let other = FakeConfigSpace::new();
    other.add_function(Bdf::new(0, 0, 0), 0x8086, 0x1237, 0x06, 0x00);
    table.enumerate(&other, PciBus::root()).unwrap();

    let handle = table.find_class(0x06).unwrap();
    assert_eq!(handle.index(), 1);
    assert_eq!(handle.generation(), 7);
}

#[test]
fn cfg_window_programs_bar_and_offset() {
    let cfg = virtio_net_bus();
    let mut dev = PciDevice::new(PciBus::root(), 3, 0);
    walk_capabilities(&cfg, &mut dev).unwrap();

    cfg.poke(NET, 0x94 + 16, &0xDEAD_BEEFu32.to_le_bytes());
    assert_eq!(read_via_cfg_window(&cfg, &dev, 4, 0x14), Ok(0xDEAD_BEEF));
    assert_eq!(cfg.peek32(NET, 0x94 + 4) & 0xFF, 4);
    assert_eq!(cfg.peek32(NET, 0x94 + 8), 0x14);
    assert_eq!(cfg.peek32(NET, 0x94 + 12), 4);
}
