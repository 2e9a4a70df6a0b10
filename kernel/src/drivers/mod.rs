/// Device drivers: PCI bus, virtio transport and virtio-net.
pub mod io;
pub mod pci;
pub mod virtio;
