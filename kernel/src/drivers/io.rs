/// Port I/O and interrupt-line seams.
///
/// PCI configuration mechanism 1 and the legacy virtio register block are
/// both reached through x86 port I/O. Drivers take a `PortIo` instead of
/// calling the instructions directly so they can run against a recorded
/// port space in tests.
pub trait PortIo {
    fn inb(&self, port: u16) -> u8;
    fn inw(&self, port: u16) -> u16;
    fn inl(&self, port: u16) -> u32;
    fn outb(&self, port: u16, val: u8);
    fn outw(&self, port: u16, val: u16);
    fn outl(&self, port: u16, val: u32);
}

impl<P: PortIo + ?Sized> PortIo for &P {
    fn inb(&self, port: u16) -> u8 {
        (**self).inb(port)
    }
    fn inw(&self, port: u16) -> u16 {
        (**self).inw(port)
    }
    fn inl(&self, port: u16) -> u32 {
        (**self).inl(port)
    }
    fn outb(&self, port: u16, val: u8) {
        (**self).outb(port, val)
    }
    fn outw(&self, port: u16, val: u16) {
        (**self).outw(port, val)
    }
    fn outl(&self, port: u16, val: u32) {
        (**self).outl(port, val)
    }
}

/// Routes a device's interrupt line to the CPU.
pub trait IrqController {
    fn enable_irq(&self, line: u8);
}

pub mod mock {
    //! Byte-addressed port space with a write log.
    use alloc::collections::BTreeMap;
    use alloc::vec::Vec;
    use spin::Mutex;

    use super::{IrqController, PortIo};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum PortWrite {
        Byte(u16, u8),
        Word(u16, u16),
        Dword(u16, u32),
    }

    /// Unset ports read as all-ones, like an empty bus.
    #[derive(Default)]
    pub struct RecordingPorts {
        bytes: Mutex<BTreeMap<u16, u8>>,
        writes: Mutex<Vec<PortWrite>>,
    }

    impl RecordingPorts {
        pub fn new() -> Self {
            Self::default()
        }

        /// Preload `data` starting at `port`.
        pub fn set_bytes(&self, port: u16, data: &[u8]) {
            let mut bytes = self.bytes.lock();
            for (i, b) in data.iter().enumerate() {
                bytes.insert(port + i as u16, *b);
            }
        }

        pub fn writes(&self) -> Vec<PortWrite> {
            self.writes.lock().clone()
        }

        fn get(&self, port: u16, width: u16) -> u32 {
            let bytes = self.bytes.lock();
            (0..width).fold(0u32, |acc, i| {
                let b = bytes.get(&(port + i)).copied().unwrap_or(0xFF) as u32;
                acc | (b << (8 * i))
            })
        }

        fn put(&self, port: u16, width: u16, val: u32) {
            let mut bytes = self.bytes.lock();
            for i in 0..width {
                bytes.insert(port + i, (val >> (8 * i)) as u8);
            }
        }
    }

    impl PortIo for RecordingPorts {
        fn inb(&self, port: u16) -> u8 {
            self.get(port, 1) as u8
        }
        fn inw(&self, port: u16) -> u16 {
            self.get(port, 2) as u16
        }
        fn inl(&self, port: u16) -> u32 {
            self.get(port, 4)
        }
        fn outb(&self, port: u16, val: u8) {
            self.writes.lock().push(PortWrite::Byte(port, val));
            self.put(port, 1, val as u32);
        }
        fn outw(&self, port: u16, val: u16) {
            self.writes.lock().push(PortWrite::Word(port, val));
            self.put(port, 2, val as u32);
        }
        fn outl(&self, port: u16, val: u32) {
            self.writes.lock().push(PortWrite::Dword(port, val));
            self.put(port, 4, val);
        }
    }

    /// Remembers which lines were enabled.
    #[derive(Default)]
    pub struct RecordingIrqs {
        lines: Mutex<Vec<u8>>,
    }

    impl RecordingIrqs {
        pub fn enabled(&self) -> Vec<u8> {
            self.lines.lock().clone()
        }
    }

    impl IrqController for RecordingIrqs {
        fn enable_irq(&self, line: u8) {
            self.lines.lock().push(line);
        }
    }
}
