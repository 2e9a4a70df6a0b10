/// 8259 PIC (Programmable Interrupt Controller): remap, mask, unmask.
///
/// The legacy PIC maps IRQ 0-7 to interrupts 8-15, which collides with
/// CPU exceptions. IRQs are remapped to 32-47 and start out masked; a
/// driver that wants its INTx line delivered unmasks it through
/// `IrqController::enable_irq`.
use crate::drivers::io::{IrqController, PortIo};
use crate::serial_println;

const PIC1_CMD: u16 = 0x20;
const PIC1_DATA: u16 = 0x21;
const PIC2_CMD: u16 = 0xA0;
const PIC2_DATA: u16 = 0xA1;

const ICW1_INIT: u8 = 0x11; // initialization + ICW4 needed
const ICW4_8086: u8 = 0x01;

const EOI: u8 = 0x20;

/// Vector of IRQ 0 after remapping.
pub const IRQ_BASE: u8 = 32;

/// Slave PIC is wired to master line 2.
const CASCADE_LINE: u8 = 2;

pub struct Pic<P: PortIo> {
    ports: P,
}

impl<P: PortIo> Pic<P> {
    pub const fn new(ports: P) -> Self {
        Self { ports }
    }

    /// Remap both controllers to `IRQ_BASE` and mask every line.
    pub fn init(&self) {
        let p = &self.ports;

        p.outb(PIC1_CMD, ICW1_INIT);
        self.io_wait();
        p.outb(PIC2_CMD, ICW1_INIT);
        self.io_wait();

        p.outb(PIC1_DATA, IRQ_BASE); // IRQ 0-7  -> INT 32-39
        self.io_wait();
        p.outb(PIC2_DATA, IRQ_BASE + 8); // IRQ 8-15 -> INT 40-47
        self.io_wait();

        p.outb(PIC1_DATA, 1 << CASCADE_LINE);
        self.io_wait();
        p.outb(PIC2_DATA, CASCADE_LINE);
        self.io_wait();

        p.outb(PIC1_DATA, ICW4_8086);
        self.io_wait();
        p.outb(PIC2_DATA, ICW4_8086);
        self.io_wait();

        p.outb(PIC1_DATA, 0xFF);
        p.outb(PIC2_DATA, 0xFF);
    }

    /// Acknowledge `line` so the controller delivers the next one.
    pub fn send_eoi(&self, line: u8) {
        if line >= 8 {
            self.ports.outb(PIC2_CMD, EOI);
        }
        self.ports.outb(PIC1_CMD, EOI);
    }

    fn unmask(&self, data_port: u16, bit: u8) {
        let mask = self.ports.inb(data_port);
        self.ports.outb(data_port, mask & !(1 << bit));
    }

    fn io_wait(&self) {
        // Port 0x80 (POST code) as a short delay
        self.ports.outb(0x80, 0);
    }
}

impl<P: PortIo> IrqController for Pic<P> {
    fn enable_irq(&self, line: u8) {
        match line {
            0..=7 => self.unmask(PIC1_DATA, line),
            8..=15 => {
                self.unmask(PIC2_DATA, line - 8);
                self.unmask(PIC1_DATA, CASCADE_LINE);
            }
            _ => serial_println!("[pic] ignoring irq {} (no such line)", line),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::io::mock::RecordingPorts;

    #[test]
    fn init_masks_every_line() {
        let pic = Pic::new(RecordingPorts::new());
        pic.init();
        assert_eq!(pic.ports.inb(PIC1_DATA), 0xFF);
        assert_eq!(pic.ports.inb(PIC2_DATA), 0xFF);
    }

    #[test]
    fn slave_line_also_unmasks_cascade() {
        let pic = Pic::new(RecordingPorts::new());
        pic.init();
        pic.enable_irq(11);
        assert_eq!(pic.ports.inb(PIC2_DATA), 0xFF & !(1 << 3));
        assert_eq!(pic.ports.inb(PIC1_DATA), 0xFF & !(1 << 2));
    }

    #[test]
    fn master_line_leaves_slave_masked() {
        let pic = Pic::new(RecordingPorts::new());
        pic.init();
        pic.enable_irq(5);
        assert_eq!(pic.ports.inb(PIC1_DATA), 0xFF & !(1 << 5));
        assert_eq!(pic.ports.inb(PIC2_DATA), 0xFF);
    }
}
