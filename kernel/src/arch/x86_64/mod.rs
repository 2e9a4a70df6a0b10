/// x86_64 architecture support.
///
/// This module provides:
/// - Port I/O (in/out instructions), wrapped by `X86Ports` for the drivers
/// - Serial console (COM1) for debug output
/// - 8259 PIC for legacy INTx lines
pub mod serial;
pub mod pic;

use crate::drivers::io::PortIo;

/// Write a byte to an I/O port.
#[inline(always)]
pub fn outb(port: u16, val: u8) {
    unsafe {
        core::arch::asm!(
            "out dx, al",
            in("dx") port,
            in("al") val,
            options(nostack, preserves_flags),
        );
    }
}

/// Read a byte from an I/O port.
#[inline(always)]
pub fn inb(port: u16) -> u8 {
    let val: u8;
    unsafe {
        core::arch::asm!(
            "in al, dx",
            in("dx") port,
            out("al") val,
            options(nostack, preserves_flags),
        );
    }
    val
}

/// Write a 16-bit value to an I/O port.
#[inline(always)]
pub fn outw(port: u16, val: u16) {
    unsafe {
        core::arch::asm!(
            "out dx, ax",
            in("dx") port,
            in("ax") val,
            options(nostack, preserves_flags),
        );
    }
}

/// Read a 16-bit value from an I/O port.
#[inline(always)]
pub fn inw(port: u16) -> u16 {
    let val: u16;
    unsafe {
        core::arch::asm!(
            "in ax, dx",
            in("dx") port,
            out("ax") val,
            options(nostack, preserves_flags),
        );
    }
    val
}

/// Write a 32-bit value to an I/O port.
#[inline(always)]
pub fn outl(port: u16, val: u32) {
    unsafe {
        core::arch::asm!(
            "out dx, eax",
            in("dx") port,
            in("eax") val,
            options(nostack, preserves_flags),
        );
    }
}

/// Read a 32-bit value from an I/O port.
#[inline(always)]
pub fn inl(port: u16) -> u32 {
    let val: u32;
    unsafe {
        core::arch::asm!(
            "in eax, dx",
            in("dx") port,
            out("eax") val,
            options(nostack, preserves_flags),
        );
    }
    val
}

/// The CPU's own I/O port space.
#[derive(Debug, Clone, Copy, Default)]
pub struct X86Ports;

impl PortIo for X86Ports {
    fn inb(&self, port: u16) -> u8 {
        inb(port)
    }
    fn inw(&self, port: u16) -> u16 {
        inw(port)
    }
    fn inl(&self, port: u16) -> u32 {
        inl(port)
    }
    fn outb(&self, port: u16, val: u8) {
        outb(port, val)
    }
    fn outw(&self, port: u16, val: u16) {
        outw(port, val)
    }
    fn outl(&self, port: u16, val: u32) {
        outl(port, val)
    }
}
