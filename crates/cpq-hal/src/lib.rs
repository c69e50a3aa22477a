#![no_std]

extern crate alloc;

use alloc::boxed::Box;

/// Abstracts volatile access to the coprocessor control registers.
///
/// On hardware this is a pair of uncached loads/stores; in tests it is a
/// simulated register file. Every access is a full memory barrier with
/// respect to shared-memory writes issued before it.
pub trait RegisterPort {
    /// Read a 32-bit register.
    fn read(&self, addr: u32) -> u32;

    /// Write a 32-bit register.
    ///
    /// For the status register the written value is a set/clear mask, not
    /// the new register contents.
    fn write(&self, addr: u32, value: u32);

    /// Called once per iteration of every producer spin-wait loop.
    fn idle(&self) {
        core::hint::spin_loop();
    }
}

/// Handler invoked when the coprocessor raises its CPU interrupt.
///
/// The handler receives the port so it can acknowledge the interrupt.
pub type InterruptHandler = Box<dyn Fn(&dyn RegisterPort) + Send + Sync>;

/// Abstracts installation of the coprocessor interrupt handler.
pub trait InterruptController {
    /// Install `handler`, replacing any previous one. `None` uninstalls.
    fn set_handler(&self, handler: Option<InterruptHandler>);

    /// Returns true if the handler can currently be delivered.
    ///
    /// Waiting on a syncpoint with interrupts masked would never return.
    fn interrupts_enabled(&self) -> bool {
        true
    }
}

impl<T: RegisterPort + ?Sized> RegisterPort for &T {
    fn read(&self, addr: u32) -> u32 {
        (**self).read(addr)
    }

    fn write(&self, addr: u32, value: u32) {
        (**self).write(addr, value)
    }

    fn idle(&self) {
        (**self).idle()
    }
}

impl<T: RegisterPort + ?Sized> RegisterPort for alloc::sync::Arc<T> {
    fn read(&self, addr: u32) -> u32 {
        (**self).read(addr)
    }

    fn write(&self, addr: u32, value: u32) {
        (**self).write(addr, value)
    }

    fn idle(&self) {
        (**self).idle()
    }
}

impl<T: InterruptController + ?Sized> InterruptController for alloc::sync::Arc<T> {
    fn set_handler(&self, handler: Option<InterruptHandler>) {
        (**self).set_handler(handler)
    }

    fn interrupts_enabled(&self) -> bool {
        (**self).interrupts_enabled()
    }
}
