//! Simulated status register.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};

use cpq_hal::{InterruptController, InterruptHandler, RegisterPort};
use cpq_registers::{StatusReg, WStatus, SIG_MORE, SP_STATUS};
use log::trace;

type IdleHook = Box<dyn FnMut() + Send>;

/// Status register shared by the producer and the simulated coprocessor.
///
/// Writes apply set/clear pairs atomically. Writing `SET_INTR` delivers the
/// installed interrupt handler synchronously on the writing thread.
pub struct SimRegisters {
    status: AtomicU32,
    handler: RwLock<Option<InterruptHandler>>,
    idle_hook: Mutex<Option<IdleHook>>,
    doorbells: AtomicU32,
}

impl Default for SimRegisters {
    fn default() -> Self {
        Self::new()
    }
}

impl SimRegisters {
    /// Reset state: halted, no signals.
    pub fn new() -> Self {
        Self {
            status: AtomicU32::new(StatusReg::HALTED),
            handler: RwLock::new(None),
            idle_hook: Mutex::new(None),
            doorbells: AtomicU32::new(0),
        }
    }

    pub fn status(&self) -> StatusReg {
        StatusReg::new(self.status.load(Ordering::Acquire))
    }

    /// Latch status bits that have no write-side setter (BROKE).
    pub fn raise(&self, bits: u32) {
        self.status.fetch_or(bits, Ordering::AcqRel);
    }

    /// Halt unless a doorbell is pending.
    ///
    /// If SIG_MORE is set it is cleared and the consumer must re-check the
    /// rings; otherwise HALTED is set. Both happen in one atomic update so a
    /// doorbell can never land between the check and the halt.
    pub fn try_halt(&self) -> bool {
        let more = StatusReg::sig(SIG_MORE);
        let mut cur = self.status.load(Ordering::Acquire);
        loop {
            let (next, halted) = if cur & more != 0 {
                (cur & !more, false)
            } else {
                (cur | StatusReg::HALTED, true)
            };
            match self
                .status
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return halted,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Install a hook run by [`RegisterPort::idle`], letting single-threaded
    /// callers drive the consumer while the producer spins.
    pub fn set_idle_hook(&self, hook: Option<IdleHook>) {
        *self.idle_hook.lock().unwrap_or_else(PoisonError::into_inner) = hook;
    }

    /// Number of status writes that set SIG_MORE.
    pub fn doorbell_count(&self) -> u32 {
        self.doorbells.load(Ordering::Relaxed)
    }
}

impl RegisterPort for SimRegisters {
    fn read(&self, addr: u32) -> u32 {
        debug_assert_eq!(addr, SP_STATUS, "unmapped register read");
        self.status.load(Ordering::Acquire)
    }

    fn write(&self, addr: u32, value: u32) {
        debug_assert_eq!(addr, SP_STATUS, "unmapped register write");
        let w = WStatus::new(value);
        debug_assert!(w.is_valid(), "conflicting status write {value:#x}");
        let mut cur = self.status.load(Ordering::Acquire);
        loop {
            match self.status.compare_exchange_weak(
                cur,
                w.apply(cur),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
        trace!("status write {value:#x}: {:?}", self.status());
        if value & WStatus::set_sig(SIG_MORE) != 0 {
            self.doorbells.fetch_add(1, Ordering::Relaxed);
        }
        if value & WStatus::SET_INTR != 0 {
            let handler = self.handler.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(handler) = handler.as_ref() {
                handler(self);
            }
        }
    }

    fn idle(&self) {
        // A hook that re-enters idle() just spins.
        match self.idle_hook.try_lock() {
            Ok(mut hook) => match hook.as_mut() {
                Some(hook) => hook(),
                None => std::thread::yield_now(),
            },
            Err(_) => core::hint::spin_loop(),
        }
    }
}

impl InterruptController for SimRegisters {
    fn set_handler(&self, handler: Option<InterruptHandler>) {
        *self.handler.write().unwrap_or_else(PoisonError::into_inner) = handler;
    }
}
