//! Coprocessor control register definitions.
//!
//! The status register is the only synchronous control-plane channel between
//! the CPU and the coprocessor. Reads return [`StatusReg`]; writes take a
//! [`WStatus`] mask made of independent set/clear pairs, so a single write can
//! flip several bits without a read-modify-write race.
#![no_std]
#![allow(clippy::identity_op)]

pub mod reg;
pub mod status;
pub mod wstatus;

pub use reg::Register;
pub use status::StatusReg;
pub use wstatus::WStatus;

/// Physical address of the status register.
pub const SP_STATUS: u32 = 0x0404_0010;

/// Number of general-purpose signal bits.
pub const SIGNAL_COUNT: usize = 8;

/// User signal, settable from the queue via `signal()`.
pub const SIG_USER: u8 = 0;
/// Set while the coprocessor is executing the high-priority queue.
pub const SIG_HIGHPRI_RUNNING: u8 = 2;
/// Set by the consumer when a syncpoint interrupt is pending acknowledgement.
pub const SIG_SYNCPOINT: u8 = 4;
/// Doorbell: set by the producer whenever new commands have been published.
pub const SIG_MORE: u8 = 7;
