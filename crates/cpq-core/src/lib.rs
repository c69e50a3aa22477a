//! Command-submission layer for a CPU driving a vector coprocessor.
//!
//! The producer side ([`Queue`]) writes variable-length commands into a ring
//! buffer in [`SharedMemory`]; the consumer side ([`dispatch::Coprocessor`])
//! fetches and dispatches them to overlays. Blocks, syncpoints and the
//! high-priority queue are layered on the same command stream, and the
//! [`rdp`] module adds the rasterizer hazard tracker on top of the writer.

pub mod block;
pub mod command;
pub mod config;
pub mod dispatch;
pub mod highpri;
pub mod memory;
pub mod overlay;
pub mod queue;
pub mod rdp;
pub mod ring;
pub mod syncpoint;
pub mod writer;

pub use block::Block;
pub use command::OverlayId;
pub use config::QueueConfig;
pub use memory::SharedMemory;
pub use overlay::{OverlayError, OverlayHeader, OverlayImage, StateWindow};
pub use queue::{Queue, QueueMode};
pub use syncpoint::Syncpoint;
pub use writer::CommandWriter;
