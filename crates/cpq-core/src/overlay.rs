//! Overlay images and the producer-side overlay registry.
//!
//! An overlay is a coprocessor code module bound to one or more consecutive
//! overlay ids. Its image header lists the word count of every command so the
//! consumer can fetch a command without look-ahead, and declares the size of a
//! persistent state window that the consumer swaps in and out of DMEM.

use std::sync::Arc;

use log::info;
use thiserror::Error;

use crate::command::{OverlayId, COMMANDS_PER_ID, MAX_COMMAND_SIZE, OVERLAY_ID_COUNT};
use crate::config::MAX_OVERLAY_STATE;
use crate::dispatch::OverlayCode;
use crate::memory::SharedMemory;

/// First word of every overlay header.
pub const OVERLAY_MAGIC: u32 = 0x4F56_4C31;

/// Words per overlay table entry: code address, header address, state
/// address, `state_size << 8 | base id`.
pub const TABLE_ENTRY_WORDS: u32 = 4;

/// Size of the overlay table in bytes.
pub const TABLE_BYTES: u32 = OVERLAY_ID_COUNT as u32 * TABLE_ENTRY_WORDS * 4;

/// Errors from parsing or validating an overlay image header.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OverlayError {
    #[error("bad overlay magic {0:#010x}")]
    BadMagic(u32),

    #[error("overlay header truncated: expected {expected} words, found {found}")]
    Truncated { expected: usize, found: usize },

    #[error("overlay declares no commands")]
    NoCommands,

    #[error("overlay declares {0} commands, more than all overlay ids can hold")]
    TooManyCommands(usize),

    #[error("command {command} has size {size}, must be 1..=16 words")]
    CommandSize { command: usize, size: usize },

    #[error("overlay state of {0} bytes does not fit in DMEM")]
    StateTooLarge(u32),

    #[error("overlay state size {0} is not a multiple of 4")]
    StateMisaligned(u32),
}

/// Fixed-layout header of an overlay image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayHeader {
    /// Persistent state window size in bytes.
    pub state_size: u32,
    /// Word count of each command, indexed by command number.
    pub command_sizes: Vec<u8>,
}

impl OverlayHeader {
    pub fn new(state_size: u32, command_sizes: &[u8]) -> Result<Self, OverlayError> {
        let header = Self {
            state_size,
            command_sizes: command_sizes.to_vec(),
        };
        header.validate()?;
        Ok(header)
    }

    pub fn validate(&self) -> Result<(), OverlayError> {
        let count = self.command_sizes.len();
        if count == 0 {
            return Err(OverlayError::NoCommands);
        }
        if count > (OVERLAY_ID_COUNT - 1) * COMMANDS_PER_ID {
            return Err(OverlayError::TooManyCommands(count));
        }
        if let Some((command, &size)) = self
            .command_sizes
            .iter()
            .enumerate()
            .find(|(_, &s)| s == 0 || s as usize > MAX_COMMAND_SIZE)
        {
            return Err(OverlayError::CommandSize {
                command,
                size: size as usize,
            });
        }
        if self.state_size > MAX_OVERLAY_STATE {
            return Err(OverlayError::StateTooLarge(self.state_size));
        }
        if self.state_size % 4 != 0 {
            return Err(OverlayError::StateMisaligned(self.state_size));
        }
        Ok(())
    }

    /// Parse a header from its word encoding.
    pub fn parse(words: &[u32]) -> Result<Self, OverlayError> {
        if words.len() < 2 {
            return Err(OverlayError::Truncated {
                expected: 2,
                found: words.len(),
            });
        }
        if words[0] != OVERLAY_MAGIC {
            return Err(OverlayError::BadMagic(words[0]));
        }
        let state_size = words[1] >> 16;
        let count = (words[1] & 0xFFFF) as usize;
        if words.len() < 2 + count {
            return Err(OverlayError::Truncated {
                expected: 2 + count,
                found: words.len(),
            });
        }
        let command_sizes = words[2..2 + count].iter().map(|w| *w as u8).collect();
        let header = Self {
            state_size,
            command_sizes,
        };
        header.validate()?;
        Ok(header)
    }

    /// Encode as words: magic, `state_size << 16 | count`, one descriptor per
    /// command with the size in the low byte.
    pub fn to_words(&self) -> Vec<u32> {
        let mut words = Vec::with_capacity(2 + self.command_sizes.len());
        words.push(OVERLAY_MAGIC);
        words.push((self.state_size << 16) | self.command_sizes.len() as u32);
        words.extend(self.command_sizes.iter().map(|&s| s as u32));
        words
    }

    /// Number of consecutive overlay ids needed for all commands.
    pub fn id_count(&self) -> usize {
        self.command_sizes.len().div_ceil(COMMANDS_PER_ID)
    }
}

/// A loadable overlay: header plus code.
#[derive(Clone)]
pub struct OverlayImage {
    name: String,
    header: OverlayHeader,
    code: Arc<dyn OverlayCode>,
}

impl OverlayImage {
    pub fn new(
        name: impl Into<String>,
        header: OverlayHeader,
        code: Arc<dyn OverlayCode>,
    ) -> Result<Self, OverlayError> {
        header.validate()?;
        Ok(Self {
            name: name.into(),
            header,
            code,
        })
    }

    /// Build an image from a raw header encoding.
    pub fn from_words(
        name: impl Into<String>,
        header: &[u32],
        code: Arc<dyn OverlayCode>,
    ) -> Result<Self, OverlayError> {
        Self::new(name, OverlayHeader::parse(header)?, code)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn header(&self) -> &OverlayHeader {
        &self.header
    }
}

impl core::fmt::Debug for OverlayImage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("OverlayImage")
            .field("name", &self.name)
            .field("header", &self.header)
            .finish_non_exhaustive()
    }
}

/// Host-side view of an overlay's persistent state in RDRAM.
///
/// The consumer copies the window into DMEM when the overlay is switched in,
/// and back out when another overlay replaces it or a syncpoint is reached.
/// Writes here only reach the overlay if it is not currently resident.
#[derive(Clone)]
pub struct StateWindow {
    mem: Arc<SharedMemory>,
    addr: u32,
    size: u32,
}

impl StateWindow {
    pub fn addr(&self) -> u32 {
        self.addr
    }

    /// Size in bytes.
    pub fn len(&self) -> u32 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Read the word at byte `offset`.
    pub fn read(&self, offset: u32) -> u32 {
        assert!(offset + 4 <= self.size, "state offset {offset} out of range");
        self.mem.read(self.addr + offset)
    }

    /// Write the word at byte `offset`.
    pub fn write(&self, offset: u32, value: u32) {
        assert!(offset + 4 <= self.size, "state offset {offset} out of range");
        self.mem.write(self.addr + offset, value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Registered {
    pub name: String,
    pub base: OverlayId,
    pub id_count: u8,
    pub code_addr: u32,
    pub header_addr: u32,
    pub state_addr: u32,
    pub state_size: u32,
    pub command_sizes: Vec<u8>,
}

impl Registered {
    fn covers(&self, id: u8) -> bool {
        (self.base.get()..self.base.get() + self.id_count).contains(&id)
    }

    /// Drop the code and free the header and state memory.
    pub(crate) fn release(&self, mem: &SharedMemory) {
        mem.unload_code(self.code_addr);
        mem.free(self.header_addr);
    }
}

/// Producer-side record of which ids are bound, mirrored into the RDRAM
/// overlay table the consumer reads.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct OverlayRegistry {
    table_addr: u32,
    overlays: Vec<Registered>,
}

impl OverlayRegistry {
    pub(crate) fn allocate(mem: &SharedMemory) -> Self {
        let table_addr = match mem.alloc(TABLE_BYTES) {
            Some(addr) => addr,
            None => panic!("out of shared memory for the overlay table"),
        };
        Self {
            table_addr,
            overlays: Vec::new(),
        }
    }

    pub(crate) fn release(&mut self, mem: &SharedMemory) {
        for ovl in self.overlays.drain(..) {
            ovl.release(mem);
        }
        if self.table_addr != 0 {
            mem.free(self.table_addr);
        }
        self.table_addr = 0;
    }

    pub fn table_addr(&self) -> u32 {
        self.table_addr
    }

    pub(crate) fn find(&self, id: u8) -> Option<&Registered> {
        self.overlays.iter().find(|o| o.covers(id))
    }

    pub fn is_registered(&self, id: OverlayId) -> bool {
        self.find(id.get()).is_some()
    }

    /// Ids bound to an overlay, as (id, overlay name) in id order.
    pub fn bindings(&self) -> Vec<(OverlayId, String)> {
        let mut out: Vec<_> = self
            .overlays
            .iter()
            .flat_map(|o| {
                (0..o.id_count).map(move |i| (OverlayId::new(o.base.get() + i), o.name.clone()))
            })
            .collect();
        out.sort();
        out
    }

    /// Declared word count of `cmd` on overlay id `id`.
    pub(crate) fn command_size(&self, id: u8, cmd: u8) -> Option<usize> {
        let ovl = self.find(id)?;
        let index = (id - ovl.base.get()) as usize * COMMANDS_PER_ID + cmd as usize;
        ovl.command_sizes.get(index).map(|&s| s as usize)
    }

    /// First run of `count` free consecutive ids, skipping the reserved id 0.
    pub(crate) fn free_run(&self, count: usize) -> Option<OverlayId> {
        (1..=OVERLAY_ID_COUNT - count)
            .find(|&start| (start..start + count).all(|id| self.find(id as u8).is_none()))
            .map(|start| OverlayId::new(start as u8))
    }

    /// Copy the image into RDRAM and bind it to the ids starting at `base`.
    pub(crate) fn load(&mut self, mem: &SharedMemory, image: OverlayImage, base: OverlayId) {
        let id_count = image.header.id_count();
        assert!(base != OverlayId::INTERNAL, "overlay id 0 is reserved");
        assert!(
            base.get() as usize + id_count <= OVERLAY_ID_COUNT,
            "overlay {} needs {id_count} ids starting at {base}",
            image.name
        );
        for id in base.get()..base.get() + id_count as u8 {
            assert!(
                self.find(id).is_none(),
                "overlay id {id:#x} already in use"
            );
        }
        assert!(
            self.overlays.iter().all(|o| o.name != image.name),
            "overlay {} registered twice",
            image.name
        );

        let header = image.header.to_words();
        let header_bytes = (header.len() as u32 * 4).next_multiple_of(16);
        let header_addr = match mem.alloc(header_bytes + image.header.state_size.max(4)) {
            Some(addr) => addr,
            None => panic!("out of shared memory for overlay {}", image.name),
        };
        mem.write_words(header_addr, &header);
        let state_addr = header_addr + header_bytes;
        let code_addr = mem.load_code(image.code.clone());

        let ovl = Registered {
            name: image.name,
            base,
            id_count: id_count as u8,
            code_addr,
            header_addr,
            state_addr,
            state_size: image.header.state_size,
            command_sizes: image.header.command_sizes,
        };
        for i in 0..ovl.id_count {
            let entry = self.table_addr + (base.get() + i) as u32 * TABLE_ENTRY_WORDS * 4;
            mem.write_words(
                entry,
                &[
                    ovl.code_addr,
                    ovl.header_addr,
                    ovl.state_addr,
                    (ovl.state_size << 8) | base.get() as u32,
                ],
            );
        }
        info!(
            "overlay {} registered at id {base} ({} ids, {} commands, {} state bytes)",
            ovl.name,
            ovl.id_count,
            ovl.command_sizes.len(),
            ovl.state_size
        );
        self.overlays.push(ovl);
    }

    /// Unbind the overlay whose id range starts at `base` and clear its table
    /// entries. Its memory stays allocated: commands already queued for it
    /// still need the code and state, so the caller releases it once the
    /// consumer is past the table update.
    pub(crate) fn remove(&mut self, mem: &SharedMemory, base: OverlayId) -> Registered {
        let idx = self.overlays.iter().position(|o| o.base == base);
        let Some(idx) = idx else {
            panic!("overlay id {base} is not the base of a registered overlay");
        };
        let ovl = self.overlays.remove(idx);
        for i in 0..ovl.id_count {
            let entry = self.table_addr + (base.get() + i) as u32 * TABLE_ENTRY_WORDS * 4;
            mem.fill(entry, TABLE_ENTRY_WORDS, 0);
        }
        info!("overlay {} unregistered from id {base}", ovl.name);
        ovl
    }

    pub(crate) fn state_window(&self, mem: &Arc<SharedMemory>, id: OverlayId) -> StateWindow {
        let Some(ovl) = self.find(id.get()) else {
            panic!("overlay id {id} is not registered");
        };
        StateWindow {
            mem: mem.clone(),
            addr: ovl.state_addr,
            size: ovl.state_size,
        }
    }
}
