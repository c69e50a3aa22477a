//! Shared RDRAM model.
//!
//! Both processors see the same word array. Producer and consumer only ever
//! touch disjoint regions at a time, so plain relaxed accesses are used for
//! payload and acquire/release for the cursor words that hand regions over.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::dispatch::OverlayCode;

/// First allocatable byte address. Everything below is reserved for fixed
/// structures such as the boot descriptor; address 0 is never handed out.
pub const HEAP_BASE: u32 = 0x100;

/// Allocation granularity, matching the DMA engine's alignment requirement.
pub const ALLOC_ALIGN: u32 = 16;

/// Commands carry addresses in 24 bits.
pub const MAX_MEMORY_BYTES: usize = 1 << 24;

/// Code addresses live outside RDRAM; they only identify a loaded overlay.
const TEXT_BASE: u32 = 0x8000_0000;
const TEXT_STRIDE: u32 = 0x1000;

struct Heap {
    /// Free ranges as (start, len), sorted by start.
    free: Vec<(u32, u32)>,
    /// Live allocations, start -> len.
    live: BTreeMap<u32, u32>,
}

impl Heap {
    fn alloc(&mut self, len: u32) -> Option<u32> {
        let idx = self.free.iter().position(|&(_, l)| l >= len)?;
        let (start, l) = self.free[idx];
        if l == len {
            self.free.remove(idx);
        } else {
            self.free[idx] = (start + len, l - len);
        }
        self.live.insert(start, len);
        Some(start)
    }

    fn free(&mut self, addr: u32) -> u32 {
        let len = match self.live.remove(&addr) {
            Some(len) => len,
            None => panic!("free of unallocated address {addr:#x}"),
        };
        let idx = self.free.partition_point(|&(s, _)| s < addr);
        self.free.insert(idx, (addr, len));
        // Coalesce with the following range, then the preceding one.
        if idx + 1 < self.free.len() && addr + len == self.free[idx + 1].0 {
            self.free[idx].1 += self.free[idx + 1].1;
            self.free.remove(idx + 1);
        }
        if idx > 0 && self.free[idx - 1].0 + self.free[idx - 1].1 == addr {
            self.free[idx - 1].1 += self.free[idx].1;
            self.free.remove(idx);
        }
        len
    }
}

/// Word-addressed memory shared between the CPU and the coprocessor.
pub struct SharedMemory {
    words: Box<[AtomicU32]>,
    heap: Mutex<Heap>,
    text: Mutex<BTreeMap<u32, Arc<dyn OverlayCode>>>,
}

impl SharedMemory {
    /// Create a zeroed memory of `size_bytes` bytes.
    pub fn new(size_bytes: usize) -> Arc<Self> {
        assert!(
            size_bytes <= MAX_MEMORY_BYTES,
            "shared memory larger than the 24-bit address space"
        );
        assert!(size_bytes > HEAP_BASE as usize, "shared memory too small");
        let size = size_bytes as u32 & !(ALLOC_ALIGN - 1);
        let words = (0..size / 4).map(|_| AtomicU32::new(0)).collect();
        Arc::new(Self {
            words,
            heap: Mutex::new(Heap {
                free: vec![(HEAP_BASE, size - HEAP_BASE)],
                live: BTreeMap::new(),
            }),
            text: Mutex::new(BTreeMap::new()),
        })
    }

    /// Size in bytes.
    pub fn size(&self) -> u32 {
        (self.words.len() * 4) as u32
    }

    /// True if `[addr, addr + bytes)` is word aligned and inside memory.
    pub fn contains(&self, addr: u32, bytes: u32) -> bool {
        addr % 4 == 0 && (addr as u64 + bytes as u64) <= self.size() as u64
    }

    #[inline]
    fn word(&self, addr: u32) -> &AtomicU32 {
        debug_assert!(addr % 4 == 0, "unaligned access at {addr:#x}");
        &self.words[(addr / 4) as usize]
    }

    pub fn read(&self, addr: u32) -> u32 {
        self.word(addr).load(Ordering::Relaxed)
    }

    pub fn write(&self, addr: u32, value: u32) {
        self.word(addr).store(value, Ordering::Relaxed)
    }

    /// Read a word that publishes a region written before it.
    pub fn load_acquire(&self, addr: u32) -> u32 {
        self.word(addr).load(Ordering::Acquire)
    }

    /// Write a word that publishes everything written before it.
    pub fn store_release(&self, addr: u32, value: u32) {
        self.word(addr).store(value, Ordering::Release)
    }

    pub fn read_words(&self, addr: u32, out: &mut [u32]) {
        for (i, w) in out.iter_mut().enumerate() {
            *w = self.read(addr + 4 * i as u32);
        }
    }

    pub fn write_words(&self, addr: u32, data: &[u32]) {
        for (i, &w) in data.iter().enumerate() {
            self.write(addr + 4 * i as u32, w);
        }
    }

    pub fn fill(&self, addr: u32, words: u32, value: u32) {
        for i in 0..words {
            self.write(addr + 4 * i, value);
        }
    }

    /// Allocate `bytes` bytes, rounded up to [`ALLOC_ALIGN`]. Returns `None`
    /// when no free range is large enough.
    pub fn alloc(&self, bytes: u32) -> Option<u32> {
        assert!(bytes > 0, "zero-sized allocation");
        let len = bytes.div_ceil(ALLOC_ALIGN) * ALLOC_ALIGN;
        let addr = self
            .heap
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .alloc(len)?;
        self.fill(addr, len / 4, 0);
        Some(addr)
    }

    /// Release an allocation made by [`alloc`](Self::alloc).
    ///
    /// # Panics
    ///
    /// Panics if `addr` is not the start of a live allocation.
    pub fn free(&self, addr: u32) {
        let len = self
            .heap
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .free(addr);
        // Stale references fetch the INVALID opcode instead of old commands.
        if cfg!(debug_assertions) {
            self.fill(addr, len / 4, 0);
        }
    }

    /// Bytes currently allocated.
    pub fn allocated_bytes(&self) -> u32 {
        let heap = self.heap.lock().unwrap_or_else(PoisonError::into_inner);
        heap.live.values().sum()
    }

    /// Make overlay code addressable by the coprocessor and return its code
    /// address.
    pub fn load_code(&self, code: Arc<dyn OverlayCode>) -> u32 {
        let mut text = self.text.lock().unwrap_or_else(PoisonError::into_inner);
        let addr = text
            .keys()
            .next_back()
            .map_or(TEXT_BASE, |&last| last + TEXT_STRIDE);
        text.insert(addr, code);
        addr
    }

    pub fn unload_code(&self, addr: u32) {
        self.text
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&addr);
    }

    /// Look up overlay code by the address returned from
    /// [`load_code`](Self::load_code).
    pub fn code_at(&self, addr: u32) -> Option<Arc<dyn OverlayCode>> {
        self.text
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&addr)
            .cloned()
    }
}
