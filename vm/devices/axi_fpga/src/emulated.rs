// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! An in-memory implementation of the device backing traits.
//!
//! This models just enough of a platform to exercise the session protocol
//! without hardware: a process page table over emulated RAM with one
//! write-back cache line per page, an interrupt controller that tests fire by
//! hand, and an address space that records the regions mapped into it.
//!
//! Accesses to unmapped memory panic, the way a real process would fault.

use crate::DeviceBacking;
use crate::IrqRegistration;
use crate::PAGE_SIZE;
use crate::PAGE_SIZE64;
use crate::completion::CompletionSignal;
use crate::mapping::AddressSpace;
use crate::mapping::CachePolicy;
use crate::pin::DmaAddr;
use crate::pin::DmaDirection;
use crate::pin::DmaOps;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::Relaxed;

/// The bus address of the first emulated RAM frame.
pub const EMULATED_RAM_BASE: u64 = 0x8000_0000;

const USER_VA_BASE: u64 = 0x7f00_0000_0000;

/// A DMA operation observed by [`EmulatedMemory`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DmaEvent {
    Map {
        addr: DmaAddr,
        len: usize,
        direction: DmaDirection,
    },
    SyncForDevice {
        addr: DmaAddr,
        len: usize,
        direction: DmaDirection,
    },
    SyncForCpu {
        addr: DmaAddr,
        len: usize,
        direction: DmaDirection,
    },
    Unmap {
        addr: DmaAddr,
        len: usize,
        direction: DmaDirection,
    },
}

/// Emulated RAM, the page table of a single process, and the CPU cache.
///
/// The CPU accesses memory through the cache by virtual address. The device
/// accesses RAM directly by bus address and never sees the cache.
pub struct EmulatedMemory {
    state: Mutex<MemoryState>,
}

struct MemoryState {
    frames: Vec<Frame>,
    page_table: HashMap<u64, usize>,
    next_va: u64,
    log: Vec<DmaEvent>,
}

struct Frame {
    ram: Box<[u8]>,
    cache: Option<CacheLine>,
    pins: usize,
    max_pins: usize,
}

struct CacheLine {
    data: Box<[u8]>,
    dirty: bool,
}

impl Frame {
    fn new() -> Self {
        Self {
            ram: vec![0; PAGE_SIZE].into(),
            cache: None,
            pins: 0,
            max_pins: 0,
        }
    }

    fn line(&mut self) -> &mut CacheLine {
        let ram = &self.ram;
        self.cache.get_or_insert_with(|| CacheLine {
            data: ram.clone(),
            dirty: false,
        })
    }

    fn writeback(&mut self) {
        if let Some(line) = &mut self.cache {
            if line.dirty {
                self.ram.copy_from_slice(&line.data);
                line.dirty = false;
            }
        }
    }

    fn invalidate(&mut self) {
        self.cache = None;
    }
}

impl MemoryState {
    fn translate(&self, va: u64) -> Option<usize> {
        self.page_table.get(&(va / PAGE_SIZE64)).copied()
    }

    fn frame_of(&mut self, addr: DmaAddr) -> &mut Frame {
        let index = addr
            .get()
            .checked_sub(EMULATED_RAM_BASE)
            .map(|offset| (offset / PAGE_SIZE64) as usize)
            .filter(|&index| index < self.frames.len())
            .unwrap_or_else(|| panic!("device access to invalid bus address {addr}"));
        &mut self.frames[index]
    }

    /// Calls `f` for each page-bounded piece of `[va, va + len)`.
    fn for_each_page(
        &mut self,
        va: u64,
        len: usize,
        mut f: impl FnMut(&mut Frame, usize, Range),
    ) {
        let mut done = 0;
        while done < len {
            let addr = va + done as u64;
            let page_offset = (addr % PAGE_SIZE64) as usize;
            let n = (PAGE_SIZE - page_offset).min(len - done);
            let index = self
                .translate(addr)
                .unwrap_or_else(|| panic!("cpu access to unmapped address {addr:#x}"));
            f(&mut self.frames[index], page_offset, done..done + n);
            done += n;
        }
    }
}

type Range = std::ops::Range<usize>;

impl EmulatedMemory {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                frames: Vec::new(),
                page_table: HashMap::new(),
                next_va: USER_VA_BASE,
                log: Vec::new(),
            }),
        }
    }

    /// Allocates `count` zeroed pages and maps them at consecutive user
    /// addresses, returning the address of the first.
    pub fn map_user_pages(&self, count: usize) -> u64 {
        let mut state = self.state.lock();
        let va = state.next_va;
        // Leave an unmapped guard page after each allocation.
        state.next_va += (count as u64 + 1) * PAGE_SIZE64;
        for i in 0..count as u64 {
            let index = state.frames.len();
            state.frames.push(Frame::new());
            state.page_table.insert(va / PAGE_SIZE64 + i, index);
        }
        va
    }

    /// Writes `data` at `va` through the CPU cache.
    pub fn cpu_write(&self, va: u64, data: &[u8]) {
        self.state
            .lock()
            .for_each_page(va, data.len(), |frame, offset, range| {
                let line = frame.line();
                line.data[offset..offset + range.len()].copy_from_slice(&data[range]);
                line.dirty = true;
            });
    }

    /// Reads `len` bytes at `va` through the CPU cache.
    pub fn cpu_read(&self, va: u64, len: usize) -> Vec<u8> {
        let mut data = vec![0; len];
        self.state
            .lock()
            .for_each_page(va, len, |frame, offset, range| {
                let line = frame.line();
                data[range.clone()].copy_from_slice(&line.data[offset..offset + range.len()]);
            });
        data
    }

    /// Writes `data` to RAM at a bus address within one page, bypassing the
    /// CPU cache.
    pub fn device_write(&self, addr: DmaAddr, data: &[u8]) {
        let offset = (addr.get() % PAGE_SIZE64) as usize;
        let mut state = self.state.lock();
        let frame = state.frame_of(addr);
        frame.ram[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Reads `len` bytes of RAM at a bus address within one page, bypassing
    /// the CPU cache.
    pub fn device_read(&self, addr: DmaAddr, len: usize) -> Vec<u8> {
        let offset = (addr.get() % PAGE_SIZE64) as usize;
        let mut state = self.state.lock();
        let frame = state.frame_of(addr);
        frame.ram[offset..offset + len].to_vec()
    }

    /// The number of outstanding pins on the page at `va`.
    pub fn pin_count(&self, va: u64) -> usize {
        let state = self.state.lock();
        state
            .translate(va)
            .map_or(0, |index| state.frames[index].pins)
    }

    /// The most pins ever held at once on the page at `va`.
    pub fn max_pin_count(&self, va: u64) -> usize {
        let state = self.state.lock();
        state
            .translate(va)
            .map_or(0, |index| state.frames[index].max_pins)
    }

    /// The DMA operations performed so far.
    pub fn dma_log(&self) -> Vec<DmaEvent> {
        self.state.lock().log.clone()
    }

    fn pin(&self, va: u64) -> Option<usize> {
        let mut state = self.state.lock();
        let index = state.translate(va)?;
        let frame = &mut state.frames[index];
        frame.pins += 1;
        frame.max_pins = frame.max_pins.max(frame.pins);
        Some(index)
    }

    fn unpin(&self, index: usize) {
        let mut state = self.state.lock();
        let frame = &mut state.frames[index];
        assert!(frame.pins > 0, "unbalanced unpin");
        frame.pins -= 1;
    }

    fn dma_op(&self, event: DmaEvent, addr: DmaAddr, f: impl FnOnce(&mut Frame)) {
        let mut state = self.state.lock();
        f(state.frame_of(addr));
        state.log.push(event);
    }
}

/// Emulated DMA operations over [`EmulatedMemory`].
///
/// Bus addresses are emulated physical addresses. Handing a page to the
/// device writes back its cache line, and also invalidates it for a
/// from-device transfer; reclaiming a from-device page invalidates it again.
pub struct EmulatedDma {
    memory: Arc<EmulatedMemory>,
    fail_next_map: AtomicBool,
}

/// A page pinned by [`EmulatedDma`].
pub struct EmulatedPage {
    memory: Arc<EmulatedMemory>,
    frame: usize,
}

impl Drop for EmulatedPage {
    fn drop(&mut self) {
        self.memory.unpin(self.frame);
    }
}

impl EmulatedDma {
    pub fn new(memory: Arc<EmulatedMemory>) -> Self {
        Self {
            memory,
            fail_next_map: AtomicBool::new(false),
        }
    }

    pub fn memory(&self) -> &Arc<EmulatedMemory> {
        &self.memory
    }

    /// Makes the next [`DmaOps::map_page`] call fail.
    pub fn fail_next_map(&self) {
        self.fail_next_map.store(true, Relaxed);
    }
}

impl DmaOps for EmulatedDma {
    type Page = EmulatedPage;

    fn pin_user_page(&self, va: u64) -> anyhow::Result<EmulatedPage> {
        let frame = self
            .memory
            .pin(va)
            .ok_or_else(|| anyhow::anyhow!("address {va:#x} is not mapped"))?;
        Ok(EmulatedPage {
            memory: self.memory.clone(),
            frame,
        })
    }

    fn map_page(
        &self,
        page: &EmulatedPage,
        len: usize,
        dir: DmaDirection,
    ) -> anyhow::Result<DmaAddr> {
        if self.fail_next_map.swap(false, Relaxed) {
            anyhow::bail!("no dma mapping space");
        }
        let addr = DmaAddr::new(EMULATED_RAM_BASE + page.frame as u64 * PAGE_SIZE64);
        self.memory.dma_op(
            DmaEvent::Map {
                addr,
                len,
                direction: dir,
            },
            addr,
            |_| {},
        );
        Ok(addr)
    }

    fn sync_for_device(&self, addr: DmaAddr, len: usize, dir: DmaDirection) {
        self.memory.dma_op(
            DmaEvent::SyncForDevice {
                addr,
                len,
                direction: dir,
            },
            addr,
            |frame| {
                frame.writeback();
                if dir == DmaDirection::FromDevice {
                    frame.invalidate();
                }
            },
        );
    }

    fn sync_for_cpu(&self, addr: DmaAddr, len: usize, dir: DmaDirection) {
        self.memory.dma_op(
            DmaEvent::SyncForCpu {
                addr,
                len,
                direction: dir,
            },
            addr,
            |frame| {
                if dir == DmaDirection::FromDevice {
                    frame.invalidate();
                }
            },
        );
    }

    fn unmap_page(&self, addr: DmaAddr, len: usize, dir: DmaDirection) {
        self.memory.dma_op(
            DmaEvent::Unmap {
                addr,
                len,
                direction: dir,
            },
            addr,
            |frame| {
                if dir == DmaDirection::FromDevice {
                    frame.invalidate();
                }
            },
        );
    }
}

/// An emulated interrupt controller.
///
/// Cloning produces another handle to the same controller.
#[derive(Clone)]
pub struct EmulatedInterruptController {
    inner: Arc<Mutex<ControllerState>>,
}

#[derive(Default)]
struct ControllerState {
    lines: HashMap<u32, Registered>,
    unavailable: HashSet<u32>,
}

struct Registered {
    name: String,
    signal: CompletionSignal,
}

struct LineGuard {
    controller: Arc<Mutex<ControllerState>>,
    line: u32,
}

impl Drop for LineGuard {
    fn drop(&mut self) {
        self.controller.lock().lines.remove(&self.line);
    }
}

impl EmulatedInterruptController {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ControllerState::default())),
        }
    }

    /// Attaches `signal` to `line`.
    pub fn request(
        &self,
        line: u32,
        name: &str,
        signal: CompletionSignal,
    ) -> anyhow::Result<IrqRegistration> {
        let mut state = self.inner.lock();
        if state.unavailable.contains(&line) {
            anyhow::bail!("interrupt {line} is unavailable");
        }
        if let Some(owner) = state.lines.get(&line) {
            anyhow::bail!("interrupt {line} is already held by {}", owner.name);
        }
        state.lines.insert(
            line,
            Registered {
                name: name.to_owned(),
                signal,
            },
        );
        Ok(IrqRegistration::new(
            line,
            LineGuard {
                controller: self.inner.clone(),
                line,
            },
        ))
    }

    /// Raises `line`, returning whether anything was attached to it.
    pub fn fire(&self, line: u32) -> bool {
        if let Some(registered) = self.inner.lock().lines.get(&line) {
            tracing::debug!(line, name = %registered.name, "signaling interrupt");
            registered.signal.signal();
            true
        } else {
            tracing::info!(line, "interrupt ignored");
            false
        }
    }

    pub fn is_registered(&self, line: u32) -> bool {
        self.inner.lock().lines.contains_key(&line)
    }

    /// Makes requests for `line` fail, as if another driver held it.
    pub fn set_unavailable(&self, line: u32, unavailable: bool) {
        let mut state = self.inner.lock();
        if unavailable {
            state.unavailable.insert(line);
        } else {
            state.unavailable.remove(&line);
        }
    }
}

/// A device backing built from the emulated components.
pub struct EmulatedBacking {
    id: String,
    interrupts: EmulatedInterruptController,
    dma: EmulatedDma,
}

impl EmulatedBacking {
    pub fn new(id: &str, memory: Arc<EmulatedMemory>) -> Self {
        Self {
            id: id.to_owned(),
            interrupts: EmulatedInterruptController::new(),
            dma: EmulatedDma::new(memory),
        }
    }

    pub fn interrupts(&self) -> &EmulatedInterruptController {
        &self.interrupts
    }

    pub fn memory(&self) -> &Arc<EmulatedMemory> {
        self.dma.memory()
    }
}

impl DeviceBacking for EmulatedBacking {
    type Dma = EmulatedDma;

    fn id(&self) -> &str {
        &self.id
    }

    fn request_irq(
        &self,
        line: u32,
        name: &str,
        signal: CompletionSignal,
    ) -> anyhow::Result<IrqRegistration> {
        self.interrupts.request(line, name, signal)
    }

    fn dma(&self) -> &EmulatedDma {
        &self.dma
    }
}

/// A region mapped into an [`EmulatedWindow`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Remap {
    pub offset: usize,
    pub pfn: u64,
    pub len: usize,
    pub cache: CachePolicy,
}

/// An address space that records mappings instead of making them.
pub struct EmulatedAddressSpace {
    state: Mutex<SpaceState>,
}

#[derive(Default)]
struct SpaceState {
    reservations: usize,
    remaps: usize,
    fail_remap_at: Option<usize>,
}

/// A window reserved in an [`EmulatedAddressSpace`].
#[derive(Debug)]
pub struct EmulatedWindow {
    len: usize,
    remaps: Vec<Remap>,
}

impl EmulatedWindow {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn remaps(&self) -> &[Remap] {
        &self.remaps
    }

    /// Returns the physical address and caching that `offset` maps to.
    pub fn resolve(&self, offset: usize) -> Option<(u64, CachePolicy)> {
        self.remaps
            .iter()
            .find(|r| (r.offset..r.offset + r.len).contains(&offset))
            .map(|r| {
                (
                    (r.pfn << crate::PAGE_SHIFT) + (offset - r.offset) as u64,
                    r.cache,
                )
            })
    }
}

impl EmulatedAddressSpace {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SpaceState::default()),
        }
    }

    /// The number of windows reserved so far.
    pub fn reservations(&self) -> usize {
        self.state.lock().reservations
    }

    /// Makes the `n`th remap call from now on fail.
    pub fn fail_remap_at(&self, n: usize) {
        let mut state = self.state.lock();
        state.fail_remap_at = Some(state.remaps + n);
    }
}

impl AddressSpace for EmulatedAddressSpace {
    type Window = EmulatedWindow;

    fn reserve(&self, len: usize) -> std::io::Result<EmulatedWindow> {
        self.state.lock().reservations += 1;
        Ok(EmulatedWindow {
            len,
            remaps: Vec::new(),
        })
    }

    fn remap_pfn_range(
        &self,
        window: &mut EmulatedWindow,
        offset: usize,
        pfn: u64,
        len: usize,
        cache: CachePolicy,
    ) -> std::io::Result<()> {
        let mut state = self.state.lock();
        let n = state.remaps;
        state.remaps += 1;
        if state.fail_remap_at == Some(n) {
            return Err(std::io::Error::from(std::io::ErrorKind::OutOfMemory));
        }
        if offset % PAGE_SIZE != 0 || len % PAGE_SIZE != 0 || offset + len > window.len {
            return Err(std::io::Error::from(std::io::ErrorKind::InvalidInput));
        }
        window.remaps.push(Remap {
            offset,
            pfn,
            len,
            cache,
        });
        Ok(())
    }
}
