//! # Conservative Mark-and-Sweep Collection
//!
//! A collector for individually heap-allocated blocks that discovers
//! reachability by conservatively scanning the active call-stack range for
//! bit patterns equal to tracked block addresses.
//!
//! ## Design
//!
//! - **Table**: every allocation is an [`ObjectRecord`] keyed by its block
//!   address in a hash map
//! - **Mark**: the stack bracket between the saved base and the current stack
//!   pointer is scanned word by word; a hit marks the record and recursively
//!   scans its payload. Records already marked are never re-visited within a
//!   cycle, which is the sole guard against nontermination on cyclic graphs
//! - **Sweep**: unmarked records are removed (destructor, then storage);
//!   referenced records are reset for the next cycle; keep-alive records are
//!   left untouched
//!
//! ## Hazard
//!
//! The scan trusts whatever words lie in the bracket. Unrelated bit patterns
//! retain garbage (benign); pointers promoted to registers or spilled outside
//! the bracket by release-mode optimization are missed (hazardous). Keep
//! collector-managed pointers in addressable locals, and pin long-lived roots
//! with [`GarbageCollector::mark_keep_alive`].

use std::fmt;
use std::fmt::Write as _;
use std::mem;
use std::ptr::NonNull;

use rustc_hash::FxHashMap;

use crate::alloc::{self, effective_alignment, sys_alloc_aligned, sys_free_aligned};

/// A machine word wide enough to hold any pointer.
pub type Word = usize;

/// Width of a scan word in bytes.
const WORD_BYTES: usize = mem::size_of::<Word>();

/// Payloads smaller than this are never scanned for interior pointers.
const PAYLOAD_SCAN_THRESHOLD: usize = 8;

/// Destructor callback invoked with the block base and its size in bytes.
///
/// Callbacks must not unwind and must not call back into the collector.
pub type DropFn = unsafe fn(*mut u8, usize);

/// Capture a word-aligned address on the current stack frame, suitable as a
/// [`GarbageCollector`] stack base.
///
/// Capture in a frame that encloses all code storing collector-managed
/// pointers; deeper frames then fall inside the scan bracket.
#[macro_export]
macro_rules! stack_base {
    () => {{
        let base: $crate::gc::Word = 0;
        ::std::hint::black_box(&base as *const $crate::gc::Word)
    }};
}

/// Reachability state of a tracked block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcMark {
    /// Pinned: survives every cycle until unmarked.
    KeepAlive,
    /// Found during the current cycle's scan (or marked explicitly); reset
    /// after the sweep.
    Referenced,
    /// Not (yet) found; swept at the end of a cycle.
    Default,
}

impl GcMark {
    /// The mark name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            GcMark::KeepAlive => "KEEP_ALIVE",
            GcMark::Referenced => "REFERENCED",
            GcMark::Default => "DEFAULT",
        }
    }
}

impl fmt::Display for GcMark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Object Records
// ============================================================================

/// Descriptor of one tracked heap block.
///
/// Move-only: dropping the record runs the registered destructor exactly
/// once and then releases the block.
struct ObjectRecord {
    /// Block base; aligned to `max(DEFAULT_ALIGNMENT, requested)`.
    data: NonNull<u8>,
    /// Block size in bytes.
    size: usize,
    /// Effective block alignment.
    align: usize,
    /// Optional destructor callback.
    dtor: Option<DropFn>,
    /// Current reachability state.
    mark: GcMark,
}

impl ObjectRecord {
    /// Acquire a block of `size` bytes; `None` on failure or zero size.
    fn new(size: usize, align: usize, dtor: Option<DropFn>) -> Option<Self> {
        let align = effective_alignment(align);
        let data = sys_alloc_aligned(size, align)?;
        Some(Self {
            data,
            size,
            align,
            dtor,
            mark: GcMark::Default,
        })
    }
}

impl Drop for ObjectRecord {
    fn drop(&mut self) {
        if let Some(dtor) = self.dtor.take() {
            // SAFETY: `data` is the live block this record owns; the callback
            // contract is to only destroy the block contents, without
            // unwinding or re-entering the collector.
            unsafe { dtor(self.data.as_ptr(), self.size) };
        }
        // SAFETY: acquired from `sys_alloc_aligned` with this size/alignment.
        unsafe { sys_free_aligned(self.data.as_ptr(), self.size, self.align) };
    }
}

/// Synthesized destructor for a single `T`.
unsafe fn drop_object<T>(data: *mut u8, _nbytes: usize) {
    // SAFETY: the block holds one initialized `T` at its base.
    unsafe { data.cast::<T>().drop_in_place() };
}

/// Synthesized destructor for a `T` array filling the block.
unsafe fn drop_array<T>(data: *mut u8, nbytes: usize) {
    if mem::size_of::<T>() == 0 {
        return;
    }
    let len = nbytes / mem::size_of::<T>();
    // SAFETY: the block holds `len` initialized `T`s from its base.
    unsafe { std::ptr::slice_from_raw_parts_mut(data.cast::<T>(), len).drop_in_place() };
}

/// Address of a fresh local in a non-inlined frame: a conservative bound for
/// the caller's live stack.
#[inline(never)]
fn approximate_stack_pointer() -> usize {
    let marker: Word = 0;
    std::hint::black_box(&marker as *const Word) as usize
}

// ============================================================================
// Collector
// ============================================================================

/// A conservative mark-and-sweep collector over individually allocated
/// blocks.
///
/// Construction captures a stack base address; [`GarbageCollector::collect`]
/// brackets the scan between that base and the current stack pointer. The
/// collector is bound to its constructing thread and is neither `Send` nor
/// `Sync`.
pub struct GarbageCollector {
    /// Tracked blocks keyed by their base address.
    objects: FxHashMap<Word, ObjectRecord>,
    /// Word-aligned stack address captured at construction.
    stack_base: usize,
}

impl GarbageCollector {
    /// Create a collector rooted at `stack_base`, an address on the current
    /// thread's call stack (see [`stack_base!`]).
    pub fn new(stack_base: *const Word) -> Self {
        Self {
            objects: FxHashMap::default(),
            stack_base: stack_base as usize,
        }
    }

    /// Allocate a tracked block of `size` bytes aligned to
    /// `max(DEFAULT_ALIGNMENT, align)`, with an optional destructor.
    ///
    /// Returns raw uninitialized storage. Zero-size requests return null and
    /// track nothing. Aborts through [`std::alloc::handle_alloc_error`] when
    /// memory cannot be acquired.
    pub fn allocate(&mut self, size: usize, align: usize, dtor: Option<DropFn>) -> *mut u8 {
        if size == 0 {
            return std::ptr::null_mut();
        }
        match self.try_allocate(size, align, dtor) {
            Some(ptr) => ptr.as_ptr(),
            None => alloc::oom(size, align),
        }
    }

    /// Allocate a tracked block; `None` on failure or zero size, with the
    /// collector unchanged.
    pub fn try_allocate(
        &mut self,
        size: usize,
        align: usize,
        dtor: Option<DropFn>,
    ) -> Option<NonNull<u8>> {
        let record = ObjectRecord::new(size, align, dtor)?;
        let data = record.data;
        self.objects.insert(data.as_ptr() as Word, record);
        Some(data)
    }

    /// Allocate a zero-filled tracked block of `count * size` bytes with no
    /// destructor.
    pub fn allocate_zeroed(&mut self, count: usize, size: usize, align: usize) -> *mut u8 {
        let Some(nbytes) = count.checked_mul(size) else {
            alloc::oom(usize::MAX, align);
        };
        let data = self.allocate(nbytes, align, None);
        if !data.is_null() {
            // SAFETY: `data` is a fresh block of `nbytes` bytes.
            unsafe { std::ptr::write_bytes(data, 0, nbytes) };
        }
        data
    }

    /// Allocate a tracked `T` and move `value` into it.
    ///
    /// A drop-in-place destructor is synthesized when `T` needs one. Returns
    /// null for zero-sized types.
    pub fn new_object<T>(&mut self, value: T) -> *mut T {
        let dtor: Option<DropFn> = if mem::needs_drop::<T>() {
            Some(drop_object::<T>)
        } else {
            None
        };
        let data = self
            .allocate(mem::size_of::<T>(), mem::align_of::<T>(), dtor)
            .cast::<T>();
        if data.is_null() {
            return data;
        }
        // SAFETY: `data` is a fresh, properly aligned block for one `T`.
        unsafe { data.write(value) };
        data
    }

    /// Allocate a tracked array of `len` default-initialized `T`s.
    ///
    /// An element-wise destructor is synthesized when `T` needs one. Returns
    /// null for empty arrays and zero-sized types.
    pub fn new_array<T: Default>(&mut self, len: usize) -> *mut T {
        let dtor: Option<DropFn> = if mem::needs_drop::<T>() {
            Some(drop_array::<T>)
        } else {
            None
        };
        let Some(nbytes) = mem::size_of::<T>().checked_mul(len) else {
            alloc::oom(usize::MAX, mem::align_of::<T>());
        };
        let data = self.allocate(nbytes, mem::align_of::<T>(), dtor).cast::<T>();
        if data.is_null() {
            return data;
        }
        for index in 0..len {
            // SAFETY: `data` holds room for `len` elements.
            unsafe { data.add(index).write(T::default()) };
        }
        data
    }

    /// Remove the block at `ptr`: its destructor runs and its storage is
    /// released. Unknown pointers are a silent no-op.
    pub fn free(&mut self, ptr: *mut u8) {
        self.objects.remove(&(ptr as Word));
    }

    /// Remove every tracked block, destructing each.
    pub fn free_all(&mut self) {
        self.objects.clear();
    }

    /// Explicitly mark the block at `ptr` as referenced for the next cycle.
    /// Unknown pointers are a no-op.
    pub fn mark_reachable(&mut self, ptr: *const u8) {
        self.set_mark(ptr, GcMark::Referenced);
    }

    /// Reset the block at `ptr` to the default (sweepable) mark. Unknown
    /// pointers are a no-op.
    pub fn mark_unreachable(&mut self, ptr: *const u8) {
        self.set_mark(ptr, GcMark::Default);
    }

    /// Pin the block at `ptr` so every cycle retains it. The supported
    /// workaround for roots the conservative scan cannot see. Unknown
    /// pointers are a no-op.
    pub fn mark_keep_alive(&mut self, ptr: *const u8) {
        self.set_mark(ptr, GcMark::KeepAlive);
    }

    /// Unpin the block at `ptr`, restoring the default mark. Unknown
    /// pointers are a no-op.
    pub fn unmark_keep_alive(&mut self, ptr: *const u8) {
        self.set_mark(ptr, GcMark::Default);
    }

    fn set_mark(&mut self, ptr: *const u8, mark: GcMark) {
        if let Some(record) = self.objects.get_mut(&(ptr as Word)) {
            record.mark = mark;
        }
    }

    /// Run one mark-and-sweep cycle.
    ///
    /// Every word between the saved stack base and the current stack pointer
    /// is treated as a potential block address; hits and their payloads mark
    /// recursively. Unmarked blocks are then removed (destructors run in an
    /// unspecified order), referenced blocks are reset for the next cycle,
    /// and keep-alive blocks are left untouched.
    ///
    /// # Safety
    ///
    /// Must be called on the thread that constructed the collector, with the
    /// captured stack base still bracketing the live stack (the frame it was
    /// captured in, or a caller of it, is still on the stack).
    pub unsafe fn collect(&mut self) {
        let sp = approximate_stack_pointer();
        // The bracket is order-normalized; stacks usually grow downwards.
        let (lo, hi) = if sp < self.stack_base {
            (sp, self.stack_base)
        } else {
            (self.stack_base, sp)
        };
        // SAFETY: the caller guarantees `[lo, hi]` is readable stack memory
        // of this thread; both ends hold live words.
        unsafe { self.find_reachable(lo, hi + WORD_BYTES) };

        let before = self.objects.len();
        self.objects.retain(|_, record| match record.mark {
            GcMark::KeepAlive => true,
            GcMark::Referenced => {
                record.mark = GcMark::Default;
                true
            }
            GcMark::Default => false,
        });
        tracing::debug!(
            swept = before - self.objects.len(),
            retained = self.objects.len(),
            "gc: collection cycle complete"
        );
    }

    /// Scan `[start, end)` as a word array, marking tracked addresses and
    /// recursing into their payloads.
    ///
    /// Recursion is bounded by the heap graph depth: a record is only entered
    /// while transitioning out of the default mark, so cyclic graphs
    /// terminate.
    ///
    /// # Safety
    ///
    /// Every word in `[start, end)` must be readable memory.
    unsafe fn find_reachable(&mut self, start: usize, end: usize) {
        debug_assert!(start % mem::align_of::<Word>() == 0);
        debug_assert!(start <= end);
        let mut cursor = start;
        while cursor < end {
            // SAFETY: the caller guarantees the range is readable.
            let word = unsafe { (cursor as *const Word).read() };
            if let Some(record) = self.objects.get_mut(&word) {
                if record.mark == GcMark::Default {
                    record.mark = GcMark::Referenced;
                    let payload = record.data.as_ptr() as usize;
                    let size = record.size;
                    if size >= PAYLOAD_SCAN_THRESHOLD {
                        // Whole words inside the block only.
                        let words = size / WORD_BYTES;
                        // SAFETY: the record owns `size` bytes at `payload`.
                        unsafe { self.find_reachable(payload, payload + words * WORD_BYTES) };
                    }
                }
            }
            cursor += WORD_BYTES;
        }
    }

    /// Number of tracked blocks.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether no blocks are tracked.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Whether the block at `ptr` is tracked.
    pub fn contains(&self, ptr: *const u8) -> bool {
        self.objects.contains_key(&(ptr as Word))
    }

    /// Human-readable description of every tracked block.
    ///
    /// The format is diagnostic output and not stable; do not parse it.
    pub fn dump_usage(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Collector usage: {} objects", self.objects.len());
        for (addr, record) in &self.objects {
            let _ = writeln!(
                out,
                "  object @ {addr:#x}: size={}, dtor={:#x}, mark={}",
                record.size,
                record.dtor.map_or(0, |f| f as usize),
                record.mark,
            );
        }
        out
    }
}

impl fmt::Debug for GarbageCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GarbageCollector")
            .field("objects", &self.objects.len())
            .field("stack_base", &format_args!("{:#x}", self.stack_base))
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
