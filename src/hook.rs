//! Allocator interposition: attributes heap byte counts to the running
//! thread without locks, recursion, or allocator corruption.
//!
//! The four canonical heap primitives of a Rust process are the four methods
//! of `GlobalAlloc`. [`TraceAlloc`] wraps any inner allocator; the host
//! binary installs it once with `#[global_allocator]` — a one-time,
//! process-wide redirection that cannot be undone after startup. Each
//! wrapper forwards to the inner allocator first, then reports the byte
//! delta.
//!
//! Whether deltas are reported at all is an independent, cheap atomic gate
//! ([`set_enabled`]); a disabled hook costs one relaxed load per allocation.
//! If the host binary never installed [`TraceAlloc`], [`install`] reports
//! the failure once and heap metrics read zero for the process lifetime —
//! heap attribution degrading is never fatal.

use std::alloc::{GlobalAlloc, Layout};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Once, OnceLock};

// ---------------------------------------------------------------------------
// Destructor-free thread-local state for the global allocator.
//
// `thread_local!` registers TLS destructors, which global allocators must
// not use. Raw POSIX TLS (`pthread_key_create` with a NULL destructor)
// stores the per-thread byte totals and the re-entrancy guard depth directly
// in TLS slot values — no allocation, no locks, no cross-thread atomics on
// the allocation hot path.
// ---------------------------------------------------------------------------
#[cfg(unix)]
mod raw_tls {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Slot values are counters/depths stored as `usize`; `usize` holds a
    /// `pthread_key_t` on every supported target.
    struct Slot {
        key: AtomicUsize,
    }

    const KEY_UNINITIALIZED: usize = usize::MAX;

    impl Slot {
        const fn new() -> Self {
            Self {
                key: AtomicUsize::new(KEY_UNINITIALIZED),
            }
        }

        fn get(&self) -> usize {
            match self.raw_key() {
                Some(key) => (unsafe { libc::pthread_getspecific(key) }) as usize,
                None => 0,
            }
        }

        fn set(&self, value: usize) {
            if let Some(key) = self.raw_key() {
                unsafe { libc::pthread_setspecific(key, value as *const libc::c_void) };
            }
        }

        fn raw_key(&self) -> Option<libc::pthread_key_t> {
            let k = self.key.load(Ordering::Acquire);
            if k != KEY_UNINITIALIZED {
                return Some(k as libc::pthread_key_t);
            }
            ensure_keys();
            let k = self.key.load(Ordering::Acquire);
            (k != KEY_UNINITIALIZED).then_some(k as libc::pthread_key_t)
        }
    }

    static GUARD_DEPTH: Slot = Slot::new();
    static ALLOC_BYTES: Slot = Slot::new();
    static DEALLOC_BYTES: Slot = Slot::new();
    static KEYS_CREATING: AtomicBool = AtomicBool::new(false);

    /// One-time creation of all three keys via a compare-and-swap spinlock.
    /// NULL destructors only — no TLS destructor may be registered.
    fn ensure_keys() {
        if KEYS_CREATING
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            for slot in [&GUARD_DEPTH, &ALLOC_BYTES, &DEALLOC_BYTES] {
                if slot.key.load(Ordering::Acquire) != KEY_UNINITIALIZED {
                    continue;
                }
                let mut raw_key: libc::pthread_key_t = 0;
                let rc = unsafe { libc::pthread_key_create(&mut raw_key, None) };
                if rc != 0 {
                    // Leave the remaining slots uninitialized; accounting
                    // degrades to zero on this process.
                    break;
                }
                slot.key.store(raw_key as usize, Ordering::Release);
            }
            KEYS_CREATING.store(false, Ordering::Release);
        } else {
            while KEYS_CREATING.load(Ordering::Acquire) {
                std::hint::spin_loop();
            }
        }
    }

    /// Whether all three slots are usable. Accounting (and, critically, the
    /// listener call that relies on the re-entrancy guard) must be skipped
    /// entirely when they are not.
    pub(super) fn ready() -> bool {
        GUARD_DEPTH.raw_key().is_some()
            && ALLOC_BYTES.raw_key().is_some()
            && DEALLOC_BYTES.raw_key().is_some()
    }

    pub(super) fn guard_depth() -> usize {
        GUARD_DEPTH.get()
    }

    pub(super) fn set_guard_depth(depth: usize) {
        GUARD_DEPTH.set(depth);
    }

    pub(super) fn add_alloc_bytes(bytes: usize) {
        ALLOC_BYTES.set(ALLOC_BYTES.get().wrapping_add(bytes));
    }

    pub(super) fn add_dealloc_bytes(bytes: usize) {
        DEALLOC_BYTES.set(DEALLOC_BYTES.get().wrapping_add(bytes));
    }

    pub(super) fn byte_totals() -> (u64, u64) {
        (ALLOC_BYTES.get() as u64, DEALLOC_BYTES.get() as u64)
    }
}

// Non-unix fallback: accounting is disabled (graceful degradation).
#[cfg(not(unix))]
mod raw_tls {
    pub(super) fn ready() -> bool {
        false
    }
    pub(super) fn guard_depth() -> usize {
        1
    }
    pub(super) fn set_guard_depth(_depth: usize) {}
    pub(super) fn add_alloc_bytes(_bytes: usize) {}
    pub(super) fn add_dealloc_bytes(_bytes: usize) {}
    pub(super) fn byte_totals() -> (u64, u64) {
        (0, 0)
    }
}

/// Receives byte deltas attributed to the current thread. Invoked with the
/// recursion guard held, so allocations made by the listener itself forward
/// to the real allocator but are excluded from attribution.
pub trait AllocListener: Sync {
    fn on_alloc(&self, bytes: usize);
    fn on_dealloc(&self, bytes: usize);
}

/// Reporting gate, independent of installation.
static ENABLED: AtomicBool = AtomicBool::new(false);
/// Set by the first allocation that flows through a [`TraceAlloc`].
static WRAPPER_LIVE: AtomicBool = AtomicBool::new(false);
/// Cached result of the one-time install probe.
static INSTALL_OK: AtomicBool = AtomicBool::new(false);

static LISTENER: OnceLock<&'static (dyn AllocListener + 'static)> = OnceLock::new();

pub fn set_enabled(enabled: bool) {
    ENABLED.store(enabled, Ordering::Release);
}

pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

/// Register the listener. The registration is process-lifetime and
/// first-one-wins; returns `false` if a different listener was already set.
pub fn set_listener(listener: &'static (dyn AllocListener + 'static)) -> bool {
    LISTENER.set(listener).is_ok()
}

/// Probe whether a [`TraceAlloc`] is serving as the process allocator.
///
/// Idempotent. Forces one small allocate/deallocate cycle so the wrapper —
/// if installed — has observed traffic, then checks the liveness flag. On
/// failure heap metrics silently stay zero for the process lifetime; the
/// condition is reported once through the diagnostic channel.
pub fn install() -> bool {
    static PROBE: Once = Once::new();
    PROBE.call_once(|| {
        let probe = vec![0u8; 64];
        drop(std::hint::black_box(probe));
        let ok = WRAPPER_LIVE.load(Ordering::Acquire);
        INSTALL_OK.store(ok, Ordering::Release);
        if !ok {
            log::warn!(
                "scopetrace allocator hook is not installed; heap metrics will read zero \
                 (add `#[global_allocator] static A: TraceAlloc<System> = TraceAlloc::new(System);`)"
            );
        }
    });
    INSTALL_OK.load(Ordering::Acquire)
}

/// The current thread's cumulative (allocated, deallocated) byte totals.
pub fn thread_totals() -> (u64, u64) {
    raw_tls::byte_totals()
}

/// Scoped, nestable opt-out from allocation attribution. Saves the previous
/// guard depth on construction and restores it on drop, so guards nest and
/// may be created while the recursion guard is already held.
pub struct HookDisableGuard {
    previous: usize,
}

impl HookDisableGuard {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        let previous = raw_tls::guard_depth();
        raw_tls::set_guard_depth(previous + 1);
        Self { previous }
    }

    pub fn is_disabled() -> bool {
        raw_tls::guard_depth() != 0
    }
}

impl Drop for HookDisableGuard {
    fn drop(&mut self) {
        raw_tls::set_guard_depth(self.previous);
    }
}

fn on_alloc(bytes: usize) {
    if !is_enabled() || !raw_tls::ready() || raw_tls::guard_depth() != 0 {
        return;
    }
    raw_tls::set_guard_depth(1);
    raw_tls::add_alloc_bytes(bytes);
    if let Some(listener) = LISTENER.get() {
        listener.on_alloc(bytes);
    }
    raw_tls::set_guard_depth(0);
}

fn on_dealloc(bytes: usize) {
    if !is_enabled() || !raw_tls::ready() || raw_tls::guard_depth() != 0 {
        return;
    }
    raw_tls::set_guard_depth(1);
    raw_tls::add_dealloc_bytes(bytes);
    if let Some(listener) = LISTENER.get() {
        listener.on_dealloc(bytes);
    }
    raw_tls::set_guard_depth(0);
}

fn mark_live() {
    if !WRAPPER_LIVE.load(Ordering::Relaxed) {
        WRAPPER_LIVE.store(true, Ordering::Release);
    }
}

/// A global allocator wrapper that reports per-thread byte deltas.
///
/// Wraps any inner `GlobalAlloc` and forwards every primitive to it first;
/// accounting happens after the inner call and never changes the outcome.
pub struct TraceAlloc<A: GlobalAlloc> {
    inner: A,
}

impl<A: GlobalAlloc> TraceAlloc<A> {
    pub const fn new(inner: A) -> Self {
        Self { inner }
    }
}

unsafe impl<A: GlobalAlloc> GlobalAlloc for TraceAlloc<A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.inner.alloc(layout) };
        mark_live();
        if !ptr.is_null() {
            on_alloc(layout.size());
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.inner.alloc_zeroed(layout) };
        mark_live();
        if !ptr.is_null() {
            on_alloc(layout.size());
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { self.inner.dealloc(ptr, layout) };
        mark_live();
        on_dealloc(layout.size());
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let old_size = layout.size();
        let result = unsafe { self.inner.realloc(ptr, layout, new_size) };
        mark_live();
        if !result.is_null() {
            if result == ptr {
                // Resized in place: only the delta moved.
                if new_size > old_size {
                    on_alloc(new_size - old_size);
                } else {
                    on_dealloc(old_size - new_size);
                }
            } else {
                // Relocated: a fresh allocation plus a free of the old block.
                on_alloc(new_size);
                on_dealloc(old_size);
            }
        }
        result
    }
}
