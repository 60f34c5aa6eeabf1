//! Allocation guard.
//!
//! Every heap allocation made by the routing engine goes through an
//! [`AllocGuard`]. The guard asks the caller-supplied [`Allocator`] for
//! permission before performing the fallible std allocation, so a refusal
//! surfaces as [`Error::OutOfMemory`] instead of aborting the process.
//!
//! Callers that want to exercise their own error paths can install
//! [`FailAfter`], which grants a fixed number of allocations and refuses the
//! rest.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::proto::error::{Error, Result};

/// Allocation hooks consulted before every engine allocation.
///
/// Returning `false` from any of the granting hooks makes the pending
/// operation fail with [`Error::OutOfMemory`]. The engine never retries a
/// refused allocation on its own.
pub trait Allocator: Send + Sync {
    /// Called before a fresh allocation of `size` bytes.
    fn allocate(&self, size: usize) -> bool;

    /// Called before growing an allocation from `old_size` to `new_size` bytes.
    fn reallocate(&self, old_size: usize, new_size: usize) -> bool {
        let _ = old_size;
        self.allocate(new_size)
    }

    /// Called before copying `len` bytes into a new owned buffer.
    fn duplicate(&self, len: usize) -> bool {
        self.allocate(len)
    }

    /// Called when the engine frees a buffer it kept for a connection's
    /// lifetime, with the size granted for it through `reallocate`.
    ///
    /// Values handed to the caller (replies, encoded commands) are never
    /// released through this hook.
    fn release(&self, size: usize) {
        let _ = size;
    }
}

/// Allocator that grants every request.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

impl Allocator for SystemAllocator {
    #[inline]
    fn allocate(&self, _size: usize) -> bool {
        true
    }
}

const UNLIMITED: usize = usize::MAX;

/// Allocator that grants a fixed number of allocations and refuses the rest.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use shardis::alloc::{Allocator, FailAfter};
///
/// let alloc = Arc::new(FailAfter::new(1));
/// assert!(alloc.allocate(16));
/// assert!(!alloc.allocate(16));
///
/// alloc.set_unlimited();
/// assert!(alloc.allocate(16));
/// ```
#[derive(Debug)]
pub struct FailAfter {
    remaining: AtomicUsize,
    attempts: AtomicUsize,
}

impl FailAfter {
    /// Grants `successes` allocations, then refuses.
    pub fn new(successes: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(successes),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Grants every allocation until a budget is set.
    pub fn unlimited() -> Self {
        Self::new(UNLIMITED)
    }

    /// Replaces the remaining budget.
    pub fn set_remaining(&self, successes: usize) {
        self.remaining.store(successes, Ordering::SeqCst);
    }

    /// Removes the budget.
    pub fn set_unlimited(&self) {
        self.remaining.store(UNLIMITED, Ordering::SeqCst);
    }

    /// Total number of allocation requests seen, granted or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn take(&self) -> bool {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                UNLIMITED => Some(UNLIMITED),
                n => Some(n - 1),
            })
            .is_ok()
    }
}

impl Default for FailAfter {
    fn default() -> Self {
        Self::unlimited()
    }
}

impl Allocator for FailAfter {
    fn allocate(&self, _size: usize) -> bool {
        self.take()
    }
}

/// Handle through which the engine performs its allocations.
///
/// Cheap to clone; every clone shares the same [`Allocator`].
#[derive(Clone)]
pub struct AllocGuard {
    inner: Arc<dyn Allocator>,
}

impl AllocGuard {
    /// Wraps an allocator.
    pub fn new<A: Allocator + 'static>(allocator: A) -> Self {
        Self {
            inner: Arc::new(allocator),
        }
    }

    /// Wraps a shared allocator, letting the caller keep a handle to it.
    pub fn shared(allocator: Arc<dyn Allocator>) -> Self {
        Self { inner: allocator }
    }

    /// A guard that never refuses.
    pub fn system() -> Self {
        Self::new(SystemAllocator)
    }

    #[inline]
    fn grant(&self, size: usize) -> Result<()> {
        if self.inner.allocate(size) {
            Ok(())
        } else {
            Err(Error::OutOfMemory)
        }
    }

    /// Asks for permission to allocate `size` bytes that the engine will
    /// allocate itself (boxed callbacks, fixed tables).
    pub fn admit(&self, size: usize) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        self.grant(size)
    }

    /// Creates an empty vector with room for exactly `capacity` items.
    pub fn vec<T>(&self, capacity: usize) -> Result<Vec<T>> {
        let mut v = Vec::new();
        if capacity == 0 {
            return Ok(v);
        }
        self.grant(capacity.saturating_mul(mem::size_of::<T>()))?;
        v.try_reserve_exact(capacity)
            .map_err(|_| Error::OutOfMemory)?;
        Ok(v)
    }

    /// Makes room for `additional` more items in `v`.
    pub fn reserve<T>(&self, v: &mut Vec<T>, additional: usize) -> Result<()> {
        if v.capacity() - v.len() >= additional {
            return Ok(());
        }
        let item = mem::size_of::<T>();
        let old = v.capacity().saturating_mul(item);
        let new = (v.len() + additional).saturating_mul(item);
        if !self.inner.reallocate(old, new) {
            return Err(Error::OutOfMemory);
        }
        v.try_reserve(additional).map_err(|_| Error::OutOfMemory)
    }

    /// Makes room for `additional` more items in `q`.
    pub fn reserve_deque<T>(&self, q: &mut VecDeque<T>, additional: usize) -> Result<()> {
        if q.capacity() - q.len() >= additional {
            return Ok(());
        }
        let item = mem::size_of::<T>();
        let old = q.capacity().saturating_mul(item);
        let new = (q.len() + additional).saturating_mul(item);
        if !self.inner.reallocate(old, new) {
            return Err(Error::OutOfMemory);
        }
        q.try_reserve(additional).map_err(|_| Error::OutOfMemory)
    }

    /// Makes room for `additional` more entries in `map`.
    pub fn reserve_map<K, V>(&self, map: &mut HashMap<K, V>, additional: usize) -> Result<()>
    where
        K: Eq + Hash,
    {
        if map.capacity() - map.len() >= additional {
            return Ok(());
        }
        let entry = mem::size_of::<(K, V)>();
        let old = map.capacity().saturating_mul(entry);
        let new = (map.len() + additional).saturating_mul(entry);
        if !self.inner.reallocate(old, new) {
            return Err(Error::OutOfMemory);
        }
        map.try_reserve(additional).map_err(|_| Error::OutOfMemory)
    }

    /// Makes room for `additional` more bytes in `buf`.
    pub fn reserve_buf(&self, buf: &mut BytesMut, additional: usize) -> Result<()> {
        if buf.capacity() - buf.len() >= additional {
            return Ok(());
        }
        if !self
            .inner
            .reallocate(buf.capacity(), buf.len() + additional)
        {
            return Err(Error::OutOfMemory);
        }
        buf.reserve(additional);
        Ok(())
    }

    /// Copies a string into a new allocation.
    pub fn string(&self, s: &str) -> Result<String> {
        let mut out = String::new();
        if s.is_empty() {
            return Ok(out);
        }
        if !self.inner.duplicate(s.len()) {
            return Err(Error::OutOfMemory);
        }
        out.try_reserve_exact(s.len())
            .map_err(|_| Error::OutOfMemory)?;
        out.push_str(s);
        Ok(out)
    }

    /// Copies bytes into a new allocation.
    pub fn bytes(&self, data: &[u8]) -> Result<Bytes> {
        if data.is_empty() {
            return Ok(Bytes::new());
        }
        if !self.inner.duplicate(data.len()) {
            return Err(Error::OutOfMemory);
        }
        let mut v = Vec::new();
        v.try_reserve_exact(data.len())
            .map_err(|_| Error::OutOfMemory)?;
        v.extend_from_slice(data);
        Ok(Bytes::from(v))
    }

    /// Moves a value onto the heap.
    pub fn boxed<T>(&self, value: T) -> Result<Box<T>> {
        self.admit(mem::size_of::<T>())?;
        Ok(Box::new(value))
    }

    /// Reports a tracked allocation as released.
    pub fn release(&self, size: usize) {
        if size > 0 {
            self.inner.release(size);
        }
    }
}

/// Byte buffer owned for a connection's lifetime.
///
/// Growth is granted through the guard; the granted size goes back through
/// [`Allocator::release`] when the buffer is reset or dropped.
#[derive(Debug)]
pub(crate) struct GuardedBuf {
    buf: BytesMut,
    granted: usize,
    alloc: AllocGuard,
}

impl GuardedBuf {
    pub(crate) fn new(alloc: AllocGuard) -> Self {
        Self {
            buf: BytesMut::new(),
            granted: 0,
            alloc,
        }
    }

    /// Makes room for `additional` more bytes. A refusal leaves the buffer
    /// untouched.
    pub(crate) fn reserve(&mut self, additional: usize) -> Result<()> {
        if self.buf.capacity() - self.buf.len() >= additional {
            return Ok(());
        }
        let new = self.buf.len() + additional;
        if !self.alloc.inner.reallocate(self.granted, new) {
            return Err(Error::OutOfMemory);
        }
        self.buf.reserve(additional);
        self.granted = new;
        Ok(())
    }

    /// Frees the storage and releases what was granted for it.
    pub(crate) fn reset(&mut self) {
        self.buf = BytesMut::new();
        self.alloc.release(mem::take(&mut self.granted));
    }

    #[cfg(test)]
    pub(crate) fn granted(&self) -> usize {
        self.granted
    }
}

impl Deref for GuardedBuf {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.buf
    }
}

impl DerefMut for GuardedBuf {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

impl Drop for GuardedBuf {
    fn drop(&mut self) {
        self.alloc.release(mem::take(&mut self.granted));
    }
}

impl Default for AllocGuard {
    fn default() -> Self {
        Self::system()
    }
}

impl fmt::Debug for AllocGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocGuard").finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[test]
    fn test_system_allocator_grants() {
        let guard = AllocGuard::system();
        let v: Vec<u64> = guard.vec(8).unwrap();
        assert!(v.capacity() >= 8);
        assert_eq!(guard.string("node").unwrap(), "node");
    }

    #[test]
    fn test_fail_after_counts_down() {
        let alloc = FailAfter::new(2);
        assert!(alloc.allocate(1));
        assert!(alloc.allocate(1));
        assert!(!alloc.allocate(1));
        assert!(!alloc.allocate(1));
        assert_eq!(alloc.attempts(), 4);

        alloc.set_remaining(1);
        assert!(alloc.allocate(1));
        assert!(!alloc.allocate(1));
    }

    #[test]
    fn test_refused_reserve_leaves_vec_untouched() {
        let alloc = Arc::new(FailAfter::new(0));
        let guard = AllocGuard::shared(alloc.clone());

        let mut v = vec![1u8, 2, 3];
        v.shrink_to_fit();
        let before = v.clone();

        let err = guard.reserve(&mut v, 64).unwrap_err();
        assert!(matches!(err, Error::OutOfMemory));
        assert_eq!(v, before);

        alloc.set_unlimited();
        guard.reserve(&mut v, 64).unwrap();
        assert!(v.capacity() >= 67);
    }

    #[test]
    fn test_reserve_with_spare_capacity_does_not_ask() {
        let alloc = Arc::new(FailAfter::new(0));
        let guard = AllocGuard::shared(alloc.clone());

        let mut v: Vec<u8> = Vec::with_capacity(32);
        guard.reserve(&mut v, 16).unwrap();
        assert_eq!(alloc.attempts(), 0);
    }

    #[test]
    fn test_empty_copies_are_free() {
        let alloc = Arc::new(FailAfter::new(0));
        let guard = AllocGuard::shared(alloc.clone());

        assert!(guard.string("").unwrap().is_empty());
        assert!(guard.bytes(b"").unwrap().is_empty());
        assert!(guard.vec::<u32>(0).unwrap().is_empty());
        assert_eq!(alloc.attempts(), 0);
    }

    /// Tracks bytes granted to kept buffers and not yet released.
    #[derive(Default)]
    pub(crate) struct Ledger {
        pub(crate) outstanding: std::sync::atomic::AtomicIsize,
        pub(crate) released: AtomicUsize,
    }

    impl Allocator for Ledger {
        fn allocate(&self, _size: usize) -> bool {
            true
        }

        fn reallocate(&self, old_size: usize, new_size: usize) -> bool {
            let delta = new_size as isize - old_size as isize;
            self.outstanding.fetch_add(delta, Ordering::SeqCst);
            true
        }

        fn release(&self, size: usize) {
            self.outstanding.fetch_sub(size as isize, Ordering::SeqCst);
            self.released.fetch_add(size, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_guarded_buf_releases_what_it_grew() {
        let ledger = Arc::new(Ledger::default());
        {
            let mut buf = GuardedBuf::new(AllocGuard::shared(ledger.clone()));
            buf.reserve(16).unwrap();
            let full = buf.capacity();
            buf.resize(full, b'x');
            buf.reserve(64).unwrap();
            assert_eq!(buf.granted(), full + 64);
            assert_eq!(ledger.outstanding.load(Ordering::SeqCst), (full + 64) as isize);

            buf.reset();
            assert!(buf.is_empty());
            assert_eq!(ledger.outstanding.load(Ordering::SeqCst), 0);

            buf.reserve(8).unwrap();
        }
        assert_eq!(ledger.outstanding.load(Ordering::SeqCst), 0);
        assert!(ledger.released.load(Ordering::SeqCst) >= 16 + 64 + 8);
    }

    #[test]
    fn test_refused_growth_keeps_guarded_buf() {
        let alloc = Arc::new(FailAfter::new(0));
        let mut buf = GuardedBuf::new(AllocGuard::shared(alloc.clone()));
        assert!(matches!(buf.reserve(4), Err(Error::OutOfMemory)));
        assert_eq!(buf.granted(), 0);
        assert_eq!(buf.capacity(), 0);
    }

    #[test]
    fn test_refused_duplicate() {
        let guard = AllocGuard::new(FailAfter::new(0));
        assert!(matches!(guard.bytes(b"abc"), Err(Error::OutOfMemory)));
        assert!(matches!(guard.string("abc"), Err(Error::OutOfMemory)));
    }
}
