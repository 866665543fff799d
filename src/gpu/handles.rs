//! Versioned opaque handles over slab-backed resource stores.
//!
//! Every GPU-side object is referred to through a 64-bit [`Handle`]: a slot
//! index into a per-kind slab plus a generation tag. Freeing a slot bumps its
//! generation, so handles held past destruction are rejected on lookup
//! instead of aliasing whatever reuses the slot. Handles are typed by a
//! zero-sized marker so a buffer handle cannot be passed where an image
//! handle is expected.

use std::marker::PhantomData;

use super::error::{GpuError, GpuResult};

/// Bit layout: low 32 bits slot index, next 30 bits generation, 2 spare.
const SLOT_BITS: u32 = 32;
const GENERATION_MASK: u64 = (1 << 30) - 1;

/// Opaque reference to a resource of kind `T`.
pub struct Handle<T> {
    raw: u64,
    _kind: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    fn new(slot: u32, generation: u32) -> Self {
        let raw = (slot as u64) | (((generation as u64) & GENERATION_MASK) << SLOT_BITS);
        Self {
            raw,
            _kind: PhantomData,
        }
    }

    /// Slot index into the backing slab.
    #[inline]
    pub fn slot(self) -> u32 {
        self.raw as u32
    }

    /// Generation tag this handle was created with.
    #[inline]
    pub fn generation(self) -> u32 {
        ((self.raw >> SLOT_BITS) & GENERATION_MASK) as u32
    }

    /// The raw 64-bit representation, for logging.
    #[inline]
    pub fn raw(self) -> u64 {
        self.raw
    }
}

// Manual impls: derives would bound on `T`, but the marker is phantom.
impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Handle<T> {}
impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}
impl<T> Eq for Handle<T> {}
impl<T> std::hash::Hash for Handle<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}
impl<T> std::fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Handle<{}>({}:{})",
            std::any::type_name::<T>().rsplit("::").next().unwrap_or("?"),
            self.slot(),
            self.generation()
        )
    }
}

struct Slot<T> {
    generation: u32,
    object: Option<T>,
}

/// Slab store for one resource kind.
///
/// Freed slots go onto a free list with their generation incremented; the
/// slab itself never shrinks. Lookup cost is one bounds check and one
/// generation compare.
pub struct ResourceStore<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    kind: &'static str,
}

impl<T> ResourceStore<T> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            kind,
        }
    }

    fn stale(&self) -> GpuError {
        GpuError::InvalidHandle { kind: self.kind }
    }

    /// Insert an object, reusing a freed slot when one is available.
    pub fn create(&mut self, object: T) -> Handle<T> {
        if let Some(slot) = self.free.pop() {
            let entry = &mut self.slots[slot as usize];
            debug_assert!(entry.object.is_none());
            entry.object = Some(object);
            return Handle::new(slot, entry.generation);
        }

        let slot = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            object: Some(object),
        });
        Handle::new(slot, 0)
    }

    fn slot_for(&self, handle: Handle<T>) -> GpuResult<&Slot<T>> {
        let entry = self
            .slots
            .get(handle.slot() as usize)
            .ok_or_else(|| self.stale())?;
        if entry.generation != handle.generation() || entry.object.is_none() {
            return Err(self.stale());
        }
        Ok(entry)
    }

    /// Resolve a handle, rejecting stale generations.
    pub fn get(&self, handle: Handle<T>) -> GpuResult<&T> {
        Ok(self.slot_for(handle)?.object.as_ref().unwrap())
    }

    pub fn get_mut(&mut self, handle: Handle<T>) -> GpuResult<&mut T> {
        self.slot_for(handle)?;
        Ok(self.slots[handle.slot() as usize].object.as_mut().unwrap())
    }

    pub fn is_valid(&self, handle: Handle<T>) -> bool {
        self.slot_for(handle).is_ok()
    }

    /// Remove the object and retire the slot. A second free of the same
    /// handle reports a stale-handle error and leaves the store untouched.
    pub fn free(&mut self, handle: Handle<T>) -> GpuResult<T> {
        self.slot_for(handle)?;
        let entry = &mut self.slots[handle.slot() as usize];
        let object = entry.object.take().unwrap();
        // Wraps at 30 bits; the spare two bits of the handle stay clear.
        entry.generation = entry.generation.wrapping_add(1) & GENERATION_MASK as u32;
        self.free.push(handle.slot());
        Ok(object)
    }

    /// Number of live objects (diagnostics only).
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain every live object, e.g. at device teardown.
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::new();
        for (i, entry) in self.slots.iter_mut().enumerate() {
            if let Some(object) = entry.object.take() {
                entry.generation = entry.generation.wrapping_add(1) & GENERATION_MASK as u32;
                self.free.push(i as u32);
                out.push(object);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_after_free_is_stale() {
        let mut store = ResourceStore::new("thing");
        let h = store.create(41u32);
        assert_eq!(*store.get(h).unwrap(), 41);

        store.free(h).unwrap();
        assert!(matches!(
            store.get(h),
            Err(GpuError::InvalidHandle { kind: "thing" })
        ));
    }

    #[test]
    fn test_slot_reuse_bumps_generation() {
        let mut store = ResourceStore::new("thing");
        let h1 = store.create(1u32);
        store.free(h1).unwrap();

        // The freed slot is reused, but under a new generation.
        let h2 = store.create(2u32);
        assert_eq!(h1.slot(), h2.slot());
        assert_ne!(h1.generation(), h2.generation());

        assert!(store.get(h1).is_err());
        assert_eq!(*store.get(h2).unwrap(), 2);
    }

    #[test]
    fn test_double_free_reports_stale() {
        let mut store = ResourceStore::new("thing");
        let h = store.create(7u32);
        assert!(store.free(h).is_ok());
        assert!(store.free(h).is_err());
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_store_grows_past_initial_capacity() {
        let mut store = ResourceStore::new("thing");
        let handles: Vec<_> = (0..256u32).map(|i| store.create(i)).collect();
        for (i, h) in handles.iter().enumerate() {
            assert_eq!(*store.get(*h).unwrap(), i as u32);
        }
        assert_eq!(store.len(), 256);
    }

    #[test]
    fn test_typed_handles_are_distinct_types() {
        struct A;
        struct B;
        let mut a = ResourceStore::<A>::new("a");
        let mut b = ResourceStore::<B>::new("b");
        let ha = a.create(A);
        let hb = b.create(B);
        // Compile-time property; just exercise both lookups.
        assert!(a.get(ha).is_ok());
        assert!(b.get(hb).is_ok());
    }
}
