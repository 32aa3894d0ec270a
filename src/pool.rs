// Resource pools - fixed-capacity slot arrays addressed by generation-checked handles
//
// Every resource kind lives in one pool. A slot stores a "hot" part (the
// native objects touched while recording) next to a "cold" part (engine
// metadata). Handles are plain index + generation pairs; GPU lifetime is
// tracked by the device, not by reference counts.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Marker implemented by the zero-sized kind types (`BufferKind`, ...)
pub trait Kind: 'static {
    const NAME: &'static str;
}

/// Index + generation pair identifying one pool slot.
///
/// Live generations are always odd: `obtain` and `destroy` each bump the
/// slot generation once, so generation 0 never names a live slot.
pub struct Handle<K> {
    index: u32,
    generation: u32,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Handle<K> {
    pub const INVALID: Self = Self {
        index: u32::MAX,
        generation: 0,
        _kind: PhantomData,
    };

    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _kind: PhantomData,
        }
    }

    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    #[inline]
    pub fn is_invalid(&self) -> bool {
        self.index == u32::MAX
    }
}

impl<K> Clone for Handle<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K> Copy for Handle<K> {}

impl<K> PartialEq for Handle<K> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<K> Eq for Handle<K> {}

impl<K> Hash for Handle<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<K> Default for Handle<K> {
    fn default() -> Self {
        Self::INVALID
    }
}

impl<K: Kind> fmt::Debug for Handle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_invalid() {
            write!(f, "{}(invalid)", K::NAME)
        } else {
            write!(f, "{}({}v{})", K::NAME, self.index, self.generation)
        }
    }
}

struct Slot<Hot, Cold> {
    hot: Hot,
    cold: Cold,
    generation: u32,
}

/// Fixed-capacity storage for one resource kind
pub struct ResourcePool<K, Hot, Cold> {
    slots: Vec<Slot<Hot, Cold>>,
    free_list: Vec<u32>,
    live: usize,
    _kind: PhantomData<fn() -> K>,
}

impl<K: Kind, Hot: Default, Cold: Default> ResourcePool<K, Hot, Cold> {
    pub fn new(capacity: u32) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                hot: Hot::default(),
                cold: Cold::default(),
                generation: 0,
            })
            .collect();

        // Reversed so that index 0 is handed out first
        let free_list = (0..capacity).rev().collect();

        Self {
            slots,
            free_list,
            live: 0,
            _kind: PhantomData,
        }
    }

    /// Pop a free slot. `None` means the pool is exhausted.
    pub fn obtain(&mut self) -> Option<Handle<K>> {
        let index = self.free_list.pop()?;
        let slot = &mut self.slots[index as usize];
        debug_assert!(slot.generation % 2 == 0, "{} slot {} handed out twice", K::NAME, index);
        slot.generation = slot.generation.wrapping_add(1);
        self.live += 1;
        Some(Handle::new(index, slot.generation))
    }

    /// Obtain a slot and fill both halves in one go.
    pub fn insert(&mut self, hot: Hot, cold: Cold) -> Option<Handle<K>> {
        let handle = self.obtain()?;
        let slot = &mut self.slots[handle.index as usize];
        slot.hot = hot;
        slot.cold = cold;
        Some(handle)
    }

    /// Release a slot and return its contents.
    ///
    /// # Panics
    /// When `handle` is stale or was already destroyed.
    pub fn destroy(&mut self, handle: Handle<K>) -> (Hot, Cold) {
        assert!(
            self.is_valid(handle),
            "destroying stale {} handle {:?}",
            K::NAME,
            handle
        );
        let slot = &mut self.slots[handle.index as usize];
        slot.generation = slot.generation.wrapping_add(1);
        self.free_list.push(handle.index);
        self.live -= 1;
        (std::mem::take(&mut slot.hot), std::mem::take(&mut slot.cold))
    }

    #[inline]
    pub fn is_valid(&self, handle: Handle<K>) -> bool {
        self.slots
            .get(handle.index as usize)
            .is_some_and(|slot| slot.generation % 2 == 1 && slot.generation == handle.generation)
    }

    #[inline]
    pub fn get_hot(&self, handle: Handle<K>) -> &Hot {
        debug_assert!(self.is_valid(handle), "stale {} handle {:?}", K::NAME, handle);
        &self.slots[handle.index as usize].hot
    }

    #[inline]
    pub fn get_hot_mut(&mut self, handle: Handle<K>) -> &mut Hot {
        debug_assert!(self.is_valid(handle), "stale {} handle {:?}", K::NAME, handle);
        &mut self.slots[handle.index as usize].hot
    }

    #[inline]
    pub fn get_cold(&self, handle: Handle<K>) -> &Cold {
        debug_assert!(self.is_valid(handle), "stale {} handle {:?}", K::NAME, handle);
        &self.slots[handle.index as usize].cold
    }

    #[inline]
    pub fn get_cold_mut(&mut self, handle: Handle<K>) -> &mut Cold {
        debug_assert!(self.is_valid(handle), "stale {} handle {:?}", K::NAME, handle);
        &mut self.slots[handle.index as usize].cold
    }

    /// Both halves at once, for callers that read one and write the other
    #[inline]
    pub fn get_mut(&mut self, handle: Handle<K>) -> (&mut Hot, &mut Cold) {
        debug_assert!(self.is_valid(handle), "stale {} handle {:?}", K::NAME, handle);
        let slot = &mut self.slots[handle.index as usize];
        (&mut slot.hot, &mut slot.cold)
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    #[inline]
    pub fn live_count(&self) -> usize {
        self.live
    }

    /// Handles of every live slot, in index order
    pub fn live_handles(&self) -> Vec<Handle<K>> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.generation % 2 == 1)
            .map(|(index, slot)| Handle::new(index as u32, slot.generation))
            .collect()
    }
}
