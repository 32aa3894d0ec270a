// Bindless texture table
//
// One global descriptor array indexed by texture pool index. Writes are
// deferred: texture creation and destruction only queue a `BindlessUpdate`,
// and the device applies the whole batch once per frame in `present`.
// Deleted slots are pointed at a dummy texture so every index stays valid.

use ash::vk;

use crate::resources::TextureHandle;

/// Binding of the sampled-texture array inside set 0
pub const BINDLESS_TEXTURE_BINDING: u32 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BindlessUpdate {
    pub texture: TextureHandle,
    /// Absolute frame of the request
    pub frame_requested: u64,
    pub deleting: bool,
}

pub struct BindlessTable {
    layout: vk::DescriptorSetLayout,
    set: vk::DescriptorSet,
    capacity: u32,
    updates: Vec<BindlessUpdate>,
}

impl BindlessTable {
    pub fn new(layout: vk::DescriptorSetLayout, set: vk::DescriptorSet, capacity: u32) -> Self {
        Self {
            layout,
            set,
            capacity,
            updates: Vec::new(),
        }
    }

    #[inline]
    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    #[inline]
    pub fn set(&self) -> vk::DescriptorSet {
        self.set
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn queue(&mut self, texture: TextureHandle, frame_requested: u64, deleting: bool) {
        debug_assert!(texture.index() < self.capacity, "texture {:?} outside bindless range", texture);
        self.updates.push(BindlessUpdate {
            texture,
            frame_requested,
            deleting,
        });
    }

    pub fn pending(&self) -> usize {
        self.updates.len()
    }

    pub fn is_pending_delete(&self, texture: TextureHandle) -> bool {
        self.updates.iter().any(|u| u.deleting && u.texture == texture)
    }

    /// Take the queued updates, newest first
    pub fn take_batch(&mut self) -> Vec<BindlessUpdate> {
        let mut batch = std::mem::take(&mut self.updates);
        batch.reverse();
        batch
    }
}

/// Collapses a batch into one write per array element plus the textures whose
/// deletion may now be scheduled. `None` means "point at the dummy".
///
/// The newest update for a slot decides the write, except that a pending
/// delete anywhere in the batch always leaves the slot on the dummy.
pub fn plan_writes(
    batch: &[BindlessUpdate],
) -> (Vec<(u32, Option<TextureHandle>)>, Vec<TextureHandle>) {
    let mut writes: Vec<(u32, Option<TextureHandle>)> = Vec::with_capacity(batch.len());
    let mut released = Vec::new();

    for update in batch {
        let index = update.texture.index();
        let target = (!update.deleting).then_some(update.texture);
        match writes.iter_mut().find(|(i, _)| *i == index) {
            Some(write) if update.deleting => write.1 = None,
            Some(_) => {}
            None => writes.push((index, target)),
        }
        if update.deleting {
            released.push(update.texture);
        }
    }
    (writes, released)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Handle;

    fn table() -> BindlessTable {
        BindlessTable::new(vk::DescriptorSetLayout::null(), vk::DescriptorSet::null(), 16)
    }

    #[test]
    fn batch_is_newest_first() {
        let mut table = table();
        let a = Handle::new(1, 1);
        let b = Handle::new(2, 1);
        table.queue(a, 0, false);
        table.queue(b, 0, false);

        let batch = table.take_batch();
        assert_eq!(batch.iter().map(|u| u.texture).collect::<Vec<_>>(), vec![b, a]);
        assert_eq!(table.pending(), 0);
    }

    #[test]
    fn create_then_destroy_in_one_frame_ends_on_dummy() {
        let mut table = table();
        let t = Handle::new(3, 1);
        table.queue(t, 0, false);
        table.queue(t, 0, true);
        assert!(table.is_pending_delete(t));

        let batch = table.take_batch();
        let (writes, released) = plan_writes(&batch);
        assert_eq!(writes, vec![(3, None)]);
        assert_eq!(released, vec![t]);
    }

    #[test]
    fn delete_wins_over_any_other_update_for_the_slot() {
        let mut table = table();
        let t = Handle::new(5, 1);
        let u = Handle::new(6, 1);
        table.queue(t, 1, true);
        table.queue(u, 1, false);
        table.queue(t, 1, false);

        let batch = table.take_batch();
        let (writes, released) = plan_writes(&batch);
        assert_eq!(writes, vec![(5, None), (6, Some(u))]);
        assert_eq!(released, vec![t]);
    }
}
