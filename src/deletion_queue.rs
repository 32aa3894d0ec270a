// Deletion queue - frame-tagged destruction of native objects
//
// A destroy call only records what to free and during which absolute frame
// it was requested. The device sweeps the queue with the number of frames the
// GPU has retired, calling back into a per-kind destructor.

use crate::resources::{
    BufferHandle, DescriptorSetHandle, DescriptorSetLayoutHandle, PipelineHandle, SamplerHandle,
    ShaderStateHandle, TextureHandle,
};

/// Any pooled resource, tagged by kind
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceRef {
    Buffer(BufferHandle),
    Texture(TextureHandle),
    Sampler(SamplerHandle),
    Pipeline(PipelineHandle),
    ShaderState(ShaderStateHandle),
    DescriptorSetLayout(DescriptorSetLayoutHandle),
    DescriptorSet(DescriptorSetHandle),
}

impl ResourceRef {
    pub fn kind_name(&self) -> &'static str {
        match self {
            ResourceRef::Buffer(_) => "buffer",
            ResourceRef::Texture(_) => "texture",
            ResourceRef::Sampler(_) => "sampler",
            ResourceRef::Pipeline(_) => "pipeline",
            ResourceRef::ShaderState(_) => "shader state",
            ResourceRef::DescriptorSetLayout(_) => "descriptor set layout",
            ResourceRef::DescriptorSet(_) => "descriptor set",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeletionRequest {
    pub resource: ResourceRef,
    /// Absolute frame being recorded when the destroy call was made
    pub frame_requested: u64,
}

#[derive(Debug, Default)]
pub struct DeletionQueue {
    requests: Vec<DeletionRequest>,
}

impl DeletionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, resource: ResourceRef, frame_requested: u64) {
        log::trace!(
            "Queued {} {:?} for deletion (frame {})",
            resource.kind_name(),
            resource,
            frame_requested
        );
        self.requests.push(DeletionRequest {
            resource,
            frame_requested,
        });
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn contains(&self, resource: ResourceRef) -> bool {
        self.requests.iter().any(|r| r.resource == resource)
    }

    /// Destroy every entry requested before `retired_frames`, the number of
    /// frames whose GPU work has completed. Returns how many were freed.
    ///
    /// Walks backwards so that swap-removing the current entry never moves an
    /// unvisited one into an already visited position.
    pub fn sweep(&mut self, retired_frames: u64, mut destroy: impl FnMut(ResourceRef)) -> usize {
        let mut freed = 0;
        let mut i = self.requests.len();
        while i > 0 {
            i -= 1;
            if self.requests[i].frame_requested < retired_frames {
                let request = self.requests.swap_remove(i);
                destroy(request.resource);
                freed += 1;
            }
        }
        freed
    }

    /// Destroy everything regardless of tag (shutdown, after an idle wait)
    pub fn flush_all(&mut self, mut destroy: impl FnMut(ResourceRef)) -> usize {
        let freed = self.requests.len();
        while let Some(request) = self.requests.pop() {
            destroy(request.resource);
        }
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Handle;

    fn buffer(i: u32) -> ResourceRef {
        ResourceRef::Buffer(Handle::new(i, 1))
    }

    #[test]
    fn sweep_frees_only_retired_frames() {
        let mut queue = DeletionQueue::new();
        queue.push(buffer(0), 0);
        queue.push(buffer(1), 3);
        queue.push(buffer(2), 1);
        queue.push(buffer(3), 2);
        queue.push(buffer(4), 0);

        let mut freed = Vec::new();
        assert_eq!(queue.sweep(2, |r| freed.push(r)), 3);

        freed.sort_by_key(|r| match r {
            ResourceRef::Buffer(h) => h.index(),
            _ => unreachable!(),
        });
        assert_eq!(freed, vec![buffer(0), buffer(2), buffer(4)]);
        assert_eq!(queue.len(), 2);
        assert!(queue.contains(buffer(1)));
        assert!(queue.contains(buffer(3)));
    }

    #[test]
    fn nothing_is_freed_before_its_frame_retires() {
        let mut queue = DeletionQueue::new();
        queue.push(buffer(0), 4);
        assert_eq!(queue.sweep(0, |_| panic!("nothing retired")), 0);
        assert_eq!(queue.sweep(4, |_| panic!("frame 4 still in flight")), 0);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.sweep(5, |_| {}), 1);
    }

    #[test]
    fn adjacent_matches_are_all_visited() {
        let mut queue = DeletionQueue::new();
        for i in 0..6 {
            queue.push(buffer(i), 0);
        }
        let mut count = 0;
        queue.sweep(1, |_| count += 1);
        assert_eq!(count, 6);
        assert!(queue.is_empty());
    }

    #[test]
    fn flush_all_ignores_tags() {
        let mut queue = DeletionQueue::new();
        queue.push(buffer(0), 0);
        queue.push(ResourceRef::Sampler(Handle::new(0, 1)), 2);
        let mut kinds = Vec::new();
        assert_eq!(queue.flush_all(|r| kinds.push(r.kind_name())), 2);
        assert_eq!(kinds, vec!["sampler", "buffer"]);
        assert!(queue.is_empty());
    }
}
