// GPU timestamps - nested begin/end markers resolved from query pools
//
// Each frame slot owns `2 * pairs_per_frame` queries. `push` hands out the
// begin query of a new pair, `pop` the end query of the innermost open one.
// Results are read back without waiting; an unfinished frame resolves to
// nothing rather than stalling.

#[derive(Clone, Debug, Default, PartialEq)]
pub struct GpuTimestamp {
    pub name: String,
    pub depth: u32,
    pub start: u64,
    pub end: u64,
    pub elapsed_ms: f64,
    pub frame: u64,
}

#[derive(Debug, Default)]
struct FrameMarkers {
    pairs: Vec<(String, u32)>,
    open: Vec<usize>,
}

pub struct GpuTimestampManager {
    pairs_per_frame: u32,
    frames: Vec<FrameMarkers>,
}

impl GpuTimestampManager {
    pub fn new(frames: u32, pairs_per_frame: u32) -> Self {
        Self {
            pairs_per_frame,
            frames: (0..frames).map(|_| FrameMarkers::default()).collect(),
        }
    }

    /// Queries each frame slot's pool must hold
    pub fn queries_per_frame(&self) -> u32 {
        self.pairs_per_frame * 2
    }

    pub fn reset(&mut self, frame: u32) {
        let markers = &mut self.frames[frame as usize];
        if !markers.open.is_empty() {
            let open = markers.open.len();
            log::warn!("Resetting frame {} with {} unclosed GPU markers", frame, open);
        }
        markers.pairs.clear();
        markers.open.clear();
    }

    /// Begin query index for a new marker, `None` once the frame is full
    pub fn push(&mut self, frame: u32, name: &str) -> Option<u32> {
        let markers = &mut self.frames[frame as usize];
        if markers.pairs.len() as u32 >= self.pairs_per_frame {
            log::trace!("GPU timestamp budget exhausted, dropping '{}'", name);
            return None;
        }
        let pair = markers.pairs.len();
        markers.pairs.push((name.to_owned(), markers.open.len() as u32));
        markers.open.push(pair);
        Some(pair as u32 * 2)
    }

    /// End query index of the innermost open marker
    pub fn pop(&mut self, frame: u32) -> Option<u32> {
        let markers = &mut self.frames[frame as usize];
        let pair = markers.open.pop()?;
        Some(pair as u32 * 2 + 1)
    }

    /// Queries written this frame, `None` while some marker is still open
    pub fn written_queries(&self, frame: u32) -> Option<u32> {
        let markers = &self.frames[frame as usize];
        if markers.pairs.is_empty() || !markers.open.is_empty() {
            return None;
        }
        Some(markers.pairs.len() as u32 * 2)
    }

    /// Turn raw query values into durations. `period_ns` is the length of one tick.
    pub fn resolve(
        &self,
        frame: u32,
        raw: &[u64],
        period_ns: f32,
        absolute_frame: u64,
    ) -> Vec<GpuTimestamp> {
        let markers = &self.frames[frame as usize];
        markers
            .pairs
            .iter()
            .enumerate()
            .filter_map(|(i, (name, depth))| {
                let start = *raw.get(i * 2)?;
                let end = *raw.get(i * 2 + 1)?;
                let ticks = end.saturating_sub(start);
                Some(GpuTimestamp {
                    name: name.clone(),
                    depth: *depth,
                    start,
                    end,
                    elapsed_ms: ticks as f64 * period_ns as f64 / 1_000_000.0,
                    frame: absolute_frame,
                })
            })
            .collect()
    }
}
