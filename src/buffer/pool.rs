use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use bytes::BytesMut;

/// Power-of-two size classes the pool tiers buffers into, smallest first.
const TIER_SIZES: [usize; 5] = [4 * 1024, 16 * 1024, 64 * 1024, 256 * 1024, 1024 * 1024];

/// Configuration for [`BufferPool`].
///
/// Follows the builder style of `HttpTransportConfig`: a `new()` with
/// documented defaults and fluent `with_*` setters.
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Maximum number of buffers a single tier will create and track.
    /// Exceeding it does not fail `acquire` — it falls back to an untracked,
    /// non-recycled allocation (§4.1: "budget is a soft hint").
    pub max_buffers_per_tier: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPoolConfig {
    pub fn new() -> Self {
        Self {
            max_buffers_per_tier: 64,
        }
    }

    pub fn with_max_buffers_per_tier(mut self, n: usize) -> Self {
        self.max_buffers_per_tier = n;
        self
    }
}

struct Tier {
    size: usize,
    cap: usize,
    created: AtomicUsize,
    free: std::sync::Mutex<Vec<BytesMut>>,
}

impl Tier {
    fn new(size: usize, cap: usize) -> Self {
        Self {
            size,
            cap,
            created: AtomicUsize::new(0),
            free: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Try to satisfy `acquire` from this tier. Returns `None` if the tier
    /// is empty and already at its creation cap — the caller then falls
    /// back to an untracked allocation.
    fn take(&self) -> Option<BytesMut> {
        if let Some(mut buf) = self.free.lock().expect("buffer pool poisoned").pop() {
            buf.clear();
            return Some(buf);
        }
        if self.created.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| {
            (c < self.cap).then_some(c + 1)
        })
        .is_ok()
        {
            return Some(BytesMut::with_capacity(self.size));
        }
        None
    }

    fn give_back(&self, buf: BytesMut) {
        self.free.lock().expect("buffer pool poisoned").push(buf);
    }
}

/// Point-in-time usage snapshot for one size tier, surfaced through
/// [`BufferPoolStats`] for the metrics hook in §6.
#[derive(Debug, Clone, Copy)]
pub struct TierStats {
    pub size: usize,
    pub created: usize,
    pub idle: usize,
    pub cap: usize,
}

/// Snapshot of pool occupancy across all tiers.
#[derive(Debug, Clone)]
pub struct BufferPoolStats {
    pub tiers: Vec<TierStats>,
}

impl BufferPoolStats {
    /// Total bytes currently idle across all tier free lists.
    pub fn idle_bytes(&self) -> usize {
        self.tiers.iter().map(|t| t.size * t.idle).sum()
    }
}

/// Allocates, recycles, and ref-counts byte buffers of tiered sizes.
///
/// `acquire(min_size)` returns a [`BufferRef`] whose capacity is at least
/// `min_size`, sourced from the smallest tier that satisfies it. The
/// returned handle auto-returns its underlying allocation to the tier's free
/// list when the last clone (including `view`s) is dropped, provided the
/// buffer still belongs to a tier under its creation cap; otherwise it is
/// simply freed. `acquire` never fails per §4.1 — once every tier is at cap
/// it allocates off-pool.
pub struct BufferPool {
    tiers: Vec<Arc<Tier>>,
}

impl BufferPool {
    pub fn new(config: BufferPoolConfig) -> Self {
        let tiers = TIER_SIZES
            .iter()
            .map(|&size| Arc::new(Tier::new(size, config.max_buffers_per_tier)))
            .collect();
        Self { tiers }
    }

    /// Acquire a buffer whose capacity is at least `min_size`.
    pub fn acquire(&self, min_size: usize) -> BufferRef {
        for tier in &self.tiers {
            if tier.size >= min_size {
                if let Some(buf) = tier.take() {
                    return BufferRef::tiered(buf, Arc::clone(tier));
                }
                // Tier matched by size but at its creation cap: allocate
                // off-pool rather than fail, per the "acquire never fails"
                // contract.
                return BufferRef::untracked(BytesMut::with_capacity(min_size));
            }
        }
        // Larger than every tier: always off-pool.
        BufferRef::untracked(BytesMut::with_capacity(min_size))
    }

    /// Current occupancy across all tiers.
    pub fn stats(&self) -> BufferPoolStats {
        BufferPoolStats {
            tiers: self
                .tiers
                .iter()
                .map(|t| TierStats {
                    size: t.size,
                    created: t.created.load(Ordering::SeqCst),
                    idle: t.free.lock().expect("buffer pool poisoned").len(),
                    cap: t.cap,
                })
                .collect(),
        }
    }
}

/// Reference-counted handle to a pooled buffer.
///
/// Cloning (what [`BufferRef::view`] does internally) increments the
/// refcount without copying the underlying bytes. The handle's `Drop`
/// returns the allocation to its tier exactly when the last clone goes
/// away, using `Arc::try_unwrap` to detect that point without a manual
/// counter — double-release is a compile-time impossibility here, unlike
/// in languages without an ownership model (see DESIGN.md).
pub struct BufferRef {
    data: Arc<RwLock<BytesMut>>,
    tier: Option<Arc<Tier>>,
}

impl BufferRef {
    fn tiered(buf: BytesMut, tier: Arc<Tier>) -> Self {
        Self {
            data: Arc::new(RwLock::new(buf)),
            tier: Some(tier),
        }
    }

    fn untracked(buf: BytesMut) -> Self {
        Self {
            data: Arc::new(RwLock::new(buf)),
            tier: None,
        }
    }

    /// Append bytes to the buffer. Only sound for the sole writer of a
    /// freshly `acquire`d buffer (invariant (a) in §4.1) — callers must not
    /// write through a handle obtained from [`BufferRef::view`] once other
    /// views exist.
    pub fn extend_from_slice(&self, bytes: &[u8]) {
        self.data
            .write()
            .expect("buffer pool poisoned")
            .extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.data.read().expect("buffer pool poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current reference count (the original handle plus every live view).
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.data)
    }

    /// Copy out `len` bytes starting at `offset`. The pool allocation itself
    /// is never duplicated or re-aliased across tiers by this call — only
    /// the returned snapshot is an owned copy, which keeps the shared
    /// buffer behind a single lock instead of unsafe aliasing.
    pub fn slice(&self, offset: usize, len: usize) -> bytes::Bytes {
        let guard = self.data.read().expect("buffer pool poisoned");
        bytes::Bytes::copy_from_slice(&guard[offset..offset + len])
    }

    /// Increment the refcount without copying and return a handle that
    /// shares the same underlying allocation. Used to hand out header
    /// slices as `(buffer_ref, offset, len)` views per §4.3.
    pub fn view(&self) -> BufferRef {
        BufferRef {
            data: Arc::clone(&self.data),
            tier: self.tier.clone(),
        }
    }
}

impl Drop for BufferRef {
    fn drop(&mut self) {
        let Some(tier) = self.tier.take() else {
            return;
        };
        // Swap in a cheap placeholder so we can inspect whether this was the
        // last outstanding handle via `Arc::try_unwrap`.
        let placeholder = Arc::new(RwLock::new(BytesMut::new()));
        let data = std::mem::replace(&mut self.data, placeholder);
        if let Ok(lock) = Arc::try_unwrap(data) {
            let buf = lock.into_inner().expect("buffer pool poisoned");
            tier.give_back(buf);
        }
        // Otherwise another handle is still alive; dropping `data` here just
        // decrements the shared refcount.
    }
}
