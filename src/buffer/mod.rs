//! Tiered, reference-counted buffer pool.
//!
//! Shaped like `transport/http/buffer_pool.rs::BufferPool` (a
//! `Mutex<Vec<Vec<u8>>>` free list returning buffers via a `Drop`-based
//! `PooledBuffer` guard), generalized here to multiple power-of-two size
//! classes with explicit view refcounting.

mod pool;

pub use pool::{BufferPool, BufferPoolConfig, BufferPoolStats, BufferRef};
