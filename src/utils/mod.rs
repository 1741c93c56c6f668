pub use buffer_pool::{BufferPool, PooledBuf};
pub use rate_limiter::{IoRateLimiter, TokenBucket};
pub use worker_pool::{Job, WorkerPool, WorkerPoolConfig};

mod buffer_pool;
mod rate_limiter;
mod worker_pool;
