//! Structured-concurrency primitives shared by the scheduler and worker pool.

mod cancel_token;

pub use cancel_token::CancelToken;
