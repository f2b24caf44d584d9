pub mod backend;
pub mod cancellation;
pub mod check_stream;
pub mod embedding;
pub mod embedding_queue;
pub mod global_status;
pub mod hub;
pub mod polling;
pub mod pool;
pub mod sse;
pub mod transport;
