pub mod client;
pub mod config;
pub mod emitter;
pub mod error;
pub mod record;
pub mod sink;
pub mod transform;
pub mod writer;
