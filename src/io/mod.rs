//! # File I/O
//!
//! Low-level durable I/O for the WAL and page store. The single component
//! here is [`AsyncFileIo`]: an asynchronous file channel that presents
//! synchronous semantics by allowing exactly one in-flight operation per
//! handle, giving callers strict operation ordering without any
//! interleaved-completion hazards.

mod async_file;

pub use async_file::AsyncFileIo;
