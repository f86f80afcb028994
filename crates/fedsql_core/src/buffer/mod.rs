//! Row storage for results and intermediate data.

pub mod batch;
pub mod buffer_manager;
pub mod storage;
pub mod tuple_buffer;
