pub mod link;
pub mod shared_buffer;
