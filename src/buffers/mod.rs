pub mod fixed_buffer;
pub mod payload_pool;
