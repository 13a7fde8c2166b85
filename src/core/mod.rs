pub mod buffer;
pub mod device;
pub mod pipe;
pub mod port;
