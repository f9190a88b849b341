pub mod mem;
pub mod module;
pub mod port;
pub mod request;
