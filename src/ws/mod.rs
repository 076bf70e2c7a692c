pub mod frame;
pub mod handler;
pub mod session;
