pub mod config;
pub mod imaging;
pub mod inference;
pub mod pipeline;
pub mod server;
pub mod session;
pub mod storage;
