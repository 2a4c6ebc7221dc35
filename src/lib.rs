pub mod backend;
pub mod config;
pub mod pop;
pub mod server;
pub mod session;
