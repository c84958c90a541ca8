pub mod server;
pub mod ws;
