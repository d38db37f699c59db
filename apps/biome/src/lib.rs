pub mod client;
pub mod config;
pub mod engine;
pub mod frame;
pub mod input;
pub mod portal;
pub mod protocol;
pub mod seeds;
pub mod session;
pub mod telemetry;
pub mod terminal;
pub mod transport;
