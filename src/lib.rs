pub mod ble;
pub mod config;
pub mod control;
pub mod error;
pub mod fake;
pub mod led;
pub mod logging;
pub mod manager;
pub mod mapper;
pub mod monitor;
pub mod server;
pub mod session;
pub mod signal;
pub mod worker;
pub mod zones;
