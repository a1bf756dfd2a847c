pub mod bus;
pub mod config;
pub mod coordinator;
pub mod device;
pub mod emulator;
pub mod protocol;
pub mod transport;
