pub mod backoff;
pub mod decoder;
pub mod frame;
pub mod modbus;
pub mod session;
pub mod transport;
