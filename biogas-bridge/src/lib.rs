pub mod bus;
pub mod calibration;
pub mod config;
pub mod correlation;
pub mod error;
pub mod handlers;
pub mod pipeline;
pub mod tls;
