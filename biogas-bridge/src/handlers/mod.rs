mod app;
mod calibration;
mod status;

pub use app::{app, AppState};
