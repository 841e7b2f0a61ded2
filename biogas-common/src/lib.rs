pub mod metrics;
pub mod pgstore;
pub mod records;
pub mod reststore;
pub mod store;
pub mod validation;
