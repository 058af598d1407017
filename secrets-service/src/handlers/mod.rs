pub mod internal;
pub mod metrics;
pub mod request;
