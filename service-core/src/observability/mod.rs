pub mod logging;
pub mod trace_context;

pub use logging::init_tracing;
pub use trace_context::{PropagateTrace, REQUEST_ID_HEADER, propagation_headers};
