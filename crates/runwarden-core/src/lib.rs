pub mod attempts;
pub mod config;
pub mod constants;
pub mod digest;
pub mod errors;
pub mod escalation;
pub mod hang;
pub mod lock;
pub mod logging;
pub mod model;
pub mod rc;
pub mod run_cache;
