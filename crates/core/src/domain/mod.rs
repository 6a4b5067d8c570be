pub mod fallback;
pub mod snapshot;
