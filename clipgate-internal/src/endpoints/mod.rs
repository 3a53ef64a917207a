pub mod extract;
pub mod fallback;
pub mod status;
