pub mod instrument;
pub mod log;
