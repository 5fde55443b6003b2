pub mod job;
pub mod receipt;
