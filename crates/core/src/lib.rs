pub mod ids;
pub mod job;
pub mod profile;
