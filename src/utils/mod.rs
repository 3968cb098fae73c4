pub mod file_log;
pub mod sos;
