pub mod args;
pub mod demo;
