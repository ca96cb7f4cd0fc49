pub mod action;
pub mod capture;
pub mod file_reader;
pub mod frames;
pub mod interpreter;
pub mod keys;
pub mod logger;
pub mod matcher;
pub mod platform;
pub mod scheduler;
pub mod settings;
pub mod types;

#[cfg(test)]
mod testing;
