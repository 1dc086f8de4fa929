pub mod chat;
pub mod completion;
pub mod config;
pub mod db;
pub mod error;
pub mod exec_log;
pub mod extraction;
pub mod jurisdiction;
pub mod parse;
pub mod pipeline;
pub mod steps;
pub mod store;
pub mod tools;
pub mod types;

pub use types::*;
