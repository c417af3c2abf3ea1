//! Local SQLite storage

mod pool;

pub use pool::*;
