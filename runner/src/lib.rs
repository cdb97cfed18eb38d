pub mod builtin;
pub mod config;
pub mod control;
pub mod lifecycle;
pub mod pool;
pub mod scheduler;
pub mod state;
pub mod wire;
