pub mod core;
pub mod cp0;
pub mod execution;
pub mod float;
pub mod fpu;
pub mod types;

pub use core::Cpu;
pub use types::{CpuError, Exception, ExceptionCode, Mode};
