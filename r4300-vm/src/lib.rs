//! MIPS R4300i CPU core: decoder, execution engine, CP0/TLB and FPU,
//! plus the bus model, loaders, snapshots and a GDB stub around it.

pub mod bus;
pub mod cpu;
pub mod debugger;
pub mod decoder;
pub mod dram;
pub mod loader;
pub mod mmu;
pub mod snapshot;

pub use bus::{Bus, BusError, SystemBus};
pub use cpu::{Cpu, CpuError, Exception, ExceptionCode};
