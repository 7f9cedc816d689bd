use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bus::BusError;

/// Operating mode derived from `Status.KSU`, `Status.EXL` and `Status.ERL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    Kernel,
    Supervisor,
    User,
}

impl Mode {
    /// Decode the effective mode. Any pending exception level forces kernel mode.
    pub fn from_status(status: u64) -> Mode {
        let exception = status & 0b110 != 0;
        if exception {
            return Mode::Kernel;
        }
        match (status >> 3) & 0b11 {
            0b00 => Mode::Kernel,
            0b01 => Mode::Supervisor,
            0b10 => Mode::User,
            // 0b11 is undefined on the R4300i; the pipeline treats it as user.
            _ => Mode::User,
        }
    }
}

/// `Cause.ExcCode` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ExceptionCode {
    Interrupt = 0,
    TlbModification = 1,
    TlbMissLoad = 2,
    TlbMissStore = 3,
    AddressErrorLoad = 4,
    AddressErrorStore = 5,
    BusErrorInstruction = 6,
    BusErrorData = 7,
    Syscall = 8,
    Breakpoint = 9,
    ReservedInstruction = 10,
    CoprocessorUnusable = 11,
    ArithmeticOverflow = 12,
    Trap = 13,
    FloatingPoint = 15,
    Watch = 23,
}

impl ExceptionCode {
    pub fn bits(self) -> u64 {
        self as u8 as u64
    }

    pub fn is_tlb_miss(self) -> bool {
        matches!(self, ExceptionCode::TlbMissLoad | ExceptionCode::TlbMissStore)
    }
}

/// Record of the last exception the dispatcher vectored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exception {
    pub code: ExceptionCode,
    pub coprocessor: u8,
    /// Address of the instruction that faulted (before delay-slot rollback).
    pub pc: u64,
    /// Vector the PC was redirected to.
    pub vector: u64,
}

/// Host-visible failures. Architectural exceptions never surface here.
#[derive(Debug, Error)]
pub enum CpuError {
    #[error("unimplemented behaviour at pc {pc:#018x}: {what}")]
    Unimplemented { pc: u64, what: String },

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Early exit from an instruction handler.
///
/// `Vectored` means the dispatcher already redirected the PC; the step is
/// complete and successful from the host's point of view.
#[derive(Debug)]
pub(crate) enum Fault {
    Vectored,
    Fatal(CpuError),
}

impl From<CpuError> for Fault {
    fn from(err: CpuError) -> Self {
        Fault::Fatal(err)
    }
}

impl From<BusError> for Fault {
    fn from(err: BusError) -> Self {
        Fault::Fatal(CpuError::Bus(err))
    }
}

pub(crate) type ExecResult<T = ()> = Result<T, Fault>;
