use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::bus::SystemBus;
use crate::cpu::Cpu;
use crate::dram::{Dram, MemoryError};
use crate::mmu::{TLB_ENTRIES, TlbEntry};

/// Version identifier for snapshot compatibility checks.
pub const SNAPSHOT_VERSION: &str = "r4300-1";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot encoding failed: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("snapshot version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: String, found: String },

    #[error("snapshot has no memory region at base {0:#x}")]
    MissingRegion(u64),

    #[error("memory region at {base:#x} is {found} bytes, expected {expected}")]
    SizeMismatch {
        base: u64,
        expected: usize,
        found: usize,
    },

    #[error("memory region at {0:#x} does not match its recorded hash")]
    HashMismatch(u64),

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// Full emulator snapshot: CPU state plus RDRAM and SP memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: String,
    pub cpu: CpuSnapshot,
    pub memory: Vec<MemRegionSnapshot>,
}

/// Serializable CPU state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuSnapshot {
    pub gpr: [u64; 32],
    pub fgr: [u64; 32],
    pub pc: u64,
    pub next_pc: u64,
    pub prev_pc: u64,
    pub hi: u64,
    pub lo: u64,
    pub llbit: bool,
    /// Whether the instruction at `pc` is a delay slot.
    pub in_delay_slot: bool,
    pub fcr0: u32,
    pub fcr31: u32,
    pub cp2_latch: u64,
    pub cp0: [u64; 32],
    /// Raw half-rate Count.
    pub cp0_count: u64,
    pub cp0_latch: u64,
    pub tlb: Vec<TlbEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemRegionSnapshot {
    pub base: u64,
    pub size: u64,
    pub hash: String,
    pub data: Vec<u8>,
}

fn digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

impl Cpu {
    pub fn snapshot(&self) -> CpuSnapshot {
        CpuSnapshot {
            gpr: self.gpr,
            fgr: self.fpu.fgr,
            pc: self.pc,
            next_pc: self.next_pc,
            prev_pc: self.prev_pc,
            hi: self.hi,
            lo: self.lo,
            llbit: self.llbit,
            in_delay_slot: self.branch,
            fcr0: self.fpu.fcr0,
            fcr31: self.fpu.fcr31,
            cp2_latch: self.cp2_latch,
            cp0: *self.cp0.raw_regs(),
            cp0_count: self.cp0.raw_count(),
            cp0_latch: self.cp0.latch(),
            tlb: self.cp0.tlb.entries().to_vec(),
        }
    }

    /// Overwrite all architectural state from `snap`.
    pub fn restore(&mut self, snap: &CpuSnapshot) {
        self.gpr = snap.gpr;
        self.gpr[0] = 0;
        self.fpu.fgr = snap.fgr;
        self.pc = snap.pc;
        self.next_pc = snap.next_pc;
        self.prev_pc = snap.prev_pc;
        self.hi = snap.hi;
        self.lo = snap.lo;
        self.llbit = snap.llbit;
        self.branch = snap.in_delay_slot;
        self.prev_branch = false;
        self.fpu.fcr0 = snap.fcr0;
        self.fpu.fcr31 = snap.fcr31;
        self.cp2_latch = snap.cp2_latch;
        self.cp0.load_raw(&snap.cp0, snap.cp0_count, snap.cp0_latch);
        self.cp0.tlb_error = None;
        for index in 0..TLB_ENTRIES {
            let entry = snap.tlb.get(index).copied().unwrap_or(TlbEntry::EMPTY);
            self.cp0.tlb.write(index, entry);
        }
        self.clear_last_exception();
        self.invalidate_decode_cache();
    }
}

fn capture_region(ram: &Dram) -> MemRegionSnapshot {
    let data = ram.get_data();
    MemRegionSnapshot {
        base: ram.base,
        size: ram.size() as u64,
        hash: digest(&data),
        data,
    }
}

fn restore_region(ram: &Dram, regions: &[MemRegionSnapshot]) -> Result<(), SnapshotError> {
    let region = regions
        .iter()
        .find(|r| r.base == ram.base)
        .ok_or(SnapshotError::MissingRegion(ram.base))?;
    if region.data.len() != ram.size() {
        return Err(SnapshotError::SizeMismatch {
            base: region.base,
            expected: ram.size(),
            found: region.data.len(),
        });
    }
    if digest(&region.data) != region.hash {
        return Err(SnapshotError::HashMismatch(region.base));
    }
    ram.set_data(&region.data)?;
    Ok(())
}

/// Capture the CPU and the bus memories.
pub fn capture(cpu: &Cpu, bus: &SystemBus) -> Snapshot {
    Snapshot {
        version: SNAPSHOT_VERSION.to_string(),
        cpu: cpu.snapshot(),
        memory: vec![capture_region(&bus.rdram), capture_region(&bus.sp_mem)],
    }
}

/// Restore a snapshot. Memory is verified against its hash before the CPU
/// is touched.
pub fn apply(snapshot: &Snapshot, cpu: &mut Cpu, bus: &SystemBus) -> Result<(), SnapshotError> {
    if snapshot.version != SNAPSHOT_VERSION {
        return Err(SnapshotError::VersionMismatch {
            expected: SNAPSHOT_VERSION.to_string(),
            found: snapshot.version.clone(),
        });
    }
    restore_region(&bus.rdram, &snapshot.memory)?;
    restore_region(&bus.sp_mem, &snapshot.memory)?;
    cpu.restore(&snapshot.cpu);
    Ok(())
}

pub fn write_to<W: Write>(writer: W, cpu: &Cpu, bus: &SystemBus) -> Result<(), SnapshotError> {
    bincode::serialize_into(writer, &capture(cpu, bus))?;
    Ok(())
}

pub fn read_from<R: Read>(reader: R, cpu: &mut Cpu, bus: &SystemBus) -> Result<(), SnapshotError> {
    let snapshot: Snapshot = bincode::deserialize_from(reader)?;
    apply(&snapshot, cpu, bus)
}

/// Save a snapshot to disk using bincode.
pub fn save<P: AsRef<Path>>(path: P, cpu: &Cpu, bus: &SystemBus) -> Result<(), SnapshotError> {
    let mut file = BufWriter::new(File::create(path.as_ref())?);
    write_to(&mut file, cpu, bus)?;
    file.flush()?;
    log::debug!("snapshot saved to {}", path.as_ref().display());
    Ok(())
}

pub fn load<P: AsRef<Path>>(path: P, cpu: &mut Cpu, bus: &SystemBus) -> Result<(), SnapshotError> {
    let file = BufReader::new(File::open(path.as_ref())?);
    read_from(file, cpu, bus)?;
    log::debug!(
        "snapshot loaded from {}, pc {:#018x}",
        path.as_ref().display(),
        cpu.pc
    );
    Ok(())
}
