use clap::Parser;
use r4300_vm::bus::{RDRAM_SIZE, SystemBus};
use r4300_vm::cpu::Cpu;
use r4300_vm::cpu::cp0::{CP0_BAD_VADDR, CP0_CAUSE, CP0_EPC, CP0_STATUS};
use r4300_vm::debugger::{GdbStub, SessionEnd};
use r4300_vm::{loader, snapshot};
use std::net::TcpListener;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Cartridge image (.z64, .v64 or .n64)
    #[arg(long, conflicts_with = "elf")]
    rom: Option<PathBuf>,

    /// Bare-metal MIPS ELF loaded into RDRAM
    #[arg(long)]
    elf: Option<PathBuf>,

    /// Stop after this many instructions
    #[arg(long)]
    max_steps: Option<u64>,

    /// Log every executed instruction at trace level
    #[arg(long)]
    trace: bool,

    /// Wait for a GDB connection on this port before running
    #[arg(long, num_args = 0..=1, default_missing_value = "1337")]
    gdb: Option<u16>,

    /// Write a snapshot when execution stops
    #[arg(long)]
    save_snapshot: Option<PathBuf>,

    /// Restore a snapshot after loading the program
    #[arg(long)]
    load_snapshot: Option<PathBuf>,
}

fn print_vm_banner() {
    const BANNER: &str = r#"
    ┌─────────────────────────────────────────────────────────────┐
    │                                                             │
    │   R4300 Virtual Machine v0.1.0                              │
    │   64-bit MIPS R4300i CPU core with COP0, COP1 and TLB       │
    │                                                             │
    └─────────────────────────────────────────────────────────────┘
"#;
    println!("{}", BANNER);
}

fn print_section(title: &str) {
    println!("\n\x1b[1;36m━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\x1b[0m");
    println!("\x1b[1;33m  ▸ {}\x1b[0m", title);
    println!("\x1b[1;36m━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\x1b[0m");
}

fn print_status(component: &str, status: &str, ok: bool) {
    let status_color = if ok { "\x1b[1;32m" } else { "\x1b[1;31m" };
    let check = if ok { "✓" } else { "✗" };
    println!("    \x1b[0;37m{:<40}\x1b[0m {}[{}] {}\x1b[0m", component, status_color, check, status);
}

fn print_info(key: &str, value: &str) {
    println!("    \x1b[0;90m├─\x1b[0m \x1b[0;37m{:<20}\x1b[0m \x1b[1;97m{}\x1b[0m", key, value);
}

fn init_logging(trace: bool) {
    let mut builder = env_logger::Builder::from_default_env();
    if trace {
        builder.filter_module("r4300_vm::cpu", log::LevelFilter::Trace);
    }
    builder.init();
}

fn dump_state(cpu: &Cpu) {
    println!("PC: {:#018x}  EPC: {:#018x}", cpu.pc, cpu.cp0[CP0_EPC]);
    println!(
        "Status: {:#010x}  Cause: {:#010x}  BadVAddr: {:#018x}",
        cpu.cp0[CP0_STATUS], cpu.cp0[CP0_CAUSE], cpu.cp0[CP0_BAD_VADDR]
    );
    for i in 0..32u8 {
        if i % 4 == 0 {
            println!();
        }
        print!("r{:<2}: {:#018x} ", i, cpu.read_reg(i));
    }
    println!();
}

/// Load the requested program and leave the CPU at its first instruction.
fn boot(args: &Args) -> Result<(Cpu, SystemBus), Box<dyn std::error::Error>> {
    let mut cpu = Cpu::new(0);

    if let Some(path) = &args.rom {
        let rom = loader::load_rom(path)?;
        print_info("Format", &format!("{:?} cartridge", rom.order));
        print_info("Title", &rom.title);
        print_info("SHA-256", &rom.sha256);
        print_info("Header Entry", &format!("0x{:08X}", rom.entry));
        let bus = SystemBus::with_rom(RDRAM_SIZE, rom.data);
        loader::simulate_pif_boot(&mut cpu, &bus)?;
        print_status("PIF Boot", "SIMULATED", true);
        return Ok((cpu, bus));
    }

    let bus = SystemBus::new(RDRAM_SIZE);
    if let Some(path) = &args.elf {
        let buffer = std::fs::read(path)?;
        let entry = loader::load_elf(&buffer, &bus)?;
        loader::prepare_elf_boot(&mut cpu, entry);
        print_info("Format", "ELF Executable");
        print_info("Entry Point", &format!("{:#018x}", entry));
        print_status("Program Image", "LOADED", true);
    } else if args.load_snapshot.is_none() {
        return Err("one of --rom, --elf or --load-snapshot is required".into());
    }
    Ok((cpu, bus))
}

/// Hand control to a debugger. Returns false when execution should stop.
fn serve_gdb(port: u16, cpu: &mut Cpu, bus: &SystemBus) -> Result<bool, Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(("127.0.0.1", port))?;
    log::info!("waiting for GDB on port {}", port);
    print_info("GDB", &format!("listening on 127.0.0.1:{}", port));

    let (stream, peer) = listener.accept()?;
    log::info!("GDB connected from {}", peer);
    let mut stub = GdbStub::new(stream);
    match stub.run(cpu, bus)? {
        SessionEnd::Fatal => match stub.take_fatal() {
            Some(err) => Err(err.into()),
            None => Ok(false),
        },
        SessionEnd::Killed => Ok(false),
        SessionEnd::Detached | SessionEnd::Disconnected => Ok(true),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging(args.trace);
    print_vm_banner();

    // ─── CPU INITIALIZATION ───────────────────────────────────────────────────
    print_section("CPU INITIALIZATION");
    print_info("Architecture", "MIPS III (R4300i)");
    print_info("Coprocessors", "CP0, CP1 (FPU), CP2 latch");
    print_info("TLB", "32 entries, paired pages");

    // ─── PROGRAM IMAGE ────────────────────────────────────────────────────────
    print_section("PROGRAM IMAGE");
    let (mut cpu, bus) = boot(&args)?;
    print_info("RDRAM Size", &format!("{} MiB", RDRAM_SIZE / (1024 * 1024)));

    if let Some(path) = &args.load_snapshot {
        snapshot::load(path, &mut cpu, &bus)?;
        print_status("Snapshot", "RESTORED", true);
    }
    print_info("PC", &format!("{:#018x}", cpu.pc));

    let mut result = Ok(());
    let mut run = true;
    if let Some(port) = args.gdb {
        print_section("REMOTE DEBUGGER");
        match serve_gdb(port, &mut cpu, &bus) {
            Ok(keep_running) => run = keep_running,
            Err(e) => {
                run = false;
                result = Err(e);
            }
        }
    }

    if run {
        print_section("EXECUTION");
        let mut steps = 0u64;
        while args.max_steps.is_none_or(|max| steps < max) {
            if let Err(err) = cpu.step(&bus) {
                eprintln!("Fatal emulator error: {err}");
                dump_state(&cpu);
                result = Err(err.into());
                break;
            }
            steps += 1;
        }
        log::info!("stopped after {} instructions at {:#018x}", steps, cpu.pc);
    }

    if let Some(path) = &args.save_snapshot {
        snapshot::save(path, &cpu, &bus)?;
        print_status("Snapshot", "SAVED", true);
    }
    result
}
