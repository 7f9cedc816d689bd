//! GDB remote serial protocol stub.
//!
//! Serves one debugger session over any byte stream. Execution only
//! happens inside `c` and `s`, so the CPU is never touched concurrently.

use std::collections::BTreeSet;
use std::io::{Read, Write};

use thiserror::Error;

use crate::bus::Bus;
use crate::cpu::core::sext32;
use crate::cpu::cp0::{CP0_BAD_VADDR, CP0_CAUSE, CP0_STATUS};
use crate::cpu::{Cpu, CpuError};
use crate::mmu::AccessType;

pub const DEFAULT_PORT: u16 = 1337;

/// Register numbering shared by `g` and `p`.
const REG_STATUS: usize = 32;
const REG_LO: usize = 33;
const REG_HI: usize = 34;
const REG_BAD_VADDR: usize = 35;
const REG_CAUSE: usize = 36;
const REG_PC: usize = 37;
const REG_FPR0: usize = 38;
const REG_FCSR: usize = 70;
const REG_FIR: usize = 71;
const REG_COUNT: usize = 72;

const SIGTRAP: &str = "S05";
const SIGABRT: &str = "S06";

const TARGET_XML: &str = r#"<?xml version="1.0"?>
<!DOCTYPE target SYSTEM "gdb-target.dtd">
<target version="1.0">
  <architecture>mips:4300</architecture>
  <feature name="org.gnu.gdb.mips.cpu">
    <reg name="r0" bitsize="64" regnum="0"/>
    <reg name="r1" bitsize="64"/>
    <reg name="r2" bitsize="64"/>
    <reg name="r3" bitsize="64"/>
    <reg name="r4" bitsize="64"/>
    <reg name="r5" bitsize="64"/>
    <reg name="r6" bitsize="64"/>
    <reg name="r7" bitsize="64"/>
    <reg name="r8" bitsize="64"/>
    <reg name="r9" bitsize="64"/>
    <reg name="r10" bitsize="64"/>
    <reg name="r11" bitsize="64"/>
    <reg name="r12" bitsize="64"/>
    <reg name="r13" bitsize="64"/>
    <reg name="r14" bitsize="64"/>
    <reg name="r15" bitsize="64"/>
    <reg name="r16" bitsize="64"/>
    <reg name="r17" bitsize="64"/>
    <reg name="r18" bitsize="64"/>
    <reg name="r19" bitsize="64"/>
    <reg name="r20" bitsize="64"/>
    <reg name="r21" bitsize="64"/>
    <reg name="r22" bitsize="64"/>
    <reg name="r23" bitsize="64"/>
    <reg name="r24" bitsize="64"/>
    <reg name="r25" bitsize="64"/>
    <reg name="r26" bitsize="64"/>
    <reg name="r27" bitsize="64"/>
    <reg name="r28" bitsize="64"/>
    <reg name="r29" bitsize="64"/>
    <reg name="r30" bitsize="64"/>
    <reg name="r31" bitsize="64"/>
    <reg name="lo" bitsize="64" regnum="33"/>
    <reg name="hi" bitsize="64" regnum="34"/>
    <reg name="pc" bitsize="64" regnum="37"/>
  </feature>
  <feature name="org.gnu.gdb.mips.cp0">
    <reg name="status" bitsize="64" regnum="32"/>
    <reg name="badvaddr" bitsize="64" regnum="35"/>
    <reg name="cause" bitsize="64" regnum="36"/>
  </feature>
  <feature name="org.gnu.gdb.mips.fpu">
    <reg name="f0" bitsize="32" type="ieee_single" regnum="38"/>
    <reg name="f1" bitsize="32" type="ieee_single"/>
    <reg name="f2" bitsize="32" type="ieee_single"/>
    <reg name="f3" bitsize="32" type="ieee_single"/>
    <reg name="f4" bitsize="32" type="ieee_single"/>
    <reg name="f5" bitsize="32" type="ieee_single"/>
    <reg name="f6" bitsize="32" type="ieee_single"/>
    <reg name="f7" bitsize="32" type="ieee_single"/>
    <reg name="f8" bitsize="32" type="ieee_single"/>
    <reg name="f9" bitsize="32" type="ieee_single"/>
    <reg name="f10" bitsize="32" type="ieee_single"/>
    <reg name="f11" bitsize="32" type="ieee_single"/>
    <reg name="f12" bitsize="32" type="ieee_single"/>
    <reg name="f13" bitsize="32" type="ieee_single"/>
    <reg name="f14" bitsize="32" type="ieee_single"/>
    <reg name="f15" bitsize="32" type="ieee_single"/>
    <reg name="f16" bitsize="32" type="ieee_single"/>
    <reg name="f17" bitsize="32" type="ieee_single"/>
    <reg name="f18" bitsize="32" type="ieee_single"/>
    <reg name="f19" bitsize="32" type="ieee_single"/>
    <reg name="f20" bitsize="32" type="ieee_single"/>
    <reg name="f21" bitsize="32" type="ieee_single"/>
    <reg name="f22" bitsize="32" type="ieee_single"/>
    <reg name="f23" bitsize="32" type="ieee_single"/>
    <reg name="f24" bitsize="32" type="ieee_single"/>
    <reg name="f25" bitsize="32" type="ieee_single"/>
    <reg name="f26" bitsize="32" type="ieee_single"/>
    <reg name="f27" bitsize="32" type="ieee_single"/>
    <reg name="f28" bitsize="32" type="ieee_single"/>
    <reg name="f29" bitsize="32" type="ieee_single"/>
    <reg name="f30" bitsize="32" type="ieee_single"/>
    <reg name="f31" bitsize="32" type="ieee_single"/>
    <reg name="fcsr" bitsize="32" group="float"/>
    <reg name="fir" bitsize="32" group="float"/>
  </feature>
</target>
"#;

#[derive(Debug, Error)]
pub enum GdbError {
    #[error("GDB connection I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed packet argument")]
    Malformed,
}

/// How a debugging session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Detached,
    Killed,
    Disconnected,
    /// The CPU hit a fatal error while running.
    Fatal,
}

enum PacketResult {
    Ok(Vec<u8>),
    BadChecksum,
    EndOfStream,
}

/// Whether to keep serving after a packet.
enum Flow {
    Continue,
    End(SessionEnd),
}

pub struct GdbStub<S> {
    stream: S,
    breakpoints: BTreeSet<u64>,
    fatal: Option<CpuError>,
}

fn ascii_hex(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn parse_hex(field: &[u8]) -> Result<u64, GdbError> {
    let text = std::str::from_utf8(field).map_err(|_| GdbError::Malformed)?;
    u64::from_str_radix(text, 16).map_err(|_| GdbError::Malformed)
}

/// GDB addresses. Eight-digit values are compatibility-segment addresses.
fn parse_addr(field: &[u8]) -> Result<u64, GdbError> {
    let addr = parse_hex(field)?;
    if addr <= 0xFFFF_FFFF {
        Ok(sext32(addr as u32))
    } else {
        Ok(addr)
    }
}

fn parse_addr_len(args: &[u8]) -> Result<(u64, usize), GdbError> {
    let mut parts = args.splitn(2, |&b| b == b',');
    let addr = parse_addr(parts.next().ok_or(GdbError::Malformed)?)?;
    let len = parse_hex(parts.next().ok_or(GdbError::Malformed)?)? as usize;
    Ok((addr, len))
}

/// `TYPE,ADDR,KIND`
fn parse_breakpoint(args: &[u8]) -> Result<(u8, u64), GdbError> {
    let mut parts = args.split(|&b| b == b',');
    let kind = *parts
        .next()
        .and_then(|t| t.first())
        .ok_or(GdbError::Malformed)?;
    let addr = parse_addr(parts.next().ok_or(GdbError::Malformed)?)?;
    Ok((kind, addr))
}

impl<S: Read + Write> GdbStub<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            breakpoints: BTreeSet::new(),
            fatal: None,
        }
    }

    pub fn breakpoints(&self) -> &BTreeSet<u64> {
        &self.breakpoints
    }

    /// Fatal CPU error that ended the session, if any.
    pub fn take_fatal(&mut self) -> Option<CpuError> {
        self.fatal.take()
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Serve requests until the debugger detaches, kills the target or
    /// disconnects.
    pub fn run(&mut self, cpu: &mut Cpu, bus: &dyn Bus) -> Result<SessionEnd, GdbError> {
        loop {
            match self.next_packet()? {
                PacketResult::Ok(packet) => {
                    self.stream.write_all(b"+")?;
                    if let Flow::End(end) = self.handle_packet(cpu, bus, &packet)? {
                        log::info!("GDB session ended: {:?}", end);
                        return Ok(end);
                    }
                }
                PacketResult::BadChecksum => self.stream.write_all(b"-")?,
                PacketResult::EndOfStream => return Ok(SessionEnd::Disconnected),
            }
        }
    }

    fn read_byte(&mut self) -> Result<Option<u8>, GdbError> {
        let mut buf = [0u8; 1];
        match self.stream.read(&mut buf)? {
            0 => Ok(None),
            _ => Ok(Some(buf[0])),
        }
    }

    /// Parse one `$data#cc` frame, skipping acks and anything outside a frame.
    fn next_packet(&mut self) -> Result<PacketResult, GdbError> {
        enum State {
            WaitForStart,
            InPacket,
            WaitForCheckSum,
            WaitForCheckSum2(u8),
        }

        let mut state = State::WaitForStart;
        let mut packet = Vec::new();
        let mut csum = 0u8;

        while let Some(byte) = self.read_byte()? {
            match state {
                State::WaitForStart => {
                    if byte == b'$' {
                        state = State::InPacket;
                    }
                }
                State::InPacket => {
                    if byte == b'#' {
                        state = State::WaitForCheckSum;
                    } else {
                        packet.push(byte);
                        csum = csum.wrapping_add(byte);
                    }
                }
                State::WaitForCheckSum => match ascii_hex(byte) {
                    Some(hi) => state = State::WaitForCheckSum2(hi),
                    None => return Ok(PacketResult::BadChecksum),
                },
                State::WaitForCheckSum2(hi) => {
                    let expected = ascii_hex(byte).map(|lo| (hi << 4) | lo);
                    if expected != Some(csum) {
                        log::warn!("GDB checksum mismatch: {:?} vs {:02x}", expected, csum);
                        return Ok(PacketResult::BadChecksum);
                    }
                    return Ok(PacketResult::Ok(packet));
                }
            }
        }
        Ok(PacketResult::EndOfStream)
    }

    fn send(&mut self, data: &[u8]) -> Result<(), GdbError> {
        let csum = data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
        let mut frame = Vec::with_capacity(data.len() + 4);
        frame.push(b'$');
        frame.extend_from_slice(data);
        frame.extend_from_slice(format!("#{:02x}", csum).as_bytes());
        self.stream.write_all(&frame)?;
        self.stream.flush()?;
        Ok(())
    }

    fn send_ok(&mut self) -> Result<(), GdbError> {
        self.send(b"OK")
    }

    fn send_error(&mut self) -> Result<(), GdbError> {
        self.send(b"E01")
    }

    fn handle_packet(&mut self, cpu: &mut Cpu, bus: &dyn Bus, packet: &[u8]) -> Result<Flow, GdbError> {
        let Some((&command, args)) = packet.split_first() else {
            self.send(b"")?;
            return Ok(Flow::Continue);
        };

        let result = match command {
            b'?' => self.send(SIGTRAP.as_bytes()),
            b'g' => self.read_registers(cpu),
            b'p' => self.read_register(cpu, args),
            b'm' => self.read_memory(cpu, bus, args),
            b'M' => self.write_memory(cpu, bus, args),
            b'Z' => self.add_breakpoint(args),
            b'z' => self.del_breakpoint(args),
            b's' => return self.step(cpu, bus),
            b'c' => return self.resume(cpu, bus),
            b'H' => self.send_ok(),
            b'q' => self.handle_query(args),
            b'D' => {
                self.send_ok()?;
                return Ok(Flow::End(SessionEnd::Detached));
            }
            b'k' => return Ok(Flow::End(SessionEnd::Killed)),
            _ => self.send(b""),
        };

        match result {
            Ok(()) => {}
            Err(GdbError::Malformed) => self.send_error()?,
            Err(e) => return Err(e),
        }
        Ok(Flow::Continue)
    }

    fn register_value(cpu: &Cpu, reg: usize) -> Option<Vec<u8>> {
        let fr = cpu.fr();
        let bytes = match reg {
            0..=31 => cpu.read_reg(reg as u8).to_be_bytes().to_vec(),
            REG_STATUS => cpu.cp0[CP0_STATUS].to_be_bytes().to_vec(),
            REG_LO => cpu.lo.to_be_bytes().to_vec(),
            REG_HI => cpu.hi.to_be_bytes().to_vec(),
            REG_BAD_VADDR => cpu.cp0[CP0_BAD_VADDR].to_be_bytes().to_vec(),
            REG_CAUSE => cpu.cp0[CP0_CAUSE].to_be_bytes().to_vec(),
            REG_PC => cpu.pc.to_be_bytes().to_vec(),
            r if (REG_FPR0..REG_FPR0 + 32).contains(&r) => {
                cpu.fpu.read_word(r - REG_FPR0, fr).to_be_bytes().to_vec()
            }
            REG_FCSR => cpu.fpu.fcr31.to_be_bytes().to_vec(),
            REG_FIR => cpu.fpu.fcr0.to_be_bytes().to_vec(),
            _ => return None,
        };
        Some(bytes)
    }

    fn read_registers(&mut self, cpu: &Cpu) -> Result<(), GdbError> {
        let mut dump = String::new();
        for reg in 0..REG_COUNT {
            if let Some(bytes) = Self::register_value(cpu, reg) {
                dump.push_str(&hex::encode(bytes));
            }
        }
        self.send(dump.as_bytes())
    }

    fn read_register(&mut self, cpu: &Cpu, args: &[u8]) -> Result<(), GdbError> {
        let reg = parse_hex(args)? as usize;
        match Self::register_value(cpu, reg) {
            Some(bytes) => self.send(hex::encode(bytes).as_bytes()),
            None => self.send_error(),
        }
    }

    /// Reads go through the TLB without raising exceptions. The reply is
    /// truncated at the first unreadable byte.
    fn read_memory(&mut self, cpu: &Cpu, bus: &dyn Bus, args: &[u8]) -> Result<(), GdbError> {
        let (addr, len) = parse_addr_len(args)?;
        let mut data = Vec::with_capacity(len);
        for i in 0..len as u64 {
            let vaddr = addr.wrapping_add(i);
            let byte = cpu
                .translate_pure(vaddr, AccessType::Load)
                .and_then(|paddr| bus.read8(paddr).ok());
            match byte {
                Some(b) => data.push(b),
                None => break,
            }
        }
        if data.is_empty() && len > 0 {
            return self.send(b"E14");
        }
        self.send(hex::encode(data).as_bytes())
    }

    fn write_memory(&mut self, cpu: &Cpu, bus: &dyn Bus, args: &[u8]) -> Result<(), GdbError> {
        let colon = args
            .iter()
            .position(|&b| b == b':')
            .ok_or(GdbError::Malformed)?;
        let (addr, len) = parse_addr_len(&args[..colon])?;
        let data = hex::decode(&args[colon + 1..]).map_err(|_| GdbError::Malformed)?;
        if data.len() != len {
            return Err(GdbError::Malformed);
        }
        for (i, byte) in data.into_iter().enumerate() {
            let vaddr = addr.wrapping_add(i as u64);
            let written = cpu
                .translate_pure(vaddr, AccessType::Load)
                .map(|paddr| bus.write8(paddr, byte).is_ok())
                .unwrap_or(false);
            if !written {
                return self.send(b"E14");
            }
        }
        self.send_ok()
    }

    fn add_breakpoint(&mut self, args: &[u8]) -> Result<(), GdbError> {
        let (kind, addr) = parse_breakpoint(args)?;
        if kind != b'0' {
            return self.send(b"");
        }
        log::debug!("breakpoint set at {:#018x}", addr);
        self.breakpoints.insert(addr);
        self.send_ok()
    }

    fn del_breakpoint(&mut self, args: &[u8]) -> Result<(), GdbError> {
        let (kind, addr) = parse_breakpoint(args)?;
        if kind != b'0' {
            return self.send(b"");
        }
        self.breakpoints.remove(&addr);
        self.send_ok()
    }

    fn stop_on_fatal(&mut self, err: CpuError) -> Result<Flow, GdbError> {
        self.send(SIGABRT.as_bytes())?;
        self.fatal = Some(err);
        Ok(Flow::End(SessionEnd::Fatal))
    }

    fn step(&mut self, cpu: &mut Cpu, bus: &dyn Bus) -> Result<Flow, GdbError> {
        if let Err(err) = cpu.step(bus) {
            return self.stop_on_fatal(err);
        }
        self.send(SIGTRAP.as_bytes())?;
        Ok(Flow::Continue)
    }

    /// Run until the PC reaches a breakpoint.
    fn resume(&mut self, cpu: &mut Cpu, bus: &dyn Bus) -> Result<Flow, GdbError> {
        loop {
            if let Err(err) = cpu.step(bus) {
                return self.stop_on_fatal(err);
            }
            if self.breakpoints.contains(&cpu.pc) {
                break;
            }
        }
        self.send(SIGTRAP.as_bytes())?;
        Ok(Flow::Continue)
    }

    fn handle_query(&mut self, args: &[u8]) -> Result<(), GdbError> {
        if args.starts_with(b"Supported") {
            return self.send(b"PacketSize=4000;qXfer:features:read+");
        }
        if args == b"Attached" {
            return self.send(b"1");
        }
        if let Some(rest) = args.strip_prefix(b"Xfer:features:read:target.xml:") {
            let (offset, len) = parse_addr_len(rest)?;
            // Offsets are plain numbers, not addresses.
            let offset = (offset as u32) as usize;
            let xml = TARGET_XML.as_bytes();
            let start = offset.min(xml.len());
            let end = start.saturating_add(len).min(xml.len());
            let marker = if end == xml.len() { b'l' } else { b'm' };
            let mut reply = vec![marker];
            reply.extend_from_slice(&xml[start..end]);
            return self.send(&reply);
        }
        self.send(b"")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::SystemBus;
    use std::io::Cursor;

    const BASE: u64 = 0xFFFF_FFFF_8000_1000;

    struct MockStream {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.output.write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn frame(data: &str) -> String {
        let csum = data.bytes().fold(0u8, |acc, b| acc.wrapping_add(b));
        format!("${}#{:02x}", data, csum)
    }

    fn session(packets: &[&str], cpu: &mut Cpu, bus: &SystemBus) -> (SessionEnd, String) {
        let input: String = packets.iter().map(|p| frame(p)).collect();
        let stream = MockStream {
            input: Cursor::new(input.into_bytes()),
            output: Vec::new(),
        };
        let mut stub = GdbStub::new(stream);
        let end = stub.run(cpu, bus).unwrap();
        let output = String::from_utf8(stub.into_inner().output).unwrap();
        (end, output)
    }

    #[test]
    fn stop_reason_is_acked_and_framed() {
        let bus = SystemBus::new(0x10_0000);
        let mut cpu = Cpu::new(BASE);
        let (end, out) = session(&["?"], &mut cpu, &bus);
        assert_eq!(end, SessionEnd::Disconnected);
        assert_eq!(out, format!("+{}", frame("S05")));
    }

    #[test]
    fn bad_checksum_is_nacked() {
        let bus = SystemBus::new(0x10_0000);
        let mut cpu = Cpu::new(BASE);
        let stream = MockStream {
            input: Cursor::new(b"$?#00".to_vec()),
            output: Vec::new(),
        };
        let mut stub = GdbStub::new(stream);
        stub.run(&mut cpu, &bus).unwrap();
        assert_eq!(stub.into_inner().output, b"-");
    }

    #[test]
    fn register_dump_layout() {
        let bus = SystemBus::new(0x10_0000);
        let mut cpu = Cpu::new(BASE);
        cpu.write_reg(1, 0x1122_3344_5566_7788);
        cpu.fpu.fcr31 = 0x0100_0000;
        let (_, out) = session(&["g", "p25", "p1"], &mut cpu, &bus);

        let replies: Vec<&str> = out
            .split('$')
            .skip(1)
            .filter_map(|r| r.split('#').next())
            .collect();
        let dump = replies[0];
        assert_eq!(dump.len(), 38 * 16 + 34 * 8);
        assert_eq!(&dump[16..32], "1122334455667788");
        assert_eq!(&dump[37 * 16..38 * 16], "ffffffff80001000");
        // fcsr follows the 32 single-width FPRs.
        let fcsr = 38 * 16 + 32 * 8;
        assert_eq!(&dump[fcsr..fcsr + 8], "01000000");
        // p25 is pc (register 37).
        assert_eq!(replies[1], "ffffffff80001000");
        assert_eq!(replies[2], "1122334455667788");
    }

    #[test]
    fn memory_read_and_write() {
        let bus = SystemBus::new(0x10_0000);
        let mut cpu = Cpu::new(BASE);
        bus.write32(0x2000, 0xDEAD_BEEF).unwrap();
        let (_, out) = session(
            &["m80002000,4", "M80002004,2:abcd", "m80002004,2", "m7f000000,4"],
            &mut cpu,
            &bus,
        );
        assert!(out.contains(&frame("deadbeef")));
        assert!(out.contains(&frame("OK")));
        assert!(out.contains(&frame("abcd")));
        // Unmapped user-segment address with an empty TLB.
        assert!(out.contains(&frame("E14")));
        assert_eq!(bus.read16(0x2004).unwrap(), 0xABCD);
    }

    #[test]
    fn continue_stops_at_breakpoint() {
        let bus = SystemBus::new(0x10_0000);
        let mut cpu = Cpu::new(BASE);
        let (end, out) = session(&["Z0,80001010,4", "c", "s", "z0,80001010,4", "D"], &mut cpu, &bus);
        assert_eq!(end, SessionEnd::Detached);
        assert_eq!(cpu.pc, BASE + 0x14);
        assert_eq!(out.matches(&frame("S05")).count(), 2);
    }

    #[test]
    fn fatal_error_ends_session() {
        let bus = SystemBus::new(0x10_0000);
        let mut cpu = Cpu::new(0xFFFF_FFFF_8FF0_0000);
        let stream = MockStream {
            input: Cursor::new(frame("c").into_bytes()),
            output: Vec::new(),
        };
        let mut stub = GdbStub::new(stream);
        assert_eq!(stub.run(&mut cpu, &bus).unwrap(), SessionEnd::Fatal);
        assert!(matches!(stub.take_fatal(), Some(CpuError::Bus(_))));
    }

    #[test]
    fn queries() {
        let bus = SystemBus::new(0x10_0000);
        let mut cpu = Cpu::new(BASE);
        let (end, out) = session(
            &["qSupported:multiprocess+", "qAttached", "qXfer:features:read:target.xml:0,fff", "qC", "k"],
            &mut cpu,
            &bus,
        );
        assert_eq!(end, SessionEnd::Killed);
        assert!(out.contains(&frame("PacketSize=4000;qXfer:features:read+")));
        assert!(out.contains(&frame("1")));
        assert!(out.contains("mips:4300"));
        assert!(out.contains(&frame("")));
    }
}
