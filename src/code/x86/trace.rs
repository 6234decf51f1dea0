//! # Trace
//!
//! Human-readable dumps of patched code for debug output

use std::fmt::Write;

use iced_x86::{Decoder, DecoderOptions, Formatter, NasmFormatter};

use super::Mode;

/// Formats bytes as space separated hex pairs
pub fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, byte) in bytes.iter().enumerate() {
        if i != 0 {
            out.push(' ');
        }
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Disassembles `code` as if it lived at `address`, one instruction per `; ` separated entry
pub fn disassemble(code: &[u8], address: usize, mode: Mode) -> String {
    let decoder = Decoder::with_ip(mode.bitness(), code, address as u64, DecoderOptions::NONE);
    let mut formatter = NasmFormatter::new();
    let mut out = String::new();
    let mut line = String::new();
    for instruction in decoder {
        if !out.is_empty() {
            out.push_str("; ");
        }
        if instruction.is_invalid() {
            out.push_str("(bad)");
            continue;
        }
        line.clear();
        formatter.format(&instruction, &mut line);
        out.push_str(&line);
    }
    out
}
