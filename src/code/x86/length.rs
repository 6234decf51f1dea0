//! # Length
//!
//! Table-driven instruction length decoding. Instructions are classified by their prefixes, opcode,
//! ModRM/SIB bytes and immediates only; nothing is executed and operands are never interpreted.

use std::slice;

use thiserror::Error;

use super::Mode;

/// Longest legal x86 instruction
pub const MAX_INSTR_LEN: usize = 15;

/// Errors while walking instructions
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum LengthError {
    /// The table doesn't know the instruction at `address`
    #[error("unrecognized opcode {opcode:#04x} at {address:#x} after {consumed} bytes")]
    UnrecognizedOpcode {
        /// Address of the first byte of the unrecognized instruction
        address: usize,
        /// Opcode byte that stopped the walk
        opcode: u8,
        /// Bytes of whole instructions consumed before it
        consumed: usize,
    },
    /// The code ran out in the middle of an instruction
    #[error("code at {address:#x} ends inside an instruction after {consumed} bytes")]
    Truncated {
        /// Address of the cut-off instruction
        address: usize,
        /// Bytes of whole instructions consumed before it
        consumed: usize,
    },
}

/// How an opcode is followed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Op {
    /// Not in the table
    Bad,
    /// Legacy prefix
    Prefix,
    /// `0x0f` escape into the two-byte map
    Escape,
    /// Opcode only
    Plain,
    /// ModRM operand
    ModRm,
    /// ModRM operand and 8-bit immediate
    ModRmIb,
    /// ModRM operand and 16/32-bit immediate
    ModRmIz,
    /// 8-bit immediate or displacement
    Ib,
    /// 16-bit immediate
    Iw,
    /// 16/32-bit immediate
    Iz,
    /// 16/32/64-bit immediate of `mov r, imm`
    Iv,
    /// `enter imm16, imm8`
    IwIb,
    /// Direct memory offset of `mov al/eax <-> moffs`
    Moffs,
    /// 16/32-bit relative branch displacement
    Jz,
    /// Far pointer `ptr16:16/32`
    Ap,
    /// `test r/m8, imm8` in group 3, everything else in it has no immediate
    Group3b,
    /// `test r/m, imm` in group 3, everything else in it has no immediate
    Group3z,
}

/// Classification of the one-byte opcode map
const fn one_byte(opcode: u8, mode: Mode) -> Op {
    let long = matches!(mode, Mode::Bits64);
    match opcode {
        // add/or/adc/sbb/and/sub/xor/cmp share one layout per row
        0x00..=0x3f if opcode & 0x07 < 0x04 => Op::ModRm,
        0x00..=0x3f if opcode & 0x07 == 0x04 => Op::Ib,
        0x00..=0x3f if opcode & 0x07 == 0x05 => Op::Iz,
        0x26 | 0x2e | 0x36 | 0x3e => Op::Prefix,
        0x0f => Op::Escape,
        // push/pop segment and the BCD adjusts are gone in long mode
        0x06 | 0x07 | 0x0e | 0x16 | 0x17 | 0x1e | 0x1f | 0x27 | 0x2f | 0x37 | 0x3f => {
            if long {
                Op::Bad
            } else {
                Op::Plain
            }
        }
        // inc/dec in 32-bit mode, REX handled by the caller in 64-bit mode
        0x40..=0x4f => Op::Plain,
        0x50..=0x5f => Op::Plain,
        0x60 | 0x61 => {
            if long {
                Op::Bad
            } else {
                Op::Plain
            }
        }
        // bound in 32-bit mode, EVEX in 64-bit mode
        0x62 => {
            if long {
                Op::Bad
            } else {
                Op::ModRm
            }
        }
        // arpl / movsxd
        0x63 => Op::ModRm,
        0x64..=0x67 => Op::Prefix,
        0x68 => Op::Iz,
        0x69 => Op::ModRmIz,
        0x6a => Op::Ib,
        0x6b => Op::ModRmIb,
        0x6c..=0x6f => Op::Plain,
        0x70..=0x7f => Op::Ib,
        0x80 | 0x83 => Op::ModRmIb,
        0x81 => Op::ModRmIz,
        0x82 => {
            if long {
                Op::Bad
            } else {
                Op::ModRmIb
            }
        }
        0x84..=0x8f => Op::ModRm,
        0x90..=0x99 | 0x9b..=0x9f => Op::Plain,
        0x9a => {
            if long {
                Op::Bad
            } else {
                Op::Ap
            }
        }
        0xa0..=0xa3 => Op::Moffs,
        0xa4..=0xa7 | 0xaa..=0xaf => Op::Plain,
        0xa8 => Op::Ib,
        0xa9 => Op::Iz,
        0xb0..=0xb7 => Op::Ib,
        0xb8..=0xbf => Op::Iv,
        0xc0 | 0xc1 => Op::ModRmIb,
        0xc2 | 0xca => Op::Iw,
        0xc3 | 0xc9 | 0xcb | 0xcc | 0xcf => Op::Plain,
        // les/lds overlap VEX, which the table doesn't cover
        0xc4 | 0xc5 => Op::Bad,
        0xc6 => Op::ModRmIb,
        0xc7 => Op::ModRmIz,
        0xc8 => Op::IwIb,
        0xcd => Op::Ib,
        0xce => {
            if long {
                Op::Bad
            } else {
                Op::Plain
            }
        }
        0xd0..=0xd3 => Op::ModRm,
        0xd4 | 0xd5 => {
            if long {
                Op::Bad
            } else {
                Op::Ib
            }
        }
        0xd6 => Op::Bad,
        0xd7 => Op::Plain,
        // x87
        0xd8..=0xdf => Op::ModRm,
        0xe0..=0xe7 => Op::Ib,
        0xe8 | 0xe9 => Op::Jz,
        0xea => {
            if long {
                Op::Bad
            } else {
                Op::Ap
            }
        }
        0xeb => Op::Ib,
        0xec..=0xef => Op::Plain,
        0xf0 | 0xf2 | 0xf3 => Op::Prefix,
        0xf1 | 0xf4 | 0xf5 | 0xf8..=0xfd => Op::Plain,
        0xf6 => Op::Group3b,
        0xf7 => Op::Group3z,
        0xfe | 0xff => Op::ModRm,
        _ => Op::Bad,
    }
}

/// Classification of the `0x0f` two-byte opcode map
const fn two_byte(opcode: u8, mode: Mode) -> Op {
    match opcode {
        0x05 => {
            if matches!(mode, Mode::Bits64) {
                Op::Plain
            } else {
                Op::Bad
            }
        }
        0x0b | 0x31 | 0x77 | 0xa2 => Op::Plain,
        0x0d => Op::ModRm,
        // SSE moves, prefetch and the multi-byte nop
        0x10..=0x1f => Op::ModRm,
        0x28..=0x2f => Op::ModRm,
        // cmovcc
        0x40..=0x4f => Op::ModRm,
        0x50..=0x6f => Op::ModRm,
        0x70..=0x73 => Op::ModRmIb,
        0x74..=0x76 | 0x7e | 0x7f => Op::ModRm,
        // jcc rel32
        0x80..=0x8f => Op::Jz,
        // setcc
        0x90..=0x9f => Op::ModRm,
        0xa3 | 0xa5 | 0xab | 0xad | 0xae | 0xaf => Op::ModRm,
        0xa4 | 0xac => Op::ModRmIb,
        0xb0 | 0xb1 | 0xb3 | 0xb6 | 0xb7 | 0xbb..=0xbf => Op::ModRm,
        0xba => Op::ModRmIb,
        0xc0 | 0xc1 | 0xc3 | 0xc7 => Op::ModRm,
        0xc2 | 0xc4..=0xc6 => Op::ModRmIb,
        // bswap
        0xc8..=0xcf => Op::Plain,
        0xd0..=0xfe => Op::ModRm,
        _ => Op::Bad,
    }
}

/// Reads bytes of a single instruction and tracks the cursor
struct Cursor<'a> {
    /// Code being decoded
    code: &'a [u8],
    /// Offset of the next unread byte
    offset: usize,
}
impl Cursor<'_> {
    /// Reads the next byte, `None` once the code runs out
    fn next(&mut self) -> Option<u8> {
        let byte = *self.code.get(self.offset)?;
        self.offset += 1;
        Some(byte)
    }

    /// Skips `count` bytes, `None` if fewer remain
    fn skip(&mut self, count: usize) -> Option<()> {
        if self.code.len() - self.offset < count {
            return None;
        }
        self.offset += count;
        Some(())
    }
}

/// Result of classifying one instruction
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Decoded {
    /// Whole instruction of this length
    Length(usize),
    /// Opcode byte not in the table
    Unknown(u8),
    /// Code ended inside the instruction
    Truncated,
}

/// Size of the operands following a ModRM byte (SIB and displacement, not the ModRM itself)
fn modrm_tail(modrm: u8, cursor: &mut Cursor<'_>, addr16: bool) -> Option<()> {
    let mode = modrm >> 6;
    let rm = modrm & 0x07;
    if mode == 0b11 {
        return Some(());
    }
    if addr16 {
        let disp = match (mode, rm) {
            (0b00, 0b110) => 2,
            (0b00, _) => 0,
            (0b01, _) => 1,
            _ => 2,
        };
        return cursor.skip(disp);
    }
    let mut disp = match mode {
        0b01 => 1,
        0b10 => 4,
        _ => 0,
    };
    if rm == 0b100 {
        let sib = cursor.next()?;
        if mode == 0b00 && sib & 0x07 == 0b101 {
            disp = 4;
        }
    } else if mode == 0b00 && rm == 0b101 {
        // disp32, or rip-relative in 64-bit mode
        disp = 4;
    }
    cursor.skip(disp)
}

/// Length of the first instruction in `code`
fn decode(code: &[u8], mode: Mode) -> Decoded {
    let long = matches!(mode, Mode::Bits64);
    let mut cursor = Cursor { code, offset: 0 };
    let mut opsize16 = false;
    let mut addrsize = false;
    let mut rex_w = false;

    let (op, opcode) = loop {
        let Some(byte) = cursor.next() else {
            return Decoded::Truncated;
        };
        if cursor.offset > MAX_INSTR_LEN {
            return Decoded::Unknown(byte);
        }
        if long && (0x40..=0x4f).contains(&byte) {
            rex_w = byte & 0x08 != 0;
            continue;
        }
        match one_byte(byte, mode) {
            Op::Prefix => {
                // a REX prefix only counts when it comes last
                rex_w = false;
                match byte {
                    0x66 => opsize16 = true,
                    0x67 => addrsize = true,
                    _ => {}
                }
            }
            Op::Escape => {
                let Some(second) = cursor.next() else {
                    return Decoded::Truncated;
                };
                let op = match second {
                    // three-byte maps: 0f 38 xx /r and 0f 3a xx /r ib
                    0x38 | 0x3a => {
                        if cursor.next().is_none() {
                            return Decoded::Truncated;
                        }
                        if second == 0x38 {
                            Op::ModRm
                        } else {
                            Op::ModRmIb
                        }
                    }
                    _ => two_byte(second, mode),
                };
                break (op, second);
            }
            op => {
                // EVEX and XOP reuse these opcodes and are told apart by the byte after them
                match (byte, cursor.code.get(cursor.offset)) {
                    (0x62, Some(&modrm)) if modrm >> 6 == 0b11 => return Decoded::Unknown(byte),
                    (0x8f, Some(&modrm)) if (modrm >> 3) & 0x07 != 0 => {
                        return Decoded::Unknown(byte)
                    }
                    _ => break (op, byte),
                }
            }
        }
    };

    // 16-bit immediates under 0x66 unless REX.W wins, 64-bit mode pins rel32 below
    let iz = if opsize16 && !rex_w { 2 } else { 4 };
    let addr16 = addrsize && !long;

    let tail = match op {
        Op::Bad | Op::Prefix | Op::Escape => return Decoded::Unknown(opcode),
        Op::Plain => Some(()),
        Op::ModRm | Op::ModRmIb | Op::ModRmIz | Op::Group3b | Op::Group3z => {
            cursor.next().and_then(|modrm| {
                modrm_tail(modrm, &mut cursor, addr16)?;
                let test = (modrm >> 3) & 0x07 < 2;
                match op {
                    Op::ModRmIb => cursor.skip(1),
                    Op::ModRmIz => cursor.skip(iz),
                    Op::Group3b if test => cursor.skip(1),
                    Op::Group3z if test => cursor.skip(iz),
                    _ => Some(()),
                }
            })
        }
        Op::Ib => cursor.skip(1),
        Op::Iw => cursor.skip(2),
        Op::Iz => cursor.skip(iz),
        Op::Iv => cursor.skip(if rex_w { 8 } else { iz }),
        Op::IwIb => cursor.skip(3),
        Op::Moffs => cursor.skip(match (long, addrsize) {
            (true, false) => 8,
            (true, true) | (false, false) => 4,
            (false, true) => 2,
        }),
        Op::Jz => cursor.skip(if long { 4 } else { iz }),
        Op::Ap => cursor.skip(iz + 2),
    };

    match tail {
        Some(()) if cursor.offset <= MAX_INSTR_LEN => Decoded::Length(cursor.offset),
        Some(()) => Decoded::Unknown(opcode),
        None => Decoded::Truncated,
    }
}

/// Returns the length of the first instruction in `code`, or `None` if the table can't classify it
pub fn instruction_len(code: &[u8], mode: Mode) -> Option<usize> {
    match decode(code, mode) {
        Decoded::Length(len) => Some(len),
        _ => None,
    }
}

/// Walks whole instructions from the start of `code` until at least `min_len` bytes are covered
///
/// `base` is the address `code` was read from and only shows up in errors.
pub fn resolve_slice(
    code: &[u8],
    base: usize,
    min_len: usize,
    mode: Mode,
) -> Result<usize, LengthError> {
    let mut consumed = 0;
    while consumed < min_len {
        let address = base.wrapping_add(consumed);
        let rest = code.get(consumed..).unwrap_or_default();
        match decode(rest, mode) {
            Decoded::Length(len) => consumed += len,
            Decoded::Unknown(opcode) => {
                return Err(LengthError::UnrecognizedOpcode {
                    address,
                    opcode,
                    consumed,
                })
            }
            Decoded::Truncated => return Err(LengthError::Truncated { address, consumed }),
        }
    }
    Ok(consumed)
}

/// Resolves how many bytes starting at `location` can be overwritten without splitting an instruction
///
/// # Safety
///
/// - `location` must be [https://doc.rust-lang.org/stable/std/ptr/index.html#safety](valid) for reads of `min_len` + `MAX_INSTR_LEN - 1` bytes
pub unsafe fn resolve(location: *const u8, min_len: usize, mode: Mode) -> Result<usize, LengthError> {
    // Add MAX_INSTR_LEN - 1 in case we stop on the first byte of the longest instruction
    let code = slice::from_raw_parts(location, min_len + MAX_INSTR_LEN - 1);
    resolve_slice(code, location as usize, min_len, mode)
}
