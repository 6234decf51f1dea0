//! # x86
//!
//! Jump encodings for 32-bit and 64-bit x86

use std::sync::atomic::{self, Ordering};

pub mod length;
pub mod trace;

/// Size of the shortest unconditional jump (`jmp rel32`)
pub const MIN_JUMP_LEN: usize = 5;

/// Size of the absolute 64-bit jump (`jmp [rip + 0]` followed by the address)
pub const ABS_JUMP_LEN: usize = 14;

/// Single-byte `nop` used to pad a jump up to the rewritten length
pub const NOP: u8 = 0x90;

/// Opcode of `jmp rel32`
const JMP_REL32: u8 = 0xe9;

/// `jmp [rip + 0]`, the address follows immediately after
const JMP_ABS_PREFIX: [u8; 6] = [0xff, 0x25, 0x00, 0x00, 0x00, 0x00];

/// Operating mode of the code being patched
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Protected mode, 32-bit operands and addresses
    Bits32,
    /// Long mode, REX prefixes and 64-bit addresses
    Bits64,
}
impl Mode {
    /// Mode of the running process
    #[cfg(target_arch = "x86_64")]
    pub const HOST: Mode = Mode::Bits64;
    /// Mode of the running process
    #[cfg(target_arch = "x86")]
    pub const HOST: Mode = Mode::Bits32;

    /// Bitness as expected by [`iced_x86::Decoder`]
    pub fn bitness(self) -> u32 {
        match self {
            Mode::Bits32 => 32,
            Mode::Bits64 => 64,
        }
    }
}

/// Unconditional jump from a patched location to its destination
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Jump {
    /// `jmp rel32`, displacement relative to the end of the jump
    Rel32 {
        /// Address of the jump itself
        from: usize,
        /// Displacement from `from + 5`
        displacement: i32,
    },
    /// `jmp [rip + 0]` followed by the absolute destination, 64-bit only
    Abs64 {
        /// Absolute destination
        destination: u64,
    },
}
impl Jump {
    /// Picks the shortest jump that gets from `from` to `to`
    ///
    /// 32-bit displacements wrap around the address space, so `Rel32` always reaches in 32-bit mode.
    /// In 64-bit mode the absolute form is used once `to` is out of the +/-2 GiB window.
    pub fn route(from: usize, to: usize, mode: Mode) -> Self {
        let next = from.wrapping_add(MIN_JUMP_LEN);
        let displacement = (to as isize).wrapping_sub(next as isize);
        match (mode, i32::try_from(displacement)) {
            (Mode::Bits32, _) => Jump::Rel32 {
                from,
                displacement: displacement as i32,
            },
            (Mode::Bits64, Ok(displacement)) => Jump::Rel32 { from, displacement },
            (Mode::Bits64, Err(_)) => Jump::Abs64 {
                destination: to as u64,
            },
        }
    }

    /// Number of bytes the jump occupies before padding
    pub fn len(&self) -> usize {
        match self {
            Jump::Rel32 { .. } => MIN_JUMP_LEN,
            Jump::Abs64 { .. } => ABS_JUMP_LEN,
        }
    }

    /// Encodes the jump, padded with `nop` up to `len` bytes
    ///
    /// Returns `None` if `len` is too short to hold the jump
    pub fn encode(&self, len: usize) -> Option<Box<[u8]>> {
        if len < self.len() {
            return None;
        }
        let mut bytes = vec![NOP; len];
        match *self {
            Jump::Rel32 { displacement, .. } => {
                bytes[..MIN_JUMP_LEN].copy_from_slice(&jmp_rel32(displacement));
            }
            Jump::Abs64 { destination } => {
                bytes[..ABS_JUMP_LEN].copy_from_slice(&jmp_abs(destination));
            }
        }
        Some(bytes.into_boxed_slice())
    }
}

/// Generates a relative jump with the given displacement
pub fn jmp_rel32(displacement: i32) -> [u8; MIN_JUMP_LEN] {
    let mut bytes = [0; MIN_JUMP_LEN];
    bytes[0] = JMP_REL32;
    bytes[1..].copy_from_slice(&displacement.to_le_bytes());
    bytes
}

/// Generates an absolute jump to a specified address and returns bytecode
pub fn jmp_abs(target: u64) -> [u8; ABS_JUMP_LEN] {
    let mut bytes = [0; ABS_JUMP_LEN];
    bytes[..JMP_ABS_PREFIX.len()].copy_from_slice(&JMP_ABS_PREFIX);
    bytes[JMP_ABS_PREFIX.len()..].copy_from_slice(&target.to_le_bytes());
    bytes
}

/// Makes freshly written code visible to instruction fetch
///
/// x86 keeps instruction caches coherent with stores, so only ordering is needed here
pub fn flush_instruction_cache(_location: *const u8, _len: usize) {
    atomic::fence(Ordering::SeqCst);
}
