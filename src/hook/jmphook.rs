//! # Jump Hook
//!
//! This hook type overwrites the start of a function with a `jmp` to redirect execution

use std::slice;

use tracing::debug;

use crate::code::x86::trace::{disassemble, hex};
use crate::code::x86::{Jump, Mode};
use crate::patcher::Patcher;

use super::HookError;

/// Bytes involved in a fresh jump installation
#[derive(Debug)]
pub struct Installed {
    /// Bytes that were at the target before the jump went in
    pub saved: Box<[u8]>,
    /// Jump bytes now at the target, padded to the rewritten length
    pub jump: Box<[u8]>,
}

/// Simple jmp hook
///
/// The hook itself holds no state about the locations it patched, only how to write them.
pub struct JmpHook<P> {
    /// Underlying patcher to be used to hook
    patcher: P,
    /// Mode used to encode jumps and traces
    mode: Mode,
    /// Trace every install and restore
    debug: bool,
}
impl<P: Patcher> JmpHook<P> {
    /// Creates a new jmp hook for code of the running process
    pub fn new(patcher: P) -> Self {
        Self {
            patcher,
            mode: Mode::HOST,
            debug: false,
        }
    }

    /// Mode jumps are encoded for
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Turns tracing of installs and restores on or off
    pub fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    /// Whether installs and restores are traced
    pub fn is_debug(&self) -> bool {
        self.debug
    }

    /// Encodes the jump from `target` to `destination`, padded to `len` bytes
    pub fn encode(&self, target: usize, len: usize, destination: usize) -> Result<Box<[u8]>, HookError> {
        let jump = Jump::route(target, destination, self.mode);
        jump.encode(len).ok_or(HookError::RewriteTooShort {
            len,
            required: jump.len(),
        })
    }

    /// Saves `len` bytes at `target` and writes a jump to `destination` over them
    ///
    /// Nothing is written if the jump doesn't fit in `len` bytes or the patcher fails.
    ///
    /// # Safety
    ///
    /// - `target` must be valid for reads and writes of `len` bytes, as required by the patcher
    /// - No other thread may be about to execute the bytes being replaced unless it can tolerate the race
    pub unsafe fn install(
        &self,
        target: *mut u8,
        len: usize,
        destination: *const u8,
    ) -> Result<Installed, HookError> {
        let jump = self.encode(target as usize, len, destination as usize)?;
        let saved = capture(target, len);
        if self.debug {
            debug!(
                address = %format!("{:#x}", target as usize),
                len,
                destination = %format!("{:#x}", destination as usize),
                original = %hex(&saved),
                displaced = %disassemble(&saved, target as usize, self.mode),
                jump = %hex(&jump),
                "installing jump"
            );
        }
        self.patcher.write(target, &jump).map_err(|e| HookError::Write(e.into()))?;
        Ok(Installed { saved, jump })
    }

    /// Writes a previously encoded jump back over `target`
    ///
    /// # Safety
    ///
    /// Same as [`JmpHook::install`], with `jump` coming from an earlier install at the same `target`
    pub unsafe fn reinstall(&self, target: *mut u8, jump: &[u8]) -> Result<(), HookError> {
        if self.debug {
            debug!(
                address = %format!("{:#x}", target as usize),
                len = jump.len(),
                jump = %hex(jump),
                "reinstalling jump"
            );
        }
        self.patcher.write(target, jump).map_err(|e| HookError::Write(e.into()))?;
        Ok(())
    }

    /// Copies `saved` back over the jump at `target`
    ///
    /// # Safety
    ///
    /// Same as [`JmpHook::install`], with `saved` coming from an earlier install at the same `target`
    pub unsafe fn restore(&self, target: *mut u8, saved: &[u8]) -> Result<(), HookError> {
        if self.debug {
            debug!(
                address = %format!("{:#x}", target as usize),
                len = saved.len(),
                current = %hex(&capture(target, saved.len())),
                restored = %hex(saved),
                code = %disassemble(saved, target as usize, self.mode),
                "restoring original bytes"
            );
        }
        self.patcher.write(target, saved).map_err(|e| HookError::Write(e.into()))?;
        Ok(())
    }
}

/// Copies `len` bytes starting at `target`
///
/// # Safety
///
/// `target` must be [https://doc.rust-lang.org/stable/std/ptr/index.html#safety](valid) for reads of `len` bytes
pub unsafe fn capture(target: *const u8, len: usize) -> Box<[u8]> {
    slice::from_raw_parts(target, len).into()
}
