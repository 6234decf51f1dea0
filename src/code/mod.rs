//! # Code
//!
//! Architecture knowledge needed to patch code: instruction lengths, jump encodings and disassembly for traces

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
compile_error!("funcpatch only supports x86 and x86_64 hosts");

pub mod x86;
