//! # Hook
//!
//! This module covers hooks, which redirect execution from one location to another

use thiserror::Error;

use crate::patcher::WriteError;

pub mod jmphook;

/// Errors that could happen while installing or removing a hook
#[derive(Debug, Error)]
pub enum HookError {
    /// The rewritten length can't hold the jump to the destination
    #[error("rewrite length {len} is shorter than the {required} byte jump")]
    RewriteTooShort {
        /// Requested length
        len: usize,
        /// Length of the jump encoding
        required: usize,
    },
    /// The patcher failed to write
    #[error(transparent)]
    Write(#[from] WriteError),
}

/// Function pointers that can be used as hook sources and destinations
///
/// # Safety
///
/// `to_ptr` must return the address of the first instruction of the function
pub unsafe trait FunctionPointer: Copy {
    /// Address of the function's code
    fn to_ptr(self) -> *const u8;
}

/// Implements [`FunctionPointer`] for every ABI at one arity
macro_rules! impl_function_pointer {
    ($($arg:ident),*) => {
        impl_function_pointer!(@one fn($($arg),*) -> R; $($arg),*);
        impl_function_pointer!(@one unsafe fn($($arg),*) -> R; $($arg),*);
        impl_function_pointer!(@one extern "C" fn($($arg),*) -> R; $($arg),*);
        impl_function_pointer!(@one unsafe extern "C" fn($($arg),*) -> R; $($arg),*);
        impl_function_pointer!(@one extern "system" fn($($arg),*) -> R; $($arg),*);
        impl_function_pointer!(@one unsafe extern "system" fn($($arg),*) -> R; $($arg),*);
    };
    (@one $ty:ty; $($arg:ident),*) => {
        unsafe impl<R, $($arg),*> FunctionPointer for $ty {
            fn to_ptr(self) -> *const u8 {
                self as *const u8
            }
        }
    };
}

impl_function_pointer!();
impl_function_pointer!(A);
impl_function_pointer!(A, B);
impl_function_pointer!(A, B, C);
impl_function_pointer!(A, B, C, D);
impl_function_pointer!(A, B, C, D, E);
impl_function_pointer!(A, B, C, D, E, F);
