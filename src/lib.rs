#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::missing_crate_level_docs)]
#![doc = include_str!("../README.md")]

pub mod code;
pub mod engine;
pub mod error;
pub mod hook;
pub mod patcher;
pub mod plugin;
pub mod registry;

#[cfg(test)]
mod test_util;

pub use error::PatchError;
pub use hook::FunctionPointer;
pub use plugin::{Plugin, PluginFlags, PluginHost, PluginInfo};
pub use registry::{CreateOptions, PatchHandle, PatchRecord, PatchRegistry};
