//! # Plugins
//!
//! Plugins describe themselves with a [`PluginInfo`] and create their patches from
//! [`Plugin::startup`]. The [`PluginHost`] runs startup inside a scope of its own, so every patch
//! the plugin leaves behind is destroyed when it is unloaded.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use thiserror::Error;
use tracing::{info, warn};

use crate::engine::DefaultPatcher;
use crate::error::PatchError;
use crate::patcher::Patcher;
use crate::registry::scope::ScopeId;
use crate::registry::PatchRegistry;

/// Plugin interface version of this crate
pub const API_VERSION: u32 = 1;

/// Longest author, name or description kept in a [`PluginInfo`], in characters
pub const MAX_INFO_LEN: usize = 255;

/// What a plugin is useful for, and what a host is running as
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct PluginFlags(u32);
impl PluginFlags {
    /// Never started by a host
    pub const MANUAL: Self = Self(0);
    /// Internal functionality
    pub const ENGINE: Self = Self(1 << 0);
    /// In-game functionality
    pub const GAME: Self = Self(1 << 1);
    /// Server functionality
    pub const SERVER: Self = Self(1 << 2);
    /// Editor addons
    pub const EDITOR: Self = Self(1 << 3);
    /// Addons for other tools
    pub const TOOLS: Self = Self(1 << 4);
    /// Suitable for everything
    pub const ALL: Self = Self((1 << 5) - 1);

    /// Flags from raw bits, dropping unknown ones
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & Self::ALL.0)
    }

    /// Raw bits
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether every flag in `other` is set
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether any flag in `other` is set
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Whether no flag is set
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}
impl BitOr for PluginFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}
impl BitOrAssign for PluginFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Packs a version number as `0x00RRUUPP`
pub const fn make_version(release: u8, update: u8, patch: u8) -> u32 {
    (release as u32) << 16 | (update as u32) << 8 | patch as u32
}

/// Unpacks a version number made by [`make_version`]
pub const fn version_numbers(version: u32) -> (u8, u8, u8) {
    ((version >> 16) as u8, (version >> 8) as u8, version as u8)
}

/// Renders a version number as `1.10`, or `1.10.3` when it has a patch number
pub fn version_string(version: u32) -> String {
    match version_numbers(version) {
        (release, update, 0) => format!("{release}.{update}"),
        (release, update, patch) => format!("{release}.{update}.{patch}"),
    }
}

/// Keeps the first [`MAX_INFO_LEN`] characters
fn truncate(text: &str) -> String {
    text.chars().take(MAX_INFO_LEN).collect()
}

/// Metadata a plugin reports about itself
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PluginInfo {
    /// Interface version the plugin was written against
    api: u32,
    /// Utility of the plugin
    flags: PluginFlags,
    /// Version made by [`make_version`]
    version: u32,
    /// Author name
    author: String,
    /// Display name
    name: String,
    /// Short description
    description: String,
    /// Unique name other plugins can look this one up by
    extension: Option<String>,
}
impl PluginInfo {
    /// Starts describing a plugin with the given utility
    pub fn builder(flags: PluginFlags) -> PluginInfoBuilder {
        PluginInfoBuilder {
            info: PluginInfo {
                api: API_VERSION,
                flags,
                version: 0,
                author: String::new(),
                name: String::new(),
                description: String::new(),
                extension: None,
            },
        }
    }

    /// Interface version the plugin was written against
    pub fn api(&self) -> u32 {
        self.api
    }

    /// Utility of the plugin
    pub fn flags(&self) -> PluginFlags {
        self.flags
    }

    /// Packed version number
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Author name
    pub fn author(&self) -> &str {
        &self.author
    }

    /// Display name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Short description
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Extension identifier, if the plugin offers itself to others
    pub fn extension(&self) -> Option<&str> {
        self.extension.as_deref()
    }
}
impl fmt::Display for PluginInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, version_string(self.version))?;
        if !self.author.is_empty() {
            write!(f, " by {}", self.author)?;
        }
        Ok(())
    }
}

/// Builder for [`PluginInfo`]
#[derive(Clone, Debug)]
pub struct PluginInfoBuilder {
    /// Info being built
    info: PluginInfo,
}
impl PluginInfoBuilder {
    /// Sets the packed version number
    pub fn version(mut self, version: u32) -> Self {
        self.info.version = version;
        self
    }

    /// Sets the author, truncated to [`MAX_INFO_LEN`] characters
    pub fn author(mut self, author: &str) -> Self {
        self.info.author = truncate(author);
        self
    }

    /// Sets the display name, truncated to [`MAX_INFO_LEN`] characters
    pub fn name(mut self, name: &str) -> Self {
        self.info.name = truncate(name);
        self
    }

    /// Sets the description, truncated to [`MAX_INFO_LEN`] characters
    pub fn description(mut self, description: &str) -> Self {
        self.info.description = truncate(description);
        self
    }

    /// Offers the plugin to others under `identifier`
    pub fn extension(mut self, identifier: &str) -> Self {
        self.info.extension = Some(identifier.to_owned());
        self
    }

    /// Overrides the interface version, for plugins built against another one
    pub fn api(mut self, api: u32) -> Self {
        self.info.api = api;
        self
    }

    /// Finishes the info
    pub fn build(self) -> PluginInfo {
        self.info
    }
}

/// A unit of patches loaded and unloaded together
pub trait Plugin<P: Patcher = DefaultPatcher> {
    /// Describes the plugin; called once before it is started
    fn info(&self) -> PluginInfo;

    /// Creates the plugin's patches
    ///
    /// If this fails, whatever it already created is destroyed and the plugin isn't loaded. The
    /// startup error is returned even if some of those patches can't be restored.
    fn startup(&mut self, _patches: &mut PatchRegistry<P>) -> Result<(), PatchError> {
        Ok(())
    }

    /// Runs before the plugin's remaining patches are destroyed
    fn shutdown(&mut self, _patches: &mut PatchRegistry<P>) {}
}

/// Errors while loading or unloading plugins
#[derive(Debug, Error)]
pub enum PluginError {
    /// The plugin was written against another interface version
    #[error("plugin `{name}` uses interface version {api}, expected {API_VERSION}")]
    ApiMismatch {
        /// Display name of the plugin
        name: String,
        /// Version it reported
        api: u32,
    },
    /// The plugin isn't suitable for what the host runs as
    #[error("plugin `{name}` isn't suitable for this host ({flags:#x})")]
    Unsuitable {
        /// Display name of the plugin
        name: String,
        /// Raw utility flags it reported
        flags: u32,
    },
    /// No loaded plugin has this id
    #[error("no plugin loaded as {0:?}")]
    UnknownPlugin(PluginId),
    /// A patch operation failed during startup or teardown
    #[error(transparent)]
    Patch(#[from] PatchError),
}

/// Id of a loaded plugin
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PluginId(ScopeId);

/// A started plugin
struct Loaded<P: Patcher> {
    /// Scope its patches are tracked under, also its id
    scope: ScopeId,
    /// Info reported at load time
    info: PluginInfo,
    /// The plugin itself
    plugin: Box<dyn Plugin<P>>,
}

/// Loads plugins suitable for one utility and tears their patches down on unload
pub struct PluginHost<P: Patcher = DefaultPatcher> {
    /// What the host runs as
    utility: PluginFlags,
    /// Started plugins, in load order
    plugins: Vec<Loaded<P>>,
}
impl<P: Patcher> PluginHost<P> {
    /// Creates a host that only starts plugins sharing a flag with `utility`
    pub fn new(utility: PluginFlags) -> Self {
        Self {
            utility,
            plugins: Vec::new(),
        }
    }

    /// What the host runs as
    pub fn utility(&self) -> PluginFlags {
        self.utility
    }

    /// Checks the plugin's info, then starts it inside a fresh scope
    pub fn load(
        &mut self,
        mut plugin: Box<dyn Plugin<P>>,
        patches: &mut PatchRegistry<P>,
    ) -> Result<PluginId, PluginError> {
        let info = plugin.info();
        if info.api != API_VERSION {
            return Err(PluginError::ApiMismatch {
                name: info.name,
                api: info.api,
            });
        }
        if !info.flags.intersects(self.utility) {
            return Err(PluginError::Unsuitable {
                name: info.name,
                flags: info.flags.bits(),
            });
        }

        let scope = ScopeId::new();
        let previous = patches.enter_scope(scope);
        let started = plugin.startup(patches);
        patches.leave_scope(previous);

        if let Err(e) = started {
            warn!(plugin = %info.name, error = %e, "plugin failed to start");
            if let Err(cleanup) = patches.destroy_scope(scope) {
                warn!(plugin = %info.name, error = %cleanup, "patches of failed plugin left behind");
            }
            return Err(e.into());
        }

        info!(
            plugin = %info.name,
            version = %version_string(info.version),
            patches = patches.scope_handles(scope).len(),
            "started plugin"
        );
        self.plugins.push(Loaded {
            scope,
            info,
            plugin,
        });
        Ok(PluginId(scope))
    }

    /// Shuts a plugin down and destroys the patches it left behind, returning how many
    ///
    /// The plugin is gone even if some of its patches can't be restored; those stay in the
    /// registry and the error is returned.
    pub fn unload(
        &mut self,
        id: PluginId,
        patches: &mut PatchRegistry<P>,
    ) -> Result<usize, PluginError> {
        let position = self
            .plugins
            .iter()
            .position(|loaded| loaded.scope == id.0)
            .ok_or(PluginError::UnknownPlugin(id))?;
        let mut loaded = self.plugins.remove(position);

        let previous = patches.enter_scope(loaded.scope);
        loaded.plugin.shutdown(patches);
        patches.leave_scope(previous);

        let destroyed = patches.destroy_scope(loaded.scope)?;
        info!(plugin = %loaded.info.name, destroyed, "stopped plugin");
        Ok(destroyed)
    }

    /// Unloads every plugin, last loaded first, and returns the first error
    pub fn unload_all(&mut self, patches: &mut PatchRegistry<P>) -> Result<(), PluginError> {
        let mut first_error = None;
        while let Some(loaded) = self.plugins.last() {
            let id = PluginId(loaded.scope);
            if let Err(e) = self.unload(id, patches) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Loaded plugins and their info, in load order
    pub fn plugins(&self) -> impl Iterator<Item = (PluginId, &PluginInfo)> {
        self.plugins
            .iter()
            .map(|loaded| (PluginId(loaded.scope), &loaded.info))
    }

    /// Finds a loaded plugin by its extension identifier
    pub fn find_extension(&self, identifier: &str) -> Option<PluginId> {
        self.plugins()
            .find(|(_, info)| info.extension() == Some(identifier))
            .map(|(id, _)| id)
    }

    /// Info of a loaded plugin
    pub fn info(&self, id: PluginId) -> Option<&PluginInfo> {
        self.plugins()
            .find(|&(loaded, _)| loaded == id)
            .map(|(_, info)| info)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::{
        make_version, version_numbers, version_string, Plugin, PluginError, PluginFlags,
        PluginHost, PluginInfo, API_VERSION, MAX_INFO_LEN,
    };
    use crate::error::PatchError;
    use crate::patcher::byte::BytePatcher;
    use crate::registry::{CreateOptions, PatchRegistry};
    use crate::test_util::{CodeBuffer, FailingPatcher, PROLOGUE};

    /// Plugin patching the start of each site in a buffer
    struct Sites {
        /// Utility reported to the host
        flags: PluginFlags,
        /// Start of the buffer
        base: usize,
        /// Offsets of the functions to patch
        sites: Vec<usize>,
        /// Offset every patch jumps to
        destination: usize,
        /// Times startup ran
        started: Rc<Cell<usize>>,
    }
    impl Plugin<BytePatcher> for Sites {
        fn info(&self) -> PluginInfo {
            PluginInfo::builder(self.flags)
                .version(make_version(1, 0, 0))
                .author("tests")
                .name("sites")
                .extension("sites")
                .build()
        }

        fn startup(&mut self, patches: &mut PatchRegistry<BytePatcher>) -> Result<(), PatchError> {
            self.started.set(self.started.get() + 1);
            for &site in &self.sites {
                let target = (self.base + site) as *const u8;
                let destination = (self.base + self.destination) as *const u8;
                unsafe {
                    patches.create(target, destination, &format!("site {site:#x}"), CreateOptions::default())?
                };
            }
            Ok(())
        }
    }

    /// Builds a plugin patching `sites` of `buffer`
    fn sites(buffer: &CodeBuffer, flags: PluginFlags, sites: &[usize]) -> (Box<Sites>, Rc<Cell<usize>>) {
        let started = Rc::new(Cell::new(0));
        let plugin = Sites {
            flags,
            base: buffer.ptr() as usize,
            sites: sites.to_vec(),
            destination: 0x80,
            started: started.clone(),
        };
        (Box::new(plugin), started)
    }

    #[test]
    /// Versions render without a trailing zero patch number
    fn test_version_string() {
        assert_eq!(make_version(1, 10, 3), 0x01_0a_03);
        assert_eq!(version_numbers(0x01_0a_03), (1, 10, 3));
        assert_eq!(version_string(make_version(1, 10, 0)), "1.10");
        assert_eq!(version_string(make_version(1, 10, 3)), "1.10.3");
        assert_eq!(version_string(make_version(255, 255, 255)), "255.255.255");
    }

    #[test]
    /// Metadata strings keep at most the maximum number of characters
    fn test_info_truncation() {
        let long = "é".repeat(MAX_INFO_LEN + 10);
        let info = PluginInfo::builder(PluginFlags::GAME | PluginFlags::SERVER)
            .name(&long)
            .description("short")
            .build();
        assert_eq!(info.name().chars().count(), MAX_INFO_LEN);
        assert_eq!(info.description(), "short");
        assert_eq!(info.api(), API_VERSION);
        assert_eq!(info.extension(), None);
        assert!(info.flags().contains(PluginFlags::SERVER));
        assert!(!info.flags().intersects(PluginFlags::EDITOR));
        assert!(PluginFlags::ALL.contains(info.flags()));
    }

    #[test]
    /// Unloading a plugin destroys every patch it created
    fn test_host_teardown() {
        let buffer = CodeBuffer::with_sites(0x100, &[0, 0x10, 0x20]);
        let mut registry = PatchRegistry::new(BytePatcher::new());
        let mut host = PluginHost::new(PluginFlags::GAME);

        let (plugin, started) = sites(&buffer, PluginFlags::ALL, &[0, 0x10, 0x20]);
        let id = host.load(plugin, &mut registry).unwrap();
        assert_eq!(started.get(), 1);
        assert_eq!(registry.len(), 3);
        assert_eq!(host.find_extension("sites"), Some(id));
        assert_eq!(host.info(id).unwrap().to_string(), "sites 1.0 by tests");

        assert_eq!(host.unload(id, &mut registry).unwrap(), 3);
        assert!(registry.is_empty());
        for offset in [0, 0x10, 0x20] {
            assert_eq!(buffer.read(offset, PROLOGUE.len()), PROLOGUE);
        }
        assert_eq!(host.plugins().count(), 0);
        assert!(matches!(
            host.unload(id, &mut registry),
            Err(PluginError::UnknownPlugin(unknown)) if unknown == id
        ));
    }

    #[test]
    /// Plugins that share no utility flag with the host are never started
    fn test_unsuitable() {
        let buffer = CodeBuffer::with_sites(0x100, &[0]);
        let mut registry = PatchRegistry::new(BytePatcher::new());
        let mut host = PluginHost::new(PluginFlags::GAME | PluginFlags::SERVER);

        for flags in [PluginFlags::EDITOR, PluginFlags::MANUAL] {
            let (plugin, started) = sites(&buffer, flags, &[0]);
            let result = host.load(plugin, &mut registry);
            assert!(matches!(result, Err(PluginError::Unsuitable { .. })));
            assert_eq!(started.get(), 0);
        }
        assert!(registry.is_empty());
        assert_eq!(buffer.read(0, PROLOGUE.len()), PROLOGUE);
    }

    #[test]
    /// Plugins built against another interface are refused
    fn test_api_mismatch() {
        struct Old;
        impl Plugin<BytePatcher> for Old {
            fn info(&self) -> PluginInfo {
                PluginInfo::builder(PluginFlags::ALL).name("old").api(API_VERSION + 1).build()
            }
        }

        let mut registry = PatchRegistry::new(BytePatcher::new());
        let mut host = PluginHost::new(PluginFlags::ALL);
        let result = host.load(Box::new(Old), &mut registry);
        assert!(matches!(result, Err(PluginError::ApiMismatch { api, .. }) if api == API_VERSION + 1));
    }

    #[test]
    /// A failed startup leaves none of its patches behind
    fn test_failed_startup() {
        let buffer = CodeBuffer::with_sites(0x100, &[0, 0x10]);
        let mut registry = PatchRegistry::new(BytePatcher::new());
        let mut host = PluginHost::new(PluginFlags::ALL);

        // the second site lands inside the first patch
        let (plugin, _) = sites(&buffer, PluginFlags::ENGINE, &[0, 0x02]);
        let result = host.load(plugin, &mut registry);
        assert!(matches!(result, Err(PluginError::Patch(PatchError::AddressInUse { .. }))));
        assert!(registry.is_empty());
        assert_eq!(buffer.read(0, PROLOGUE.len()), PROLOGUE);
        assert_eq!(host.plugins().count(), 0);
    }

    #[test]
    /// Unloading everything goes through plugins last loaded first
    fn test_unload_all() {
        let buffer = CodeBuffer::with_sites(0x100, &[0, 0x10, 0x20]);
        let mut registry = PatchRegistry::new(BytePatcher::new());
        let mut host = PluginHost::new(PluginFlags::TOOLS);

        let (first, _) = sites(&buffer, PluginFlags::TOOLS, &[0]);
        let (second, _) = sites(&buffer, PluginFlags::ALL, &[0x10, 0x20]);
        host.load(first, &mut registry).unwrap();
        host.load(second, &mut registry).unwrap();
        assert_eq!(registry.len(), 3);

        host.unload_all(&mut registry).unwrap();
        assert!(registry.is_empty());
        assert_eq!(host.plugins().count(), 0);
    }

    #[test]
    /// The startup error wins over a failed cleanup of its patches
    fn test_failed_startup_cleanup() {
        /// Patches one site, then makes it unrestorable and fails
        struct Stubborn {
            /// Start of the buffer
            base: usize,
            /// Shared with the registry's patcher
            patcher: FailingPatcher,
        }
        impl Plugin<FailingPatcher> for Stubborn {
            fn info(&self) -> PluginInfo {
                PluginInfo::builder(PluginFlags::ALL).name("stubborn").build()
            }

            fn startup(&mut self, patches: &mut PatchRegistry<FailingPatcher>) -> Result<(), PatchError> {
                let target = self.base as *const u8;
                let destination = (self.base + 0x80) as *const u8;
                unsafe { patches.create(target, destination, "stubborn", CreateOptions::default())? };
                self.patcher.fail_at(target);
                unsafe { patches.create(target, destination, "stubborn", CreateOptions::default())? };
                Ok(())
            }
        }

        let buffer = CodeBuffer::with_sites(0x100, &[0]);
        let patcher = FailingPatcher::default();
        let mut registry = PatchRegistry::new(patcher.clone());
        let mut host = PluginHost::new(PluginFlags::GAME);

        let plugin = Stubborn {
            base: buffer.ptr() as usize,
            patcher: patcher.clone(),
        };
        let result = host.load(Box::new(plugin), &mut registry);
        assert!(matches!(
            result,
            Err(PluginError::Patch(PatchError::DuplicateIdentifier(_)))
        ));
        assert_eq!(host.plugins().count(), 0);
        // the patch that couldn't be restored is still there to retry
        assert_eq!(registry.len(), 1);

        patcher.heal();
        registry.destroy_all().unwrap();
        assert_eq!(buffer.read(0, PROLOGUE.len()), PROLOGUE);
    }
}
