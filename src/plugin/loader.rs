//! Plugin Loader: scans a directory of shared modules and binds each one's six exported hooks
//! into a [`HookTable`] entry, in discovery order.

use std::fs;
use std::path::Path;

use libloading::{Library, Symbol};
use log::{info, warn};

use crate::config::{MAX_PLUGINS, SO_SUFFIX};
use crate::error::{Error, Result};

use super::{HookTable, OnCloseFn, OnConnectFn, OnInitFn, OnRecvFn, OnSendFn, PauseRemoteRecvFn};

/// A successfully loaded plugin: its resolved hooks plus the [`Library`] keeping the module
/// mapped. Dropping a `LoadedPlugin` unmaps the module; the engine holds these for its own
/// lifetime, so that never happens while sessions are live.
pub struct LoadedPlugin {
    hooks: HookTable,
    // Kept only to keep the module mapped for as long as the resolved symbols are called through;
    // never read directly once loading succeeds.
    _library: Library,
}

impl LoadedPlugin {
    pub fn hooks(&self) -> &HookTable {
        &self.hooks
    }
}

/// Returns the plugin filenames this directory would yield, in the order `load` will register
/// them, without attempting to load anything. Exposed mainly so the suffix-filtering rule is unit
/// testable independent of `libloading`.
fn candidates(dir: &Path) -> Result<Vec<std::path::PathBuf>> {
    let entries = fs::read_dir(dir).map_err(|_| Error::PluginDirMissing(dir.to_path_buf()))?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        let path = entry.path();
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n,
            None => continue,
        };
        if name.len() > SO_SUFFIX.len() && name.ends_with(SO_SUFFIX) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Scans `dir` for `.so`-suffixed files and loads each one as a plugin.
///
/// A directory that can't be opened at all is a configuration error and fatal (`Err`). Any
/// individual candidate that fails to load, or is missing one of the six required symbols, is
/// logged and skipped — a broken plugin must never poison the ones loaded around it, and partial
/// registration (some but not all of a module's hooks bound) is never allowed.
pub fn load(dir: &Path) -> Result<Vec<LoadedPlugin>> {
    let candidates = candidates(dir)?;

    let mut plugins = Vec::new();
    for path in candidates {
        if plugins.len() >= MAX_PLUGINS {
            warn!(
                "plugin directory has more than {} candidates; ignoring {}",
                MAX_PLUGINS,
                path.display()
            );
            continue;
        }
        info!("loading plugin: {}", path.display());

        let library = match unsafe { Library::new(&path) } {
            Ok(lib) => lib,
            Err(e) => {
                warn!("failed to load plugin {}: {}", path.display(), e);
                continue;
            }
        };

        match resolve_hooks(&library) {
            Ok(hooks) => plugins.push(LoadedPlugin {
                hooks,
                _library: library,
            }),
            Err(e) => {
                warn!("plugin {} missing required symbol: {}", path.display(), e);
                // `library` drops here, unmapping the half-resolved module.
            }
        }
    }

    Ok(plugins)
}

/// Resolves all six required symbols or fails without binding any of them — partial registration
/// is forbidden by the spec this loader implements.
fn resolve_hooks(library: &Library) -> std::result::Result<HookTable, libloading::Error> {
    unsafe {
        let on_init: Symbol<OnInitFn> = *library.get(b"on_init\0")?;
        let on_connect: Symbol<OnConnectFn> = *library.get(b"on_connect\0")?;
        let on_recv: Symbol<OnRecvFn> = *library.get(b"on_recv\0")?;
        let on_send: Symbol<OnSendFn> = *library.get(b"on_send\0")?;
        let on_close: Symbol<OnCloseFn> = *library.get(b"on_close\0")?;
        let pause_remote_recv: Symbol<PauseRemoteRecvFn> = *library.get(b"pause_remote_recv\0")?;

        Ok(HookTable {
            on_init,
            on_connect,
            on_recv,
            on_send,
            on_close,
            pause_remote_recv,
        })
    }
}
