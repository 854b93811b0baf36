//! Dynamic-library plugin loading and hot reload.
//!
//! Layout on disk: `Resources/Server/<plugin>/` holds one or more native
//! libraries, each exposing
//! `extern "C" fn relay_plugin_register(*mut PluginContext)`. The watcher
//! stats every loaded file on a 2-second cadence: a vanished file unloads
//! its plugin, a changed mtime re-registers it (and re-runs `onInit`), a
//! new file loads fresh.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use libloading::Library;
use tracing::{info, warn};

use super::runtime::{LibrarySource, PluginContext, PluginRuntime};

/// Subdirectory of the resource directory that holds plugins.
pub const PLUGIN_SUBDIR: &str = "Server";

/// Hot-reload poll cadence.
pub const WATCH_INTERVAL: Duration = Duration::from_secs(2);

/// Symbol every plugin library must export.
pub const REGISTER_SYMBOL: &[u8] = b"relay_plugin_register";

type RegisterFn = unsafe extern "C" fn(*mut PluginContext);

/// Loads every plugin under `<resource_dir>/Server`, creating the
/// directory tree when absent.
pub fn load_all(runtime: &Arc<PluginRuntime>, resource_dir: &Path) -> anyhow::Result<()> {
    let root = resource_dir.join(PLUGIN_SUBDIR);
    std::fs::create_dir_all(&root).with_context(|| format!("create {}", root.display()))?;
    scan(runtime, &root, false);
    Ok(())
}

/// Spawns the watcher thread; it runs for the life of the process.
pub fn spawn_watcher(runtime: Arc<PluginRuntime>, resource_dir: PathBuf) {
    let root = resource_dir.join(PLUGIN_SUBDIR);
    std::thread::Builder::new()
        .name("plugin-watcher".into())
        .spawn(move || loop {
            watch_pass(&runtime, &root);
            std::thread::sleep(WATCH_INTERVAL);
        })
        .expect("spawn plugin watcher");
}

fn watch_pass(runtime: &Arc<PluginRuntime>, root: &Path) {
    for (path, recorded) in runtime.library_files() {
        match std::fs::metadata(&path).and_then(|m| m.modified()) {
            Err(_) => {
                runtime.unload_path(&path);
                info!(file = %path.display(), "removed plugin");
            }
            Ok(mtime) if mtime != recorded => {
                runtime.unload_path(&path);
                match load_library(runtime, &path) {
                    Ok(()) => info!(file = %path.display(), "reloaded plugin"),
                    Err(e) => warn!(file = %path.display(), error = %e, "plugin reload failed"),
                }
            }
            Ok(_) => {}
        }
    }
    scan(runtime, root, true);
}

fn scan(runtime: &Arc<PluginRuntime>, root: &Path, hot: bool) {
    let Ok(dirs) = std::fs::read_dir(root) else {
        return;
    };
    for dir in dirs.flatten() {
        let dir_path = dir.path();
        if !dir_path.is_dir() {
            continue;
        }
        let Ok(files) = std::fs::read_dir(&dir_path) else {
            continue;
        };
        for file in files.flatten() {
            let path = file.path();
            if path.extension().and_then(|e| e.to_str()) != Some(std::env::consts::DLL_EXTENSION)
            {
                continue;
            }
            if runtime.is_loaded(&path) {
                continue;
            }
            match load_library(runtime, &path) {
                Ok(()) => {
                    if hot {
                        info!(file = %path.display(), "added plugin");
                    }
                }
                Err(e) => warn!(file = %path.display(), error = %e, "plugin load failed"),
            }
        }
    }
}

fn load_library(runtime: &Arc<PluginRuntime>, path: &Path) -> anyhow::Result<()> {
    let plugin = path
        .parent()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .unwrap_or("plugin")
        .to_string();
    let mtime = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .with_context(|| format!("stat {}", path.display()))?;

    // SAFETY: loading executes the library's constructors and the
    // registration entry point. Plugins are operator-installed code and
    // trusted to honor the `RegisterFn` signature. The runtime keeps the
    // library mapped for as long as any of its hooks can still run.
    let library = unsafe { Library::new(path) }
        .with_context(|| format!("load {}", path.display()))?;
    let library = Arc::new(library);
    let mut ctx = runtime.context(&plugin, &path.display().to_string());
    unsafe {
        let entry: libloading::Symbol<'_, RegisterFn> = library
            .get(REGISTER_SYMBOL)
            .context("missing registration symbol")?;
        entry(&mut ctx as *mut PluginContext);
    }
    runtime.commit(
        ctx,
        Some(LibrarySource {
            path: path.to_path_buf(),
            mtime,
        }),
        Some(library),
    );
    info!(plugin = %plugin, file = %path.display(), "loaded plugin");
    Ok(())
}
