//! Event registry and hook invocation.
//!
//! Every plugin record owns one worker thread; all of its hooks and timer
//! callbacks run there, so a plugin never observes parallel entry. The
//! caller waits at most [`HOOK_TIMEOUT`] per invocation; a hook that
//! overruns contributes 0 and leaves a warning naming the plugin.

use std::any::Any;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, SystemTime};

use tracing::{info, warn};

use super::api::PluginApi;

/// Hard cap on one synchronous hook invocation.
pub const HOOK_TIMEOUT: Duration = Duration::from_secs(5);

/// Timer frequency bounds, in hertz.
pub const TIMER_FREQ_MIN: u32 = 1;
pub const TIMER_FREQ_MAX: u32 = 500;

/// One argument handed to a hook.
#[derive(Debug, Clone, PartialEq)]
pub enum HookValue {
    Int(i64),
    Num(f64),
    Bool(bool),
    Str(String),
}

/// Ordered hook arguments.
#[derive(Debug, Clone, Default)]
pub struct HookArgs(Vec<HookValue>);

impl HookArgs {
    pub fn new() -> Self {
        HookArgs(Vec::new())
    }

    pub fn int(mut self, v: i64) -> Self {
        self.0.push(HookValue::Int(v));
        self
    }

    pub fn num(mut self, v: f64) -> Self {
        self.0.push(HookValue::Num(v));
        self
    }

    pub fn flag(mut self, v: bool) -> Self {
        self.0.push(HookValue::Bool(v));
        self
    }

    pub fn str(mut self, v: impl Into<String>) -> Self {
        self.0.push(HookValue::Str(v.into()));
        self
    }

    pub fn get_int(&self, idx: usize) -> Option<i64> {
        match self.0.get(idx) {
            Some(HookValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_str(&self, idx: usize) -> Option<&str> {
        match self.0.get(idx) {
            Some(HookValue::Str(v)) => Some(v),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A registered handler. Non-zero returns veto for vetoing events.
pub type Hook = Arc<dyn Fn(&HookArgs) -> i64 + Send + Sync>;

struct Job {
    hook: Hook,
    args: Arc<HookArgs>,
    reply: Option<tokio::sync::oneshot::Sender<i64>>,
}

/// Stops a plugin's timers when pulled from inside a hook.
#[derive(Clone)]
pub struct TimerStop(Arc<AtomicBool>);

impl TimerStop {
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Handed to a plugin's registration entry point.
pub struct PluginContext {
    name: String,
    label: String,
    api: Arc<PluginApi>,
    stop: Arc<AtomicBool>,
    hooks: HashMap<String, Hook>,
    timers: Vec<(u32, Hook)>,
}

impl PluginContext {
    pub fn plugin_name(&self) -> &str {
        &self.name
    }

    /// Server API for queries and commands; hooks capture the clone.
    pub fn api(&self) -> Arc<PluginApi> {
        self.api.clone()
    }

    /// Handle that stops this plugin's timers.
    pub fn timer_stop(&self) -> TimerStop {
        TimerStop(self.stop.clone())
    }

    /// Registers a handler for a named event.
    pub fn on(
        &mut self,
        event: impl Into<String>,
        hook: impl Fn(&HookArgs) -> i64 + Send + Sync + 'static,
    ) {
        self.hooks.insert(event.into(), Arc::new(hook));
    }

    /// Schedules a callback at `freq_hz` (1..=500) until the plugin
    /// unloads or [`TimerStop::stop`] is pulled.
    pub fn every(
        &mut self,
        freq_hz: u32,
        hook: impl Fn(&HookArgs) -> i64 + Send + Sync + 'static,
    ) {
        if !(TIMER_FREQ_MIN..=TIMER_FREQ_MAX).contains(&freq_hz) {
            warn!(
                plugin = %self.label,
                freq_hz,
                "timer frequency must be between {TIMER_FREQ_MIN} and {TIMER_FREQ_MAX}"
            );
            return;
        }
        self.timers.push((freq_hz, Arc::new(hook)));
    }
}

pub(crate) struct LibrarySource {
    pub path: PathBuf,
    pub mtime: SystemTime,
}

struct PluginRecord {
    name: String,
    label: String,
    source: Option<LibrarySource>,
    hooks: HashMap<String, Hook>,
    worker_tx: mpsc::Sender<Job>,
    stop_timers: Arc<AtomicBool>,
    /// Keeps the backing dynamic library mapped while any hook can run.
    _keeper: Option<Arc<dyn Any + Send + Sync>>,
}

pub struct PluginRuntime {
    api: Arc<PluginApi>,
    timeout: Duration,
    records: Mutex<Vec<PluginRecord>>,
}

impl PluginRuntime {
    pub fn new(api: Arc<PluginApi>) -> Self {
        Self::with_timeout(api, HOOK_TIMEOUT)
    }

    pub fn with_timeout(api: Arc<PluginApi>, timeout: Duration) -> Self {
        PluginRuntime {
            api,
            timeout,
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn api(&self) -> Arc<PluginApi> {
        self.api.clone()
    }

    /// Starts a registration context for a plugin.
    pub fn context(&self, name: &str, label: &str) -> PluginContext {
        PluginContext {
            name: name.to_string(),
            label: label.to_string(),
            api: self.api.clone(),
            stop: Arc::new(AtomicBool::new(false)),
            hooks: HashMap::new(),
            timers: Vec::new(),
        }
    }

    /// Installs a registered context: spawns the worker and timers and
    /// queues `onInit` as the worker's first job.
    pub(crate) fn commit(
        &self,
        ctx: PluginContext,
        source: Option<LibrarySource>,
        keeper: Option<Arc<dyn Any + Send + Sync>>,
    ) {
        let PluginContext {
            name,
            label,
            api: _,
            stop,
            mut hooks,
            timers,
        } = ctx;

        // Hooks and timers keep the backing library mapped for as long as
        // any of them can still be invoked.
        let wrap = |hook: Hook| -> Hook {
            match &keeper {
                Some(keeper) => {
                    let keeper = keeper.clone();
                    Arc::new(move |args: &HookArgs| {
                        let _mapped = &keeper;
                        hook(args)
                    })
                }
                None => hook,
            }
        };
        for hook in hooks.values_mut() {
            *hook = wrap(hook.clone());
        }

        let (tx, rx) = mpsc::channel::<Job>();
        let worker = std::thread::Builder::new().name(format!("plugin-{name}"));
        worker
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    let result = (job.hook)(&job.args);
                    if let Some(reply) = job.reply {
                        let _ = reply.send(result);
                    }
                }
            })
            .expect("spawn plugin worker");

        for (freq_hz, hook) in timers {
            let hook = wrap(hook);
            let tx = tx.clone();
            let stop = stop.clone();
            let period = Duration::from_millis(1000 / u64::from(freq_hz));
            std::thread::Builder::new()
                .name(format!("plugin-{name}-timer"))
                .spawn(move || loop {
                    if stop.load(Ordering::Acquire) {
                        break;
                    }
                    let job = Job {
                        hook: hook.clone(),
                        args: Arc::new(HookArgs::new()),
                        reply: None,
                    };
                    if tx.send(job).is_err() {
                        break;
                    }
                    std::thread::sleep(period);
                })
                .expect("spawn plugin timer");
        }

        if let Some(hook) = hooks.get("onInit") {
            let _ = tx.send(Job {
                hook: hook.clone(),
                args: Arc::new(HookArgs::new()),
                reply: None,
            });
        }

        self.records.lock().expect("plugin set poisoned").push(PluginRecord {
            name,
            label,
            source,
            hooks,
            worker_tx: tx,
            stop_timers: stop,
            _keeper: keeper,
        });
    }

    /// Registers an in-process plugin.
    pub fn load_static(&self, name: &str, register: impl FnOnce(&mut PluginContext)) {
        let mut ctx = self.context(name, name);
        register(&mut ctx);
        self.commit(ctx, None, None);
        info!(plugin = %name, "loaded plugin");
    }

    /// Fires `event` on every plugin registered for it. With `wait` the
    /// call blocks (bounded per hook) and returns the arithmetic sum of
    /// handler returns; without it the jobs are queued and 0 returned.
    pub async fn trigger(&self, event: &str, args: HookArgs, wait: bool) -> i64 {
        self.trigger_inner(None, event, args, wait).await
    }

    /// Like [`Self::trigger`] but restricted to one plugin's handlers.
    pub async fn trigger_for(
        &self,
        plugin: &str,
        event: &str,
        args: HookArgs,
        wait: bool,
    ) -> i64 {
        self.trigger_inner(Some(plugin), event, args, wait).await
    }

    async fn trigger_inner(
        &self,
        only: Option<&str>,
        event: &str,
        args: HookArgs,
        wait: bool,
    ) -> i64 {
        let args = Arc::new(args);
        let targets: Vec<(String, mpsc::Sender<Job>, Hook)> = {
            let records = self.records.lock().expect("plugin set poisoned");
            records
                .iter()
                .filter(|r| only.map_or(true, |p| r.name == p))
                .filter_map(|r| {
                    r.hooks
                        .get(event)
                        .map(|h| (r.label.clone(), r.worker_tx.clone(), h.clone()))
                })
                .collect()
        };

        if !wait {
            for (_, tx, hook) in targets {
                let _ = tx.send(Job {
                    hook,
                    args: args.clone(),
                    reply: None,
                });
            }
            return 0;
        }

        let mut sum = 0i64;
        for (label, tx, hook) in targets {
            let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
            let sent = tx.send(Job {
                hook,
                args: args.clone(),
                reply: Some(reply_tx),
            });
            if sent.is_err() {
                continue;
            }
            match tokio::time::timeout(self.timeout, reply_rx).await {
                Ok(Ok(v)) => sum += v,
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!(plugin = %label, event, "hook took too long to respond");
                }
            }
        }
        sum
    }

    /// True when any plugin has a handler for `event`.
    pub fn is_registered(&self, event: &str) -> bool {
        self.records
            .lock()
            .expect("plugin set poisoned")
            .iter()
            .any(|r| r.hooks.contains_key(event))
    }

    pub fn loaded_count(&self) -> usize {
        self.records.lock().expect("plugin set poisoned").len()
    }

    /// Library-backed records, for the hot-reload watcher.
    pub(crate) fn library_files(&self) -> Vec<(PathBuf, SystemTime)> {
        self.records
            .lock()
            .expect("plugin set poisoned")
            .iter()
            .filter_map(|r| r.source.as_ref().map(|s| (s.path.clone(), s.mtime)))
            .collect()
    }

    pub(crate) fn is_loaded(&self, path: &Path) -> bool {
        self.records
            .lock()
            .expect("plugin set poisoned")
            .iter()
            .any(|r| r.source.as_ref().is_some_and(|s| s.path == path))
    }

    /// Unloads the record backed by `path`: timers stop, the worker
    /// drains and exits, registrations disappear.
    pub(crate) fn unload_path(&self, path: &Path) -> bool {
        let mut records = self.records.lock().expect("plugin set poisoned");
        let before = records.len();
        records.retain(|r| {
            let matches = r.source.as_ref().is_some_and(|s| s.path == path);
            if matches {
                r.stop_timers.store(true, Ordering::Release);
            }
            !matches
        });
        before != records.len()
    }

    /// Unloads every record of a named plugin.
    pub fn unload(&self, name: &str) {
        let mut records = self.records.lock().expect("plugin set poisoned");
        records.retain(|r| {
            if r.name == name {
                r.stop_timers.store(true, Ordering::Release);
                false
            } else {
                true
            }
        });
    }
}
