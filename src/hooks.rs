//! Named-hook dispatch with atomic table swap.
//!
//! The [`EventHub`] holds two tables behind one `RwLock`:
//!
//! - **base** hooks installed by the server itself (e.g. the default
//!   `COMMAND-HELP`), added with [`EventHub::register`];
//! - **custom** hooks from the current behavior definition, replaced
//!   wholesale by [`EventHub::swap_custom`] on reload.
//!
//! Custom hooks shadow base hooks of the same name. Lookups clone the
//! handler `Arc` under the read lock and run it after releasing the lock,
//! so a reload never waits for a slow handler and a handler never sees a
//! half-built table.
//!
//! # Core hook names
//!
//! `CONNECT`, `DISCONNECT`, `RESIZE`, `TICK`, `LOAD`, `UNLOAD`, `QUIT`,
//! `KEYDOWN-<key>`, `COMMAND-<VERB>`.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::Result;

use crate::canvas::Canvas;
use crate::net::session::ClientHandle;

/// Fired after a session is registered.
pub const CONNECT: &str = "CONNECT";
/// Fired exactly once when a session ends.
pub const DISCONNECT: &str = "DISCONNECT";
/// Fired after the canvas was resized. Args: width, height.
pub const RESIZE: &str = "RESIZE";
/// Fired every render tick. Args: tick counter.
pub const TICK: &str = "TICK";
/// Fired after a behavior definition was installed.
pub const LOAD: &str = "LOAD";
/// Fired on the outgoing behavior before a reload.
pub const UNLOAD: &str = "UNLOAD";
/// Fired when the display asks the server to stop.
pub const QUIT: &str = "QUIT";

/// Hook name for a key press.
pub fn keydown(key: &str) -> String {
    format!("KEYDOWN-{key}")
}

/// Hook name for a protocol verb the session does not handle itself.
pub fn command(verb: &str) -> String {
    format!("COMMAND-{verb}")
}

/// A handler bound to a hook name.
///
/// Receives the canvas, the issuing client for client-scoped hooks, and the
/// hook arguments. Errors are contained by [`EventHub::fire`].
pub trait Hook: Send + Sync {
    /// Run the handler.
    fn call(&self, canvas: &Arc<Canvas>, client: Option<&ClientHandle>, args: &[String]) -> Result<()>;
}

impl<F> Hook for F
where
    F: Fn(&Arc<Canvas>, Option<&ClientHandle>, &[String]) -> Result<()> + Send + Sync,
{
    fn call(&self, canvas: &Arc<Canvas>, client: Option<&ClientHandle>, args: &[String]) -> Result<()> {
        self(canvas, client, args)
    }
}

/// Mapping from hook name to handler.
#[derive(Clone, Default)]
pub struct HookTable {
    hooks: HashMap<String, Arc<dyn Hook>>,
}

impl std::fmt::Debug for HookTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookTable")
            .field("hooks", &self.names())
            .finish()
    }
}

impl HookTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `hook` to `name`, replacing any previous binding.
    pub fn insert(&mut self, name: impl Into<String>, hook: Arc<dyn Hook>) {
        self.hooks.insert(name.into(), hook);
    }

    /// Handler bound to `name`.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Hook>> {
        self.hooks.get(name)
    }

    /// Whether `name` is bound.
    pub fn contains(&self, name: &str) -> bool {
        self.hooks.contains_key(name)
    }

    /// Number of bound hooks.
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Bound names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.hooks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Collects registrations while a behavior definition loads.
///
/// This is the only capability a behavior receives: it can bind handlers,
/// nothing else.
#[derive(Debug)]
pub struct HookRegistrar<'a> {
    table: &'a mut HookTable,
}

impl<'a> HookRegistrar<'a> {
    /// Register into `table`.
    pub fn new(table: &'a mut HookTable) -> Self {
        Self { table }
    }

    /// Bind a handler to a hook name.
    pub fn register(&mut self, name: impl Into<String>, hook: Arc<dyn Hook>) {
        let name = name.into();
        log::debug!("[Hooks] Registered '{}'", name);
        self.table.insert(name, hook);
    }
}

/// Result of firing a hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    /// No handler bound to the name.
    Missing,
    /// Handler ran and returned `Ok`.
    Ran,
    /// Handler ran but failed; the error was logged.
    Failed(String),
}

impl HookOutcome {
    /// Whether a handler existed and succeeded.
    pub fn succeeded(&self) -> bool {
        matches!(self, Self::Ran)
    }

    /// Whether a handler existed (successful or not).
    pub fn handled(&self) -> bool {
        !matches!(self, Self::Missing)
    }
}

#[derive(Default)]
struct Tables {
    base: Arc<HookTable>,
    custom: Arc<HookTable>,
}

/// Process-wide hook dispatch table.
pub struct EventHub {
    canvas: Arc<Canvas>,
    tables: RwLock<Tables>,
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("EventHub")
            .field("base", &tables.base.names())
            .field("custom", &tables.custom.names())
            .finish_non_exhaustive()
    }
}

impl EventHub {
    /// Create a hub with empty tables, firing handlers against `canvas`.
    pub fn new(canvas: Arc<Canvas>) -> Self {
        Self {
            canvas,
            tables: RwLock::new(Tables::default()),
        }
    }

    /// Canvas passed to every handler.
    pub fn canvas(&self) -> &Arc<Canvas> {
        &self.canvas
    }

    /// Bind a base handler. Base handlers survive behavior reloads.
    pub fn register(&self, name: impl Into<String>, hook: Arc<dyn Hook>) {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        Arc::make_mut(&mut tables.base).insert(name, hook);
    }

    /// Replace the custom table, returning the previous one.
    pub fn swap_custom(&self, table: HookTable) -> Arc<HookTable> {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut tables.custom, Arc::new(table))
    }

    /// Current custom table.
    pub fn custom(&self) -> Arc<HookTable> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&tables.custom)
    }

    /// Whether a handler is bound to `name` in either table.
    pub fn has(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    fn lookup(&self, name: &str) -> Option<Arc<dyn Hook>> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        tables
            .custom
            .get(name)
            .or_else(|| tables.base.get(name))
            .map(Arc::clone)
    }

    /// Fire a hook.
    ///
    /// Handler errors and panics are logged and reported as
    /// [`HookOutcome::Failed`]; they never reach the caller.
    pub fn fire(&self, name: &str, client: Option<&ClientHandle>, args: &[String]) -> HookOutcome {
        let Some(hook) = self.lookup(name) else {
            return HookOutcome::Missing;
        };
        run_hook(name, hook.as_ref(), &self.canvas, client, args)
    }

    /// Fire a hook from a specific table, bypassing the live tables.
    ///
    /// Used to deliver `UNLOAD` to the outgoing behavior.
    pub fn fire_in(&self, table: &HookTable, name: &str, args: &[String]) -> HookOutcome {
        match table.get(name) {
            Some(hook) => run_hook(name, hook.as_ref(), &self.canvas, None, args),
            None => HookOutcome::Missing,
        }
    }
}

fn run_hook(
    name: &str,
    hook: &dyn Hook,
    canvas: &Arc<Canvas>,
    client: Option<&ClientHandle>,
    args: &[String],
) -> HookOutcome {
    match std::panic::catch_unwind(AssertUnwindSafe(|| hook.call(canvas, client, args))) {
        Ok(Ok(())) => HookOutcome::Ran,
        Ok(Err(e)) => {
            log::warn!("[Hooks] '{}' failed: {:#}", name, e);
            HookOutcome::Failed(format!("{e:#}"))
        }
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "panic".to_string());
            log::error!("[Hooks] '{}' panicked: {}", name, msg);
            HookOutcome::Failed(msg)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::ServerStats;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_hub() -> EventHub {
        let canvas = Arc::new(Canvas::new(
            8,
            8,
            Arc::new(ServerStats::default()),
            std::env::temp_dir(),
        ));
        EventHub::new(canvas)
    }

    fn counting_hook(counter: &Arc<AtomicUsize>) -> Arc<dyn Hook> {
        let counter = Arc::clone(counter);
        Arc::new(move |_: &Arc<Canvas>, _: Option<&ClientHandle>, _: &[String]| -> Result<()> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn test_fire_missing_hook() {
        let hub = test_hub();
        assert_eq!(hub.fire("NOPE", None, &[]), HookOutcome::Missing);
        assert!(!hub.fire("NOPE", None, &[]).handled());
    }

    #[test]
    fn test_fire_runs_handler_with_args() {
        let hub = test_hub();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_in = Arc::clone(&seen);
        hub.register(
            TICK,
            Arc::new(move |_: &Arc<Canvas>, _: Option<&ClientHandle>, args: &[String]| -> Result<()> {
                seen_in.lock().unwrap().extend_from_slice(args);
                Ok(())
            }),
        );
        assert!(hub.fire(TICK, None, &["7".to_string()]).succeeded());
        assert_eq!(*seen.lock().unwrap(), vec!["7".to_string()]);
    }

    #[test]
    fn test_handler_error_is_contained() {
        let hub = test_hub();
        hub.register(
            "COMMAND-BAD",
            Arc::new(|_: &Arc<Canvas>, _: Option<&ClientHandle>, _: &[String]| -> Result<()> {
                anyhow::bail!("boom")
            }),
        );
        let outcome = hub.fire("COMMAND-BAD", None, &[]);
        assert_eq!(outcome, HookOutcome::Failed("boom".to_string()));
        assert!(outcome.handled());
        assert!(!outcome.succeeded());
    }

    #[test]
    fn test_handler_panic_is_contained() {
        let hub = test_hub();
        hub.register(
            "COMMAND-PANIC",
            Arc::new(|_: &Arc<Canvas>, _: Option<&ClientHandle>, _: &[String]| -> Result<()> {
                panic!("handler exploded")
            }),
        );
        assert!(matches!(hub.fire("COMMAND-PANIC", None, &[]), HookOutcome::Failed(m) if m.contains("exploded")));
    }

    #[test]
    fn test_custom_shadows_base_and_swap_restores() {
        let hub = test_hub();
        let base = Arc::new(AtomicUsize::new(0));
        let custom = Arc::new(AtomicUsize::new(0));
        hub.register("COMMAND-HELP", counting_hook(&base));

        let mut table = HookTable::new();
        HookRegistrar::new(&mut table).register("COMMAND-HELP", counting_hook(&custom));
        let previous = hub.swap_custom(table);
        assert!(previous.is_empty());

        hub.fire("COMMAND-HELP", None, &[]);
        assert_eq!(custom.load(Ordering::SeqCst), 1);
        assert_eq!(base.load(Ordering::SeqCst), 0);

        hub.swap_custom(HookTable::new());
        hub.fire("COMMAND-HELP", None, &[]);
        assert_eq!(base.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fire_in_uses_given_table_only() {
        let hub = test_hub();
        let count = Arc::new(AtomicUsize::new(0));
        let mut old = HookTable::new();
        old.insert(UNLOAD, counting_hook(&count));
        assert_eq!(hub.fire_in(&old, UNLOAD, &[]), HookOutcome::Ran);
        assert_eq!(hub.fire(UNLOAD, None, &[]), HookOutcome::Missing);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reader_keeps_running_during_swap() {
        let hub = Arc::new(test_hub());
        let count = Arc::new(AtomicUsize::new(0));
        let mut table = HookTable::new();
        table.insert(TICK, counting_hook(&count));
        hub.swap_custom(table.clone());

        let reader = {
            let hub = Arc::clone(&hub);
            std::thread::spawn(move || {
                for _ in 0..2000 {
                    assert!(hub.fire(TICK, None, &[]).succeeded());
                }
            })
        };
        for _ in 0..200 {
            hub.swap_custom(table.clone());
        }
        reader.join().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2000);
    }

    #[test]
    fn test_hook_names() {
        assert_eq!(keydown("c"), "KEYDOWN-c");
        assert_eq!(command("TEXT"), "COMMAND-TEXT");
    }
}
