//! Hot-reloadable behavior definitions.
//!
//! A [`Behavior`] binds handlers through a [`HookRegistrar`]; that is its
//! only capability. The [`BehaviorLoader`] watches a behavior file with a
//! `notify` poll watcher and, on change:
//!
//! 1. fires `UNLOAD` on the current custom table;
//! 2. reads the file and installs it into a fresh table;
//! 3. on success swaps it in and fires `LOAD`; on failure (unreadable file
//!    or broken script) logs the error and leaves the current table in
//!    place.
//!
//! Hooks that are running during a swap finish against the table they were
//! looked up in.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use notify::{Event, EventKind, PollWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_util::sync::CancellationToken;

use crate::hooks::{self, EventHub, HookRegistrar, HookTable};
use crate::lua::LuaBehavior;

/// A set of hook registrations that can be installed as a unit.
pub trait Behavior: Send + Sync {
    /// Bind this behavior's handlers.
    ///
    /// An error means the definition is unusable; nothing registered so far
    /// is kept.
    fn install(&self, registrar: &mut HookRegistrar<'_>) -> Result<()>;
}

/// Replace the hub's custom hooks with `behavior`.
///
/// # Errors
///
/// Returns the install error; the previous table stays active.
pub fn reload(hub: &EventHub, behavior: &dyn Behavior) -> Result<()> {
    hub.fire_in(&hub.custom(), hooks::UNLOAD, &[]);
    swap_in(hub, behavior)
}

/// Replace the hub's custom hooks with the Lua script at `path`.
///
/// `UNLOAD` fires before the file is read, so every reload attempt is
/// announced the same way whether it then fails to read, fails to run, or
/// succeeds.
///
/// # Errors
///
/// Returns the read or install error; the previous table stays active.
pub fn reload_file(hub: &EventHub, path: &Path) -> Result<()> {
    hub.fire_in(&hub.custom(), hooks::UNLOAD, &[]);
    let behavior = LuaBehavior::from_file(path)?;
    swap_in(hub, &behavior)
}

fn swap_in(hub: &EventHub, behavior: &dyn Behavior) -> Result<()> {
    let mut table = HookTable::new();
    behavior.install(&mut HookRegistrar::new(&mut table))?;
    let count = table.len();
    hub.swap_custom(table);
    log::info!("[Behavior] Installed {} hooks", count);
    hub.fire(hooks::LOAD, None, &[]);
    Ok(())
}

/// Watches a Lua behavior file and hot-reloads it into an [`EventHub`].
#[derive(Debug)]
pub struct BehaviorLoader {
    path: PathBuf,
    hub: Arc<EventHub>,
    interval: Duration,
}

impl BehaviorLoader {
    /// Create a loader for `path`, scanning for changes every `interval`.
    pub fn new(path: PathBuf, hub: Arc<EventHub>, interval: Duration) -> Self {
        Self {
            path,
            hub,
            interval,
        }
    }

    /// Watched file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory containing the watched file.
    fn watch_dir(&self) -> &Path {
        match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        }
    }

    fn is_watched(&self, event: &Event) -> bool {
        event
            .paths
            .iter()
            .any(|p| p.file_name() == self.path.file_name())
    }

    /// Whether `event` is a create or write of the watched file.
    fn is_change(&self, event: &Event) -> bool {
        matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) && self.is_watched(event)
    }

    /// Reload the file now, off the async workers.
    ///
    /// Returns `None` without touching the hooks if the file does not exist,
    /// otherwise the reload result.
    pub async fn load(&self) -> Option<Result<()>> {
        if !self.path.exists() {
            log::warn!("[Behavior] {} not found, waiting for it", self.path.display());
            return None;
        }

        log::info!("[Behavior] Loading {}", self.path.display());
        let hub = Arc::clone(&self.hub);
        let path = self.path.clone();
        let result = tokio::task::spawn_blocking(move || reload_file(&hub, &path))
            .await
            .unwrap_or_else(|e| Err(anyhow!("Reload task failed: {e}")));
        if let Err(e) = &result {
            log::error!("[Behavior] Reload failed, keeping previous hooks: {e:#}");
        }
        Some(result)
    }

    fn watch(&self, tx: UnboundedSender<notify::Result<Event>>) -> Result<PollWatcher> {
        let config = notify::Config::default()
            .with_poll_interval(self.interval)
            .with_compare_contents(true);
        let mut watcher = PollWatcher::new(
            move |res| {
                let _ = tx.send(res);
            },
            config,
        )
        .context("Failed to create file watcher")?;

        let dir = self.watch_dir();
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch: {}", dir.display()))?;
        log::info!("[Behavior] Watching for file changes: {:?}", self.path);
        Ok(watcher)
    }

    /// Reload on every change until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _watcher = match self.watch(tx) {
            Ok(watcher) => watcher,
            Err(e) => {
                log::error!("[Behavior] Hot reload disabled: {e:#}");
                return;
            }
        };

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                Some(res) = rx.recv() => match res {
                    Ok(event) if self.is_change(&event) => {
                        // One scan can report several events; reload once.
                        while rx.try_recv().is_ok() {}
                        self.load().await;
                    }
                    Ok(event) => {
                        if matches!(event.kind, EventKind::Remove(_)) && self.is_watched(&event) {
                            log::warn!("[Behavior] {} removed, keeping current hooks", self.path.display());
                        }
                    }
                    Err(e) => log::warn!("[Behavior] File watch error: {e}"),
                },
            }
        }
        log::debug!("[Behavior] Loader stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::{Canvas, ServerStats};
    use crate::hooks::{Hook, HookOutcome};
    use crate::net::ClientHandle;
    use notify::event::{CreateKind, ModifyKind, RemoveKind};
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::SystemTime;

    fn test_hub() -> Arc<EventHub> {
        let canvas = Arc::new(Canvas::new(4, 4, Arc::new(ServerStats::default()), std::env::temp_dir()));
        Arc::new(EventHub::new(canvas))
    }

    fn counting(counter: &Arc<AtomicUsize>) -> Arc<dyn Hook> {
        let counter = Arc::clone(counter);
        Arc::new(move |_: &Arc<Canvas>, _: Option<&ClientHandle>, _: &[String]| -> Result<()> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    /// Behavior built from Rust closures.
    struct Fixed(Vec<(&'static str, Arc<dyn Hook>)>);

    impl Behavior for Fixed {
        fn install(&self, registrar: &mut HookRegistrar<'_>) -> Result<()> {
            for (name, hook) in &self.0 {
                registrar.register(*name, Arc::clone(hook));
            }
            Ok(())
        }
    }

    struct Broken;

    impl Behavior for Broken {
        fn install(&self, registrar: &mut HookRegistrar<'_>) -> Result<()> {
            registrar.register("COMMAND-HALF", Arc::new(|_: &Arc<Canvas>, _: Option<&ClientHandle>, _: &[String]| -> Result<()> { Ok(()) }));
            anyhow::bail!("definition is broken")
        }
    }

    /// Rewrite `path` and give it a distinct modification time.
    fn write_script(path: &Path, source: &str, generation: u64) {
        fs::write(path, source).unwrap();
        let file = fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000 + generation))
            .unwrap();
    }

    async fn wait_for_hook(hub: &EventHub, name: &str) {
        tokio::time::timeout(Duration::from_secs(3), async {
            while !hub.has(name) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("hook {name} never appeared"));
    }

    #[test]
    fn test_reload_fires_unload_then_load() {
        let hub = test_hub();
        let unloads = Arc::new(AtomicUsize::new(0));
        let loads = Arc::new(AtomicUsize::new(0));

        reload(&hub, &Fixed(vec![(hooks::UNLOAD, counting(&unloads))])).unwrap();
        assert_eq!(unloads.load(Ordering::SeqCst), 0);

        reload(&hub, &Fixed(vec![(hooks::LOAD, counting(&loads))])).unwrap();
        assert_eq!(unloads.load(Ordering::SeqCst), 1, "outgoing table gets UNLOAD");
        assert_eq!(loads.load(Ordering::SeqCst), 1, "incoming table gets LOAD");
        assert!(!hub.has(hooks::UNLOAD));
    }

    #[test]
    fn test_broken_reload_keeps_previous_table() {
        let hub = test_hub();
        let calls = Arc::new(AtomicUsize::new(0));
        reload(&hub, &Fixed(vec![("COMMAND-TEXT", counting(&calls))])).unwrap();

        assert!(reload(&hub, &Broken).is_err());
        assert!(hub.fire("COMMAND-TEXT", None, &[]).succeeded());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(hub.fire("COMMAND-HALF", None, &[]), HookOutcome::Missing);
    }

    #[test]
    fn test_unreadable_file_still_fires_unload() {
        let tmp = tempfile::TempDir::new().unwrap();
        let hub = test_hub();
        let unloads = Arc::new(AtomicUsize::new(0));
        let calls = Arc::new(AtomicUsize::new(0));
        reload(
            &hub,
            &Fixed(vec![
                (hooks::UNLOAD, counting(&unloads)),
                ("COMMAND-TEXT", counting(&calls)),
            ]),
        )
        .unwrap();

        // A directory exists but cannot be read as a script.
        assert!(reload_file(&hub, tmp.path()).is_err());
        assert_eq!(unloads.load(Ordering::SeqCst), 1);
        assert!(hub.fire("COMMAND-TEXT", None, &[]).succeeded());
    }

    #[test]
    fn test_broken_script_fires_unload_and_keeps_table() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("brain.lua");
        let hub = test_hub();
        let unloads = Arc::new(AtomicUsize::new(0));
        reload(&hub, &Fixed(vec![(hooks::UNLOAD, counting(&unloads))])).unwrap();

        write_script(&path, "on('COMMAND-TEXT', function() end", 1);
        assert!(reload_file(&hub, &path).is_err());
        assert_eq!(unloads.load(Ordering::SeqCst), 1);
        assert!(hub.has(hooks::UNLOAD), "previous table stays active");
        assert!(!hub.has("COMMAND-TEXT"));
    }

    #[tokio::test]
    async fn test_load_skips_missing_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("brain.lua");
        let hub = test_hub();
        let loader = BehaviorLoader::new(path.clone(), Arc::clone(&hub), Duration::from_millis(10));

        assert!(loader.load().await.is_none());

        write_script(&path, r#"on("COMMAND-ONE", function() end)"#, 1);
        assert!(loader.load().await.unwrap().is_ok());
        assert!(hub.has("COMMAND-ONE"));

        write_script(&path, "on('COMMAND-TWO', function() end", 2);
        assert!(loader.load().await.unwrap().is_err());
        assert!(hub.has("COMMAND-ONE"));
    }

    #[test]
    fn test_only_changes_to_the_watched_file_count() {
        let loader = BehaviorLoader::new(
            PathBuf::from("/srv/behaviors/brain.lua"),
            test_hub(),
            Duration::from_millis(10),
        );
        let write = |path: &str| {
            Event::new(EventKind::Modify(ModifyKind::Any)).add_path(PathBuf::from(path))
        };

        assert!(loader.is_change(&write("/srv/behaviors/brain.lua")));
        assert!(loader.is_change(
            &Event::new(EventKind::Create(CreateKind::File)).add_path(PathBuf::from("/srv/behaviors/brain.lua"))
        ));
        assert!(!loader.is_change(&write("/srv/behaviors/other.lua")));
        assert!(!loader.is_change(
            &Event::new(EventKind::Remove(RemoveKind::File)).add_path(PathBuf::from("/srv/behaviors/brain.lua"))
        ));
        assert_eq!(loader.watch_dir(), Path::new("/srv/behaviors"));

        let bare = BehaviorLoader::new(PathBuf::from("brain.lua"), test_hub(), Duration::from_millis(10));
        assert_eq!(bare.watch_dir(), Path::new("."));
    }

    #[tokio::test]
    async fn test_run_reloads_on_change_and_stops_on_shutdown() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("brain.lua");
        write_script(&path, r#"on("TICK", function() end)"#, 1);
        let hub = test_hub();
        let loader = BehaviorLoader::new(path.clone(), Arc::clone(&hub), Duration::from_millis(10));
        assert!(loader.load().await.unwrap().is_ok());
        assert!(hub.has(hooks::TICK));

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(loader.run(shutdown.clone()));

        // Keep editing until the watcher, which may still be taking its
        // first scan, reports a change.
        let writer_hub = Arc::clone(&hub);
        let edits = tokio::spawn(async move {
            let mut generation = 2;
            while !writer_hub.has("COMMAND-TWO") {
                write_script(
                    &path,
                    &format!("-- edit {generation}\non(\"COMMAND-TWO\", function() end)"),
                    generation,
                );
                generation += 1;
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        });
        wait_for_hook(&hub, "COMMAND-TWO").await;
        assert!(!hub.has(hooks::TICK));
        edits.await.unwrap();

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }
}
