//! Lua behavior definitions.
//!
//! A behavior definition is a Lua 5.4 script. Each load runs it in a fresh
//! interpreter that exposes two globals:
//!
//! - `on(hook_name, fn)` binds `fn` to a hook (only while the script loads);
//! - `log` (see [`logging`]).
//!
//! ```lua
//! on("COMMAND-TEXT", function(server, client, ...)
//!     client:send("you said: " .. table.concat({...}, " "))
//! end)
//!
//! on("TICK", function(server, tick)
//!     if tick % 30 == 0 then server:set_title("clients: " .. server:clients()) end
//! end)
//! ```
//!
//! Client-scoped hooks (`CONNECT`, `DISCONNECT`, `COMMAND-*`) are called as
//! `fn(server, client, args...)`; all others as `fn(server, args...)`.
//! Arguments are strings.

pub mod logging;
pub mod userdata;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{anyhow, Context, Result};
use mlua::prelude::*;

use crate::behavior::Behavior;
use crate::canvas::Canvas;
use crate::hooks::{Hook, HookRegistrar};
use crate::net::ClientHandle;

use self::userdata::{LuaCanvas, LuaClient};

/// A Lua function bound to a hook.
///
/// Keeps its interpreter alive; the interpreter is dropped with the last
/// hook of the table it was loaded into.
pub struct LuaHook {
    lua: Lua,
    func: LuaFunction,
}

impl std::fmt::Debug for LuaHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LuaHook").finish_non_exhaustive()
    }
}

impl Hook for LuaHook {
    fn call(&self, canvas: &Arc<Canvas>, client: Option<&ClientHandle>, args: &[String]) -> Result<()> {
        let mut values = Vec::with_capacity(args.len() + 2);
        values.push(LuaValue::UserData(
            self.lua.create_userdata(LuaCanvas(Arc::clone(canvas)))?,
        ));
        if let Some(client) = client {
            values.push(LuaValue::UserData(
                self.lua.create_userdata(LuaClient(client.clone()))?,
            ));
        }
        for arg in args {
            values.push(LuaValue::String(self.lua.create_string(arg)?));
        }
        self.func
            .call::<()>(LuaMultiValue::from_vec(values))
            .map_err(|e| anyhow!("{e}"))
    }
}

/// A behavior definition backed by a Lua script.
#[derive(Debug, Clone)]
pub struct LuaBehavior {
    name: String,
    source: String,
}

impl LuaBehavior {
    /// Wrap script source. `name` appears in error messages.
    pub fn from_source(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
        }
    }

    /// Read a script from disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub fn from_file(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read behavior: {}", path.display()))?;
        Ok(Self::from_source(path.display().to_string(), source))
    }

    /// Script path or name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

type Registrations = Arc<Mutex<Vec<(String, LuaFunction)>>>;

fn register_on(lua: &Lua, registrations: &Registrations, loading: &Arc<AtomicBool>) -> Result<()> {
    let registrations = Arc::clone(registrations);
    let loading = Arc::clone(loading);
    let on_fn = lua
        .create_function(move |_, (name, func): (String, LuaFunction)| {
            if !loading.load(Ordering::SeqCst) {
                return Err(LuaError::runtime("on() is only available while the behavior loads"));
            }
            registrations
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((name, func));
            Ok(())
        })
        .map_err(|e| anyhow!("Failed to create on function: {e}"))?;
    lua.globals()
        .set("on", on_fn)
        .map_err(|e| anyhow!("Failed to register on function globally: {e}"))?;
    Ok(())
}

impl Behavior for LuaBehavior {
    fn install(&self, registrar: &mut HookRegistrar<'_>) -> Result<()> {
        let lua = Lua::new();
        logging::register(&lua)?;

        let registrations: Registrations = Arc::default();
        let loading = Arc::new(AtomicBool::new(true));
        register_on(&lua, &registrations, &loading)?;

        let result = lua.load(self.source.as_str()).set_name(self.name.as_str()).exec();
        loading.store(false, Ordering::SeqCst);
        result.map_err(|e| anyhow!("Failed to run {}: {e}", self.name))?;

        // Emptying the list drops the references held by `on`.
        let bound = std::mem::take(&mut *registrations.lock().unwrap_or_else(PoisonError::into_inner));
        for (name, func) in bound {
            registrar.register(
                name,
                Arc::new(LuaHook {
                    lua: lua.clone(),
                    func,
                }),
            );
        }
        Ok(())
    }
}
