//! `log` table for behavior scripts.
//!
//! ```lua
//! log.info("behavior loaded")
//! log.warn("canvas is " .. w .. "x" .. h)
//! ```
//!
//! Messages go through the `log` crate with target `lua`, so they share the
//! server's output and level filter.

use anyhow::{anyhow, Result};
use mlua::prelude::*;

/// Register the global `log` table (`info`, `warn`, `error`, `debug`).
///
/// # Errors
///
/// Returns an error if Lua table or function creation fails.
pub fn register(lua: &Lua) -> Result<()> {
    let log_table = lua
        .create_table()
        .map_err(|e| anyhow!("Failed to create log table: {e}"))?;

    let levels = [
        ("info", log::Level::Info),
        ("warn", log::Level::Warn),
        ("error", log::Level::Error),
        ("debug", log::Level::Debug),
    ];
    for (name, level) in levels {
        let func = lua
            .create_function(move |_, msg: LuaValue| {
                let text = match &msg {
                    LuaValue::String(s) => s.to_string_lossy().to_string(),
                    other => format!("{other:?}"),
                };
                log::log!(target: "lua", level, "{}", text);
                Ok(())
            })
            .map_err(|e| anyhow!("Failed to create log.{name} function: {e}"))?;
        log_table
            .set(name, func)
            .map_err(|e| anyhow!("Failed to set log.{name}: {e}"))?;
    }

    lua.globals()
        .set("log", log_table)
        .map_err(|e| anyhow!("Failed to register log table globally: {e}"))?;
    Ok(())
}
