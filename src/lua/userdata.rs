//! Userdata handed to Lua hooks as `server` and `client`.
//!
//! # `server`
//!
//! ```lua
//! local w, h = server:size()
//! local r, g, b, a = server:get_pixel(x, y)   -- nil when out of bounds
//! server:set_pixel(x, y, r, g, b [, a])
//! server:clear([r, g, b])
//! server:set_title("Pixelflut")
//! local path = server:save([path])
//! local s = server:stats()    -- { ticks, pixels, pps, clients }
//! local n = server:clients()
//! ```
//!
//! # `client`
//!
//! ```lua
//! client:send("hello")        -- false once the client is gone
//! client:disconnect()
//! client:address()            -- "10.0.0.7"
//! client:pixels()
//! client:connected_at()       -- RFC 3339 timestamp
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use mlua::prelude::*;

use crate::canvas::Canvas;
use crate::framebuffer::Rgba;
use crate::net::ClientHandle;

/// `server` argument of every Lua hook.
#[derive(Debug, Clone)]
pub struct LuaCanvas(pub Arc<Canvas>);

impl LuaUserData for LuaCanvas {
    fn add_methods<M: LuaUserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("size", |_, this, ()| Ok(this.0.size()));

        methods.add_method("get_pixel", |_, this, (x, y): (i64, i64)| {
            // Four nils when out of bounds.
            Ok(match this.0.framebuffer().get_pixel(x, y) {
                Ok(p) => (Some(p.r), Some(p.g), Some(p.b), Some(p.a)),
                Err(_) => (None, None, None, None),
            })
        });

        methods.add_method(
            "set_pixel",
            |_, this, (x, y, r, g, b, a): (i64, i64, u8, u8, u8, Option<u8>)| {
                let color = Rgba::new(r, g, b, a.unwrap_or(255));
                this.0.framebuffer().set_pixel(x, y, color);
                Ok(())
            },
        );

        methods.add_method("clear", |_, this, (r, g, b): (Option<u8>, Option<u8>, Option<u8>)| {
            this.0
                .framebuffer()
                .clear(r.unwrap_or(0), g.unwrap_or(0), b.unwrap_or(0));
            Ok(())
        });

        methods.add_method("set_title", |_, this, title: String| {
            this.0.set_title(title);
            Ok(())
        });

        methods.add_method("save", |_, this, path: Option<String>| {
            let path = path.map(PathBuf::from);
            let saved = this.0.save(path.as_deref());
            Ok(saved.display().to_string())
        });

        methods.add_method("stats", |lua, this, ()| {
            let stats = this.0.stats();
            let t = lua.create_table()?;
            t.set("ticks", stats.ticks())?;
            t.set("pixels", stats.pixels())?;
            t.set("pps", stats.pixels_per_second())?;
            t.set("clients", stats.clients())?;
            Ok(t)
        });

        methods.add_method("clients", |_, this, ()| Ok(this.0.stats().clients()));
    }
}

/// `client` argument of client-scoped Lua hooks.
#[derive(Debug, Clone)]
pub struct LuaClient(pub ClientHandle);

impl LuaUserData for LuaClient {
    fn add_methods<M: LuaUserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("send", |_, this, line: String| Ok(this.0.send(line)));

        methods.add_method("disconnect", |_, this, ()| {
            this.0.disconnect();
            Ok(())
        });

        methods.add_method("address", |_, this, ()| Ok(this.0.identity().to_string()));

        methods.add_method("pixels", |_, this, ()| Ok(this.0.pixels()));

        methods.add_method("connected_at", |_, this, ()| Ok(this.0.connected_at().to_rfc3339()));
    }
}
