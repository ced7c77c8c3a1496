//! Registry for host-provided context menus
//!
//! When a remote plugin asks for a context menu, the native host hands back
//! an opaque menu object. That object never crosses the process boundary;
//! it is parked here under a small integer handle, together with every
//! per-item target created against it. Releasing the handle drops the menu
//! and all its targets as one unit, inside a single registry critical
//! section.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::{BridgeError, Result};
use crate::protocol::ContextMenuHandle;

/// A live menu object supplied by the embedding host.
pub trait HostContextMenu: Send {
    fn add_item(&mut self, tag: i32, name: &str);
    /// Show the menu at host-window coordinates. Returns whether the host
    /// actually displayed it.
    fn popup(&mut self, x: i32, y: i32) -> bool;
}

/// Callback target for one menu item. Created on demand when the remote
/// plugin adds an item, released with the menu.
pub trait MenuTarget: Send {
    fn item_selected(&self) -> Result<()>;
}

struct MenuEntry {
    // None while the menu is checked out into a popup call.
    menu: Option<Box<dyn HostContextMenu>>,
    targets: HashMap<i32, Box<dyn MenuTarget>>,
}

#[derive(Default)]
pub struct ContextMenuRegistry {
    inner: Mutex<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    menus: HashMap<u64, MenuEntry>,
}

impl ContextMenuRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a host menu object and hand out its bridge-side identity.
    pub fn register(&self, menu: Box<dyn HostContextMenu>) -> ContextMenuHandle {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.menus.insert(
            id,
            MenuEntry {
                menu: Some(menu),
                targets: HashMap::new(),
            },
        );
        ContextMenuHandle(id)
    }

    /// Add an item and its selection target to a registered menu.
    pub fn add_item(
        &self,
        handle: ContextMenuHandle,
        tag: i32,
        name: &str,
        target: Box<dyn MenuTarget>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = inner
            .menus
            .get_mut(&handle.0)
            .ok_or(BridgeError::MenuInvalid(handle.0))?;
        let menu = entry
            .menu
            .as_mut()
            .ok_or(BridgeError::MenuInvalid(handle.0))?;
        menu.add_item(tag, name);
        entry.targets.insert(tag, target);
        Ok(())
    }

    /// Show the menu. A modal host menu blocks in here and fires its
    /// selections back through [`select`](Self::select) before returning,
    /// so the menu is checked out and called with the registry unlocked.
    pub fn popup(&self, handle: ContextMenuHandle, x: i32, y: i32) -> Result<bool> {
        let mut menu = {
            let mut inner = self.inner.lock();
            let entry = inner
                .menus
                .get_mut(&handle.0)
                .ok_or(BridgeError::MenuInvalid(handle.0))?;
            entry
                .menu
                .take()
                .ok_or(BridgeError::MenuInvalid(handle.0))?
        };
        let shown = menu.popup(x, y);
        let mut inner = self.inner.lock();
        // Dropped here instead if the handle was released mid-popup.
        if let Some(entry) = inner.menus.get_mut(&handle.0) {
            entry.menu = Some(menu);
        }
        Ok(shown)
    }

    /// Fire the target registered under `tag`. Used by host menu
    /// implementations when the user picks an item.
    pub fn select(&self, handle: ContextMenuHandle, tag: i32) -> Result<()> {
        let inner = self.inner.lock();
        let entry = inner
            .menus
            .get(&handle.0)
            .ok_or(BridgeError::MenuInvalid(handle.0))?;
        let target = entry
            .targets
            .get(&tag)
            .ok_or(BridgeError::MenuInvalid(handle.0))?;
        target.item_selected()
    }

    /// Drop the menu and every target registered against it, atomically.
    /// Later operations on the handle fail with `MenuInvalid`.
    pub fn unregister(&self, handle: ContextMenuHandle) -> Result<()> {
        self.inner
            .lock()
            .menus
            .remove(&handle.0)
            .map(|_| ())
            .ok_or(BridgeError::MenuInvalid(handle.0))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().menus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().menus.is_empty()
    }
}
