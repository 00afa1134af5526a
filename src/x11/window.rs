//! Top-level window lifecycle and state machine
//!
//! A [`Window`] wraps one X11 window handle. State requested by the
//! application and state confirmed by the window manager are tracked
//! separately: queries always answer from the confirmed side, which is
//! updated asynchronously from `MapNotify`, `UnmapNotify`, `ConfigureNotify`
//! and `_NET_WM_STATE` property changes. Requests made before the window is
//! mapped accumulate in a pending mask and are sent exactly once when the
//! window actually appears.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tracing::{trace, warn};
use x11rb::connection::Connection as _;
use x11rb::protocol::xproto::{
    Atom, AtomEnum, ClientMessageEvent, ConfigureWindowAux, ConnectionExt as _, CreateWindowAux,
    EventMask, PropMode, Window as X11Window, WindowClass,
};
use x11rb::rust_connection::RustConnection;
use x11rb::wrapper::ConnectionExt as _;

use crate::utils::{Point, Rectangle, Size};
use crate::widget::WidgetId;
use super::{Atoms, Display, X11Error};

bitflags::bitflags! {
    /// Style of a top-level window, fixed at creation
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WindowStyle: u32 {
        /// Override-redirect popup, invisible to the window manager
        const POPUP = 1 << 0;
        /// No server-side decorations
        const BORDERLESS = 1 << 1;
        /// The user may resize the window
        const RESIZABLE = 1 << 2;
        /// Dialog semantics (window type hint)
        const DIALOG = 1 << 3;
        /// Transient for another window of this process
        const TRANSIENT = 1 << 4;
    }
}

bitflags::bitflags! {
    /// Requests deferred until the window is first mapped
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PendingRequests: u32 {
        /// Move to the stored position
        const MOVE = 1 << 0;
        /// Start iconified
        const ICONIFY = 1 << 1;
        /// Start maximized in both directions
        const MAXIMIZE = 1 << 2;
        /// Mark modal
        const MODAL = 1 << 3;
        /// Keep above other windows
        const ABOVE = 1 << 4;
        /// Start fullscreen
        const FULLSCREEN = 1 << 5;
    }
}

bitflags::bitflags! {
    /// Confirmed `_NET_WM_STATE` bits, as last reported by the WM
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct WmState: u32 {
        /// `_NET_WM_STATE_MAXIMIZED_HORZ`
        const MAXIMIZED_HORZ = 1 << 0;
        /// `_NET_WM_STATE_MAXIMIZED_VERT`
        const MAXIMIZED_VERT = 1 << 1;
        /// `_NET_WM_STATE_HIDDEN`
        const HIDDEN = 1 << 2;
        /// `_NET_WM_STATE_ABOVE`
        const ABOVE = 1 << 3;
        /// `_NET_WM_STATE_MODAL`
        const MODAL = 1 << 4;
        /// `_NET_WM_STATE_FULLSCREEN`
        const FULLSCREEN = 1 << 5;
    }
}

/// Map status of a window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MapState {
    /// Not mapped and no map requested
    #[default]
    Unmapped,
    /// `map` was requested, `MapNotify` not seen yet
    Pending,
    /// Visible as far as the server is concerned
    Mapped,
}

#[derive(Debug, Default)]
struct SharedState {
    map_state: MapState,
    wm_state: WmState,
    geometry: Rectangle,
    pending: PendingRequests,
    pending_position: Point,
}

impl SharedState {
    /// Hand out the accumulated pre-map requests, clearing them so they
    /// can never be applied twice
    fn take_pending(&mut self) -> (PendingRequests, Point) {
        let pending = std::mem::take(&mut self.pending);
        (pending, self.pending_position)
    }
}

#[derive(Debug)]
pub(crate) struct WindowInner {
    id: X11Window,
    root: X11Window,
    conn: Weak<RustConnection>,
    atoms: Atoms,
    style: WindowStyle,
    state: Mutex<SharedState>,
}

impl Drop for WindowInner {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.upgrade() {
            let _ = conn.destroy_window(self.id);
            let _ = conn.flush();
        }
    }
}

/// Handle to a top-level window
#[derive(Debug, Clone)]
pub struct Window(pub(crate) Arc<WindowInner>);

/// Builder for top-level windows
#[derive(Debug)]
pub struct WindowBuilder {
    title: String,
    class: String,
    size: Size,
    position: Option<Point>,
    style: WindowStyle,
    transient_for: Option<X11Window>,
}

impl Default for WindowBuilder {
    fn default() -> Self {
        WindowBuilder {
            title: String::new(),
            class: String::new(),
            size: Size::new(640, 480),
            position: None,
            style: WindowStyle::RESIZABLE,
            transient_for: None,
        }
    }
}

impl WindowBuilder {
    /// Start building a window with default style and size
    pub fn new() -> WindowBuilder {
        Default::default()
    }

    /// Set the window title
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Set the `WM_CLASS` instance and class string
    pub fn class(mut self, class: impl Into<String>) -> Self {
        self.class = class.into();
        self
    }

    /// Set the initial inner size
    pub fn size(mut self, size: impl Into<Size>) -> Self {
        self.size = size.into();
        self
    }

    /// Set the initial position
    pub fn position(mut self, position: impl Into<Point>) -> Self {
        self.position = Some(position.into());
        self
    }

    /// Replace the style flags
    pub fn style(mut self, style: WindowStyle) -> Self {
        self.style = style;
        self
    }

    /// Mark the window transient for `owner`
    pub fn transient_for(mut self, owner: &Window) -> Self {
        self.transient_for = Some(owner.0.id);
        self.style |= WindowStyle::TRANSIENT;
        self
    }

    /// Create the window on the server, unmapped
    pub fn build(self, display: &Display) -> Result<Window, X11Error> {
        let conn = &display.conn;
        let screen = &display.screen;
        let atoms = &display.atoms;

        let id = conn.generate_id()?;
        let position = self.position.unwrap_or_default();

        let mut aux = CreateWindowAux::new().event_mask(
            EventMask::EXPOSURE
                | EventMask::STRUCTURE_NOTIFY
                | EventMask::KEY_PRESS
                | EventMask::KEY_RELEASE
                | EventMask::BUTTON_PRESS
                | EventMask::BUTTON_RELEASE
                | EventMask::POINTER_MOTION
                | EventMask::ENTER_WINDOW
                | EventMask::LEAVE_WINDOW
                | EventMask::FOCUS_CHANGE
                | EventMask::PROPERTY_CHANGE,
        );
        if self.style.contains(WindowStyle::POPUP) {
            aux = aux.override_redirect(1);
        }

        conn.create_window(
            screen.root_depth,
            id,
            screen.root,
            position.x as i16,
            position.y as i16,
            self.size.w.max(1) as u16,
            self.size.h.max(1) as u16,
            0,
            WindowClass::INPUT_OUTPUT,
            screen.root_visual,
            &aux,
        )?;

        if !self.style.contains(WindowStyle::POPUP) {
            conn.change_property32(
                PropMode::REPLACE,
                id,
                atoms.WM_PROTOCOLS,
                AtomEnum::ATOM,
                &[atoms.WM_DELETE_WINDOW],
            )?;

            let window_type = if self.style.contains(WindowStyle::DIALOG) {
                atoms._NET_WM_WINDOW_TYPE_DIALOG
            } else {
                atoms._NET_WM_WINDOW_TYPE_NORMAL
            };
            conn.change_property32(
                PropMode::REPLACE,
                id,
                atoms._NET_WM_WINDOW_TYPE,
                AtomEnum::ATOM,
                &[window_type],
            )?;

            conn.change_property32(
                PropMode::REPLACE,
                id,
                atoms._MOTIF_WM_HINTS,
                atoms._MOTIF_WM_HINTS,
                &motif_hints(self.style),
            )?;
        }

        if !self.title.is_empty() {
            conn.change_property8(
                PropMode::REPLACE,
                id,
                atoms._NET_WM_NAME,
                atoms.UTF8_STRING,
                self.title.as_bytes(),
            )?;
            conn.change_property8(
                PropMode::REPLACE,
                id,
                AtomEnum::WM_NAME,
                AtomEnum::STRING,
                self.title.as_bytes(),
            )?;
        }
        if !self.class.is_empty() {
            // instance\0class\0
            let mut wm_class = Vec::with_capacity(self.class.len() * 2 + 2);
            wm_class.extend_from_slice(self.class.as_bytes());
            wm_class.push(0);
            wm_class.extend_from_slice(self.class.as_bytes());
            wm_class.push(0);
            conn.change_property8(
                PropMode::REPLACE,
                id,
                AtomEnum::WM_CLASS,
                AtomEnum::STRING,
                &wm_class,
            )?;
        }
        if let Some(owner) = self.transient_for {
            conn.change_property32(
                PropMode::REPLACE,
                id,
                AtomEnum::WM_TRANSIENT_FOR,
                AtomEnum::WINDOW,
                &[owner],
            )?;
        }

        // announce ourselves as an Xdnd target
        conn.change_property32(
            PropMode::REPLACE,
            id,
            atoms.XdndAware,
            AtomEnum::ATOM,
            &[super::dnd::DND_VERSION],
        )?;

        conn.flush()?;

        let state = SharedState {
            geometry: Rectangle::new(position, self.size),
            pending: if self.position.is_some() {
                PendingRequests::MOVE
            } else {
                PendingRequests::empty()
            },
            pending_position: position,
            ..Default::default()
        };

        trace!(window = id, style = ?self.style, "window created");
        Ok(Window(Arc::new(WindowInner {
            id,
            root: screen.root,
            conn: Arc::downgrade(conn),
            atoms: *atoms,
            style: self.style,
            state: Mutex::new(state),
        })))
    }
}

impl Window {
    /// The X11 window id
    pub(crate) fn id(&self) -> X11Window {
        self.0.id
    }

    /// The style flags the window was created with
    pub fn style(&self) -> WindowStyle {
        self.0.style
    }

    /// Confirmed inner geometry
    pub fn geometry(&self) -> Rectangle {
        self.0.state.lock().unwrap().geometry
    }

    /// Confirmed map status
    pub fn map_state(&self) -> MapState {
        self.0.state.lock().unwrap().map_state
    }

    /// Whether the WM currently reports the window maximized both ways
    pub fn is_maximized(&self) -> bool {
        self.0
            .state
            .lock()
            .unwrap()
            .wm_state
            .contains(WmState::MAXIMIZED_HORZ | WmState::MAXIMIZED_VERT)
    }

    /// Whether the WM currently reports the window hidden/iconified
    pub fn is_hidden(&self) -> bool {
        self.0.state.lock().unwrap().wm_state.contains(WmState::HIDDEN)
    }

    /// Confirmed `_NET_WM_STATE` mask
    pub fn wm_state(&self) -> WmState {
        self.0.state.lock().unwrap().wm_state
    }

    /// Ask the server to map the window
    pub fn map(&self) -> Result<(), X11Error> {
        let Some(conn) = self.0.conn.upgrade() else {
            return Ok(());
        };
        self.0.state.lock().unwrap().map_state = MapState::Pending;
        conn.map_window(self.0.id)?;
        conn.flush()?;
        Ok(())
    }

    /// Ask the server to unmap the window
    pub fn unmap(&self) -> Result<(), X11Error> {
        let Some(conn) = self.0.conn.upgrade() else {
            return Ok(());
        };
        conn.unmap_window(self.0.id)?;
        conn.flush()?;
        Ok(())
    }

    /// Replace the window title
    pub fn set_title(&self, title: &str) -> Result<(), X11Error> {
        let Some(conn) = self.0.conn.upgrade() else {
            return Ok(());
        };
        conn.change_property8(
            PropMode::REPLACE,
            self.0.id,
            self.0.atoms._NET_WM_NAME,
            self.0.atoms.UTF8_STRING,
            title.as_bytes(),
        )?;
        conn.change_property8(
            PropMode::REPLACE,
            self.0.id,
            AtomEnum::WM_NAME,
            AtomEnum::STRING,
            title.as_bytes(),
        )?;
        conn.flush()?;
        Ok(())
    }

    /// Move the window, deferred until mapped if necessary
    pub fn move_to(&self, position: impl Into<Point>) -> Result<(), X11Error> {
        let position = position.into();
        let mut state = self.0.state.lock().unwrap();
        if state.map_state != MapState::Mapped {
            state.pending |= PendingRequests::MOVE;
            state.pending_position = position;
            return Ok(());
        }
        drop(state);
        let Some(conn) = self.0.conn.upgrade() else {
            return Ok(());
        };
        conn.configure_window(
            self.0.id,
            &ConfigureWindowAux::new().x(position.x).y(position.y),
        )?;
        conn.flush()?;
        Ok(())
    }

    /// Resize the window
    pub fn resize(&self, size: impl Into<Size>) -> Result<(), X11Error> {
        let size = size.into();
        let Some(conn) = self.0.conn.upgrade() else {
            return Ok(());
        };
        conn.configure_window(
            self.0.id,
            &ConfigureWindowAux::new()
                .width(size.w.max(1) as u32)
                .height(size.h.max(1) as u32),
        )?;
        conn.flush()?;
        Ok(())
    }

    /// Request maximization, deferred until mapped if necessary
    pub fn maximize(&self) -> Result<(), X11Error> {
        self.request(PendingRequests::MAXIMIZE)
    }

    /// Request iconification, deferred until mapped if necessary
    pub fn iconify(&self) -> Result<(), X11Error> {
        self.request(PendingRequests::ICONIFY)
    }

    /// Request modal state, deferred until mapped if necessary
    pub fn set_modal(&self) -> Result<(), X11Error> {
        self.request(PendingRequests::MODAL)
    }

    /// Request keep-above, deferred until mapped if necessary
    pub fn set_always_on_top(&self) -> Result<(), X11Error> {
        self.request(PendingRequests::ABOVE)
    }

    /// Request fullscreen, deferred until mapped if necessary
    pub fn set_fullscreen(&self) -> Result<(), X11Error> {
        self.request(PendingRequests::FULLSCREEN)
    }

    fn request(&self, what: PendingRequests) -> Result<(), X11Error> {
        let mut state = self.0.state.lock().unwrap();
        if state.map_state != MapState::Mapped {
            state.pending |= what;
            return Ok(());
        }
        drop(state);
        self.send_request(what)
    }

    fn send_request(&self, what: PendingRequests) -> Result<(), X11Error> {
        let atoms = &self.0.atoms;
        for flag in what.iter() {
            match flag {
                PendingRequests::MOVE => {
                    let position = self.0.state.lock().unwrap().pending_position;
                    let Some(conn) = self.0.conn.upgrade() else {
                        continue;
                    };
                    conn.configure_window(
                        self.0.id,
                        &ConfigureWindowAux::new().x(position.x).y(position.y),
                    )?;
                }
                PendingRequests::ICONIFY => {
                    // ICCCM 4.1.4: WM_CHANGE_STATE to the root
                    self.send_wm_message(atoms.WM_CHANGE_STATE, [3, 0, 0, 0, 0])?;
                }
                PendingRequests::MAXIMIZE => {
                    self.send_net_wm_state(
                        true,
                        atoms._NET_WM_STATE_MAXIMIZED_HORZ,
                        atoms._NET_WM_STATE_MAXIMIZED_VERT,
                    )?;
                }
                PendingRequests::MODAL => {
                    self.send_net_wm_state(true, atoms._NET_WM_STATE_MODAL, 0)?;
                }
                PendingRequests::ABOVE => {
                    self.send_net_wm_state(true, atoms._NET_WM_STATE_ABOVE, 0)?;
                }
                PendingRequests::FULLSCREEN => {
                    self.send_net_wm_state(true, atoms._NET_WM_STATE_FULLSCREEN, 0)?;
                }
                _ => {}
            }
        }
        if let Some(conn) = self.0.conn.upgrade() {
            conn.flush()?;
        }
        Ok(())
    }

    fn send_net_wm_state(&self, add: bool, first: Atom, second: Atom) -> Result<(), X11Error> {
        self.send_wm_message(
            self.0.atoms._NET_WM_STATE,
            [u32::from(add), first, second, 1, 0],
        )
    }

    fn send_wm_message(&self, type_: Atom, data: [u32; 5]) -> Result<(), X11Error> {
        let Some(conn) = self.0.conn.upgrade() else {
            return Ok(());
        };
        conn.send_event(
            false,
            self.0.root,
            EventMask::SUBSTRUCTURE_REDIRECT | EventMask::SUBSTRUCTURE_NOTIFY,
            ClientMessageEvent::new(32, self.0.id, type_, data),
        )?;
        Ok(())
    }

    /// The window became visible; flush the pre-map requests exactly once
    pub(crate) fn handle_map_notify(&self) -> Result<(), X11Error> {
        let (pending, _) = {
            let mut state = self.0.state.lock().unwrap();
            state.map_state = MapState::Mapped;
            state.take_pending()
        };
        if !pending.is_empty() {
            trace!(window = self.0.id, ?pending, "applying deferred requests");
            self.send_request(pending)?;
        }
        Ok(())
    }

    /// The window was unmapped by us or the WM
    pub(crate) fn handle_unmap_notify(&self) {
        self.0.state.lock().unwrap().map_state = MapState::Unmapped;
    }

    /// Confirmed geometry changed
    pub(crate) fn handle_configure_notify(&self, geometry: Rectangle) -> bool {
        let mut state = self.0.state.lock().unwrap();
        let resized = state.geometry.size != geometry.size;
        state.geometry = geometry;
        resized
    }

    /// Re-read `_NET_WM_STATE` after a property change
    pub(crate) fn refresh_wm_state(&self) -> Result<(), X11Error> {
        let Some(conn) = self.0.conn.upgrade() else {
            return Ok(());
        };
        let atoms = &self.0.atoms;
        let reply = conn
            .get_property(
                false,
                self.0.id,
                atoms._NET_WM_STATE,
                AtomEnum::ATOM,
                0,
                1024,
            )?
            .reply_unchecked()?;

        let mut wm_state = WmState::empty();
        if let Some(values) = reply.as_ref().and_then(|reply| reply.value32()) {
            for atom in values {
                wm_state |= match atom {
                    x if x == atoms._NET_WM_STATE_MAXIMIZED_HORZ => WmState::MAXIMIZED_HORZ,
                    x if x == atoms._NET_WM_STATE_MAXIMIZED_VERT => WmState::MAXIMIZED_VERT,
                    x if x == atoms._NET_WM_STATE_HIDDEN => WmState::HIDDEN,
                    x if x == atoms._NET_WM_STATE_ABOVE => WmState::ABOVE,
                    x if x == atoms._NET_WM_STATE_MODAL => WmState::MODAL,
                    x if x == atoms._NET_WM_STATE_FULLSCREEN => WmState::FULLSCREEN,
                    _ => WmState::empty(),
                };
            }
        }
        self.0.state.lock().unwrap().wm_state = wm_state;
        Ok(())
    }

    /// Update `_NET_WM_USER_TIME`, if the WM supports it
    pub(crate) fn set_user_time(&self, display: &Display, time: u32) {
        if !display.caps.user_time {
            return;
        }
        let Some(conn) = self.0.conn.upgrade() else {
            return;
        };
        let sent = conn.change_property32(
            PropMode::REPLACE,
            self.0.id,
            self.0.atoms._NET_WM_USER_TIME,
            AtomEnum::CARDINAL,
            &[time],
        );
        if let Err(err) = sent {
            warn!(?err, "failed to update user time");
        }
    }
}

/// Motif decoration hints derived from the style flags
///
/// Layout: flags, functions, decorations, input mode, status. Only the
/// decorations field (flag bit 1) is filled in.
fn motif_hints(style: WindowStyle) -> [u32; 5] {
    let decorations =
        !(style.contains(WindowStyle::BORDERLESS) || style.contains(WindowStyle::POPUP));
    [1 << 1, 0, u32::from(decorations), 0, 0]
}

/// All windows of the core, keyed by their X11 id
///
/// Holds weak references only; a window whose last [`Window`] handle was
/// dropped simply disappears from lookups.
#[derive(Debug, Default)]
pub(crate) struct WindowRegistry {
    windows: HashMap<X11Window, (WidgetId, Weak<WindowInner>)>,
}

impl WindowRegistry {
    pub(crate) fn insert(&mut self, window: &Window, widget: WidgetId) {
        self.windows
            .insert(window.id(), (widget, Arc::downgrade(&window.0)));
    }

    pub(crate) fn remove(&mut self, id: X11Window) {
        self.windows.remove(&id);
    }

    /// Resolve an X11 window id to its widget and handle
    ///
    /// Unknown or already-dropped windows yield `None`; events for them
    /// are stale and must be discarded, not treated as errors.
    pub(crate) fn get(&self, id: X11Window) -> Option<(WidgetId, Window)> {
        let (widget, inner) = self.windows.get(&id)?;
        Some((*widget, Window(inner.upgrade()?)))
    }

    /// Widget owning an X11 window, without upgrading the handle
    pub(crate) fn widget_of(&self, id: X11Window) -> Option<WidgetId> {
        self.windows.get(&id).map(|(widget, _)| *widget)
    }

    /// Remove entries for windows owned by `widget`, returning their ids
    pub(crate) fn remove_widget(&mut self, widget: WidgetId) -> Vec<X11Window> {
        let ids: Vec<_> = self
            .windows
            .iter()
            .filter(|(_, (owner, _))| *owner == widget)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            self.windows.remove(id);
        }
        ids
    }

    /// Drop entries whose window handle is gone
    pub(crate) fn prune(&mut self) {
        self.windows
            .retain(|_, (_, inner)| inner.strong_count() > 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_requests_are_taken_exactly_once() {
        let mut state = SharedState::default();
        state.pending |= PendingRequests::MAXIMIZE | PendingRequests::MODAL;

        let (first, _) = state.take_pending();
        assert_eq!(first, PendingRequests::MAXIMIZE | PendingRequests::MODAL);

        let (second, _) = state.take_pending();
        assert!(second.is_empty());
    }

    #[test]
    fn motif_hints_strip_decorations_for_borderless() {
        assert_eq!(motif_hints(WindowStyle::BORDERLESS)[2], 0);
        assert_eq!(motif_hints(WindowStyle::POPUP)[2], 0);
        assert_eq!(motif_hints(WindowStyle::RESIZABLE)[2], 1);
    }

    #[test]
    fn map_state_starts_unmapped() {
        let state = SharedState::default();
        assert_eq!(state.map_state, MapState::Unmapped);
        assert!(state.pending.is_empty());
    }
}
