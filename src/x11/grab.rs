//! Exclusive pointer and keyboard capture
//!
//! At most one pointer grab and one keyboard grab exist at a time,
//! process-wide. The pointer grab goes through the XInput2 device path
//! when the extension is available, because a core grab stops motion
//! delivery while a stylus button is held; whichever path was used is
//! recorded so the matching ungrab request is sent later. Re-grabbing
//! releases the previous grab first; ungrabbing with nothing held is a
//! no-op.

use tracing::{debug, warn};
use x11rb::connection::Connection as _;
use x11rb::protocol::xinput::{self, ConnectionExt as _};
use x11rb::protocol::xproto::{ConnectionExt as _, EventMask, GrabMode, GrabStatus};

use crate::widget::WidgetId;
use super::{window::Window, Display, X11Error};

// XIAllMasterDevices
const ALL_MASTER_DEVICES: u16 = 1;

/// Which protocol path a pointer grab went through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PointerPath {
    Core,
    XInput { deviceid: u16 },
}

#[derive(Debug, Clone, Copy)]
struct PointerGrab {
    owner: WidgetId,
    path: PointerPath,
}

#[derive(Debug, Clone, Copy)]
struct KeyboardGrab {
    owner: WidgetId,
}

/// Bookkeeping and protocol driver for the two grab classes
#[derive(Debug, Default)]
pub(crate) struct GrabManager {
    pointer: Option<PointerGrab>,
    keyboard: Option<KeyboardGrab>,
}

impl GrabManager {
    /// Widget currently holding the pointer grab
    pub(crate) fn pointer_owner(&self) -> Option<WidgetId> {
        self.pointer.map(|grab| grab.owner)
    }

    /// Widget currently holding the keyboard grab
    pub(crate) fn keyboard_owner(&self) -> Option<WidgetId> {
        self.keyboard.map(|grab| grab.owner)
    }

    /// Route all pointer events to `owner` until ungrabbed
    ///
    /// Returns `false` if the server refused the grab; any previous grab
    /// has been released either way.
    pub(crate) fn grab_pointer(
        &mut self,
        display: &Display,
        owner: WidgetId,
        window: &Window,
    ) -> Result<bool, X11Error> {
        // last request wins
        self.ungrab_pointer(display)?;

        let time = display.last_event_time;
        let path = if display.caps.xinput {
            let mask: u32 = (xinput::XIEventMask::BUTTON_PRESS
                | xinput::XIEventMask::BUTTON_RELEASE
                | xinput::XIEventMask::MOTION)
                .into();
            let reply = display
                .conn
                .xinput_xi_grab_device(
                    window.id(),
                    time,
                    x11rb::NONE,
                    ALL_MASTER_DEVICES,
                    GrabMode::ASYNC,
                    GrabMode::ASYNC,
                    xinput::GrabOwner::OWNER,
                    &[mask],
                )?
                .reply()?;
            if reply.status != GrabStatus::SUCCESS {
                warn!(status = ?reply.status, "XI2 pointer grab refused");
                return Ok(false);
            }
            PointerPath::XInput {
                deviceid: ALL_MASTER_DEVICES,
            }
        } else {
            let reply = display
                .conn
                .grab_pointer(
                    true,
                    window.id(),
                    EventMask::BUTTON_PRESS
                        | EventMask::BUTTON_RELEASE
                        | EventMask::POINTER_MOTION,
                    GrabMode::ASYNC,
                    GrabMode::ASYNC,
                    x11rb::NONE,
                    x11rb::NONE,
                    time,
                )?
                .reply()?;
            if reply.status != GrabStatus::SUCCESS {
                warn!(status = ?reply.status, "pointer grab refused");
                return Ok(false);
            }
            PointerPath::Core
        };

        debug!(?owner, ?path, "pointer grabbed");
        self.pointer = Some(PointerGrab { owner, path });
        Ok(true)
    }

    /// Release the pointer grab through the path that created it
    pub(crate) fn ungrab_pointer(&mut self, display: &Display) -> Result<(), X11Error> {
        let Some(grab) = self.pointer.take() else {
            return Ok(());
        };
        match grab.path {
            PointerPath::Core => {
                display.conn.ungrab_pointer(x11rb::CURRENT_TIME)?;
            }
            PointerPath::XInput { deviceid } => {
                display
                    .conn
                    .xinput_xi_ungrab_device(x11rb::CURRENT_TIME, deviceid)?;
            }
        }
        display.conn.flush()?;
        debug!(owner = ?grab.owner, "pointer ungrabbed");
        Ok(())
    }

    /// Route all keyboard events to `owner` until ungrabbed
    pub(crate) fn grab_keyboard(
        &mut self,
        display: &Display,
        owner: WidgetId,
        window: &Window,
    ) -> Result<bool, X11Error> {
        self.ungrab_keyboard(display)?;

        let reply = display
            .conn
            .grab_keyboard(
                true,
                window.id(),
                display.last_event_time,
                GrabMode::ASYNC,
                GrabMode::ASYNC,
            )?
            .reply()?;
        if reply.status != GrabStatus::SUCCESS {
            warn!(status = ?reply.status, "keyboard grab refused");
            return Ok(false);
        }

        debug!(?owner, "keyboard grabbed");
        self.keyboard = Some(KeyboardGrab { owner });
        Ok(true)
    }

    /// Release the keyboard grab; no-op when nothing is held
    pub(crate) fn ungrab_keyboard(&mut self, display: &Display) -> Result<(), X11Error> {
        let Some(grab) = self.keyboard.take() else {
            return Ok(());
        };
        display.conn.ungrab_keyboard(x11rb::CURRENT_TIME)?;
        display.conn.flush()?;
        debug!(owner = ?grab.owner, "keyboard ungrabbed");
        Ok(())
    }

    /// Release any grab held by a widget that is going away
    pub(crate) fn widget_destroyed(
        &mut self,
        display: &Display,
        widget: WidgetId,
    ) -> Result<(), X11Error> {
        if self.pointer_owner() == Some(widget) {
            self.ungrab_pointer(display)?;
        }
        if self.keyboard_owner() == Some(widget) {
            self.ungrab_keyboard(display)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::widget::WidgetArena;

    #[test]
    fn owners_are_tracked_per_class() {
        let mut arena = WidgetArena::new();
        let a = arena.alloc();
        let b = arena.alloc();

        let mut grabs = GrabManager::default();
        assert_eq!(grabs.pointer_owner(), None);
        assert_eq!(grabs.keyboard_owner(), None);

        grabs.pointer = Some(PointerGrab {
            owner: a,
            path: PointerPath::Core,
        });
        grabs.keyboard = Some(KeyboardGrab { owner: b });
        assert_eq!(grabs.pointer_owner(), Some(a));
        assert_eq!(grabs.keyboard_owner(), Some(b));
    }

    #[test]
    fn taking_a_grab_clears_it() {
        let mut arena = WidgetArena::new();
        let a = arena.alloc();
        let mut grabs = GrabManager::default();
        grabs.pointer = Some(PointerGrab {
            owner: a,
            path: PointerPath::XInput { deviceid: 1 },
        });

        let taken = grabs.pointer.take().unwrap();
        assert_eq!(taken.path, PointerPath::XInput { deviceid: 1 });
        // mirrors the no-op ungrab case
        assert!(grabs.pointer.take().is_none());
    }
}
