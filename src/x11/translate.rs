//! Raw protocol values to semantic event values
//!
//! Pure translation helpers used by the core's event pump: modifier and
//! button mapping, keycode to keysym resolution and double-click
//! detection. Kept free of connection I/O so the rules are testable.

use x11rb::connection::Connection as _;
use x11rb::protocol::xproto::ConnectionExt as _;

use crate::event::{Modifiers, MouseButton};
use crate::utils::Point;
use crate::widget::WidgetId;
use super::{Display, X11Error};

/// Presses closer together than this are a double-click candidate
pub(crate) const DOUBLE_CLICK_MS: u32 = 400;
/// Maximum pointer travel between the two presses, Chebyshev metric
pub(crate) const DOUBLE_CLICK_SLOP: i32 = 5;

/// Convert an X11 `KeyButMask` (or XI2 effective mods) to the neutral set
pub(crate) fn modifiers_from_raw(state: u32) -> Modifiers {
    let mut mods = Modifiers::empty();
    if state & 0x01 != 0 {
        mods |= Modifiers::SHIFT;
    }
    if state & 0x02 != 0 {
        mods |= Modifiers::CAPS_LOCK;
    }
    if state & 0x04 != 0 {
        mods |= Modifiers::CTRL;
    }
    if state & 0x08 != 0 {
        mods |= Modifiers::ALT;
    }
    if state & 0x40 != 0 {
        mods |= Modifiers::SUPER;
    }
    mods
}

/// What an X11 button index means
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PointerButton {
    /// A real button
    Button(MouseButton),
    /// A scroll step encoded as a button press
    Wheel(i32),
}

/// Map an X11 button index; 4 and 5 are the vertical scroll wheel
pub(crate) fn translate_button(detail: u8) -> PointerButton {
    match detail {
        1 => PointerButton::Button(MouseButton::Left),
        2 => PointerButton::Button(MouseButton::Middle),
        3 => PointerButton::Button(MouseButton::Right),
        4 => PointerButton::Wheel(-1),
        5 => PointerButton::Wheel(1),
        n => PointerButton::Button(MouseButton::Other(n)),
    }
}

/// Snapshot of the server's keycode to keysym table
///
/// Refreshed on `MappingNotify`; lookups never hit the server.
#[derive(Debug, Default)]
pub(crate) struct KeyMap {
    first_keycode: u8,
    keysyms_per_keycode: u8,
    keysyms: Vec<u32>,
}

impl KeyMap {
    pub(crate) fn refresh(&mut self, display: &Display) -> Result<(), X11Error> {
        let setup = display.conn.setup();
        let first = setup.min_keycode;
        let count = setup.max_keycode - setup.min_keycode + 1;
        let reply = display.conn.get_keyboard_mapping(first, count)?.reply()?;
        self.first_keycode = first;
        self.keysyms_per_keycode = reply.keysyms_per_keycode;
        self.keysyms = reply.keysyms;
        Ok(())
    }

    /// Resolve a keycode to a keysym, honoring the shift column
    pub(crate) fn keysym(&self, keycode: u8, shifted: bool) -> u32 {
        if keycode < self.first_keycode || self.keysyms_per_keycode == 0 {
            return 0;
        }
        let row = (keycode - self.first_keycode) as usize * self.keysyms_per_keycode as usize;
        let column = usize::from(shifted && self.keysyms_per_keycode > 1);
        let sym = self.keysyms.get(row + column).copied().unwrap_or(0);
        if sym == 0 && column == 1 {
            // no shifted binding, fall back to the plain one
            self.keysyms.get(row).copied().unwrap_or(0)
        } else {
            sym
        }
    }
}

/// Double-click detector
///
/// A press within [`DOUBLE_CLICK_MS`] and [`DOUBLE_CLICK_SLOP`] of the
/// previous same-button press on the same widget is reported as the second
/// half of a double-click, and the cycle restarts so a third press begins
/// a fresh single click.
#[derive(Debug, Default)]
pub(crate) struct ClickTracker {
    last: Option<LastPress>,
}

#[derive(Debug, Clone, Copy)]
struct LastPress {
    target: WidgetId,
    button: MouseButton,
    time: u32,
    position: Point,
}

impl ClickTracker {
    /// Record a press; returns `true` if it completes a double-click
    pub(crate) fn on_press(
        &mut self,
        target: WidgetId,
        button: MouseButton,
        time: u32,
        position: Point,
    ) -> bool {
        let is_double = self.last.is_some_and(|last| {
            last.target == target
                && last.button == button
                && time.wrapping_sub(last.time) <= DOUBLE_CLICK_MS
                && last.position.chebyshev_distance(&position) <= DOUBLE_CLICK_SLOP
        });
        if is_double {
            self.last = None;
        } else {
            self.last = Some(LastPress {
                target,
                button,
                time,
                position,
            });
        }
        is_double
    }

    /// Forget the pending press, e.g. when its widget is destroyed
    pub(crate) fn reset(&mut self, target: WidgetId) {
        if self.last.is_some_and(|last| last.target == target) {
            self.last = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::widget::WidgetArena;

    #[test]
    fn modifier_bits_map_to_neutral_set() {
        let mods = modifiers_from_raw(0x01 | 0x04 | 0x40);
        assert_eq!(mods, Modifiers::SHIFT | Modifiers::CTRL | Modifiers::SUPER);
        assert_eq!(modifiers_from_raw(0), Modifiers::empty());
    }

    #[test]
    fn wheel_buttons_become_scroll_steps() {
        assert_eq!(translate_button(4), PointerButton::Wheel(-1));
        assert_eq!(translate_button(5), PointerButton::Wheel(1));
        assert_eq!(
            translate_button(1),
            PointerButton::Button(MouseButton::Left)
        );
        assert_eq!(
            translate_button(8),
            PointerButton::Button(MouseButton::Other(8))
        );
    }

    #[test]
    fn rapid_same_button_press_is_a_double_click() {
        let mut arena = WidgetArena::new();
        let w = arena.alloc();
        let mut clicks = ClickTracker::default();
        let at = Point::new(100, 100);

        assert!(!clicks.on_press(w, MouseButton::Left, 1000, at));
        assert!(clicks.on_press(w, MouseButton::Left, 1200, Point::new(103, 98)));
        // the cycle restarted; a third press is single again
        assert!(!clicks.on_press(w, MouseButton::Left, 1300, at));
    }

    #[test]
    fn slow_or_distant_presses_stay_single() {
        let mut arena = WidgetArena::new();
        let w = arena.alloc();
        let mut clicks = ClickTracker::default();
        let at = Point::new(100, 100);

        assert!(!clicks.on_press(w, MouseButton::Left, 1000, at));
        // too late
        assert!(!clicks.on_press(w, MouseButton::Left, 1500, at));
        // too far
        assert!(!clicks.on_press(w, MouseButton::Left, 1600, Point::new(150, 100)));
    }

    #[test]
    fn different_button_or_widget_does_not_pair() {
        let mut arena = WidgetArena::new();
        let a = arena.alloc();
        let b = arena.alloc();
        let mut clicks = ClickTracker::default();
        let at = Point::new(0, 0);

        assert!(!clicks.on_press(a, MouseButton::Left, 100, at));
        assert!(!clicks.on_press(a, MouseButton::Right, 150, at));
        assert!(!clicks.on_press(b, MouseButton::Right, 200, at));
    }

    #[test]
    fn keysym_lookup_uses_shift_column() {
        let map = KeyMap {
            first_keycode: 8,
            keysyms_per_keycode: 2,
            // keycode 8: 'a'/'A', keycode 9: '1' with no shifted binding
            keysyms: vec![0x61, 0x41, 0x31, 0x00],
        };
        assert_eq!(map.keysym(8, false), 0x61);
        assert_eq!(map.keysym(8, true), 0x41);
        assert_eq!(map.keysym(9, true), 0x31);
        assert_eq!(map.keysym(7, false), 0);
    }
}
