//! Semantic events and the dispatch queue
//!
//! Raw protocol events are translated into [`Event`] values targeted at a
//! single widget and queued as [`EventRecord`]s in one FIFO. The queue
//! preserves arrival order with two documented exceptions: an undelivered
//! motion record is replaced in place by a newer motion for the same widget,
//! and a timer fire is not queued twice for the same `(widget, timer)` key
//! while the first record is still undelivered.

use std::collections::VecDeque;
use std::path::PathBuf;

use crate::utils::{Point, Rectangle, Size};
use crate::widget::WidgetId;

bitflags::bitflags! {
    /// Keyboard modifier state, decoupled from the X11 `KeyButMask` layout
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Modifiers: u8 {
        /// Shift is held
        const SHIFT = 1 << 0;
        /// Control is held
        const CTRL = 1 << 1;
        /// Alt (Mod1) is held
        const ALT = 1 << 2;
        /// Super / logo (Mod4) is held
        const SUPER = 1 << 3;
        /// Caps lock is latched
        const CAPS_LOCK = 1 << 4;
    }
}

/// A pointer button
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MouseButton {
    /// Left (primary) button
    Left,
    /// Middle button
    Middle,
    /// Right (secondary) button
    Right,
    /// Any other button, by X11 button index
    Other(u8),
}

/// Payload retrieved at the end of a drag-and-drop handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropData {
    /// A list of local file paths (from a `text/uri-list` transfer)
    Files(Vec<PathBuf>),
    /// Plain text
    Text(String),
}

/// One styled span of a composition string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreeditRun {
    /// first character of the run
    pub start: usize,
    /// length of the run in characters
    pub len: usize,
    /// draw with foreground and background swapped
    pub reverse: bool,
    /// draw underlined
    pub underline: bool,
}

/// A widget-level event
///
/// Every variant carries only what the widget layer needs; window ids,
/// atoms and protocol timestamps stay inside the core.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A pointer button was pressed
    ButtonPress {
        /// which button
        button: MouseButton,
        /// position in window coordinates
        position: Point,
        /// modifier state at press time
        modifiers: Modifiers,
    },
    /// The second press of a rapid same-button pair
    ///
    /// Delivered instead of (not in addition to) [`Event::ButtonPress`].
    DoubleClick {
        /// which button
        button: MouseButton,
        /// position in window coordinates
        position: Point,
        /// modifier state at press time
        modifiers: Modifiers,
    },
    /// A pointer button was released
    ButtonRelease {
        /// which button
        button: MouseButton,
        /// position in window coordinates
        position: Point,
        /// modifier state at release time
        modifiers: Modifiers,
    },
    /// The pointer moved
    Motion {
        /// position in window coordinates
        position: Point,
        /// modifier state
        modifiers: Modifiers,
    },
    /// Vertical scroll, positive away from the user
    Wheel {
        /// scroll steps, negative for up
        delta: i32,
        /// pointer position in window coordinates
        position: Point,
        /// modifier state
        modifiers: Modifiers,
    },
    /// A key was pressed
    KeyPress {
        /// X11 keysym
        keysym: u32,
        /// modifier state
        modifiers: Modifiers,
    },
    /// A key was released
    KeyRelease {
        /// X11 keysym
        keysym: u32,
        /// modifier state
        modifiers: Modifiers,
    },
    /// Committed text from the input method
    TextInput {
        /// the committed string
        text: String,
    },
    /// In-progress composition text from the input method
    ///
    /// An empty `text` means the composition ended or was cancelled and
    /// any inline preedit display should be cleared.
    Preedit {
        /// the current composition string
        text: String,
        /// caret position in characters from the start of `text`
        caret: usize,
        /// styling runs covering `text`
        runs: Vec<PreeditRun>,
    },
    /// The widget's window gained keyboard focus
    FocusIn,
    /// The widget's window lost keyboard focus
    FocusOut,
    /// The pointer entered the widget's window
    Enter {
        /// entry position in window coordinates
        position: Point,
    },
    /// The pointer left the widget's window
    Leave,
    /// The window was resized, size is the confirmed geometry
    Resized {
        /// new inner size
        size: Size,
    },
    /// A region of the window needs repainting
    Redraw {
        /// bounding box of the damaged area
        region: Rectangle,
    },
    /// The window manager asked the window to close
    CloseRequested,
    /// A timer fired
    Timer {
        /// timer id within the owning widget
        id: u32,
        /// user data passed to `add_timer`
        data: u64,
    },
    /// A drag entered the widget
    DragEnter,
    /// The drag pointer moved over the widget
    DragMotion {
        /// position in window coordinates
        position: Point,
    },
    /// The drag left the widget without dropping
    DragLeave,
    /// The drag completed over the widget
    Drop {
        /// position in window coordinates
        position: Point,
        /// the transferred payload
        data: DropData,
    },
    /// Application-defined event injected via the core
    User {
        /// application-chosen discriminator
        code: u32,
        /// opaque payload
        data: u64,
    },
}

impl Event {
    /// Whether this event participates in motion coalescing
    #[inline]
    pub fn is_motion(&self) -> bool {
        matches!(self, Event::Motion { .. })
    }
}

/// One queued delivery
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    /// the widget the event is addressed to
    pub target: WidgetId,
    /// the event itself
    pub event: Event,
}

/// The single FIFO feeding the widget dispatcher
#[derive(Debug, Default)]
pub struct EventQueue {
    records: VecDeque<EventRecord>,
}

impl EventQueue {
    /// Create an empty queue
    pub fn new() -> EventQueue {
        Default::default()
    }

    /// Queue a record for delivery
    ///
    /// A motion record replaces a still-undelivered motion for the same
    /// widget unless a non-motion record for that widget was queued in
    /// between; a timer record is dropped if the same `(widget, id)` fire
    /// is already pending. Everything else appends in FIFO order.
    pub fn push(&mut self, record: EventRecord) {
        match &record.event {
            Event::Motion { .. } => {
                // Back-scan: the most recent record for this widget decides.
                for queued in self.records.iter_mut().rev() {
                    if queued.target != record.target {
                        continue;
                    }
                    if queued.event.is_motion() {
                        *queued = record;
                        return;
                    }
                    break;
                }
            }
            Event::Timer { id, .. } => {
                let id = *id;
                let dup = self.records.iter().any(|queued| {
                    queued.target == record.target
                        && matches!(&queued.event, Event::Timer { id: qid, .. } if *qid == id)
                });
                if dup {
                    return;
                }
            }
            _ => {}
        }
        self.records.push_back(record);
    }

    /// Pop the next record in FIFO order
    pub fn pop(&mut self) -> Option<EventRecord> {
        self.records.pop_front()
    }

    /// Drop every undelivered record addressed to `target`
    pub fn remove_target(&mut self, target: WidgetId) {
        self.records.retain(|record| record.target != target);
    }

    /// Number of undelivered records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the queue holds no records
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::widget::WidgetArena;

    fn motion(x: i32, y: i32) -> Event {
        Event::Motion {
            position: Point::new(x, y),
            modifiers: Modifiers::empty(),
        }
    }

    #[test]
    fn motion_burst_coalesces_to_last_position() {
        let mut arena = WidgetArena::new();
        let w = arena.alloc();
        let mut queue = EventQueue::new();
        for i in 0..10 {
            queue.push(EventRecord {
                target: w,
                event: motion(i, i * 2),
            });
        }
        assert_eq!(queue.len(), 1);
        let record = queue.pop().unwrap();
        assert_eq!(record.event, motion(9, 18));
    }

    #[test]
    fn non_motion_record_ends_coalescing() {
        let mut arena = WidgetArena::new();
        let w = arena.alloc();
        let mut queue = EventQueue::new();
        queue.push(EventRecord {
            target: w,
            event: motion(1, 1),
        });
        queue.push(EventRecord {
            target: w,
            event: Event::ButtonPress {
                button: MouseButton::Left,
                position: Point::new(1, 1),
                modifiers: Modifiers::empty(),
            },
        });
        queue.push(EventRecord {
            target: w,
            event: motion(2, 2),
        });
        // press must stay between the two motions
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop().unwrap().event, motion(1, 1));
        assert!(matches!(
            queue.pop().unwrap().event,
            Event::ButtonPress { .. }
        ));
        assert_eq!(queue.pop().unwrap().event, motion(2, 2));
    }

    #[test]
    fn motions_for_distinct_widgets_do_not_coalesce() {
        let mut arena = WidgetArena::new();
        let a = arena.alloc();
        let b = arena.alloc();
        let mut queue = EventQueue::new();
        queue.push(EventRecord {
            target: a,
            event: motion(1, 1),
        });
        queue.push(EventRecord {
            target: b,
            event: motion(2, 2),
        });
        queue.push(EventRecord {
            target: a,
            event: motion(3, 3),
        });
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().unwrap().event, motion(3, 3));
        assert_eq!(queue.pop().unwrap().event, motion(2, 2));
    }

    #[test]
    fn duplicate_timer_fire_is_dropped() {
        let mut arena = WidgetArena::new();
        let w = arena.alloc();
        let mut queue = EventQueue::new();
        queue.push(EventRecord {
            target: w,
            event: Event::Timer { id: 7, data: 0 },
        });
        queue.push(EventRecord {
            target: w,
            event: Event::Timer { id: 7, data: 0 },
        });
        queue.push(EventRecord {
            target: w,
            event: Event::Timer { id: 8, data: 0 },
        });
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn remove_target_purges_only_that_widget() {
        let mut arena = WidgetArena::new();
        let a = arena.alloc();
        let b = arena.alloc();
        let mut queue = EventQueue::new();
        queue.push(EventRecord {
            target: a,
            event: Event::FocusIn,
        });
        queue.push(EventRecord {
            target: b,
            event: Event::FocusIn,
        });
        queue.remove_target(a);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop().unwrap().target, b);
    }
}
