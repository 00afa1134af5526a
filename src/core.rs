//! The session object and dispatch loop
//!
//! One [`Core`] owns the display connection, the widget arena, the window
//! registry, the timer queue and the event queue, plus the selection,
//! drag-and-drop, input-method and grab machinery. The application state
//! implements [`EaselHandler`] and hands the core back through
//! `core_state`, following the usual inversion: callbacks receive `&mut`
//! access to both sides without locking, because everything runs on the
//! one thread that owns the connection.
//!
//! A dispatch cycle is: block until the socket is readable, the wakeup fd
//! is signalled or the earliest timer is due; drain every ready protocol
//! event into the queue; fire due timers; drain cross-thread injections;
//! flush accumulated damage; then pop and deliver records one at a time,
//! dropping those whose target widget died in the meantime.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};
use x11rb::connection::Connection as _;
use x11rb::protocol::xproto::{KeyPressEvent, Property};
use x11rb::protocol::Event as X11Event;

use crate::event::{Event, EventQueue, EventRecord};
use crate::timer::TimerQueue;
use crate::utils::{Point, Rectangle, Size};
use crate::widget::{WidgetArena, WidgetId};
use crate::x11::dnd::DndEngine;
use crate::x11::grab::GrabManager;
use crate::x11::im::ImBridge;
use crate::x11::selection::{ProduceFn, Selection, SelectionBroker};
use crate::x11::translate::{
    modifiers_from_raw, translate_button, ClickTracker, KeyMap, PointerButton,
};
use crate::x11::window::{Window, WindowBuilder, WindowRegistry, WindowStyle};
use crate::x11::{Display, Wakeup, X11Error};

/// Identifier of a [`Core`] instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoreId(usize);

/// Tunables of a [`Core`]
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// How long the clipboard reader, the clipboard-manager handover and
    /// the drop payload transfer wait for an unresponsive peer
    pub peer_timeout: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            peer_timeout: Duration::from_secs(1),
        }
    }
}

/// Callbacks the application implements on its state type
///
/// `Core::dispatch` takes the application state and re-borrows the core
/// through [`core_state`](EaselHandler::core_state) between callbacks, so
/// every callback may freely use both.
pub trait EaselHandler {
    /// Access the core owned by this application state
    fn core_state(&mut self) -> &mut Core;

    /// Deliver one event to a widget
    ///
    /// The return path carries nothing; delivery of later records does
    /// not depend on what the handler does with this one.
    fn widget_event(&mut self, widget: WidgetId, event: Event);

    /// Resolve a point in `toplevel`'s window to the widget under it
    ///
    /// Used by drag-and-drop to recompute the hover widget on every
    /// position update. `None` means nothing there accepts a drop.
    fn widget_at(&mut self, toplevel: WidgetId, position: Point) -> Option<WidgetId>;

    /// The text caret position of `widget`, in its window's coordinates
    ///
    /// Anchors the input-method preedit popup. `None` leaves the popup
    /// where it is.
    fn caret_position(&mut self, widget: WidgetId) -> Option<Point>;
}

/// An application event injected from another thread
#[derive(Debug)]
struct Injected {
    target: WidgetId,
    code: u32,
    data: u64,
}

/// Cross-thread sender of [`Event::User`] records
///
/// Cloneable and sendable. Each `post` wakes the UI thread's wait
/// primitive, so injected events are picked up promptly even when no
/// protocol traffic arrives.
#[derive(Debug, Clone)]
pub struct EventPoster {
    wakeup: Wakeup,
    injected: Arc<Mutex<Vec<Injected>>>,
}

impl EventPoster {
    /// Queue an [`Event::User`] for `target` and wake the UI thread
    pub fn post(&self, target: WidgetId, code: u32, data: u64) {
        self.injected.lock().unwrap().push(Injected { target, code, data });
        self.wakeup.wake();
    }
}

/// The windowing and event core
///
/// Owns one display connection and everything hanging off it. Created
/// with [`Core::new`], driven by calling [`Core::dispatch`] in a loop.
#[derive(Debug)]
pub struct Core {
    id: CoreId,
    config: CoreConfig,
    display: Display,
    arena: WidgetArena,
    registry: WindowRegistry,
    timers: TimerQueue,
    queue: EventQueue,
    grabs: GrabManager,
    broker: SelectionBroker,
    dnd: DndEngine,
    im: ImBridge,
    keymap: KeyMap,
    clicks: ClickTracker,
    damage: HashMap<WidgetId, Rectangle>,
    injected: Arc<Mutex<Vec<Injected>>>,
    /// events drained by a scoped sub-pump, replayed before the socket
    stash: Vec<X11Event>,
}

impl Drop for Core {
    fn drop(&mut self) {
        // keep the clipboard alive past our exit if a manager is running
        let mut stash = Vec::new();
        let _ = self
            .broker
            .save_to_manager(&self.display, self.config.peer_timeout, &mut stash);
        if let Err(err) = self.im.shutdown(&self.display) {
            debug!(?err, "input method shutdown failed");
        }
        debug!(id = ?self.id, "core shut down");
    }
}

impl Core {
    /// Connect to the display and set up an empty session
    pub fn new(config: CoreConfig) -> Result<Core, X11Error> {
        let display = Display::connect()?;
        let mut keymap = KeyMap::default();
        keymap.refresh(&display)?;
        let broker = SelectionBroker::new(&display)?;

        let mut im = ImBridge::new();
        match im.connect(&display) {
            Ok(false) => {}
            Ok(true) => debug!("input method connection in progress"),
            Err(err) => warn!(?err, "input method connect failed"),
        }

        let id = CoreId(crate::utils::ids::next_core_id());
        debug!(?id, "core started");
        Ok(Core {
            id,
            config,
            display,
            arena: WidgetArena::new(),
            registry: WindowRegistry::default(),
            timers: TimerQueue::new(),
            queue: EventQueue::new(),
            grabs: GrabManager::default(),
            broker,
            dnd: DndEngine::default(),
            im,
            keymap,
            clicks: ClickTracker::default(),
            damage: HashMap::new(),
            injected: Arc::new(Mutex::new(Vec::new())),
            stash: Vec::new(),
        })
    }

    /// The id of this core instance
    pub fn id(&self) -> CoreId {
        self.id
    }

    /// The display connection this core runs on
    pub fn display(&self) -> &Display {
        &self.display
    }

    /// A handle other threads use to inject [`Event::User`] records
    pub fn poster(&self) -> EventPoster {
        EventPoster {
            wakeup: self.display.wakeup_handle(),
            injected: self.injected.clone(),
        }
    }

    /// Allocate a widget id with no window of its own
    ///
    /// Child widgets need ids to receive events, own timers and take
    /// grabs; only top-level widgets also get a window.
    pub fn alloc_widget(&mut self) -> WidgetId {
        self.arena.alloc()
    }

    /// Create a top-level window owned by a fresh widget
    pub fn create_window(
        &mut self,
        builder: WindowBuilder,
    ) -> Result<(WidgetId, Window), X11Error> {
        let widget = self.arena.alloc();
        let window = builder.build(&self.display)?;
        self.registry.insert(&window, widget);
        if !window.style().contains(WindowStyle::POPUP) {
            self.im.create_context(&self.display, widget, window.id())?;
        }
        Ok((widget, window))
    }

    /// Tear down everything referencing `widget`
    ///
    /// Undelivered records, timers, grabs, the drag hover, the input
    /// context and the double-click state are all purged; the id becomes
    /// stale and later lookups fail the generation check. Calling this
    /// twice is harmless.
    pub fn destroy_widget(&mut self, widget: WidgetId) -> Result<(), X11Error> {
        if !self.arena.is_alive(widget) {
            return Ok(());
        }
        self.queue.remove_target(widget);
        self.timers.remove_widget(widget);
        self.grabs.widget_destroyed(&self.display, widget)?;
        self.dnd.widget_destroyed(widget);
        self.im.destroy_context(&self.display, widget)?;
        self.clicks.reset(widget);
        self.damage.remove(&widget);
        for window in self.registry.remove_widget(widget) {
            trace!(window, ?widget, "window unregistered");
        }
        self.arena.free(widget);
        Ok(())
    }

    /// Queue an event for `target` as if the platform had produced it
    pub fn post_event(&mut self, target: WidgetId, event: Event) {
        self.queue.push(EventRecord { target, event });
    }

    /// Accumulate damage for `widget`
    ///
    /// Regions merge into one bounding box per widget and are delivered
    /// as a single [`Event::Redraw`] on the next dispatch cycle.
    pub fn request_redraw(&mut self, widget: WidgetId, region: Rectangle) {
        let damage = self.damage.entry(widget).or_default();
        *damage = damage.merge(region);
    }

    /// Schedule (or reschedule) the repeating timer `(owner, id)`
    pub fn add_timer(&mut self, owner: WidgetId, id: u32, interval: Duration, data: u64) {
        self.timers.append(Instant::now(), owner, id, interval, data);
    }

    /// Cancel the timer `(owner, id)`; returns whether it existed
    pub fn kill_timer(&mut self, owner: WidgetId, id: u32) -> bool {
        self.timers.remove(owner, id)
    }

    /// Route all pointer events to `owner` until ungrabbed
    pub fn grab_pointer(&mut self, owner: WidgetId, window: &Window) -> Result<bool, X11Error> {
        self.grabs.grab_pointer(&self.display, owner, window)
    }

    /// Release the pointer grab; a no-op when nothing is grabbed
    pub fn ungrab_pointer(&mut self) -> Result<(), X11Error> {
        self.grabs.ungrab_pointer(&self.display)
    }

    /// Route all keyboard events to `owner` until ungrabbed
    pub fn grab_keyboard(&mut self, owner: WidgetId, window: &Window) -> Result<bool, X11Error> {
        self.grabs.grab_keyboard(&self.display, owner, window)
    }

    /// Release the keyboard grab; a no-op when nothing is grabbed
    pub fn ungrab_keyboard(&mut self) -> Result<(), X11Error> {
        self.grabs.ungrab_keyboard(&self.display)
    }

    /// Widget currently holding the pointer grab
    pub fn pointer_grab(&self) -> Option<WidgetId> {
        self.grabs.pointer_owner()
    }

    /// Widget currently holding the keyboard grab
    pub fn keyboard_grab(&self) -> Option<WidgetId> {
        self.grabs.keyboard_owner()
    }

    /// Claim `selection` with a text payload
    pub fn set_selection_text(
        &mut self,
        selection: Selection,
        text: String,
    ) -> Result<(), X11Error> {
        self.broker
            .set_data(&self.display, selection, text.into_bytes(), Vec::new(), None)
    }

    /// Claim `selection` with raw data, extra targets and a producer
    /// callback for them
    pub fn set_selection_data(
        &mut self,
        selection: Selection,
        data: Vec<u8>,
        targets: Vec<x11rb::protocol::xproto::Atom>,
        produce: Option<ProduceFn>,
    ) -> Result<(), X11Error> {
        self.broker
            .set_data(&self.display, selection, data, targets, produce)
    }

    /// Read `selection` as text
    ///
    /// Answers locally when this process is the owner. Otherwise this is
    /// the one blocking call in the core: a scoped sub-pump bounded by
    /// [`CoreConfig::peer_timeout`], with unrelated events stashed for
    /// the next dispatch cycle.
    pub fn selection_text(&mut self, selection: Selection) -> Result<Option<String>, X11Error> {
        let timeout = self.config.peer_timeout;
        self.broker
            .get_text(&self.display, selection, timeout, &mut self.stash)
    }

    /// Whether this process owns `selection`
    pub fn owns_selection(&self, selection: Selection) -> bool {
        self.broker.owns(selection)
    }

    /// Hand the clipboard to the persistent manager, if one is running
    pub fn save_clipboard(&mut self) -> Result<bool, X11Error> {
        let timeout = self.config.peer_timeout;
        self.broker
            .save_to_manager(&self.display, timeout, &mut self.stash)
    }

    /// Whether input-method composition is currently available
    pub fn input_method_ready(&self) -> bool {
        self.im.is_ready()
    }

    /// Retry the input-method connection after a failed or lost one
    pub fn restart_input_method(&mut self) -> Result<bool, X11Error> {
        self.im.restart(&self.display)
    }

    /// Run one dispatch cycle
    ///
    /// Blocks until something happens (with the poll timeout derived from
    /// the earliest timer deadline), then drains, translates and delivers.
    /// Call in a loop.
    pub fn dispatch<D: EaselHandler>(data: &mut D) -> Result<(), X11Error> {
        let core = data.core_state();
        let timeout = core.timers.min_wait(Instant::now());
        core.display.wait(timeout)?;

        // drain every ready protocol event before dispatching anything
        loop {
            let core = data.core_state();
            let Some(event) = core.next_event()? else {
                break;
            };
            Self::handle_x11_event(data, event)?;
        }

        let core = data.core_state();
        core.timers.process(Instant::now(), &mut core.queue);
        core.drain_injected();
        core.flush_damage();

        loop {
            let core = data.core_state();
            let Some(record) = next_live_record(&mut core.queue, &core.arena) else {
                break;
            };
            data.widget_event(record.target, record.event);
        }

        data.core_state().display.flush()
    }

    fn next_event(&mut self) -> Result<Option<X11Event>, X11Error> {
        if !self.stash.is_empty() {
            return Ok(Some(self.stash.remove(0)));
        }
        Ok(self.display.conn.poll_for_event()?)
    }

    fn drain_injected(&mut self) {
        let injected: Vec<Injected> = std::mem::take(&mut *self.injected.lock().unwrap());
        for event in injected {
            self.queue.push(EventRecord {
                target: event.target,
                event: Event::User {
                    code: event.code,
                    data: event.data,
                },
            });
        }
    }

    fn flush_damage(&mut self) {
        for (widget, region) in self.damage.drain() {
            self.queue.push(EventRecord {
                target: widget,
                event: Event::Redraw { region },
            });
        }
    }

    /// Translate one raw key event and queue the semantic record
    fn queue_key(&mut self, widget: WidgetId, key: &KeyPressEvent, press: bool) {
        let state = u32::from(u16::from(key.state));
        let shifted = state & 0x01 != 0;
        let keysym = self.keymap.keysym(key.detail, shifted);
        if keysym == 0 {
            trace!(keycode = key.detail, "keycode without keysym dropped");
            return;
        }
        let modifiers = modifiers_from_raw(state);
        let event = if press {
            Event::KeyPress { keysym, modifiers }
        } else {
            Event::KeyRelease { keysym, modifiers }
        };
        self.queue.push(EventRecord {
            target: widget,
            event,
        });
    }

    fn handle_x11_event<D: EaselHandler>(data: &mut D, event: X11Event) -> Result<(), X11Error> {
        let core = data.core_state();

        // the input-method transport claims its traffic first
        let mut bounced: Vec<KeyPressEvent> = Vec::new();
        if core
            .im
            .handle_event(&core.display, &event, &mut core.queue, &mut bounced)?
        {
            for key in bounced {
                if let Some(widget) = core.registry.widget_of(key.event) {
                    core.queue_key(widget, &key, true);
                }
            }
            let popup = core.im.take_popup_request();
            if let Some(widget) = popup {
                if let Some(caret) = data.caret_position(widget) {
                    let core = data.core_state();
                    core.im.place_popup(&core.display, caret)?;
                }
            }
            return Ok(());
        }

        match event {
            X11Event::KeyPress(key) => {
                core.display.note_user_time(key.time);
                let Some((widget, window)) = core.registry.get(key.event) else {
                    return Ok(());
                };
                window.set_user_time(&core.display, key.time);
                if core.im.filter_key(&core.display, widget, &key)? {
                    return Ok(());
                }
                core.queue_key(widget, &key, true);
            }
            X11Event::KeyRelease(key) => {
                core.display.note_event_time(key.time);
                let Some(widget) = core.registry.widget_of(key.event) else {
                    return Ok(());
                };
                // releases are not offered for composition
                core.queue_key(widget, &key, false);
            }
            X11Event::ButtonPress(button) => {
                core.display.note_user_time(button.time);
                let Some((widget, window)) = core.registry.get(button.event) else {
                    return Ok(());
                };
                window.set_user_time(&core.display, button.time);
                let position = Point::new(button.event_x as i32, button.event_y as i32);
                let modifiers = modifiers_from_raw(u32::from(u16::from(button.state)));
                match translate_button(button.detail) {
                    PointerButton::Wheel(delta) => {
                        core.queue.push(EventRecord {
                            target: widget,
                            event: Event::Wheel {
                                delta,
                                position,
                                modifiers,
                            },
                        });
                    }
                    PointerButton::Button(mouse) => {
                        let double = core.clicks.on_press(widget, mouse, button.time, position);
                        let event = if double {
                            Event::DoubleClick {
                                button: mouse,
                                position,
                                modifiers,
                            }
                        } else {
                            Event::ButtonPress {
                                button: mouse,
                                position,
                                modifiers,
                            }
                        };
                        core.queue.push(EventRecord {
                            target: widget,
                            event,
                        });
                    }
                }
            }
            X11Event::ButtonRelease(button) => {
                core.display.note_event_time(button.time);
                let Some(widget) = core.registry.widget_of(button.event) else {
                    return Ok(());
                };
                if let PointerButton::Button(mouse) = translate_button(button.detail) {
                    core.queue.push(EventRecord {
                        target: widget,
                        event: Event::ButtonRelease {
                            button: mouse,
                            position: Point::new(button.event_x as i32, button.event_y as i32),
                            modifiers: modifiers_from_raw(u32::from(u16::from(button.state))),
                        },
                    });
                }
            }
            X11Event::MotionNotify(motion) => {
                core.display.note_event_time(motion.time);
                let Some(widget) = core.registry.widget_of(motion.event) else {
                    return Ok(());
                };
                core.queue.push(EventRecord {
                    target: widget,
                    event: Event::Motion {
                        position: Point::new(motion.event_x as i32, motion.event_y as i32),
                        modifiers: modifiers_from_raw(u32::from(u16::from(motion.state))),
                    },
                });
            }
            X11Event::EnterNotify(crossing) => {
                core.display.note_event_time(crossing.time);
                let Some(widget) = core.registry.widget_of(crossing.event) else {
                    return Ok(());
                };
                core.queue.push(EventRecord {
                    target: widget,
                    event: Event::Enter {
                        position: Point::new(crossing.event_x as i32, crossing.event_y as i32),
                    },
                });
            }
            X11Event::LeaveNotify(crossing) => {
                core.display.note_event_time(crossing.time);
                let Some(widget) = core.registry.widget_of(crossing.event) else {
                    return Ok(());
                };
                core.queue.push(EventRecord {
                    target: widget,
                    event: Event::Leave,
                });
            }
            X11Event::FocusIn(focus) => {
                let Some(widget) = core.registry.widget_of(focus.event) else {
                    return Ok(());
                };
                core.im.focus_in(&core.display, widget)?;
                core.queue.push(EventRecord {
                    target: widget,
                    event: Event::FocusIn,
                });
            }
            X11Event::FocusOut(focus) => {
                let Some(widget) = core.registry.widget_of(focus.event) else {
                    return Ok(());
                };
                core.im.focus_out(&core.display, widget)?;
                core.queue.push(EventRecord {
                    target: widget,
                    event: Event::FocusOut,
                });
            }
            X11Event::Expose(expose) => {
                let Some(widget) = core.registry.widget_of(expose.window) else {
                    return Ok(());
                };
                let region = Rectangle::new(
                    (expose.x as i32, expose.y as i32),
                    (expose.width as i32, expose.height as i32),
                );
                core.request_redraw(widget, region);
                // the last expose of a series flushes the merged region
                if expose.count == 0 {
                    if let Some(region) = core.damage.remove(&widget) {
                        core.queue.push(EventRecord {
                            target: widget,
                            event: Event::Redraw { region },
                        });
                    }
                }
            }
            X11Event::ConfigureNotify(configure) => {
                let Some((widget, window)) = core.registry.get(configure.window) else {
                    return Ok(());
                };
                let geometry = Rectangle::new(
                    Point::new(configure.x as i32, configure.y as i32),
                    Size::new(configure.width as i32, configure.height as i32),
                );
                if window.handle_configure_notify(geometry) {
                    core.queue.push(EventRecord {
                        target: widget,
                        event: Event::Resized {
                            size: geometry.size,
                        },
                    });
                }
            }
            X11Event::MapNotify(map) => {
                if let Some((_, window)) = core.registry.get(map.window) {
                    window.handle_map_notify()?;
                }
            }
            X11Event::UnmapNotify(unmap) => {
                if let Some((_, window)) = core.registry.get(unmap.window) {
                    window.handle_unmap_notify();
                }
            }
            X11Event::DestroyNotify(destroy) => {
                core.registry.remove(destroy.window);
            }
            X11Event::PropertyNotify(notify) => {
                if notify.state == Property::DELETE {
                    // may belong to an outgoing INCR transfer
                    core.broker
                        .handle_property_delete(&core.display, notify.window, notify.atom)?;
                } else if notify.atom == core.display.atoms._NET_WM_STATE {
                    core.display.note_event_time(notify.time);
                    if let Some((_, window)) = core.registry.get(notify.window) {
                        window.refresh_wm_state()?;
                    }
                }
            }
            X11Event::SelectionClear(clear) => {
                core.display.note_event_time(clear.time);
                if let Some(selection) = Selection::from_atom(clear.selection, &core.display.atoms)
                {
                    core.broker.lose_ownership(selection);
                }
            }
            X11Event::XfixesSelectionNotify(notify) => {
                core.display.note_event_time(notify.timestamp);
                if notify.owner != core.broker.transfer_window() {
                    if let Some(selection) =
                        Selection::from_atom(notify.selection, &core.display.atoms)
                    {
                        core.broker.lose_ownership(selection);
                    }
                }
            }
            X11Event::SelectionRequest(request) => {
                core.display.note_event_time(request.time);
                core.broker.handle_selection_request(&core.display, &request)?;
            }
            X11Event::SelectionNotify(_) => {
                // live replies are consumed by the scoped sub-pump
                trace!("stale selection notify dropped");
            }
            X11Event::MappingNotify(_) => {
                core.keymap.refresh(&core.display)?;
            }
            X11Event::ClientMessage(msg) => {
                let atoms = core.display.atoms;
                if msg.type_ == atoms.WM_PROTOCOLS {
                    if msg.data.as_data32()[0] == atoms.WM_DELETE_WINDOW {
                        if let Some(widget) = core.registry.widget_of(msg.window) {
                            core.queue.push(EventRecord {
                                target: widget,
                                event: Event::CloseRequested,
                            });
                        }
                    }
                } else if msg.type_ == atoms.XdndEnter {
                    if let Some(widget) = core.registry.widget_of(msg.window) {
                        core.dnd
                            .handle_enter(&core.display, &msg.data, msg.window, widget)?;
                    }
                } else if msg.type_ == atoms.XdndPosition {
                    let prepared = core.dnd.prepare_position(&core.display, &msg.data)?;
                    let Some((toplevel, position)) = prepared else {
                        return Ok(());
                    };
                    let over = data.widget_at(toplevel, position);
                    let core = data.core_state();
                    core.dnd.finish_position(&core.display, over, &mut core.queue)?;
                } else if msg.type_ == atoms.XdndLeave {
                    core.dnd.handle_leave(&msg.data, &mut core.queue);
                } else if msg.type_ == atoms.XdndDrop {
                    let timeout = core.config.peer_timeout;
                    let Core {
                        display,
                        dnd,
                        broker,
                        queue,
                        stash,
                        ..
                    } = core;
                    dnd.handle_drop(display, broker, &msg.data, queue, timeout, stash)?;
                } else {
                    trace!(type_ = msg.type_, "unhandled client message");
                }
            }
            X11Event::Error(err) => {
                warn!(?err, "X11 error event");
            }
            other => {
                trace!(event = ?other, "ignoring event");
            }
        }
        Ok(())
    }
}

/// Pop records until one with a live target is found
///
/// Records whose widget was destroyed between enqueue and dispatch are
/// dropped here; that is the contract, not an error.
fn next_live_record(queue: &mut EventQueue, arena: &WidgetArena) -> Option<EventRecord> {
    while let Some(record) = queue.pop() {
        if arena.is_alive(record.target) {
            return Some(record);
        }
        trace!(target = ?record.target, "record for destroyed widget dropped");
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_log() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    #[test]
    fn records_for_destroyed_widgets_are_not_delivered() {
        init_log();
        let mut arena = WidgetArena::new();
        let alive = arena.alloc();
        let doomed = arena.alloc();

        let mut queue = EventQueue::new();
        queue.push(EventRecord {
            target: doomed,
            event: Event::FocusIn,
        });
        queue.push(EventRecord {
            target: alive,
            event: Event::FocusIn,
        });
        queue.push(EventRecord {
            target: doomed,
            event: Event::FocusOut,
        });
        arena.free(doomed);

        let record = next_live_record(&mut queue, &arena).unwrap();
        assert_eq!(record.target, alive);
        assert!(next_live_record(&mut queue, &arena).is_none());
    }

    #[test]
    fn injected_events_become_user_records() {
        let injected = Arc::new(Mutex::new(Vec::new()));
        let mut arena = WidgetArena::new();
        let w = arena.alloc();
        injected.lock().unwrap().push(Injected {
            target: w,
            code: 3,
            data: 99,
        });

        let mut queue = EventQueue::new();
        let drained: Vec<Injected> = std::mem::take(&mut *injected.lock().unwrap());
        for event in drained {
            queue.push(EventRecord {
                target: event.target,
                event: Event::User {
                    code: event.code,
                    data: event.data,
                },
            });
        }
        assert!(matches!(
            queue.pop().unwrap().event,
            Event::User { code: 3, data: 99 }
        ));
        assert!(injected.lock().unwrap().is_empty());
    }

    #[test]
    fn damage_merges_per_widget() {
        let mut arena = WidgetArena::new();
        let a = arena.alloc();
        let b = arena.alloc();
        let mut damage: HashMap<WidgetId, Rectangle> = HashMap::new();

        for (widget, region) in [
            (a, Rectangle::new((0, 0), (10, 10))),
            (a, Rectangle::new((20, 20), (5, 5))),
            (b, Rectangle::new((1, 1), (2, 2))),
        ] {
            let entry = damage.entry(widget).or_default();
            *entry = entry.merge(region);
        }

        assert_eq!(damage.len(), 2);
        assert_eq!(damage[&a], Rectangle::new((0, 0), (25, 25)));
        assert_eq!(damage[&b], Rectangle::new((1, 1), (2, 2)));
    }
}
