//! Input-method bridge
//!
//! Speaks the XIM protocol to whatever IM server owns an `@server=`
//! selection: one lazy process-wide connection, one input context per
//! top-level window, and an on-the-spot preedit fed back to the
//! application as events plus a small popup window anchored beneath the
//! focused widget's caret. If no server is running the bridge stays
//! dormant and [`restart`](ImBridge::restart) can try again later; if the
//! server dies, the liveness flag keeps teardown from sending requests
//! into the void.

use std::collections::HashMap;

use tracing::{debug, trace, warn};
use x11rb::connection::Connection as _;
use x11rb::protocol::xproto::{
    AtomEnum, ChangeWindowAttributesAux, ClientMessageEvent, ConnectionExt as _, CreateWindowAux,
    EventMask, KeyPressEvent, PropMode, Window as X11Window, WindowClass,
};
use x11rb::protocol::Event as X11Event;
use x11rb::wrapper::ConnectionExt as _;
use x11rb::x11_utils::{Serialize as _, TryParse as _};

use crate::event::{Event, EventQueue, EventRecord, PreeditRun};
use crate::utils::Point;
use crate::widget::WidgetId;
use super::{Display, X11Error};

pub(crate) mod proto;

use proto::{feedback, style, ServerMessage};

// transport chunk carried by one _XIM_PROTOCOL client message
const CM_CHUNK: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// No server found yet, nothing in flight
    Idle,
    /// `_XIM_XCONNECT` sent, waiting for the transport answer
    AwaitTransport,
    AwaitConnectReply,
    AwaitOpenReply,
    AwaitStyles,
    Ready,
    /// The server announced its death; context teardown is unsafe
    Dead,
}

#[derive(Debug)]
struct IcContext {
    ic_id: Option<u16>,
    window: X11Window,
}

#[derive(Debug)]
struct Preedit {
    widget: WidgetId,
    text: Vec<char>,
    feedback: Vec<u32>,
    caret: i32,
    popup: Option<X11Window>,
    popup_mapped: bool,
}

/// Process-wide XIM client state
#[derive(Debug)]
pub(crate) struct ImBridge {
    phase: Phase,
    client_window: Option<X11Window>,
    server_owner: X11Window,
    accept_window: X11Window,
    recv: Vec<u8>,
    im_id: u16,
    query_style_attr: Option<u16>,
    attr_input_style: Option<u16>,
    attr_client_window: Option<u16>,
    attr_focus_window: Option<u16>,
    chosen_style: u32,
    contexts: HashMap<WidgetId, IcContext>,
    create_inflight: Vec<WidgetId>,
    pending_create: Vec<WidgetId>,
    next_serial: u16,
    focused: Option<WidgetId>,
    preedit: Option<Preedit>,
    popup_request: Option<WidgetId>,
}

impl ImBridge {
    pub(crate) fn new() -> ImBridge {
        ImBridge {
            phase: Phase::Idle,
            client_window: None,
            server_owner: x11rb::NONE,
            accept_window: x11rb::NONE,
            recv: Vec::new(),
            im_id: 0,
            query_style_attr: None,
            attr_input_style: None,
            attr_client_window: None,
            attr_focus_window: None,
            chosen_style: 0,
            contexts: HashMap::new(),
            create_inflight: Vec::new(),
            pending_create: Vec::new(),
            next_serial: 0,
            focused: None,
            preedit: None,
            popup_request: None,
        }
    }

    /// Whether composition is currently possible
    pub(crate) fn is_ready(&self) -> bool {
        self.phase == Phase::Ready
    }

    /// Try to find and connect to an IM server
    ///
    /// Returns `false` when none is running; the core keeps working
    /// without composition support and may call [`restart`](Self::restart)
    /// later.
    pub(crate) fn connect(&mut self, display: &Display) -> Result<bool, X11Error> {
        if self.phase != Phase::Idle {
            return Ok(self.phase != Phase::Dead);
        }

        let conn = &display.conn;
        let atoms = &display.atoms;

        let reply = conn
            .get_property(
                false,
                display.screen.root,
                atoms.XIM_SERVERS,
                AtomEnum::ATOM,
                0,
                1024,
            )?
            .reply_unchecked()?;
        let Some(servers) = reply.and_then(|reply| {
            reply
                .value32()
                .map(|values| values.collect::<Vec<_>>())
        }) else {
            debug!("no XIM_SERVERS property, input method unavailable");
            return Ok(false);
        };

        let mut owner = x11rb::NONE;
        for server in servers {
            let name = display.atom_name(server)?;
            if !name.starts_with("@server=") {
                continue;
            }
            let candidate = conn.get_selection_owner(server)?.reply()?.owner;
            if candidate != x11rb::NONE {
                debug!(server = %name, owner = candidate, "XIM server found");
                owner = candidate;
                break;
            }
        }
        if owner == x11rb::NONE {
            debug!("no live XIM server, input method unavailable");
            return Ok(false);
        }

        // DestroyNotify for the owner only arrives with this selected
        conn.change_window_attributes(
            owner,
            &ChangeWindowAttributesAux::new().event_mask(EventMask::STRUCTURE_NOTIFY),
        )?;

        let client_window = conn.generate_id()?;
        conn.create_window(
            0,
            client_window,
            display.screen.root,
            0,
            0,
            1,
            1,
            0,
            WindowClass::INPUT_ONLY,
            x11rb::COPY_FROM_PARENT,
            &CreateWindowAux::new(),
        )?;

        conn.send_event(
            false,
            owner,
            EventMask::NO_EVENT,
            ClientMessageEvent::new(
                32,
                owner,
                atoms._XIM_XCONNECT,
                [client_window, 0, 0, 0, 0],
            ),
        )?;
        conn.flush()?;

        self.server_owner = owner;
        self.client_window = Some(client_window);
        self.phase = Phase::AwaitTransport;
        Ok(true)
    }

    /// Retry hook after a failed or lost connection
    pub(crate) fn restart(&mut self, display: &Display) -> Result<bool, X11Error> {
        if matches!(self.phase, Phase::Idle | Phase::Dead) {
            let contexts = std::mem::take(&mut self.contexts);
            *self = ImBridge::new();
            // windows survive a bridge restart, contexts are recreated
            for (widget, ctx) in contexts {
                self.contexts.insert(
                    widget,
                    IcContext {
                        ic_id: None,
                        window: ctx.window,
                    },
                );
                self.pending_create.push(widget);
            }
        }
        self.connect(display)
    }

    /// Request an input context for a top-level window
    ///
    /// Deferred until the connection reaches the ready phase.
    pub(crate) fn create_context(
        &mut self,
        display: &Display,
        widget: WidgetId,
        window: X11Window,
    ) -> Result<(), X11Error> {
        self.contexts.insert(
            widget,
            IcContext {
                ic_id: None,
                window,
            },
        );
        if self.phase == Phase::Ready {
            self.send_create(display, widget)?;
        } else {
            self.pending_create.push(widget);
            if self.phase == Phase::Idle {
                self.connect(display)?;
            }
        }
        Ok(())
    }

    /// Tear down a window's input context
    ///
    /// Consults the liveness flag first: once the server announced its
    /// own death, sending `XIM_DESTROY_IC` is unsafe and the local state
    /// is simply dropped.
    pub(crate) fn destroy_context(
        &mut self,
        display: &Display,
        widget: WidgetId,
    ) -> Result<(), X11Error> {
        self.pending_create.retain(|w| *w != widget);
        self.create_inflight.retain(|w| *w != widget);
        if self.focused == Some(widget) {
            self.focused = None;
        }
        if self.popup_request == Some(widget) {
            self.popup_request = None;
        }
        if self.preedit.as_ref().is_some_and(|p| p.widget == widget) {
            self.drop_popup(display)?;
            self.preedit = None;
        }
        let Some(ctx) = self.contexts.remove(&widget) else {
            return Ok(());
        };
        if self.phase == Phase::Ready {
            if let Some(ic_id) = ctx.ic_id {
                self.send_frame(display, &proto::destroy_ic(self.im_id, ic_id))?;
            }
        }
        Ok(())
    }

    /// Keyboard focus moved onto a widget's window
    pub(crate) fn focus_in(&mut self, display: &Display, widget: WidgetId) -> Result<(), X11Error> {
        self.focused = Some(widget);
        if let Some(ic_id) = self.ic_of(widget) {
            self.send_frame(display, &proto::set_ic_focus(self.im_id, ic_id))?;
        }
        // bring back a popup hidden by the previous focus-out
        if let Some(preedit) = self.preedit.as_mut() {
            if preedit.widget == widget && !preedit.popup_mapped {
                if let Some(popup) = preedit.popup {
                    display.conn.map_window(popup)?;
                    display.conn.flush()?;
                    preedit.popup_mapped = true;
                }
            }
        }
        Ok(())
    }

    /// Keyboard focus left a widget's window
    pub(crate) fn focus_out(&mut self, display: &Display, widget: WidgetId) -> Result<(), X11Error> {
        if self.focused == Some(widget) {
            self.focused = None;
        }
        if let Some(preedit) = self.preedit.as_mut() {
            if preedit.widget == widget && preedit.popup_mapped {
                if let Some(popup) = preedit.popup {
                    display.conn.unmap_window(popup)?;
                    display.conn.flush()?;
                    preedit.popup_mapped = false;
                }
            }
        }
        if let Some(ic_id) = self.ic_of(widget) {
            self.send_frame(display, &proto::unset_ic_focus(self.im_id, ic_id))?;
        }
        Ok(())
    }

    /// Offer a key press to the IM server
    ///
    /// Returns `true` when the event was swallowed for composition; the
    /// server echoes unfiltered keys back through `XIM_FORWARD_EVENT`.
    pub(crate) fn filter_key(
        &mut self,
        display: &Display,
        widget: WidgetId,
        event: &KeyPressEvent,
    ) -> Result<bool, X11Error> {
        if self.phase != Phase::Ready {
            return Ok(false);
        }
        let Some(ic_id) = self.ic_of(widget) else {
            return Ok(false);
        };

        let raw = event.serialize();
        self.next_serial = self.next_serial.wrapping_add(1);
        let frame = proto::forward_event(self.im_id, ic_id, self.next_serial, &raw);
        self.send_frame(display, &frame)?;
        Ok(true)
    }

    /// Orderly teardown of the XIM connection
    ///
    /// Sends `XIM_CLOSE` and `XIM_DISCONNECT` while the server is still
    /// alive; a dead or never-established connection gets nothing. The
    /// bridge returns to the idle phase either way.
    pub(crate) fn shutdown(&mut self, display: &Display) -> Result<(), X11Error> {
        if self.phase == Phase::Ready {
            self.send_frame(display, &proto::close(self.im_id))?;
            self.send_frame(display, &proto::disconnect())?;
        }
        self.phase = Phase::Idle;
        self.accept_window = x11rb::NONE;
        for ctx in self.contexts.values_mut() {
            ctx.ic_id = None;
        }
        self.create_inflight.clear();
        Ok(())
    }

    /// The server's communication window disappeared
    pub(crate) fn server_died(&mut self) {
        if self.phase == Phase::Dead {
            return;
        }
        warn!("input method server died");
        self.phase = Phase::Dead;
        for ctx in self.contexts.values_mut() {
            ctx.ic_id = None;
        }
        self.create_inflight.clear();
    }

    /// Whether a destroyed window belonged to the IM transport
    pub(crate) fn owns_window(&self, window: X11Window) -> bool {
        window == self.server_owner || window == self.accept_window
    }

    /// Route an event to the bridge
    ///
    /// Returns `true` if the event belonged to the IM transport. Keys the
    /// server bounced back unfiltered are appended to `keys_out` for
    /// normal translation. After a `true` return the caller should check
    /// [`take_popup_request`](Self::take_popup_request).
    pub(crate) fn handle_event(
        &mut self,
        display: &Display,
        event: &X11Event,
        queue: &mut EventQueue,
        keys_out: &mut Vec<KeyPressEvent>,
    ) -> Result<bool, X11Error> {
        let atoms = &display.atoms;
        match event {
            X11Event::ClientMessage(msg)
                if msg.type_ == atoms._XIM_XCONNECT
                    && Some(msg.window) == self.client_window =>
            {
                let data = msg.data.as_data32();
                self.accept_window = data[0];
                trace!(accept = self.accept_window, "XIM transport established");
                self.phase = Phase::AwaitConnectReply;
                self.send_frame(display, &proto::connect())?;
                Ok(true)
            }
            X11Event::ClientMessage(msg)
                if (msg.type_ == atoms._XIM_PROTOCOL || msg.type_ == atoms._XIM_MOREDATA)
                    && Some(msg.window) == self.client_window =>
            {
                if msg.format == 8 {
                    self.recv.extend_from_slice(&msg.data.as_data8());
                    if msg.type_ == atoms._XIM_PROTOCOL {
                        self.drain_frames(display, queue, keys_out)?;
                        self.recv.clear();
                    }
                } else if msg.format == 32 {
                    // large frame passed through a property
                    let data = msg.data.as_data32();
                    let reply = display
                        .conn
                        .get_property(true, msg.window, data[1], AtomEnum::ANY, 0, 0x1fffffff)?
                        .reply()?;
                    self.recv.extend_from_slice(&reply.value);
                    self.drain_frames(display, queue, keys_out)?;
                    self.recv.clear();
                }
                Ok(true)
            }
            X11Event::DestroyNotify(notify) if self.owns_window(notify.window) => {
                self.server_died();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn ic_of(&self, widget: WidgetId) -> Option<u16> {
        self.contexts.get(&widget).and_then(|ctx| ctx.ic_id)
    }

    fn drain_frames(
        &mut self,
        display: &Display,
        queue: &mut EventQueue,
        keys_out: &mut Vec<KeyPressEvent>,
    ) -> Result<(), X11Error> {
        let mut data = std::mem::take(&mut self.recv);
        let mut rest = data.as_slice();
        while let Some((frame, used)) = proto::decode_frame(rest) {
            if frame.major == 0 {
                // transport padding
                break;
            }
            rest = &rest[used..];
            if let Some(message) = proto::parse_server_frame(&frame) {
                self.handle_message(display, message, queue, keys_out)?;
            } else {
                trace!(
                    major = frame.major,
                    minor = frame.minor,
                    "ignoring unknown XIM message"
                );
            }
        }
        data.clear();
        self.recv = data;
        Ok(())
    }

    fn handle_message(
        &mut self,
        display: &Display,
        message: ServerMessage,
        queue: &mut EventQueue,
        keys_out: &mut Vec<KeyPressEvent>,
    ) -> Result<(), X11Error> {
        match message {
            ServerMessage::ConnectReply { major, minor } => {
                trace!(major, minor, "XIM connected");
                self.phase = Phase::AwaitOpenReply;
                let locale = std::env::var("LC_ALL")
                    .or_else(|_| std::env::var("LC_CTYPE"))
                    .or_else(|_| std::env::var("LANG"))
                    .unwrap_or_else(|_| "C".into());
                self.send_frame(display, &proto::open(&locale))?;
            }
            ServerMessage::OpenReply {
                im_id,
                im_attrs,
                ic_attrs,
            } => {
                self.im_id = im_id;
                for attr in &im_attrs {
                    if attr.name == "queryInputStyle" {
                        self.query_style_attr = Some(attr.id);
                    }
                }
                for attr in &ic_attrs {
                    match attr.name.as_str() {
                        "inputStyle" => self.attr_input_style = Some(attr.id),
                        "clientWindow" => self.attr_client_window = Some(attr.id),
                        "focusWindow" => self.attr_focus_window = Some(attr.id),
                        _ => {}
                    }
                }
                if let Some(query) = self.query_style_attr {
                    self.phase = Phase::AwaitStyles;
                    self.send_frame(display, &proto::get_im_values(self.im_id, &[query]))?;
                } else {
                    // server without style negotiation, no preedit
                    self.chosen_style = style::PREEDIT_NONE | style::STATUS_NONE;
                    self.become_ready(display)?;
                }
            }
            ServerMessage::GetImValuesReply { styles } => {
                self.chosen_style = choose_style(&styles);
                debug!(style = format_args!("{:#x}", self.chosen_style), "input style negotiated");
                self.become_ready(display)?;
            }
            ServerMessage::CreateIcReply { ic_id } => {
                if self.create_inflight.is_empty() {
                    warn!(ic_id, "unsolicited XIM_CREATE_IC_REPLY");
                    return Ok(());
                }
                let widget = self.create_inflight.remove(0);
                if let Some(ctx) = self.contexts.get_mut(&widget) {
                    ctx.ic_id = Some(ic_id);
                    trace!(?widget, ic_id, "input context created");
                    if self.focused == Some(widget) {
                        self.send_frame(display, &proto::set_ic_focus(self.im_id, ic_id))?;
                    }
                }
            }
            ServerMessage::DestroyIcReply | ServerMessage::RegisterTriggerkeys => {}
            ServerMessage::SetEventMask => {}
            ServerMessage::ForwardEvent { ic_id, raw_event } => {
                // the server did not consume this key, deliver it normally
                if let Ok((key, _)) = KeyPressEvent::try_parse(&raw_event) {
                    keys_out.push(key);
                }
                self.send_frame(display, &proto::sync_reply(self.im_id, ic_id))?;
            }
            ServerMessage::Sync { ic_id } => {
                self.send_frame(display, &proto::sync_reply(self.im_id, ic_id))?;
            }
            ServerMessage::Commit { ic_id, text } => {
                if let Some(widget) = self.focused {
                    let text = String::from_utf8_lossy(&text).into_owned();
                    trace!(?widget, len = text.len(), "committed text");
                    queue.push(EventRecord {
                        target: widget,
                        event: Event::TextInput { text },
                    });
                }
                self.send_frame(display, &proto::sync_reply(self.im_id, ic_id))?;
            }
            ServerMessage::PreeditStart { ic_id } => {
                if let Some(widget) = self.focused {
                    self.preedit = Some(Preedit {
                        widget,
                        text: Vec::new(),
                        feedback: Vec::new(),
                        caret: 0,
                        popup: None,
                        popup_mapped: false,
                    });
                }
                self.send_frame(display, &proto::preedit_start_reply(self.im_id, ic_id))?;
            }
            ServerMessage::PreeditDraw {
                caret,
                chg_first,
                chg_length,
                text,
                feedback,
            } => {
                self.preedit_draw(
                    display,
                    caret,
                    chg_first,
                    chg_length,
                    text.as_deref(),
                    feedback,
                    queue,
                )?;
            }
            ServerMessage::PreeditCaret { ic_id, position } => {
                if let Some(preedit) = self.preedit.as_mut() {
                    preedit.caret = position;
                }
                self.send_frame(
                    display,
                    &proto::preedit_caret_reply(self.im_id, ic_id, position),
                )?;
            }
            ServerMessage::PreeditDone => {
                self.popup_request = None;
                self.drop_popup(display)?;
                if let Some(preedit) = self.preedit.take() {
                    queue.push(EventRecord {
                        target: preedit.widget,
                        event: Event::Preedit {
                            text: String::new(),
                            caret: 0,
                            runs: Vec::new(),
                        },
                    });
                }
            }
            ServerMessage::Error { code, detail } => {
                warn!(code, detail = %detail, "XIM error");
            }
            ServerMessage::CloseReply | ServerMessage::DisconnectReply => {
                self.phase = Phase::Dead;
            }
        }
        Ok(())
    }

    fn become_ready(&mut self, display: &Display) -> Result<(), X11Error> {
        self.phase = Phase::Ready;
        let pending = std::mem::take(&mut self.pending_create);
        for widget in pending {
            if self.contexts.contains_key(&widget) {
                self.send_create(display, widget)?;
            }
        }
        Ok(())
    }

    fn send_create(&mut self, display: &Display, widget: WidgetId) -> Result<(), X11Error> {
        let Some(ctx) = self.contexts.get(&widget) else {
            return Ok(());
        };
        let mut values = Vec::new();
        if let Some(id) = self.attr_input_style {
            values.push(proto::IcValue {
                id,
                value: self.chosen_style.to_le_bytes().to_vec(),
            });
        }
        if let Some(id) = self.attr_client_window {
            values.push(proto::IcValue {
                id,
                value: ctx.window.to_le_bytes().to_vec(),
            });
        }
        if let Some(id) = self.attr_focus_window {
            values.push(proto::IcValue {
                id,
                value: ctx.window.to_le_bytes().to_vec(),
            });
        }
        self.create_inflight.push(widget);
        self.send_frame(display, &proto::create_ic(self.im_id, &values))
    }

    #[allow(clippy::too_many_arguments)]
    fn preedit_draw(
        &mut self,
        display: &Display,
        caret: i32,
        chg_first: i32,
        chg_length: i32,
        text: Option<&str>,
        feedback: Vec<u32>,
        queue: &mut EventQueue,
    ) -> Result<(), X11Error> {
        let Some(preedit) = self.preedit.as_mut() else {
            return Ok(());
        };

        apply_draw(
            &mut preedit.text,
            &mut preedit.feedback,
            chg_first,
            chg_length,
            text,
            &feedback,
        );
        preedit.caret = caret;

        let widget = preedit.widget;
        let current: String = preedit.text.iter().collect();
        let runs = feedback_to_runs(&preedit.feedback);

        if preedit.text.is_empty() {
            self.popup_request = None;
            self.drop_popup(display)?;
        } else {
            self.popup_request = Some(widget);
        }

        queue.push(EventRecord {
            target: widget,
            event: Event::Preedit {
                text: current,
                caret: caret.max(0) as usize,
                runs,
            },
        });
        Ok(())
    }

    /// The widget whose preedit popup needs creating or repositioning
    ///
    /// The caller resolves the widget's caret position and feeds it back
    /// through [`place_popup`](Self::place_popup).
    pub(crate) fn take_popup_request(&mut self) -> Option<WidgetId> {
        self.popup_request.take()
    }

    /// Create or move the popup beneath the caret at `local`, a point in
    /// the coordinates of the preedit widget's window
    pub(crate) fn place_popup(&mut self, display: &Display, local: Point) -> Result<(), X11Error> {
        let Some(preedit) = self.preedit.as_mut() else {
            return Ok(());
        };
        let Some(window) = self.contexts.get(&preedit.widget).map(|ctx| ctx.window) else {
            return Ok(());
        };

        let conn = &display.conn;
        let root = conn
            .translate_coordinates(window, display.screen.root, local.x as i16, local.y as i16)?
            .reply()?;
        // rough cell metrics, the widget layer draws the actual glyphs
        let width = (preedit.text.len().max(1) * 9 + 6) as u32;
        let height = 20u32;
        let x = root.dst_x as i32;
        let y = root.dst_y as i32 + 2;

        match preedit.popup {
            Some(popup) => {
                conn.configure_window(
                    popup,
                    &x11rb::protocol::xproto::ConfigureWindowAux::new()
                        .x(x)
                        .y(y)
                        .width(width)
                        .height(height),
                )?;
            }
            None => {
                let popup = conn.generate_id()?;
                conn.create_window(
                    display.screen.root_depth,
                    popup,
                    display.screen.root,
                    x as i16,
                    y as i16,
                    width as u16,
                    height as u16,
                    1,
                    WindowClass::INPUT_OUTPUT,
                    display.screen.root_visual,
                    &CreateWindowAux::new()
                        .override_redirect(1)
                        .background_pixel(display.screen.white_pixel)
                        .border_pixel(display.screen.black_pixel),
                )?;
                conn.map_window(popup)?;
                preedit.popup = Some(popup);
                preedit.popup_mapped = true;
                trace!(popup, "preedit popup created");
            }
        }
        conn.flush()?;
        Ok(())
    }

    fn drop_popup(&mut self, display: &Display) -> Result<(), X11Error> {
        if let Some(preedit) = self.preedit.as_mut() {
            if let Some(popup) = preedit.popup.take() {
                display.conn.destroy_window(popup)?;
                display.conn.flush()?;
                preedit.popup_mapped = false;
                trace!(popup, "preedit popup destroyed");
            }
        }
        Ok(())
    }

    /// Send one frame, chunked into 20-byte client messages
    ///
    /// Intermediate chunks travel as `_XIM_MOREDATA`, the final chunk as
    /// `_XIM_PROTOCOL`; large frames go through a property instead.
    fn send_frame(&self, display: &Display, frame: &[u8]) -> Result<(), X11Error> {
        let conn = &display.conn;
        let atoms = &display.atoms;
        let dest = self.accept_window;
        if dest == x11rb::NONE {
            return Ok(());
        }

        if frame.len() > CM_CHUNK * 10 {
            // large frame: property transfer announced by a format-32 message
            conn.change_property8(
                PropMode::APPEND,
                dest,
                atoms._XIM_MOREDATA,
                AtomEnum::STRING,
                frame,
            )?;
            conn.send_event(
                false,
                dest,
                EventMask::NO_EVENT,
                ClientMessageEvent::new(
                    32,
                    dest,
                    atoms._XIM_PROTOCOL,
                    [frame.len() as u32, atoms._XIM_MOREDATA, 0, 0, 0],
                ),
            )?;
            conn.flush()?;
            return Ok(());
        }

        let mut chunks = frame.chunks(CM_CHUNK).peekable();
        while let Some(chunk) = chunks.next() {
            let mut data = [0u8; 20];
            data[..chunk.len()].copy_from_slice(chunk);
            let type_ = if chunks.peek().is_some() {
                atoms._XIM_MOREDATA
            } else {
                atoms._XIM_PROTOCOL
            };
            conn.send_event(
                false,
                dest,
                EventMask::NO_EVENT,
                ClientMessageEvent::new(8, dest, type_, data),
            )?;
        }
        conn.flush()?;
        Ok(())
    }
}

/// Prefer on-the-spot composition, degrade towards no preedit at all
fn choose_style(styles: &[u32]) -> u32 {
    let preference = [
        style::PREEDIT_CALLBACKS | style::STATUS_NOTHING,
        style::PREEDIT_NOTHING | style::STATUS_NOTHING,
        style::PREEDIT_NONE | style::STATUS_NONE,
    ];
    for wanted in preference {
        if styles.contains(&wanted) {
            return wanted;
        }
    }
    styles
        .first()
        .copied()
        .unwrap_or(style::PREEDIT_NONE | style::STATUS_NONE)
}

/// Apply one `XIM_PREEDIT_DRAW` delta to the composition buffer
///
/// A present string replaces the `chg_first..chg_first+chg_length`
/// characters. An absent string with feedback restyles that range in
/// place; an absent string without feedback deletes it.
fn apply_draw(
    buffer: &mut Vec<char>,
    buffer_feedback: &mut Vec<u32>,
    chg_first: i32,
    chg_length: i32,
    text: Option<&str>,
    feedback: &[u32],
) {
    match text {
        Some(text) => {
            splice_preedit(buffer, buffer_feedback, chg_first, chg_length, text, feedback)
        }
        None if feedback.is_empty() => {
            splice_preedit(buffer, buffer_feedback, chg_first, chg_length, "", &[])
        }
        None => {
            let first = (chg_first.max(0) as usize).min(buffer.len());
            let last = (first + chg_length.max(0) as usize).min(buffer.len());
            buffer_feedback.resize(buffer.len(), 0);
            for (slot, bits) in buffer_feedback[first..last].iter_mut().zip(feedback) {
                *slot = *bits;
            }
        }
    }
}

/// Replace the `chg_first..chg_first+chg_length` characters by `text`;
/// feedback is spliced in parallel, padded with the neutral style when
/// the server sent none.
fn splice_preedit(
    buffer: &mut Vec<char>,
    buffer_feedback: &mut Vec<u32>,
    chg_first: i32,
    chg_length: i32,
    text: &str,
    feedback: &[u32],
) {
    let first = (chg_first.max(0) as usize).min(buffer.len());
    let last = (first + chg_length.max(0) as usize).min(buffer.len());

    let chars: Vec<char> = text.chars().collect();
    let mut new_feedback = feedback.to_vec();
    new_feedback.resize(chars.len(), 0);

    buffer.splice(first..last, chars);
    if buffer_feedback.len() < last {
        buffer_feedback.resize(last, 0);
    }
    buffer_feedback.splice(first..last, new_feedback);
    buffer_feedback.resize(buffer.len(), 0);
}

/// Collapse per-character feedback into styled runs
fn feedback_to_runs(feedback: &[u32]) -> Vec<PreeditRun> {
    let mut runs: Vec<PreeditRun> = Vec::new();
    for (index, &bits) in feedback.iter().enumerate() {
        let reverse = bits & feedback::REVERSE != 0;
        let underline = bits & feedback::UNDERLINE != 0;
        match runs.last_mut() {
            Some(run) if run.reverse == reverse && run.underline == underline => {
                run.len += 1;
            }
            _ => runs.push(PreeditRun {
                start: index,
                len: 1,
                reverse,
                underline,
            }),
        }
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn style_preference_prefers_callbacks() {
        let styles = [
            style::PREEDIT_NOTHING | style::STATUS_NOTHING,
            style::PREEDIT_CALLBACKS | style::STATUS_NOTHING,
        ];
        assert_eq!(
            choose_style(&styles),
            style::PREEDIT_CALLBACKS | style::STATUS_NOTHING
        );
        assert_eq!(
            choose_style(&[style::PREEDIT_NOTHING | style::STATUS_NOTHING]),
            style::PREEDIT_NOTHING | style::STATUS_NOTHING
        );
        // nothing usable offered: no-preedit fallback
        assert_eq!(choose_style(&[]), style::PREEDIT_NONE | style::STATUS_NONE);
    }

    #[test]
    fn preedit_splice_replaces_the_changed_range() {
        let mut text: Vec<char> = "abcdef".chars().collect();
        let mut feedback = vec![0; 6];
        splice_preedit(&mut text, &mut feedback, 2, 2, "XY", &[1, 2]);
        assert_eq!(text.iter().collect::<String>(), "abXYef");
        assert_eq!(feedback, vec![0, 0, 1, 2, 0, 0]);
    }

    #[test]
    fn preedit_splice_appends_and_deletes() {
        let mut text: Vec<char> = Vec::new();
        let mut feedback = Vec::new();
        splice_preedit(&mut text, &mut feedback, 0, 0, "ab", &[]);
        assert_eq!(text.iter().collect::<String>(), "ab");
        assert_eq!(feedback, vec![0, 0]);

        splice_preedit(&mut text, &mut feedback, 0, 2, "", &[]);
        assert!(text.is_empty());
        assert!(feedback.is_empty());
    }

    #[test]
    fn stringless_draw_with_feedback_restyles_without_deleting() {
        let mut text: Vec<char> = "abc".chars().collect();
        let mut fb = vec![0; 3];
        apply_draw(&mut text, &mut fb, 0, 3, None, &[feedback::REVERSE; 3]);
        assert_eq!(text.iter().collect::<String>(), "abc");
        assert_eq!(fb, vec![feedback::REVERSE; 3]);

        // a partial restyle leaves the rest of the range alone
        apply_draw(&mut text, &mut fb, 1, 1, None, &[feedback::UNDERLINE]);
        assert_eq!(text.iter().collect::<String>(), "abc");
        assert_eq!(
            fb,
            vec![feedback::REVERSE, feedback::UNDERLINE, feedback::REVERSE]
        );
    }

    #[test]
    fn stringless_draw_without_feedback_deletes_the_range() {
        let mut text: Vec<char> = "abcd".chars().collect();
        let mut fb = vec![feedback::REVERSE; 4];
        apply_draw(&mut text, &mut fb, 1, 2, None, &[]);
        assert_eq!(text.iter().collect::<String>(), "ad");
        assert_eq!(fb, vec![feedback::REVERSE; 2]);
    }

    #[test]
    fn feedback_collapses_into_runs() {
        let runs = feedback_to_runs(&[
            feedback::REVERSE,
            feedback::REVERSE,
            0,
            feedback::UNDERLINE,
        ]);
        assert_eq!(runs.len(), 3);
        assert_eq!((runs[0].start, runs[0].len), (0, 2));
        assert!(runs[0].reverse && !runs[0].underline);
        assert_eq!((runs[1].start, runs[1].len), (2, 1));
        assert_eq!((runs[2].start, runs[2].len), (3, 1));
        assert!(runs[2].underline);
    }

    #[test]
    fn dead_server_blocks_context_teardown_requests() {
        let mut bridge = ImBridge::new();
        bridge.phase = Phase::Ready;
        assert!(bridge.is_ready());
        bridge.server_died();
        assert_eq!(bridge.phase, Phase::Dead);
        assert!(!bridge.is_ready());
        // a second announcement is harmless
        bridge.server_died();
        assert!(bridge.contexts.values().all(|ctx| ctx.ic_id.is_none()));
    }
}
