//! Clipboard and primary selection broker
//!
//! One hidden window owns whatever selections this process holds. As the
//! owner we answer conversion requests (`TARGETS`, `TIMESTAMP`, text
//! targets) with chunked INCR delivery for oversized payloads; as a reader
//! we issue a conversion and run a bounded, scoped sub-pump until the
//! reply lands or the configured timeout elapses. That sub-pump is the one
//! place the core waits on a remote peer, and every event it drains that
//! is not part of the transfer is stashed for the main loop.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};
use x11rb::connection::Connection as _;
use x11rb::protocol::xproto::{
    Atom, AtomEnum, ChangeWindowAttributesAux, ConnectionExt as _, CreateWindowAux, EventMask,
    PropMode, Property, SelectionNotifyEvent, SelectionRequestEvent, Window as X11Window,
    WindowClass, SELECTION_NOTIFY_EVENT,
};
use x11rb::wrapper::ConnectionExt as _;
use x11rb::protocol::Event as X11Event;

use super::{Atoms, Display, X11Error};

// no way to query the real limit, this matches what other toolkits assume
pub(crate) const INCR_CHUNK_SIZE: usize = 64 * 1024;

/// The selection slots the broker manages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// The explicit-copy clipboard
    Clipboard,
    /// The select-to-copy primary selection
    Primary,
}

impl Selection {
    fn atom(self, atoms: &Atoms) -> Atom {
        match self {
            Selection::Clipboard => atoms.CLIPBOARD,
            Selection::Primary => AtomEnum::PRIMARY.into(),
        }
    }

    /// Resolve a protocol selection atom to a broker slot
    pub(crate) fn from_atom(atom: Atom, atoms: &Atoms) -> Option<Selection> {
        if atom == atoms.CLIPBOARD {
            Some(Selection::Clipboard)
        } else if atom == Atom::from(AtomEnum::PRIMARY) {
            Some(Selection::Primary)
        } else {
            None
        }
    }
}

/// Callback producing payload bytes for a requested target
pub type ProduceFn = Box<dyn FnMut(Atom) -> Option<Vec<u8>>>;

/// Outcome of a reader-side conversion attempt
///
/// Refusal and timeout are kept apart: a refusing owner is worth asking
/// for another target, a stalled one is not.
#[derive(Debug)]
pub(crate) enum Conversion {
    Data(Vec<u8>),
    Refused,
    TimedOut,
}

struct OwnedSelection {
    data: Vec<u8>,
    targets: Vec<Atom>,
    produce: Option<ProduceFn>,
    timestamp: u32,
}

impl fmt::Debug for OwnedSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedSelection")
            .field("data", &self.data.len())
            .field("targets", &self.targets)
            .field("produce", &self.produce.is_some())
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

#[derive(Debug)]
struct OutgoingIncr {
    requestor: X11Window,
    property: Atom,
    target: Atom,
    remaining: Vec<u8>,
}

impl OutgoingIncr {
    /// Split off the next chunk; an empty result terminates the transfer
    fn next_chunk(&mut self) -> Vec<u8> {
        let len = self.remaining.len().min(INCR_CHUNK_SIZE);
        let mut chunk = self.remaining.split_off(len);
        std::mem::swap(&mut chunk, &mut self.remaining);
        chunk
    }
}

/// Owner-side and reader-side selection state
pub struct SelectionBroker {
    window: X11Window,
    clipboard: Option<OwnedSelection>,
    primary: Option<OwnedSelection>,
    outgoing: HashMap<(X11Window, Atom), OutgoingIncr>,
}

impl fmt::Debug for SelectionBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectionBroker")
            .field("window", &self.window)
            .field("clipboard", &self.clipboard)
            .field("primary", &self.primary)
            .field("outgoing", &self.outgoing)
            .finish()
    }
}

impl SelectionBroker {
    pub(crate) fn new(display: &Display) -> Result<SelectionBroker, X11Error> {
        let conn = &display.conn;
        let screen = &display.screen;

        let window = conn.generate_id()?;
        conn.create_window(
            screen.root_depth,
            window,
            screen.root,
            0,
            0,
            10,
            10,
            0,
            WindowClass::INPUT_OUTPUT,
            screen.root_visual,
            &CreateWindowAux::new().event_mask(EventMask::PROPERTY_CHANGE),
        )?;

        if display.caps.xfixes {
            use x11rb::protocol::xfixes::{ConnectionExt as _, SelectionEventMask};
            for selection in [Selection::Clipboard, Selection::Primary] {
                conn.xfixes_select_selection_input(
                    window,
                    selection.atom(&display.atoms),
                    SelectionEventMask::SET_SELECTION_OWNER
                        | SelectionEventMask::SELECTION_WINDOW_DESTROY
                        | SelectionEventMask::SELECTION_CLIENT_CLOSE,
                )?;
            }
        }
        conn.flush()?;

        debug!(selection_window = window, "selection broker init");
        Ok(SelectionBroker {
            window,
            clipboard: None,
            primary: None,
            outgoing: HashMap::new(),
        })
    }

    pub(crate) fn transfer_window(&self) -> X11Window {
        self.window
    }

    fn slot(&self, selection: Selection) -> &Option<OwnedSelection> {
        match selection {
            Selection::Clipboard => &self.clipboard,
            Selection::Primary => &self.primary,
        }
    }

    fn slot_mut(&mut self, selection: Selection) -> &mut Option<OwnedSelection> {
        match selection {
            Selection::Clipboard => &mut self.clipboard,
            Selection::Primary => &mut self.primary,
        }
    }

    fn slot_by_atom(&mut self, atom: Atom, atoms: &Atoms) -> Option<&mut OwnedSelection> {
        if atom == atoms.CLIPBOARD {
            self.clipboard.as_mut()
        } else if atom == Atom::from(AtomEnum::PRIMARY) {
            self.primary.as_mut()
        } else {
            None
        }
    }

    /// Whether this process currently owns `selection`
    pub fn owns(&self, selection: Selection) -> bool {
        self.slot(selection).is_some()
    }

    /// Claim `selection` and hold `data` for incoming conversions
    ///
    /// `targets` lists the additional target atoms the `produce` callback
    /// can serve; `TARGETS`, `TIMESTAMP`, `UTF8_STRING` and `STRING` are
    /// always answered. Replaces any previously held payload.
    pub fn set_data(
        &mut self,
        display: &Display,
        selection: Selection,
        data: Vec<u8>,
        targets: Vec<Atom>,
        produce: Option<ProduceFn>,
    ) -> Result<(), X11Error> {
        let timestamp = display.last_event_time;
        display
            .conn
            .set_selection_owner(self.window, selection.atom(&display.atoms), timestamp)?;
        display.conn.flush()?;

        self.store(selection, data, targets, produce, timestamp);
        Ok(())
    }

    /// Record the held payload, without touching the server
    fn store(
        &mut self,
        selection: Selection,
        data: Vec<u8>,
        targets: Vec<Atom>,
        produce: Option<ProduceFn>,
        timestamp: u32,
    ) {
        *self.slot_mut(selection) = Some(OwnedSelection {
            data,
            targets,
            produce,
            timestamp,
        });
    }

    /// Another client took the selection; forget ours silently
    pub(crate) fn lose_ownership(&mut self, selection: Selection) {
        if self.slot_mut(selection).take().is_some() {
            trace!(?selection, "selection ownership lost");
        }
    }

    /// The held text, when we own the selection ourselves
    pub(crate) fn local_text(&self, selection: Selection) -> Option<String> {
        self.slot(selection)
            .as_ref()
            .map(|owned| String::from_utf8_lossy(&owned.data).into_owned())
    }

    /// Read `selection` as text
    ///
    /// Answers from the local buffer when we are the owner; otherwise asks
    /// the owning client and sub-pumps until the reply or `timeout`.
    /// Events that are not part of the transfer are appended to `stash`.
    pub fn get_text(
        &mut self,
        display: &Display,
        selection: Selection,
        timeout: Duration,
        stash: &mut Vec<X11Event>,
    ) -> Result<Option<String>, X11Error> {
        if let Some(text) = self.local_text(selection) {
            return Ok(Some(text));
        }

        let atoms = display.atoms;
        let sel_atom = selection.atom(&atoms);
        match self.read_selection(display, sel_atom, atoms.UTF8_STRING, timeout, stash)? {
            Conversion::Data(bytes) => {
                return Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
            }
            // a stalled owner will not answer a second target any faster
            Conversion::TimedOut => return Ok(None),
            Conversion::Refused => {}
        }

        // owner may be an old client that only speaks latin-1 STRING
        match self.read_selection(display, sel_atom, AtomEnum::STRING.into(), timeout, stash)? {
            Conversion::Data(bytes) => {
                let (text, _, _) = encoding_rs::WINDOWS_1252.decode(&bytes);
                Ok(Some(text.into_owned()))
            }
            Conversion::Refused | Conversion::TimedOut => Ok(None),
        }
    }

    /// Convert `selection` to `target` and collect the raw reply bytes
    ///
    /// Shared by the clipboard reader and the drag-and-drop drop path.
    pub(crate) fn read_selection(
        &mut self,
        display: &Display,
        selection_atom: Atom,
        target: Atom,
        timeout: Duration,
        stash: &mut Vec<X11Event>,
    ) -> Result<Conversion, X11Error> {
        let conn = &display.conn;
        let atoms = &display.atoms;

        conn.convert_selection(
            self.window,
            selection_atom,
            target,
            atoms._EASEL_SELECTION,
            display.last_event_time,
        )?;
        conn.flush()?;

        // a timed-out INCR transfer must not leave a half-written property
        // behind to confuse the next read
        let window = self.window;
        let _cleanup = scopeguard::guard((), move |_| {
            let _ = conn.delete_property(window, atoms._EASEL_SELECTION);
            let _ = conn.flush();
        });

        let deadline = Instant::now() + timeout;
        let mut incr = false;
        let mut data: Vec<u8> = Vec::new();

        loop {
            while let Some(event) = conn.poll_for_event()? {
                match &event {
                    X11Event::SelectionNotify(notify)
                        if notify.requestor == self.window && notify.selection == selection_atom =>
                    {
                        if notify.property == x11rb::NONE {
                            trace!(selection = selection_atom, "conversion refused by owner");
                            return Ok(Conversion::Refused);
                        }
                        let reply = conn
                            .get_property(
                                true,
                                self.window,
                                atoms._EASEL_SELECTION,
                                AtomEnum::ANY,
                                0,
                                0x1fffffff,
                            )?
                            .reply()?;
                        if reply.type_ == atoms.INCR {
                            // chunks follow as property writes
                            incr = true;
                            conn.flush()?;
                        } else {
                            data.extend_from_slice(&reply.value);
                            return Ok(Conversion::Data(data));
                        }
                    }
                    X11Event::PropertyNotify(notify)
                        if incr
                            && notify.window == self.window
                            && notify.atom == atoms._EASEL_SELECTION
                            && notify.state == Property::NEW_VALUE =>
                    {
                        let reply = conn
                            .get_property(
                                true,
                                self.window,
                                atoms._EASEL_SELECTION,
                                AtomEnum::ANY,
                                0,
                                0x1fffffff,
                            )?
                            .reply()?;
                        conn.flush()?;
                        if reply.value.is_empty() {
                            debug!(len = data.len(), "INCR read complete");
                            return Ok(Conversion::Data(data));
                        }
                        data.extend_from_slice(&reply.value);
                    }
                    _ => stash.push(event),
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(selection = selection_atom, "selection read timed out");
                return Ok(Conversion::TimedOut);
            }
            display.wait_readable(remaining)?;
        }
    }

    /// Answer an incoming conversion request for a selection we own
    pub(crate) fn handle_selection_request(
        &mut self,
        display: &Display,
        request: &SelectionRequestEvent,
    ) -> Result<(), X11Error> {
        let atoms = display.atoms;
        let conn = display.conn.clone();

        // obsolete clients may pass property None
        let property = if request.property == x11rb::NONE {
            request.target
        } else {
            request.property
        };

        let Some(owned) = self.slot_by_atom(request.selection, &atoms) else {
            return send_notify(display, request, false);
        };

        if request.target == atoms.TARGETS {
            let mut list = vec![
                atoms.TARGETS,
                atoms.TIMESTAMP,
                atoms.UTF8_STRING,
                AtomEnum::STRING.into(),
            ];
            list.extend_from_slice(&owned.targets);
            conn.change_property32(
                PropMode::REPLACE,
                request.requestor,
                property,
                AtomEnum::ATOM,
                &list,
            )?;
            return send_notify(display, request, true);
        }
        if request.target == atoms.TIMESTAMP {
            conn.change_property32(
                PropMode::REPLACE,
                request.requestor,
                property,
                AtomEnum::CARDINAL,
                &[owned.timestamp],
            )?;
            return send_notify(display, request, true);
        }

        let bytes = produce_bytes(owned, request.target, &atoms);
        let Some(bytes) = bytes else {
            trace!(target = request.target, "refusing conversion to unsupported target");
            return send_notify(display, request, false);
        };

        if bytes.len() > INCR_CHUNK_SIZE {
            // announce an INCR transfer, chunks follow on property deletes
            conn.change_window_attributes(
                request.requestor,
                &ChangeWindowAttributesAux::new().event_mask(EventMask::PROPERTY_CHANGE),
            )?;
            conn.change_property32(
                PropMode::REPLACE,
                request.requestor,
                property,
                atoms.INCR,
                &[bytes.len() as u32],
            )?;
            self.outgoing.insert(
                (request.requestor, property),
                OutgoingIncr {
                    requestor: request.requestor,
                    property,
                    target: request.target,
                    remaining: bytes,
                },
            );
            debug!(requestor = request.requestor, "INCR write started");
            return send_notify(display, request, true);
        }

        conn.change_property8(
            PropMode::REPLACE,
            request.requestor,
            property,
            request.target,
            &bytes,
        )?;
        send_notify(display, request, true)
    }

    /// Drive outgoing INCR transfers from requestor property deletes
    ///
    /// Returns `true` if the notification belonged to a transfer.
    pub(crate) fn handle_property_delete(
        &mut self,
        display: &Display,
        window: X11Window,
        atom: Atom,
    ) -> Result<bool, X11Error> {
        let Some(transfer) = self.outgoing.get_mut(&(window, atom)) else {
            return Ok(false);
        };

        let chunk = transfer.next_chunk();
        let conn = &display.conn;
        conn.change_property8(
            PropMode::REPLACE,
            transfer.requestor,
            transfer.property,
            transfer.target,
            &chunk,
        )?;
        conn.flush()?;

        if chunk.is_empty() {
            // zero-length chunk ends the transfer
            let transfer = self.outgoing.remove(&(window, atom));
            if let Some(transfer) = transfer {
                debug!(requestor = transfer.requestor, "INCR write complete");
                conn.change_window_attributes(
                    transfer.requestor,
                    &ChangeWindowAttributesAux::new().event_mask(EventMask::NO_EVENT),
                )?;
                conn.flush()?;
            }
        }
        Ok(true)
    }

    /// Offer the clipboard to the persistent manager before teardown
    ///
    /// The manager answers with conversion requests of its own, so this
    /// sub-pumps with the same machinery as a read, answering requests as
    /// they arrive, until `SelectionNotify` signals completion.
    pub fn save_to_manager(
        &mut self,
        display: &Display,
        timeout: Duration,
        stash: &mut Vec<X11Event>,
    ) -> Result<bool, X11Error> {
        if !self.owns(Selection::Clipboard) {
            return Ok(false);
        }
        let atoms = display.atoms;
        let conn = &display.conn;

        let manager = conn
            .get_selection_owner(atoms.CLIPBOARD_MANAGER)?
            .reply()?
            .owner;
        if manager == x11rb::NONE {
            debug!("no clipboard manager running");
            return Ok(false);
        }

        conn.convert_selection(
            self.window,
            atoms.CLIPBOARD_MANAGER,
            atoms.SAVE_TARGETS,
            atoms._EASEL_SELECTION,
            display.last_event_time,
        )?;
        conn.flush()?;

        let deadline = Instant::now() + timeout;
        loop {
            while let Some(event) = conn.poll_for_event()? {
                match &event {
                    X11Event::SelectionRequest(request) if request.owner == self.window => {
                        self.handle_selection_request(display, request)?;
                        display.flush()?;
                    }
                    X11Event::PropertyNotify(notify) if notify.state == Property::DELETE => {
                        if !self.handle_property_delete(display, notify.window, notify.atom)? {
                            stash.push(event);
                        }
                    }
                    X11Event::SelectionNotify(notify)
                        if notify.requestor == self.window
                            && notify.selection == atoms.CLIPBOARD_MANAGER =>
                    {
                        debug!("clipboard handed to manager");
                        return Ok(notify.property != x11rb::NONE);
                    }
                    _ => stash.push(event),
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!("clipboard manager did not answer in time");
                return Ok(false);
            }
            display.wait_readable(remaining)?;
        }
    }
}

fn produce_bytes(owned: &mut OwnedSelection, target: Atom, atoms: &Atoms) -> Option<Vec<u8>> {
    if target == atoms.UTF8_STRING || target == atoms.TEXT_PLAIN_UTF8 {
        return Some(owned.data.clone());
    }
    if target == Atom::from(AtomEnum::STRING) {
        let text = String::from_utf8_lossy(&owned.data);
        let (encoded, _, _) = encoding_rs::WINDOWS_1252.encode(&text);
        return Some(encoded.into_owned());
    }
    if owned.targets.contains(&target) {
        if let Some(produce) = owned.produce.as_mut() {
            return produce(target);
        }
        return Some(owned.data.clone());
    }
    None
}

fn send_notify(
    display: &Display,
    request: &SelectionRequestEvent,
    success: bool,
) -> Result<(), X11Error> {
    display.conn.send_event(
        false,
        request.requestor,
        EventMask::NO_EVENT,
        SelectionNotifyEvent {
            response_type: SELECTION_NOTIFY_EVENT,
            sequence: 0,
            time: request.time,
            requestor: request.requestor,
            selection: request.selection,
            target: request.target,
            property: if success {
                request.property
            } else {
                AtomEnum::NONE.into()
            },
        },
    )?;
    display.conn.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker() -> SelectionBroker {
        SelectionBroker {
            window: 1,
            clipboard: None,
            primary: None,
            outgoing: HashMap::new(),
        }
    }

    #[test]
    fn stored_data_round_trips_locally() {
        let mut broker = broker();
        broker.store(
            Selection::Clipboard,
            b"hello there".to_vec(),
            Vec::new(),
            None,
            42,
        );
        assert!(broker.owns(Selection::Clipboard));
        assert_eq!(
            broker.local_text(Selection::Clipboard).as_deref(),
            Some("hello there")
        );
        // the other slot is untouched
        assert!(!broker.owns(Selection::Primary));
    }

    #[test]
    fn replacing_held_data_discards_the_old_buffer() {
        let mut broker = broker();
        broker.store(Selection::Primary, b"first".to_vec(), Vec::new(), None, 1);
        broker.store(Selection::Primary, b"second".to_vec(), Vec::new(), None, 2);
        assert_eq!(
            broker.local_text(Selection::Primary).as_deref(),
            Some("second")
        );
    }

    #[test]
    fn ownership_loss_clears_buffer_and_callback() {
        let mut broker = broker();
        broker.store(
            Selection::Primary,
            b"mine".to_vec(),
            Vec::new(),
            Some(Box::new(|_| None)),
            7,
        );
        broker.lose_ownership(Selection::Primary);
        assert!(!broker.owns(Selection::Primary));
        assert_eq!(broker.local_text(Selection::Primary), None);
    }

    #[test]
    fn incr_chunking_splits_and_terminates() {
        let mut transfer = OutgoingIncr {
            requestor: 2,
            property: 3,
            target: 4,
            remaining: vec![0xab; INCR_CHUNK_SIZE + 100],
        };
        assert_eq!(transfer.next_chunk().len(), INCR_CHUNK_SIZE);
        assert_eq!(transfer.next_chunk().len(), 100);
        assert!(transfer.next_chunk().is_empty());
    }
}
