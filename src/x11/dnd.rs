//! Target side of the Xdnd drag-and-drop handshake
//!
//! One session at a time: `XdndEnter` negotiates the payload type,
//! every `XdndPosition` is answered with exactly one `XdndStatus`,
//! `XdndDrop` pulls the payload through the selection machinery and
//! answers `XdndFinished`, `XdndLeave` discards the session outright.
//! The widget under the drag is recomputed on every position update, so
//! child widgets see their own enter/leave pairs independent of the
//! top-level protocol messages.

use std::path::PathBuf;
use std::time::Duration;

use smallvec::SmallVec;
use tracing::{debug, trace, warn};
use x11rb::connection::Connection as _;
use x11rb::protocol::xproto::{
    Atom, AtomEnum, ClientMessageData, ClientMessageEvent, ConnectionExt as _, EventMask,
    Window as X11Window,
};
use x11rb::protocol::Event as X11Event;

use crate::event::{DropData, Event, EventQueue, EventRecord};
use crate::utils::Point;
use crate::widget::WidgetId;
use super::selection::{Conversion, SelectionBroker};
use super::{Atoms, Display, X11Error};

/// The Xdnd protocol version we announce on our windows
pub(crate) const DND_VERSION: u32 = 5;
const MIN_DND_VERSION: u32 = 3;

#[derive(Debug)]
struct DragSession {
    source: X11Window,
    target_window: X11Window,
    target_widget: WidgetId,
    accepted: Option<Atom>,
    hover: Option<WidgetId>,
    position: Point,
    last_timestamp: u32,
}

impl DragSession {
    /// The negotiated payload type and drop target, if the drop can land
    ///
    /// The last `XdndStatus` already refused when no widget is hovered,
    /// so a drop without one gets no conversion and a negative finish.
    fn drop_outcome(&self) -> Option<(Atom, WidgetId)> {
        Some((self.accepted?, self.hover?))
    }
}

/// Target-side drag-and-drop state machine
#[derive(Debug, Default)]
pub(crate) struct DndEngine {
    session: Option<DragSession>,
}

impl DndEngine {
    /// A drag entered one of our top-level windows
    pub(crate) fn handle_enter(
        &mut self,
        display: &Display,
        msg: &ClientMessageData,
        target_window: X11Window,
        target_widget: WidgetId,
    ) -> Result<(), X11Error> {
        let data = msg.as_data32();
        let source = data[0];
        let version = data[1] >> 24;

        trace!(source, version, "XdndEnter");
        if version < MIN_DND_VERSION {
            debug!(version, "drag source speaks an unsupported Xdnd version");
            return Ok(());
        }

        let offered: SmallVec<[Atom; 8]> = if data[1] & 1 == 0 {
            data[2..5].iter().copied().filter(|&atom| atom != 0).collect()
        } else {
            // more than three types, fetch the full list
            let reply = display
                .conn
                .get_property(
                    false,
                    source,
                    display.atoms.XdndTypeList,
                    AtomEnum::ATOM,
                    0,
                    0x1fffffff,
                )?
                .reply_unchecked()?;
            reply
                .and_then(|reply| reply.value32().map(|values| values.collect()))
                .unwrap_or_default()
        };

        let accepted = negotiate(&offered, &display.atoms);
        if accepted.is_none() {
            debug!(?offered, "no mutually acceptable drag payload type");
        }

        self.session = Some(DragSession {
            source,
            target_window,
            target_widget,
            accepted,
            hover: None,
            position: Point::default(),
            last_timestamp: x11rb::CURRENT_TIME,
        });
        Ok(())
    }

    /// First half of a position update: decode and store the pointer
    /// position, returning the top-level widget and window-local point
    /// the caller should hit-test
    ///
    /// The caller must follow up with [`finish_position`](Self::finish_position)
    /// so the source gets its `XdndStatus` answer.
    pub(crate) fn prepare_position(
        &mut self,
        display: &Display,
        msg: &ClientMessageData,
    ) -> Result<Option<(WidgetId, Point)>, X11Error> {
        let Some(session) = self.session.as_mut() else {
            return Ok(None);
        };
        let data = msg.as_data32();
        if data[0] != session.source {
            debug!(got = data[0], expected = session.source, "XdndPosition from unknown source");
            return Ok(None);
        }

        let root_x = (data[2] >> 16) as i16 as i32;
        let root_y = (data[2] & 0xffff) as i16 as i32;
        session.last_timestamp = data[3];

        let local = display
            .conn
            .translate_coordinates(
                display.screen.root,
                session.target_window,
                root_x as i16,
                root_y as i16,
            )?
            .reply()?;
        let position = Point::new(local.dst_x as i32, local.dst_y as i32);
        session.position = position;
        Ok(Some((session.target_widget, position)))
    }

    /// Second half of a position update; answers with exactly one
    /// `XdndStatus`
    ///
    /// `over` is the hit-test result for the point returned by
    /// [`prepare_position`](Self::prepare_position).
    pub(crate) fn finish_position(
        &mut self,
        display: &Display,
        over: Option<WidgetId>,
        queue: &mut EventQueue,
    ) -> Result<(), X11Error> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let position = session.position;
        if session.hover != over {
            if let Some(old) = session.hover {
                queue.push(EventRecord {
                    target: old,
                    event: Event::DragLeave,
                });
            }
            if let Some(new) = over {
                queue.push(EventRecord {
                    target: new,
                    event: Event::DragEnter,
                });
            }
            session.hover = over;
        }
        if let Some(over) = over {
            queue.push(EventRecord {
                target: over,
                event: Event::DragMotion { position },
            });
        }

        let accept = session.accepted.is_some() && over.is_some();
        let status = [
            session.target_window,
            // bit 0: will accept, bit 1: keep the position updates coming
            u32::from(accept) | (1 << 1),
            0,
            0,
            if accept {
                display.atoms.XdndActionCopy
            } else {
                0
            },
        ];
        send_dnd_message(
            display,
            session.source,
            display.atoms.XdndStatus,
            status,
        )?;
        Ok(())
    }

    /// The drag left without dropping; discard everything
    pub(crate) fn handle_leave(&mut self, msg: &ClientMessageData, queue: &mut EventQueue) {
        let Some(session) = self.session.take() else {
            return;
        };
        let data = msg.as_data32();
        if data[0] != session.source {
            // stale leave for a session we no longer track
            self.session = Some(session);
            return;
        }
        trace!(source = session.source, "XdndLeave");
        if let Some(hover) = session.hover {
            queue.push(EventRecord {
                target: hover,
                event: Event::DragLeave,
            });
        }
    }

    /// The source dropped; fetch the payload and finish the handshake
    ///
    /// Issues exactly one conversion request, through the same reply path
    /// the clipboard reader uses.
    pub(crate) fn handle_drop(
        &mut self,
        display: &Display,
        broker: &mut SelectionBroker,
        msg: &ClientMessageData,
        queue: &mut EventQueue,
        timeout: Duration,
        stash: &mut Vec<X11Event>,
    ) -> Result<(), X11Error> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        let data = msg.as_data32();
        if data[0] != session.source {
            debug!(got = data[0], expected = session.source, "XdndDrop from unknown source");
            self.session = Some(session);
            return Ok(());
        }

        let outcome = session.drop_outcome();
        let (finished, payload) = match outcome {
            Some((accepted, _)) => {
                let conversion = broker.read_selection(
                    display,
                    display.atoms.XdndSelection,
                    accepted,
                    timeout,
                    stash,
                )?;
                match conversion {
                    Conversion::Data(bytes) => {
                        (true, Some(decode_payload(&bytes, accepted, &display.atoms)))
                    }
                    Conversion::Refused | Conversion::TimedOut => {
                        warn!("drag payload transfer failed");
                        (false, None)
                    }
                }
            }
            None => (false, None),
        };

        if let (Some(payload), Some((_, target))) = (payload, outcome) {
            queue.push(EventRecord {
                target,
                event: Event::Drop {
                    position: session.position,
                    data: payload,
                },
            });
        }

        let finish = [
            session.target_window,
            u32::from(finished),
            if finished {
                display.atoms.XdndActionCopy
            } else {
                0
            },
            0,
            0,
        ];
        send_dnd_message(
            display,
            session.source,
            display.atoms.XdndFinished,
            finish,
        )?;
        debug!(source = session.source, finished, "drop completed");
        Ok(())
    }

    /// Drop the session if its target widget went away
    pub(crate) fn widget_destroyed(&mut self, widget: WidgetId) {
        if let Some(session) = self.session.as_mut() {
            if session.target_widget == widget {
                self.session = None;
            } else if session.hover == Some(widget) {
                session.hover = None;
            }
        }
    }
}

fn send_dnd_message(
    display: &Display,
    dest: X11Window,
    type_: Atom,
    data: [u32; 5],
) -> Result<(), X11Error> {
    display.conn.send_event(
        false,
        dest,
        EventMask::NO_EVENT,
        ClientMessageEvent::new(32, dest, type_, data),
    )?;
    display.conn.flush()?;
    Ok(())
}

/// Pick the best mutually acceptable payload type
///
/// A file list beats plain text for a drop onto a paint canvas.
fn negotiate(offered: &[Atom], atoms: &Atoms) -> Option<Atom> {
    let preference = [
        atoms.TEXT_URI_LIST,
        atoms.UTF8_STRING,
        atoms.TEXT_PLAIN_UTF8,
        AtomEnum::STRING.into(),
    ];
    first_preferred(&preference, offered)
}

fn first_preferred(preference: &[Atom], offered: &[Atom]) -> Option<Atom> {
    preference
        .iter()
        .copied()
        .find(|wanted| offered.contains(wanted))
}

fn decode_payload(bytes: &[u8], target: Atom, atoms: &Atoms) -> DropData {
    if target == atoms.TEXT_URI_LIST {
        DropData::Files(parse_uri_list(bytes))
    } else if target == Atom::from(AtomEnum::STRING) {
        let (text, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
        DropData::Text(text.into_owned())
    } else {
        DropData::Text(String::from_utf8_lossy(bytes).into_owned())
    }
}

/// Extract local paths from a `text/uri-list` payload
///
/// Lines are CRLF separated, `#` starts a comment, only `file://` URIs
/// for this host are kept, percent-escapes are decoded.
fn parse_uri_list(bytes: &[u8]) -> Vec<PathBuf> {
    let text = String::from_utf8_lossy(bytes);
    text.lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let rest = line.strip_prefix("file://")?;
            // an optional authority of "localhost" or empty is ours
            let path = match rest.find('/') {
                Some(0) => rest,
                Some(slash) if &rest[..slash] == "localhost" => &rest[slash..],
                _ => return None,
            };
            Some(PathBuf::from(percent_decode(path)))
        })
        .collect()
}

fn percent_decode(input: &str) -> String {
    let mut out = Vec::with_capacity(input.len());
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let (Some(hi), Some(lo)) = (
                bytes.get(i + 1).and_then(|b| (*b as char).to_digit(16)),
                bytes.get(i + 2).and_then(|b| (*b as char).to_digit(16)),
            ) {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_list_yields_decoded_paths() {
        let input = b"file:///home/user/image%20one.png\r\nfile://localhost/tmp/b.ora\r\n";
        let paths = parse_uri_list(input);
        assert_eq!(
            paths,
            vec![
                PathBuf::from("/home/user/image one.png"),
                PathBuf::from("/tmp/b.ora"),
            ]
        );
    }

    #[test]
    fn uri_list_skips_comments_and_foreign_uris() {
        let input = b"# dropped from somewhere\r\nhttp://example.com/x.png\r\nfile://otherhost/nope\r\nfile:///ok\r\n";
        assert_eq!(parse_uri_list(input), vec![PathBuf::from("/ok")]);
    }

    #[test]
    fn uri_list_tolerates_bare_lf() {
        let input = b"file:///a\nfile:///b";
        assert_eq!(
            parse_uri_list(input),
            vec![PathBuf::from("/a"), PathBuf::from("/b")]
        );
    }

    #[test]
    fn negotiation_walks_the_preference_order() {
        // atoms stand in for uri-list, utf8, plain, string
        let preference = [10, 11, 12, 13];
        assert_eq!(first_preferred(&preference, &[13, 11]), Some(11));
        assert_eq!(first_preferred(&preference, &[99, 10]), Some(10));
        assert_eq!(first_preferred(&preference, &[99, 98]), None);
    }

    #[test]
    fn drop_without_hovered_widget_fetches_nothing() {
        let mut arena = crate::widget::WidgetArena::new();
        let toplevel = arena.alloc();
        let mut session = DragSession {
            source: 100,
            target_window: 200,
            target_widget: toplevel,
            accepted: Some(42),
            hover: None,
            position: Point::default(),
            last_timestamp: x11rb::CURRENT_TIME,
        };
        // a refused position never becomes a delivery at drop time
        assert_eq!(session.drop_outcome(), None);

        let child = arena.alloc();
        session.hover = Some(child);
        assert_eq!(session.drop_outcome(), Some((42, child)));

        session.accepted = None;
        assert_eq!(session.drop_outcome(), None);
    }

    #[test]
    fn percent_decode_passes_invalid_escapes_through() {
        assert_eq!(percent_decode("a%2zb"), "a%2zb");
        assert_eq!(percent_decode("trailing%2"), "trailing%2");
        assert_eq!(percent_decode("%41%42"), "AB");
    }
}
