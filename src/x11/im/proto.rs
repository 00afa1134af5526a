//! XIM transport frame codec
//!
//! The input-method protocol runs as framed messages tunnelled through
//! `_XIM_PROTOCOL` client messages. Each frame is a 4-byte header (major
//! opcode, minor opcode, payload length in 4-byte units) followed by the
//! padded payload. Only the subset of messages the bridge speaks is
//! implemented. All of our frames use little-endian encoding, announced
//! in `XIM_CONNECT`.

/// Opcodes of the XIM protocol messages the bridge knows
pub(crate) mod opcode {
    pub const CONNECT: u8 = 1;
    pub const CONNECT_REPLY: u8 = 2;
    pub const DISCONNECT: u8 = 3;
    pub const DISCONNECT_REPLY: u8 = 4;
    pub const ERROR: u8 = 20;
    pub const OPEN: u8 = 30;
    pub const OPEN_REPLY: u8 = 31;
    pub const CLOSE: u8 = 32;
    pub const CLOSE_REPLY: u8 = 33;
    pub const REGISTER_TRIGGERKEYS: u8 = 34;
    pub const SET_EVENT_MASK: u8 = 37;
    pub const GET_IM_VALUES: u8 = 44;
    pub const GET_IM_VALUES_REPLY: u8 = 45;
    pub const CREATE_IC: u8 = 50;
    pub const CREATE_IC_REPLY: u8 = 51;
    pub const DESTROY_IC: u8 = 52;
    pub const DESTROY_IC_REPLY: u8 = 53;
    pub const SET_IC_FOCUS: u8 = 58;
    pub const UNSET_IC_FOCUS: u8 = 59;
    pub const FORWARD_EVENT: u8 = 60;
    pub const SYNC: u8 = 61;
    pub const SYNC_REPLY: u8 = 62;
    pub const COMMIT: u8 = 63;
    pub const PREEDIT_START: u8 = 73;
    pub const PREEDIT_START_REPLY: u8 = 74;
    pub const PREEDIT_DRAW: u8 = 75;
    pub const PREEDIT_CARET: u8 = 76;
    pub const PREEDIT_CARET_REPLY: u8 = 77;
    pub const PREEDIT_DONE: u8 = 78;
}

/// Input styles, as bits of the `XNQueryInputStyle` result
pub(crate) mod style {
    pub const PREEDIT_CALLBACKS: u32 = 0x0002;
    pub const PREEDIT_NOTHING: u32 = 0x0008;
    pub const PREEDIT_NONE: u32 = 0x0010;
    pub const STATUS_NOTHING: u32 = 0x0400;
    pub const STATUS_NONE: u32 = 0x0800;
}

/// Per-character preedit feedback bits
pub(crate) mod feedback {
    pub const REVERSE: u32 = 0x01;
    pub const UNDERLINE: u32 = 0x02;
}

pub(crate) const LITTLE_ENDIAN_MARKER: u8 = 0x6c;

/// One decoded transport frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Frame {
    pub major: u8,
    pub minor: u8,
    pub payload: Vec<u8>,
}

/// Serialize a frame, padding the payload to a 4-byte boundary
pub(crate) fn encode_frame(major: u8, minor: u8, payload: &[u8]) -> Vec<u8> {
    let padded = (payload.len() + 3) & !3;
    let mut out = Vec::with_capacity(4 + padded);
    out.push(major);
    out.push(minor);
    out.extend_from_slice(&((padded / 4) as u16).to_le_bytes());
    out.extend_from_slice(payload);
    out.resize(4 + padded, 0);
    out
}

/// Decode the first complete frame of `data`, returning it and the
/// number of bytes consumed
pub(crate) fn decode_frame(data: &[u8]) -> Option<(Frame, usize)> {
    if data.len() < 4 {
        return None;
    }
    let major = data[0];
    let minor = data[1];
    let units = u16::from_le_bytes([data[2], data[3]]) as usize;
    let total = 4 + units * 4;
    if data.len() < total {
        return None;
    }
    Some((
        Frame {
            major,
            minor,
            payload: data[4..total].to_vec(),
        },
        total,
    ))
}

/// Little-endian payload writer
#[derive(Debug, Default)]
pub(crate) struct FrameWriter {
    buf: Vec<u8>,
}

impl FrameWriter {
    pub(crate) fn new() -> FrameWriter {
        Default::default()
    }

    pub(crate) fn u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    pub(crate) fn u16(&mut self, value: u16) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub(crate) fn i32(&mut self, value: i32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub(crate) fn bytes(&mut self, value: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(value);
        self
    }

    /// Pad to the next 4-byte boundary
    pub(crate) fn pad(&mut self) -> &mut Self {
        while self.buf.len() % 4 != 0 {
            self.buf.push(0);
        }
        self
    }

    pub(crate) fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

/// Little-endian payload reader; reads past the end yield zero values
/// so malformed server frames degrade instead of panicking
#[derive(Debug)]
pub(crate) struct FrameReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> FrameReader<'a> {
        FrameReader { data, pos: 0 }
    }

    pub(crate) fn u8(&mut self) -> u8 {
        let value = self.data.get(self.pos).copied().unwrap_or(0);
        self.pos += 1;
        value
    }

    pub(crate) fn u16(&mut self) -> u16 {
        u16::from_le_bytes([self.u8(), self.u8()])
    }

    pub(crate) fn u32(&mut self) -> u32 {
        u32::from_le_bytes([self.u8(), self.u8(), self.u8(), self.u8()])
    }

    pub(crate) fn i32(&mut self) -> i32 {
        self.u32() as i32
    }

    pub(crate) fn bytes(&mut self, len: usize) -> &'a [u8] {
        let start = self.pos.min(self.data.len());
        let end = (self.pos + len).min(self.data.len());
        self.pos += len;
        &self.data[start..end]
    }

    pub(crate) fn skip_pad(&mut self) {
        while self.pos % 4 != 0 {
            self.pos += 1;
        }
    }
}

/// A named IM or IC attribute announced in `XIM_OPEN_REPLY`
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Attr {
    pub id: u16,
    pub name: String,
}

/// Parse an attribute list: id, type, name length, name, padding
pub(crate) fn parse_attrs(reader: &mut FrameReader<'_>, byte_len: usize) -> Vec<Attr> {
    let end = reader.pos + byte_len;
    let mut attrs = Vec::new();
    while reader.pos + 6 <= end.min(reader.data.len()) {
        let id = reader.u16();
        let _type = reader.u16();
        let name_len = reader.u16() as usize;
        let name = String::from_utf8_lossy(reader.bytes(name_len)).into_owned();
        reader.skip_pad();
        attrs.push(Attr { id, name });
    }
    reader.pos = end;
    attrs
}

/// Messages the bridge sends

pub(crate) fn connect() -> Vec<u8> {
    let payload = FrameWriter::new()
        .u8(LITTLE_ENDIAN_MARKER)
        .u8(0)
        .u16(1) // protocol major
        .u16(0) // protocol minor
        .u16(0) // no auth protocols
        .finish();
    encode_frame(opcode::CONNECT, 0, &payload)
}

pub(crate) fn open(locale: &str) -> Vec<u8> {
    let mut writer = FrameWriter::new();
    writer.u8(locale.len() as u8).bytes(locale.as_bytes()).pad();
    encode_frame(opcode::OPEN, 0, &writer.finish())
}

pub(crate) fn close(im_id: u16) -> Vec<u8> {
    let payload = FrameWriter::new().u16(im_id).u16(0).finish();
    encode_frame(opcode::CLOSE, 0, &payload)
}

pub(crate) fn disconnect() -> Vec<u8> {
    encode_frame(opcode::DISCONNECT, 0, &[])
}

pub(crate) fn get_im_values(im_id: u16, attr_ids: &[u16]) -> Vec<u8> {
    let mut writer = FrameWriter::new();
    writer.u16(im_id).u16((attr_ids.len() * 2) as u16);
    for id in attr_ids {
        writer.u16(*id);
    }
    writer.pad();
    encode_frame(opcode::GET_IM_VALUES, 0, &writer.finish())
}

/// One IC attribute value for `XIM_CREATE_IC`
#[derive(Debug, Clone)]
pub(crate) struct IcValue {
    pub id: u16,
    pub value: Vec<u8>,
}

pub(crate) fn create_ic(im_id: u16, values: &[IcValue]) -> Vec<u8> {
    let mut list = FrameWriter::new();
    for value in values {
        list.u16(value.id)
            .u16(value.value.len() as u16)
            .bytes(&value.value)
            .pad();
    }
    let list = list.finish();

    let mut writer = FrameWriter::new();
    writer.u16(im_id).u16(list.len() as u16).bytes(&list);
    encode_frame(opcode::CREATE_IC, 0, &writer.finish())
}

pub(crate) fn destroy_ic(im_id: u16, ic_id: u16) -> Vec<u8> {
    let payload = FrameWriter::new().u16(im_id).u16(ic_id).finish();
    encode_frame(opcode::DESTROY_IC, 0, &payload)
}

pub(crate) fn set_ic_focus(im_id: u16, ic_id: u16) -> Vec<u8> {
    let payload = FrameWriter::new().u16(im_id).u16(ic_id).finish();
    encode_frame(opcode::SET_IC_FOCUS, 0, &payload)
}

pub(crate) fn unset_ic_focus(im_id: u16, ic_id: u16) -> Vec<u8> {
    let payload = FrameWriter::new().u16(im_id).u16(ic_id).finish();
    encode_frame(opcode::UNSET_IC_FOCUS, 0, &payload)
}

/// Forward a raw key event to the server, asking for synchronous filtering
pub(crate) fn forward_event(im_id: u16, ic_id: u16, serial: u16, raw_event: &[u8]) -> Vec<u8> {
    let mut writer = FrameWriter::new();
    writer
        .u16(im_id)
        .u16(ic_id)
        .u16(0x0001) // synchronous
        .u16(serial)
        .bytes(raw_event)
        .pad();
    encode_frame(opcode::FORWARD_EVENT, 0, &writer.finish())
}

pub(crate) fn sync_reply(im_id: u16, ic_id: u16) -> Vec<u8> {
    let payload = FrameWriter::new().u16(im_id).u16(ic_id).finish();
    encode_frame(opcode::SYNC_REPLY, 0, &payload)
}

pub(crate) fn preedit_start_reply(im_id: u16, ic_id: u16) -> Vec<u8> {
    // -1: no length limit on the preedit string
    let payload = FrameWriter::new().u16(im_id).u16(ic_id).i32(-1).finish();
    encode_frame(opcode::PREEDIT_START_REPLY, 0, &payload)
}

pub(crate) fn preedit_caret_reply(im_id: u16, ic_id: u16, position: i32) -> Vec<u8> {
    let payload = FrameWriter::new()
        .u16(im_id)
        .u16(ic_id)
        .i32(position)
        .finish();
    encode_frame(opcode::PREEDIT_CARET_REPLY, 0, &payload)
}

/// Messages the server sends

/// Decoded server-to-client message
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ServerMessage {
    ConnectReply {
        major: u16,
        minor: u16,
    },
    OpenReply {
        im_id: u16,
        im_attrs: Vec<Attr>,
        ic_attrs: Vec<Attr>,
    },
    GetImValuesReply {
        styles: Vec<u32>,
    },
    CreateIcReply {
        ic_id: u16,
    },
    DestroyIcReply,
    SetEventMask,
    RegisterTriggerkeys,
    ForwardEvent {
        ic_id: u16,
        raw_event: Vec<u8>,
    },
    Sync {
        ic_id: u16,
    },
    Commit {
        ic_id: u16,
        text: Vec<u8>,
    },
    PreeditStart {
        ic_id: u16,
    },
    PreeditDraw {
        caret: i32,
        chg_first: i32,
        chg_length: i32,
        /// `None` when the draw carries no string: with feedback present
        /// the change range is restyled in place, without it the range is
        /// deleted
        text: Option<String>,
        feedback: Vec<u32>,
    },
    PreeditCaret {
        ic_id: u16,
        position: i32,
    },
    PreeditDone,
    CloseReply,
    DisconnectReply,
    Error {
        code: u16,
        detail: String,
    },
}

/// Interpret a decoded frame; `None` for messages the bridge ignores
pub(crate) fn parse_server_frame(frame: &Frame) -> Option<ServerMessage> {
    let mut reader = FrameReader::new(&frame.payload);
    let message = match frame.major {
        opcode::CONNECT_REPLY => {
            let major = reader.u16();
            let minor = reader.u16();
            ServerMessage::ConnectReply { major, minor }
        }
        opcode::OPEN_REPLY => {
            let im_id = reader.u16();
            let im_len = reader.u16() as usize;
            let im_attrs = parse_attrs(&mut reader, im_len);
            let ic_len = reader.u16() as usize;
            reader.u16(); // unused
            let ic_attrs = parse_attrs(&mut reader, ic_len);
            ServerMessage::OpenReply {
                im_id,
                im_attrs,
                ic_attrs,
            }
        }
        opcode::GET_IM_VALUES_REPLY => {
            let _im_id = reader.u16();
            let _byte_len = reader.u16();
            // single value expected: the XIMStyles list for XNQueryInputStyle
            let _attr_id = reader.u16();
            let _value_len = reader.u16();
            let count = reader.u16();
            reader.u16(); // pad
            let styles = (0..count).map(|_| reader.u32()).collect();
            ServerMessage::GetImValuesReply { styles }
        }
        opcode::CREATE_IC_REPLY => {
            let _im_id = reader.u16();
            ServerMessage::CreateIcReply {
                ic_id: reader.u16(),
            }
        }
        opcode::DESTROY_IC_REPLY => ServerMessage::DestroyIcReply,
        opcode::SET_EVENT_MASK => ServerMessage::SetEventMask,
        opcode::REGISTER_TRIGGERKEYS => ServerMessage::RegisterTriggerkeys,
        opcode::FORWARD_EVENT => {
            let _im_id = reader.u16();
            let ic_id = reader.u16();
            let _flag = reader.u16();
            let _serial = reader.u16();
            let raw_event = reader.bytes(32).to_vec();
            ServerMessage::ForwardEvent { ic_id, raw_event }
        }
        opcode::SYNC => {
            let _im_id = reader.u16();
            ServerMessage::Sync {
                ic_id: reader.u16(),
            }
        }
        opcode::COMMIT => {
            let _im_id = reader.u16();
            let ic_id = reader.u16();
            let flag = reader.u16();
            // XLookupChars (0x2): a counted byte string follows
            let text = if flag & 0x2 != 0 {
                if flag & 0x1 != 0 {
                    // XLookupBoth carries a keysym first
                    reader.u16();
                    reader.u32();
                }
                let len = reader.u16() as usize;
                reader.bytes(len).to_vec()
            } else {
                Vec::new()
            };
            ServerMessage::Commit { ic_id, text }
        }
        opcode::PREEDIT_START => {
            let _im_id = reader.u16();
            ServerMessage::PreeditStart {
                ic_id: reader.u16(),
            }
        }
        opcode::PREEDIT_DRAW => {
            let _im_id = reader.u16();
            let _ic_id = reader.u16();
            let caret = reader.i32();
            let chg_first = reader.i32();
            let chg_length = reader.i32();
            let status = reader.u32();
            // status bit 0: no string in this draw, bit 1: no feedback
            let text = if status & 0x1 == 0 {
                let len = reader.u16() as usize;
                let bytes = reader.bytes(len).to_vec();
                reader.skip_pad();
                Some(String::from_utf8_lossy(&bytes).into_owned())
            } else {
                reader.u16();
                reader.skip_pad();
                None
            };
            let feedback = if status & 0x2 == 0 {
                let byte_len = reader.u16() as usize;
                reader.u16(); // pad
                (0..byte_len / 4).map(|_| reader.u32()).collect()
            } else {
                Vec::new()
            };
            ServerMessage::PreeditDraw {
                caret,
                chg_first,
                chg_length,
                text,
                feedback,
            }
        }
        opcode::PREEDIT_CARET => {
            let _im_id = reader.u16();
            let ic_id = reader.u16();
            let position = reader.i32();
            ServerMessage::PreeditCaret { ic_id, position }
        }
        opcode::PREEDIT_DONE => ServerMessage::PreeditDone,
        opcode::CLOSE_REPLY => ServerMessage::CloseReply,
        opcode::DISCONNECT_REPLY => ServerMessage::DisconnectReply,
        opcode::ERROR => {
            reader.u16(); // im
            reader.u16(); // ic
            reader.u16(); // flag
            let code = reader.u16();
            let len = reader.u16() as usize;
            reader.u16(); // type of detail
            let detail = String::from_utf8_lossy(reader.bytes(len)).into_owned();
            ServerMessage::Error { code, detail }
        }
        _ => return None,
    };
    Some(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_round_trip_with_padding() {
        let encoded = encode_frame(opcode::OPEN, 0, &[5, b'C', 0, 0, 0, 0]);
        assert_eq!(encoded.len() % 4, 0);
        let (frame, consumed) = decode_frame(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(frame.major, opcode::OPEN);
        assert_eq!(frame.payload.len() % 4, 0);
    }

    #[test]
    fn partial_frames_are_not_decoded() {
        let encoded = encode_frame(opcode::COMMIT, 0, &[0; 12]);
        assert!(decode_frame(&encoded[..3]).is_none());
        assert!(decode_frame(&encoded[..encoded.len() - 1]).is_none());
    }

    #[test]
    fn connect_announces_little_endian() {
        let frame = connect();
        let (frame, _) = decode_frame(&frame).unwrap();
        assert_eq!(frame.major, opcode::CONNECT);
        assert_eq!(frame.payload[0], LITTLE_ENDIAN_MARKER);
    }

    #[test]
    fn commit_text_is_extracted() {
        // im 1, ic 2, flag XLookupChars, 5 byte string
        let payload = FrameWriter::new()
            .u16(1)
            .u16(2)
            .u16(0x2)
            .u16(5)
            .bytes(b"hello")
            .pad()
            .finish();
        let frame = Frame {
            major: opcode::COMMIT,
            minor: 0,
            payload,
        };
        assert_eq!(
            parse_server_frame(&frame),
            Some(ServerMessage::Commit {
                ic_id: 2,
                text: b"hello".to_vec(),
            })
        );
    }

    #[test]
    fn close_and_disconnect_frames_carry_no_payload_surprises() {
        let (frame, _) = decode_frame(&close(7)).unwrap();
        assert_eq!(frame.major, opcode::CLOSE);
        assert_eq!(&frame.payload[..2], &7u16.to_le_bytes());

        let (frame, _) = decode_frame(&disconnect()).unwrap();
        assert_eq!(frame.major, opcode::DISCONNECT);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn preedit_draw_carries_text_and_feedback() {
        let payload = FrameWriter::new()
            .u16(1)
            .u16(2)
            .i32(3) // caret
            .i32(0) // chg_first
            .i32(0) // chg_length
            .bytes(&0u32.to_le_bytes()) // status: both present
            .u16(3)
            .bytes(b"abc")
            .pad()
            .u16(12)
            .u16(0)
            .bytes(&feedback::REVERSE.to_le_bytes())
            .bytes(&0u32.to_le_bytes())
            .bytes(&feedback::UNDERLINE.to_le_bytes())
            .finish();
        let frame = Frame {
            major: opcode::PREEDIT_DRAW,
            minor: 0,
            payload,
        };
        let Some(ServerMessage::PreeditDraw {
            caret,
            text,
            feedback,
            ..
        }) = parse_server_frame(&frame)
        else {
            panic!("not a preedit draw");
        };
        assert_eq!(caret, 3);
        assert_eq!(text.as_deref(), Some("abc"));
        assert_eq!(feedback, vec![0x1, 0x0, 0x2]);
    }

    #[test]
    fn preedit_draw_without_string_parses_as_absent() {
        let payload = FrameWriter::new()
            .u16(1)
            .u16(2)
            .i32(0) // caret
            .i32(0) // chg_first
            .i32(2) // chg_length
            .bytes(&1u32.to_le_bytes()) // status: no string
            .u16(0)
            .pad()
            .u16(8)
            .u16(0)
            .bytes(&feedback::REVERSE.to_le_bytes())
            .bytes(&feedback::REVERSE.to_le_bytes())
            .finish();
        let frame = Frame {
            major: opcode::PREEDIT_DRAW,
            minor: 0,
            payload,
        };
        let Some(ServerMessage::PreeditDraw { text, feedback, .. }) = parse_server_frame(&frame)
        else {
            panic!("not a preedit draw");
        };
        assert_eq!(text, None);
        assert_eq!(feedback, vec![0x1, 0x1]);
    }

    #[test]
    fn open_reply_attr_tables_are_parsed() {
        // one im attr "queryInputStyle", one ic attr "inputStyle"
        let mut im_list = FrameWriter::new();
        im_list
            .u16(7)
            .u16(0x1b) // type: XIMStyles
            .u16(15)
            .bytes(b"queryInputStyle")
            .pad();
        let im_list = im_list.finish();

        let mut ic_list = FrameWriter::new();
        ic_list.u16(3).u16(0xd).u16(10).bytes(b"inputStyle").pad();
        let ic_list = ic_list.finish();

        let mut writer = FrameWriter::new();
        writer
            .u16(9)
            .u16(im_list.len() as u16)
            .bytes(&im_list)
            .u16(ic_list.len() as u16)
            .u16(0)
            .bytes(&ic_list);
        let frame = Frame {
            major: opcode::OPEN_REPLY,
            minor: 0,
            payload: writer.finish(),
        };

        let Some(ServerMessage::OpenReply {
            im_id,
            im_attrs,
            ic_attrs,
        }) = parse_server_frame(&frame)
        else {
            panic!("not an open reply");
        };
        assert_eq!(im_id, 9);
        assert_eq!(im_attrs, vec![Attr { id: 7, name: "queryInputStyle".into() }]);
        assert_eq!(ic_attrs, vec![Attr { id: 3, name: "inputStyle".into() }]);
    }
}
