//! Frame codec for the result queue.
//!
//! Every frame is a one-byte tag followed by a little-endian body. The
//! worker is the only sender; the launcher decodes. Unknown tags decode
//! to [`Message::Unknown`] so a newer worker does not break an older
//! launcher.

use crate::error::{Error, Result};

pub(crate) const TAG_ROW_DESCRIPTION: u8 = b'T';
pub(crate) const TAG_DATA_ROW: u8 = b'D';
pub(crate) const TAG_COMMAND_COMPLETE: u8 = b'C';
pub(crate) const TAG_ERROR: u8 = b'E';
pub(crate) const TAG_NOTICE: u8 = b'N';
pub(crate) const TAG_NOTIFY: u8 = b'A';
pub(crate) const TAG_READY: u8 = b'Z';
pub(crate) const TAG_COPY_IN: u8 = b'G';
pub(crate) const TAG_COPY_OUT: u8 = b'H';
pub(crate) const TAG_COPY_BOTH: u8 = b'W';

const FIELD_SEVERITY: u8 = b'S';
const FIELD_CODE: u8 = b'C';
const FIELD_MESSAGE: u8 = b'M';
const FIELD_DETAIL: u8 = b'D';
const FIELD_HINT: u8 = b'H';
const FIELD_END: u8 = 0;

pub const TYPE_BOOL: u8 = 1;
pub const TYPE_INT4: u8 = 2;
pub const TYPE_INT8: u8 = 3;
pub const TYPE_FLOAT8: u8 = 4;
pub const TYPE_TEXT: u8 = 5;
pub const TYPE_BYTEA: u8 = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDesc {
    pub name: String,
    pub type_code: u8,
}

/// Structured error or notice payload, field for field.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorFields {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
}

/// Out-of-band notification relayed alongside the result stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub pid: u32,
    pub channel: String,
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Message {
    RowDescription(Vec<ColumnDesc>),
    /// Fields as raw bytes; `None` is a null field.
    DataRow(Vec<Option<Vec<u8>>>),
    CommandComplete(String),
    ErrorResponse(ErrorFields),
    NoticeResponse(ErrorFields),
    Notify(Notification),
    /// Terminal marker: the unit of work committed.
    Ready,
    CopyMarker(u8),
    Unknown(u8),
}

pub(crate) fn encode(msg: &Message) -> Vec<u8> {
    let mut out = Vec::new();
    match msg {
        Message::RowDescription(cols) => {
            out.push(TAG_ROW_DESCRIPTION);
            out.extend_from_slice(&(cols.len() as u16).to_le_bytes());
            for col in cols {
                put_string(&mut out, &col.name);
                out.push(col.type_code);
            }
        }
        Message::DataRow(fields) => {
            out.push(TAG_DATA_ROW);
            out.extend_from_slice(&(fields.len() as u16).to_le_bytes());
            for field in fields {
                match field {
                    None => out.extend_from_slice(&(-1i32).to_le_bytes()),
                    Some(bytes) => {
                        out.extend_from_slice(&(bytes.len() as i32).to_le_bytes());
                        out.extend_from_slice(bytes);
                    }
                }
            }
        }
        Message::CommandComplete(tag) => {
            out.push(TAG_COMMAND_COMPLETE);
            put_string(&mut out, tag);
        }
        Message::ErrorResponse(fields) => {
            out.push(TAG_ERROR);
            put_error_fields(&mut out, fields);
        }
        Message::NoticeResponse(fields) => {
            out.push(TAG_NOTICE);
            put_error_fields(&mut out, fields);
        }
        Message::Notify(n) => {
            out.push(TAG_NOTIFY);
            out.extend_from_slice(&n.pid.to_le_bytes());
            put_string(&mut out, &n.channel);
            put_string(&mut out, &n.payload);
        }
        Message::Ready => out.push(TAG_READY),
        Message::CopyMarker(tag) => out.push(*tag),
        Message::Unknown(tag) => out.push(*tag),
    }
    out
}

pub(crate) fn decode(frame: &[u8]) -> Result<Message> {
    let mut r = Reader::new(frame);
    let tag = r.u8()?;
    let msg = match tag {
        TAG_ROW_DESCRIPTION => {
            let n = r.u16()?;
            let mut cols = Vec::with_capacity(n as usize);
            for _ in 0..n {
                let name = r.string()?;
                let type_code = r.u8()?;
                cols.push(ColumnDesc { name, type_code });
            }
            Message::RowDescription(cols)
        }
        TAG_DATA_ROW => {
            let n = r.u16()?;
            let mut fields = Vec::with_capacity(n as usize);
            for _ in 0..n {
                let len = r.i32()?;
                if len < 0 {
                    fields.push(None);
                } else {
                    fields.push(Some(r.bytes(len as usize)?.to_vec()));
                }
            }
            Message::DataRow(fields)
        }
        TAG_COMMAND_COMPLETE => Message::CommandComplete(r.string()?),
        TAG_ERROR => Message::ErrorResponse(read_error_fields(&mut r)?),
        TAG_NOTICE => Message::NoticeResponse(read_error_fields(&mut r)?),
        TAG_NOTIFY => {
            let pid = r.u32()?;
            let channel = r.string()?;
            let payload = r.string()?;
            Message::Notify(Notification {
                pid,
                channel,
                payload,
            })
        }
        TAG_READY => Message::Ready,
        TAG_COPY_IN | TAG_COPY_OUT | TAG_COPY_BOTH => Message::CopyMarker(tag),
        other => Message::Unknown(other),
    };
    Ok(msg)
}

fn put_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn put_error_fields(out: &mut Vec<u8>, fields: &ErrorFields) {
    out.push(FIELD_SEVERITY);
    put_string(out, &fields.severity);
    out.push(FIELD_CODE);
    put_string(out, &fields.code);
    out.push(FIELD_MESSAGE);
    put_string(out, &fields.message);
    if let Some(detail) = &fields.detail {
        out.push(FIELD_DETAIL);
        put_string(out, detail);
    }
    if let Some(hint) = &fields.hint {
        out.push(FIELD_HINT);
        put_string(out, hint);
    }
    out.push(FIELD_END);
}

fn read_error_fields(r: &mut Reader<'_>) -> Result<ErrorFields> {
    let mut fields = ErrorFields::default();
    loop {
        let code = r.u8()?;
        if code == FIELD_END {
            break;
        }
        let value = r.string()?;
        match code {
            FIELD_SEVERITY => fields.severity = value,
            FIELD_CODE => fields.code = value,
            FIELD_MESSAGE => fields.message = value,
            FIELD_DETAIL => fields.detail = Some(value),
            FIELD_HINT => fields.hint = Some(value),
            // Unknown field codes are skipped for forward compatibility.
            _ => {}
        }
    }
    Ok(fields)
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| Error::ProtocolViolation("truncated frame".to_string()))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> Result<i32> {
        let b = self.bytes(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let bytes = self.bytes(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::ProtocolViolation("frame string is not UTF-8".to_string()))
    }
}
