//! Typed result values and the decoder that turns queue frames into rows.
//!
//! The decoder is a pure state machine over decoded frames, so every
//! ordering and shape rule is testable without a worker process. The
//! session drives it from the queue and reacts to the events it emits.

use std::str::FromStr;

use crate::error::{Error, RemoteError, Result};
use crate::wire::{self, ColumnDesc, ErrorFields, Message, Notification};

/// Column types a caller can declare for a worker's result rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColType {
    Bool,
    Int4,
    Int8,
    Float8,
    Text,
    Bytea,
}

impl ColType {
    pub(crate) fn type_code(self) -> u8 {
        match self {
            ColType::Bool => wire::TYPE_BOOL,
            ColType::Int4 => wire::TYPE_INT4,
            ColType::Int8 => wire::TYPE_INT8,
            ColType::Float8 => wire::TYPE_FLOAT8,
            ColType::Text => wire::TYPE_TEXT,
            ColType::Bytea => wire::TYPE_BYTEA,
        }
    }

    pub(crate) fn from_type_code(code: u8) -> Option<ColType> {
        match code {
            wire::TYPE_BOOL => Some(ColType::Bool),
            wire::TYPE_INT4 => Some(ColType::Int4),
            wire::TYPE_INT8 => Some(ColType::Int8),
            wire::TYPE_FLOAT8 => Some(ColType::Float8),
            wire::TYPE_TEXT => Some(ColType::Text),
            wire::TYPE_BYTEA => Some(ColType::Bytea),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ColType::Bool => "bool",
            ColType::Int4 => "int4",
            ColType::Int8 => "int8",
            ColType::Float8 => "float8",
            ColType::Text => "text",
            ColType::Bytea => "bytea",
        }
    }
}

impl FromStr for ColType {
    type Err = Error;

    fn from_str(s: &str) -> Result<ColType> {
        match s {
            "bool" => Ok(ColType::Bool),
            "int4" => Ok(ColType::Int4),
            "int8" => Ok(ColType::Int8),
            "float8" => Ok(ColType::Float8),
            "text" => Ok(ColType::Text),
            "bytea" => Ok(ColType::Bytea),
            other => Err(Error::InvalidParameter(format!(
                "unknown column type {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int4(i32),
    Int8(i64),
    Float8(f64),
    Text(String),
    Bytea(Vec<u8>),
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int4(v) => write!(f, "{v}"),
            Value::Int8(v) => write!(f, "{v}"),
            Value::Float8(v) => write!(f, "{v}"),
            Value::Text(v) => write!(f, "{v}"),
            Value::Bytea(v) => {
                write!(f, "\\x")?;
                for b in v {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
        }
    }
}

pub type Row = Vec<Value>;

/// Caller-declared shape of the rows a worker is expected to produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultShape {
    pub cols: Vec<ColType>,
}

impl ResultShape {
    pub fn new(cols: Vec<ColType>) -> Self {
        ResultShape { cols }
    }

    pub fn single_text() -> Self {
        ResultShape {
            cols: vec![ColType::Text],
        }
    }
}

/// What one decoded frame meant for the caller.
#[derive(Debug, PartialEq)]
pub(crate) enum DecodeEvent {
    Row(Row),
    Notice(ErrorFields),
    Notify(Notification),
    RemoteError(ErrorFields),
    /// Terminal ready marker seen; the stream is complete.
    Complete,
    /// Frame consumed with nothing to surface.
    None,
}

/// Streaming decoder for one worker's result stream.
pub(crate) struct ResultDecoder {
    shape: ResultShape,
    has_row_description: bool,
    command_tags: Vec<String>,
    complete: bool,
}

impl ResultDecoder {
    pub(crate) fn new(shape: ResultShape) -> Self {
        ResultDecoder {
            shape,
            has_row_description: false,
            command_tags: Vec::new(),
            complete: false,
        }
    }

    pub(crate) fn feed(&mut self, frame: &[u8]) -> Result<DecodeEvent> {
        let msg = wire::decode(frame)?;
        match msg {
            Message::RowDescription(cols) => {
                if self.has_row_description {
                    return Err(Error::ProtocolViolation(
                        "second row description in one result stream".to_string(),
                    ));
                }
                self.check_shape(&cols)?;
                self.has_row_description = true;
                Ok(DecodeEvent::None)
            }
            Message::DataRow(fields) => {
                if !self.has_row_description {
                    return Err(Error::ProtocolViolation(
                        "data row before any row description".to_string(),
                    ));
                }
                Ok(DecodeEvent::Row(self.decode_row(fields)?))
            }
            Message::CommandComplete(tag) => {
                self.command_tags.push(tag);
                Ok(DecodeEvent::None)
            }
            Message::ErrorResponse(mut fields) => {
                cap_severity(&mut fields);
                Ok(DecodeEvent::RemoteError(fields))
            }
            Message::NoticeResponse(mut fields) => {
                cap_severity(&mut fields);
                // Workers may route errors through the notice tag; an
                // error-level notice still fails the work.
                if is_error_severity(&fields.severity) {
                    Ok(DecodeEvent::RemoteError(fields))
                } else {
                    Ok(DecodeEvent::Notice(fields))
                }
            }
            Message::Notify(n) => Ok(DecodeEvent::Notify(n)),
            Message::Ready => {
                self.complete = true;
                Ok(DecodeEvent::Complete)
            }
            Message::CopyMarker(_) => Err(Error::Unsupported("copy protocol")),
            Message::Unknown(tag) => {
                crate::debug_log(&format!("ignoring unknown message tag {tag:#x}"));
                Ok(DecodeEvent::None)
            }
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.complete
    }

    /// Consumes the decoder once the stream completed. If no rows were
    /// described, a single-text shape gets every accumulated command tag
    /// as one text row apiece; any other shape is a mismatch.
    pub(crate) fn finish(self) -> Result<Vec<Row>> {
        if self.has_row_description {
            return Ok(Vec::new());
        }
        if self.shape.cols != [ColType::Text] {
            return Err(Error::ShapeMismatch(
                "result rowtype is not a single text column".to_string(),
            ));
        }
        Ok(self
            .command_tags
            .into_iter()
            .map(|tag| vec![Value::Text(tag)])
            .collect())
    }

    fn check_shape(&self, cols: &[ColumnDesc]) -> Result<()> {
        if cols.len() != self.shape.cols.len() {
            return Err(Error::ShapeMismatch(format!(
                "worker produced {} columns, caller declared {}",
                cols.len(),
                self.shape.cols.len()
            )));
        }
        for (i, (desc, declared)) in cols.iter().zip(&self.shape.cols).enumerate() {
            match ColType::from_type_code(desc.type_code) {
                Some(actual) if actual == *declared => {}
                // A type this layer does not know renders as text, so the
                // caller must have declared text for it.
                None if *declared == ColType::Text => {}
                _ => {
                    return Err(Error::ShapeMismatch(format!(
                        "column {i} ({:?}) does not match declared type {}",
                        desc.name,
                        declared.name()
                    )));
                }
            }
        }
        Ok(())
    }

    fn decode_row(&self, fields: Vec<Option<Vec<u8>>>) -> Result<Row> {
        if fields.len() != self.shape.cols.len() {
            return Err(Error::ShapeMismatch(format!(
                "row has {} fields, declared shape has {}",
                fields.len(),
                self.shape.cols.len()
            )));
        }
        fields
            .into_iter()
            .zip(&self.shape.cols)
            .map(|(field, ty)| match field {
                None => Ok(Value::Null),
                Some(bytes) => decode_value(&bytes, *ty),
            })
            .collect()
    }
}

fn decode_value(bytes: &[u8], ty: ColType) -> Result<Value> {
    let bad = |what: &str| Error::ProtocolViolation(format!("malformed {what} field"));
    match ty {
        ColType::Bool => match bytes {
            [0] => Ok(Value::Bool(false)),
            [1] => Ok(Value::Bool(true)),
            _ => Err(bad("bool")),
        },
        ColType::Int4 => {
            let arr: [u8; 4] = bytes.try_into().map_err(|_| bad("int4"))?;
            Ok(Value::Int4(i32::from_le_bytes(arr)))
        }
        ColType::Int8 => {
            let arr: [u8; 8] = bytes.try_into().map_err(|_| bad("int8"))?;
            Ok(Value::Int8(i64::from_le_bytes(arr)))
        }
        ColType::Float8 => {
            let arr: [u8; 8] = bytes.try_into().map_err(|_| bad("float8"))?;
            Ok(Value::Float8(f64::from_le_bytes(arr)))
        }
        ColType::Text => String::from_utf8(bytes.to_vec())
            .map(Value::Text)
            .map_err(|_| bad("text")),
        ColType::Bytea => Ok(Value::Bytea(bytes.to_vec())),
    }
}

fn is_error_severity(severity: &str) -> bool {
    matches!(severity, "ERROR" | "FATAL" | "PANIC")
}

/// A fatal condition in the worker must never look fatal to the caller.
fn cap_severity(fields: &mut ErrorFields) {
    if matches!(fields.severity.as_str(), "FATAL" | "PANIC") {
        fields.severity = "ERROR".to_string();
    }
}

pub(crate) fn remote_error(pid: u32, fields: ErrorFields) -> RemoteError {
    RemoteError {
        pid,
        severity: fields.severity,
        code: fields.code,
        message: fields.message,
        detail: fields.detail,
        hint: fields.hint,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::encode;

    fn desc(cols: &[(&str, u8)]) -> Vec<u8> {
        encode(&Message::RowDescription(
            cols.iter()
                .map(|(name, code)| ColumnDesc {
                    name: name.to_string(),
                    type_code: *code,
                })
                .collect(),
        ))
    }

    fn row(fields: Vec<Option<Vec<u8>>>) -> Vec<u8> {
        encode(&Message::DataRow(fields))
    }

    #[test]
    fn typed_rows_decode_in_order() {
        let mut d = ResultDecoder::new(ResultShape::new(vec![ColType::Int8, ColType::Text]));
        assert_eq!(
            d.feed(&desc(&[("n", wire::TYPE_INT8), ("s", wire::TYPE_TEXT)]))
                .unwrap(),
            DecodeEvent::None
        );
        let ev = d
            .feed(&row(vec![
                Some(7i64.to_le_bytes().to_vec()),
                Some(b"seven".to_vec()),
            ]))
            .unwrap();
        assert_eq!(
            ev,
            DecodeEvent::Row(vec![Value::Int8(7), Value::Text("seven".to_string())])
        );
        assert_eq!(d.feed(&encode(&Message::Ready)).unwrap(), DecodeEvent::Complete);
        assert!(d.is_complete());
        assert!(d.finish().unwrap().is_empty());
    }

    #[test]
    fn null_field_becomes_null_value() {
        let mut d = ResultDecoder::new(ResultShape::new(vec![ColType::Int4]));
        d.feed(&desc(&[("n", wire::TYPE_INT4)])).unwrap();
        assert_eq!(
            d.feed(&row(vec![None])).unwrap(),
            DecodeEvent::Row(vec![Value::Null])
        );
    }

    #[test]
    fn row_before_description_is_a_protocol_violation() {
        let mut d = ResultDecoder::new(ResultShape::single_text());
        assert!(matches!(
            d.feed(&row(vec![Some(b"x".to_vec())])),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[test]
    fn second_description_is_a_protocol_violation() {
        let mut d = ResultDecoder::new(ResultShape::single_text());
        d.feed(&desc(&[("s", wire::TYPE_TEXT)])).unwrap();
        assert!(matches!(
            d.feed(&desc(&[("s", wire::TYPE_TEXT)])),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[test]
    fn column_count_mismatch_is_shape_mismatch() {
        let mut d = ResultDecoder::new(ResultShape::new(vec![ColType::Int4, ColType::Int4]));
        assert!(matches!(
            d.feed(&desc(&[("n", wire::TYPE_INT4)])),
            Err(Error::ShapeMismatch(_))
        ));
    }

    #[test]
    fn column_type_mismatch_is_shape_mismatch() {
        let mut d = ResultDecoder::new(ResultShape::new(vec![ColType::Int4]));
        assert!(matches!(
            d.feed(&desc(&[("n", wire::TYPE_INT8)])),
            Err(Error::ShapeMismatch(_))
        ));
    }

    #[test]
    fn unknown_type_code_needs_declared_text() {
        let mut ok = ResultDecoder::new(ResultShape::single_text());
        ok.feed(&desc(&[("odd", 200)])).unwrap();

        let mut bad = ResultDecoder::new(ResultShape::new(vec![ColType::Int4]));
        assert!(matches!(
            bad.feed(&desc(&[("odd", 200)])),
            Err(Error::ShapeMismatch(_))
        ));
    }

    #[test]
    fn every_command_tag_becomes_a_text_row() {
        let mut d = ResultDecoder::new(ResultShape::single_text());
        d.feed(&encode(&Message::CommandComplete("DONE 3".to_string())))
            .unwrap();
        d.feed(&encode(&Message::CommandComplete("COPY 1".to_string())))
            .unwrap();
        d.feed(&encode(&Message::Ready)).unwrap();
        assert_eq!(
            d.finish().unwrap(),
            vec![
                vec![Value::Text("DONE 3".to_string())],
                vec![Value::Text("COPY 1".to_string())],
            ]
        );
    }

    #[test]
    fn command_tag_fallback_rejects_non_single_text_shapes() {
        let mut d = ResultDecoder::new(ResultShape::new(vec![ColType::Int4]));
        d.feed(&encode(&Message::CommandComplete("DONE".to_string())))
            .unwrap();
        match d.finish() {
            Err(Error::ShapeMismatch(msg)) => {
                assert_eq!(msg, "result rowtype is not a single text column");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn fatal_severity_is_capped_to_error() {
        let mut d = ResultDecoder::new(ResultShape::single_text());
        let ev = d
            .feed(&encode(&Message::ErrorResponse(ErrorFields {
                severity: "FATAL".to_string(),
                message: "dying".to_string(),
                ..Default::default()
            })))
            .unwrap();
        match ev {
            DecodeEvent::RemoteError(fields) => assert_eq!(fields.severity, "ERROR"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn error_level_notice_fails_the_work() {
        let mut d = ResultDecoder::new(ResultShape::single_text());
        let ev = d
            .feed(&encode(&Message::NoticeResponse(ErrorFields {
                severity: "ERROR".to_string(),
                message: "oops".to_string(),
                ..Default::default()
            })))
            .unwrap();
        assert!(matches!(ev, DecodeEvent::RemoteError(_)));
        let ev = d
            .feed(&encode(&Message::NoticeResponse(ErrorFields {
                severity: "WARNING".to_string(),
                message: "meh".to_string(),
                ..Default::default()
            })))
            .unwrap();
        assert!(matches!(ev, DecodeEvent::Notice(_)));
    }

    #[test]
    fn copy_markers_are_unsupported() {
        let mut d = ResultDecoder::new(ResultShape::single_text());
        assert!(matches!(
            d.feed(&[wire::TAG_COPY_OUT]),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn col_type_parses_from_str() {
        assert_eq!("int8".parse::<ColType>().unwrap(), ColType::Int8);
        assert!("int16".parse::<ColType>().is_err());
    }

    #[test]
    fn value_display_is_stable() {
        assert_eq!(Value::Null.to_string(), "NULL");
        assert_eq!(Value::Bytea(vec![0xde, 0xad]).to_string(), "\\xdead");
    }
}
