//! PostgreSQL v3 frontend/backend frame codec.
//!
//! Framing only: one function decodes a startup-phase packet, one decodes a
//! tagged frontend message, one encodes a backend message. Decoding reads
//! through a byte cursor; encoding goes through `FrameBuilder`, which owns
//! the tag-plus-length framing. The client-side encoders exist for the
//! integration tests, which speak the protocol against a live listener.

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt};

use crate::tcop::postgres::{BackendMessage, FrontendMessage, RowDescriptionField};

const PROTOCOL_VERSION_3: u32 = 196_608;
const SSL_REQUEST_CODE: u32 = 80_877_103;
const CANCEL_REQUEST_CODE: u32 = 80_877_102;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolError {
    pub message: String,
}

impl ProtocolError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ProtocolError {}

/// What the first packet on a connection turned out to be. Startup carries
/// the raw parameter list; `startup_parameter` looks up well-known keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupAction {
    Startup {
        parameters: Vec<(String, String)>,
    },
    SslRequest,
    CancelRequest {
        process_id: u32,
        secret_key: u32,
    },
}

pub fn startup_parameter<'a>(parameters: &'a [(String, String)], key: &str) -> Option<&'a str> {
    parameters
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, value)| value.as_str())
}

pub fn decode_startup_action(bytes: &[u8]) -> Result<StartupAction, ProtocolError> {
    let mut cursor = Cursor::new(bytes);
    let declared_len = cursor
        .read_u32::<BigEndian>()
        .map_err(|_| ProtocolError::new("startup packet is too short"))? as usize;
    if declared_len != bytes.len() {
        return Err(ProtocolError::new("startup packet length mismatch"));
    }
    let code = cursor
        .read_u32::<BigEndian>()
        .map_err(|_| ProtocolError::new("startup packet is too short"))?;

    match code {
        PROTOCOL_VERSION_3 => {
            // Null-terminated key/value pairs, closed by one empty byte.
            let mut parameters = Vec::new();
            loop {
                let lead = read_u8(&mut cursor)?;
                if lead == 0 {
                    break;
                }
                let key = collect_cstring(&mut cursor, vec![lead])?;
                let value = collect_cstring(&mut cursor, Vec::new())?;
                parameters.push((key, value));
            }
            ensure_consumed(&cursor, "startup packet")?;
            Ok(StartupAction::Startup { parameters })
        }
        SSL_REQUEST_CODE => {
            ensure_consumed(&cursor, "SSL request packet")?;
            Ok(StartupAction::SslRequest)
        }
        CANCEL_REQUEST_CODE => {
            let process_id = cursor
                .read_u32::<BigEndian>()
                .map_err(|_| ProtocolError::new("cancel request packet is truncated"))?;
            let secret_key = cursor
                .read_u32::<BigEndian>()
                .map_err(|_| ProtocolError::new("cancel request packet is truncated"))?;
            ensure_consumed(&cursor, "cancel request packet")?;
            Ok(StartupAction::CancelRequest {
                process_id,
                secret_key,
            })
        }
        other => Err(ProtocolError::new(format!(
            "unsupported startup code {}",
            other
        ))),
    }
}

pub fn decode_frontend_message(tag: u8, payload: &[u8]) -> Result<FrontendMessage, ProtocolError> {
    let mut cursor = Cursor::new(payload);
    let message = match tag {
        b'Q' => FrontendMessage::Query {
            sql: read_cstring(&mut cursor)?,
        },
        b'P' => {
            let statement_name = read_cstring(&mut cursor)?;
            let query = read_cstring(&mut cursor)?;
            let count = read_i16(&mut cursor)?.max(0) as usize;
            let mut parameter_types = Vec::with_capacity(count);
            for _ in 0..count {
                parameter_types.push(read_i32(&mut cursor)? as u32);
            }
            FrontendMessage::Parse {
                statement_name,
                query,
                parameter_types,
            }
        }
        b'B' => {
            let portal_name = read_cstring(&mut cursor)?;
            let statement_name = read_cstring(&mut cursor)?;

            let param_format_count = read_i16(&mut cursor)?.max(0) as usize;
            let mut param_formats = Vec::with_capacity(param_format_count);
            for _ in 0..param_format_count {
                param_formats.push(read_i16(&mut cursor)?);
            }

            let param_count = read_i16(&mut cursor)?.max(0) as usize;
            let mut params = Vec::with_capacity(param_count);
            for _ in 0..param_count {
                let len = read_i32(&mut cursor)?;
                if len == -1 {
                    params.push(None);
                } else if len < -1 {
                    return Err(ProtocolError::new("bind parameter length is invalid"));
                } else {
                    params.push(Some(read_bytes(&mut cursor, len as usize)?));
                }
            }

            let result_format_count = read_i16(&mut cursor)?.max(0) as usize;
            let mut result_formats = Vec::with_capacity(result_format_count);
            for _ in 0..result_format_count {
                result_formats.push(read_i16(&mut cursor)?);
            }

            FrontendMessage::Bind {
                portal_name,
                statement_name,
                param_formats,
                params,
                result_formats,
            }
        }
        b'E' => FrontendMessage::Execute {
            portal_name: read_cstring(&mut cursor)?,
            max_rows: i64::from(read_i32(&mut cursor)?),
        },
        b'D' => {
            let kind = read_u8(&mut cursor)?;
            let name = read_cstring(&mut cursor)?;
            match kind {
                b'S' => FrontendMessage::DescribeStatement {
                    statement_name: name,
                },
                b'P' => FrontendMessage::DescribePortal { portal_name: name },
                _ => {
                    return Err(ProtocolError::new("describe message kind must be S or P"));
                }
            }
        }
        b'C' => {
            let kind = read_u8(&mut cursor)?;
            let name = read_cstring(&mut cursor)?;
            match kind {
                b'S' => FrontendMessage::CloseStatement {
                    statement_name: name,
                },
                b'P' => FrontendMessage::ClosePortal { portal_name: name },
                _ => {
                    return Err(ProtocolError::new("close message kind must be S or P"));
                }
            }
        }
        b'H' => FrontendMessage::Flush,
        b'S' => FrontendMessage::Sync,
        b'X' => FrontendMessage::Terminate,
        _ => {
            return Err(ProtocolError::new(format!(
                "unsupported frontend message tag {}",
                tag as char
            )));
        }
    };
    ensure_consumed(&cursor, "frontend message")?;
    Ok(message)
}

/// Encodes a backend message into a wire frame. `None` means the message is
/// an internal signal (flush) with no frame of its own.
pub fn encode_backend_message(message: &BackendMessage) -> Option<Vec<u8>> {
    match message {
        BackendMessage::AuthenticationOk => {
            let mut frame = FrameBuilder::new(b'R');
            frame.i32(0);
            Some(frame.finish())
        }
        BackendMessage::ParameterStatus { name, value } => {
            let mut frame = FrameBuilder::new(b'S');
            frame.cstring(name);
            frame.cstring(value);
            Some(frame.finish())
        }
        BackendMessage::BackendKeyData {
            process_id,
            secret_key,
        } => {
            let mut frame = FrameBuilder::new(b'K');
            frame.u32(*process_id);
            frame.u32(*secret_key);
            Some(frame.finish())
        }
        BackendMessage::ReadyForQuery => {
            let mut frame = FrameBuilder::new(b'Z');
            frame.u8(b'I');
            Some(frame.finish())
        }
        BackendMessage::ParseComplete => Some(FrameBuilder::new(b'1').finish()),
        BackendMessage::BindComplete => Some(FrameBuilder::new(b'2').finish()),
        BackendMessage::CloseComplete => Some(FrameBuilder::new(b'3').finish()),
        BackendMessage::EmptyQueryResponse => Some(FrameBuilder::new(b'I').finish()),
        BackendMessage::RowDescription { fields } => {
            let mut frame = FrameBuilder::new(b'T');
            frame.i16(fields.len() as i16);
            for field in fields {
                frame.cstring(&field.name);
                frame.u32(field.table_oid);
                frame.i16(field.column_attr);
                frame.u32(field.type_oid);
                frame.i16(field.type_size);
                frame.i32(field.type_modifier);
                frame.i16(field.format_code);
            }
            Some(frame.finish())
        }
        BackendMessage::DataRow { values } => {
            let mut frame = FrameBuilder::new(b'D');
            frame.i16(values.len() as i16);
            for value in values {
                match value {
                    None => frame.i32(-1),
                    Some(text) => {
                        frame.i32(text.len() as i32);
                        frame.bytes(text.as_bytes());
                    }
                }
            }
            Some(frame.finish())
        }
        BackendMessage::CommandComplete { tag } => {
            let mut frame = FrameBuilder::new(b'C');
            frame.cstring(tag);
            Some(frame.finish())
        }
        BackendMessage::ParameterDescription { parameter_types } => {
            let mut frame = FrameBuilder::new(b't');
            frame.i16(parameter_types.len() as i16);
            for oid in parameter_types {
                frame.u32(*oid);
            }
            Some(frame.finish())
        }
        BackendMessage::NoData => Some(FrameBuilder::new(b'n').finish()),
        BackendMessage::PortalSuspended => Some(FrameBuilder::new(b's').finish()),
        BackendMessage::ErrorResponse { message, code } => {
            let mut frame = FrameBuilder::new(b'E');
            frame.u8(b'S');
            frame.cstring("ERROR");
            frame.u8(b'V');
            frame.cstring("ERROR");
            frame.u8(b'C');
            frame.cstring(code);
            frame.u8(b'M');
            frame.cstring(message);
            frame.u8(0);
            Some(frame.finish())
        }
        BackendMessage::FlushComplete => None,
        BackendMessage::Terminate => None,
    }
}

// ---- client-side encoders (used by the integration tests) ----

/// Startup has no tag byte: just a self-inclusive length, the protocol
/// version, the null-terminated parameter pairs, and a closing zero.
pub fn encode_startup_message(parameters: &[(String, String)]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&PROTOCOL_VERSION_3.to_be_bytes());
    for (key, value) in parameters {
        body.extend_from_slice(key.as_bytes());
        body.push(0);
        body.extend_from_slice(value.as_bytes());
        body.push(0);
    }
    body.push(0);

    let mut out = Vec::with_capacity(body.len() + 4);
    out.extend_from_slice(&((body.len() + 4) as u32).to_be_bytes());
    out.extend_from_slice(&body);
    out
}

pub fn encode_ssl_request() -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    out.extend_from_slice(&8u32.to_be_bytes());
    out.extend_from_slice(&SSL_REQUEST_CODE.to_be_bytes());
    out
}

pub fn encode_frontend_message(message: &FrontendMessage) -> Vec<u8> {
    match message {
        // Startup is not a tagged frame; see encode_startup_message.
        FrontendMessage::Startup { .. } => Vec::new(),
        FrontendMessage::Query { sql } => {
            let mut frame = FrameBuilder::new(b'Q');
            frame.cstring(sql);
            frame.finish()
        }
        FrontendMessage::Parse {
            statement_name,
            query,
            parameter_types,
        } => {
            let mut frame = FrameBuilder::new(b'P');
            frame.cstring(statement_name);
            frame.cstring(query);
            frame.i16(parameter_types.len() as i16);
            for oid in parameter_types {
                frame.u32(*oid);
            }
            frame.finish()
        }
        FrontendMessage::Bind {
            portal_name,
            statement_name,
            param_formats,
            params,
            result_formats,
        } => {
            let mut frame = FrameBuilder::new(b'B');
            frame.cstring(portal_name);
            frame.cstring(statement_name);
            frame.i16(param_formats.len() as i16);
            for format in param_formats {
                frame.i16(*format);
            }
            frame.i16(params.len() as i16);
            for param in params {
                match param {
                    None => frame.i32(-1),
                    Some(bytes) => {
                        frame.i32(bytes.len() as i32);
                        frame.bytes(bytes);
                    }
                }
            }
            frame.i16(result_formats.len() as i16);
            for format in result_formats {
                frame.i16(*format);
            }
            frame.finish()
        }
        FrontendMessage::Execute {
            portal_name,
            max_rows,
        } => {
            let mut frame = FrameBuilder::new(b'E');
            frame.cstring(portal_name);
            frame.i32(*max_rows as i32);
            frame.finish()
        }
        FrontendMessage::DescribeStatement { statement_name } => {
            let mut frame = FrameBuilder::new(b'D');
            frame.u8(b'S');
            frame.cstring(statement_name);
            frame.finish()
        }
        FrontendMessage::DescribePortal { portal_name } => {
            let mut frame = FrameBuilder::new(b'D');
            frame.u8(b'P');
            frame.cstring(portal_name);
            frame.finish()
        }
        FrontendMessage::CloseStatement { statement_name } => {
            let mut frame = FrameBuilder::new(b'C');
            frame.u8(b'S');
            frame.cstring(statement_name);
            frame.finish()
        }
        FrontendMessage::ClosePortal { portal_name } => {
            let mut frame = FrameBuilder::new(b'C');
            frame.u8(b'P');
            frame.cstring(portal_name);
            frame.finish()
        }
        FrontendMessage::Flush => FrameBuilder::new(b'H').finish(),
        FrontendMessage::Sync => FrameBuilder::new(b'S').finish(),
        FrontendMessage::Terminate => FrameBuilder::new(b'X').finish(),
    }
}

// ---- frame plumbing ----

/// One outgoing frame: tag byte, self-inclusive big-endian length, payload.
struct FrameBuilder {
    tag: u8,
    payload: Vec<u8>,
}

impl FrameBuilder {
    fn new(tag: u8) -> Self {
        Self {
            tag,
            payload: Vec::new(),
        }
    }

    fn u8(&mut self, value: u8) {
        self.payload.push(value);
    }

    fn i16(&mut self, value: i16) {
        self.payload.extend_from_slice(&value.to_be_bytes());
    }

    fn i32(&mut self, value: i32) {
        self.payload.extend_from_slice(&value.to_be_bytes());
    }

    fn u32(&mut self, value: u32) {
        self.payload.extend_from_slice(&value.to_be_bytes());
    }

    fn bytes(&mut self, value: &[u8]) {
        self.payload.extend_from_slice(value);
    }

    fn cstring(&mut self, value: &str) {
        self.payload.extend_from_slice(value.as_bytes());
        self.payload.push(0);
    }

    fn finish(self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(self.payload.len() + 5);
        frame.push(self.tag);
        frame.extend_from_slice(&((self.payload.len() + 4) as u32).to_be_bytes());
        frame.extend_from_slice(&self.payload);
        frame
    }
}

// ---- cursor reads ----

fn read_u8(cursor: &mut Cursor<&[u8]>) -> Result<u8, ProtocolError> {
    cursor.read_u8().map_err(|_| truncated())
}

fn read_i16(cursor: &mut Cursor<&[u8]>) -> Result<i16, ProtocolError> {
    cursor.read_i16::<BigEndian>().map_err(|_| truncated())
}

fn read_i32(cursor: &mut Cursor<&[u8]>) -> Result<i32, ProtocolError> {
    cursor.read_i32::<BigEndian>().map_err(|_| truncated())
}

fn read_bytes(cursor: &mut Cursor<&[u8]>, len: usize) -> Result<Vec<u8>, ProtocolError> {
    if cursor.position() as usize + len > cursor.get_ref().len() {
        return Err(truncated());
    }
    let mut buf = vec![0u8; len];
    cursor.read_exact(&mut buf).map_err(|_| truncated())?;
    Ok(buf)
}

fn read_cstring(cursor: &mut Cursor<&[u8]>) -> Result<String, ProtocolError> {
    collect_cstring(cursor, Vec::new())
}

fn collect_cstring(cursor: &mut Cursor<&[u8]>, mut bytes: Vec<u8>) -> Result<String, ProtocolError> {
    loop {
        match cursor.read_u8() {
            Ok(0) => break,
            Ok(byte) => bytes.push(byte),
            Err(_) => return Err(ProtocolError::new("cstring terminator missing")),
        }
    }
    String::from_utf8(bytes).map_err(|_| ProtocolError::new("cstring is not valid utf8"))
}

fn ensure_consumed(cursor: &Cursor<&[u8]>, context: &str) -> Result<(), ProtocolError> {
    if cursor.position() as usize == cursor.get_ref().len() {
        Ok(())
    } else {
        Err(ProtocolError::new(format!(
            "{} has trailing bytes",
            context
        )))
    }
}

fn truncated() -> ProtocolError {
    ProtocolError::new("message payload is truncated")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_message_roundtrip() {
        let parameters = vec![
            ("user".to_string(), "alice".to_string()),
            ("database".to_string(), "appdb".to_string()),
            ("application_name".to_string(), "loamdb-tests".to_string()),
        ];
        let encoded = encode_startup_message(&parameters);
        let StartupAction::Startup {
            parameters: decoded,
        } = decode_startup_action(&encoded).expect("startup should decode")
        else {
            panic!("expected startup action");
        };
        assert_eq!(decoded, parameters);
        assert_eq!(startup_parameter(&decoded, "user"), Some("alice"));
        assert_eq!(startup_parameter(&decoded, "DataBase"), Some("appdb"));
        assert_eq!(startup_parameter(&decoded, "missing"), None);
    }

    #[test]
    fn ssl_request_is_detected() {
        assert_eq!(
            decode_startup_action(&encode_ssl_request()).expect("ssl request should decode"),
            StartupAction::SslRequest
        );
    }

    #[test]
    fn frontend_messages_roundtrip() {
        let messages = [
            FrontendMessage::Query {
                sql: "SELECT 1".to_string(),
            },
            FrontendMessage::Parse {
                statement_name: "s1".to_string(),
                query: "SELECT $1".to_string(),
                parameter_types: vec![23],
            },
            FrontendMessage::Bind {
                portal_name: "p1".to_string(),
                statement_name: "s1".to_string(),
                param_formats: vec![0],
                params: vec![Some(b"7".to_vec()), None],
                result_formats: vec![],
            },
            FrontendMessage::Execute {
                portal_name: "p1".to_string(),
                max_rows: 100,
            },
            FrontendMessage::DescribeStatement {
                statement_name: "s1".to_string(),
            },
            FrontendMessage::ClosePortal {
                portal_name: "p1".to_string(),
            },
            FrontendMessage::Sync,
            FrontendMessage::Terminate,
        ];
        for message in messages {
            let frame = encode_frontend_message(&message);
            let decoded = decode_frontend_message(frame[0], &frame[5..])
                .expect("frontend frame should decode");
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn null_cells_are_sent_with_negative_length() {
        let frame = encode_backend_message(&BackendMessage::DataRow {
            values: vec![Some("1".to_string()), None],
        })
        .expect("data row should encode");
        assert_eq!(frame[0], b'D');
        // field count 2, "1" with length 1, then length -1 and no bytes.
        let payload = &frame[5..];
        assert_eq!(&payload[0..2], &2i16.to_be_bytes());
        assert_eq!(&payload[2..6], &1i32.to_be_bytes());
        assert_eq!(payload[6], b'1');
        assert_eq!(&payload[7..11], &(-1i32).to_be_bytes());
    }

    #[test]
    fn error_response_carries_sqlstate() {
        let frame = encode_backend_message(&BackendMessage::ErrorResponse {
            message: "syntax error".to_string(),
            code: "42601".to_string(),
        })
        .expect("error response should encode");
        assert_eq!(frame[0], b'E');
        let payload = &frame[5..];
        let expected = b"SERROR\0VERROR\0C42601\0Msyntax error\0\0";
        assert_eq!(payload, expected);
    }

    #[test]
    fn flush_signal_has_no_frame() {
        assert!(encode_backend_message(&BackendMessage::FlushComplete).is_none());
    }

    #[test]
    fn malformed_frames_are_rejected() {
        assert!(decode_frontend_message(b'Q', b"no terminator").is_err());
        assert!(decode_frontend_message(b'@', b"").is_err());
        // Declared length disagrees with the actual packet size.
        assert!(decode_startup_action(&[0, 0, 0, 9, 0, 0, 0, 1]).is_err());
        // SSL request with trailing garbage.
        let mut ssl = encode_ssl_request();
        ssl.extend_from_slice(&[0, 0]);
        ssl[3] = 10;
        assert!(decode_startup_action(&ssl).is_err());
    }
}
