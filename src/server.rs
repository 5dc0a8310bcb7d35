//! TCP front door: accepts connections and shuttles frames between the
//! socket and a per-connection session. One thread per connection; the
//! session owns all protocol state, so this file is only framing and IO.

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use crate::catalog::Catalog;
use crate::protocol::messages::{
    decode_frontend_message, decode_startup_action, encode_backend_message, startup_parameter,
    StartupAction,
};
use crate::tcop::postgres::{BackendMessage, FrontendMessage, PostgresSession};

pub fn serve(listener: TcpListener, catalog: Arc<Catalog>) -> io::Result<()> {
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let catalog = Arc::clone(&catalog);
                thread::spawn(move || {
                    if let Err(err) = handle_connection(stream, catalog) {
                        tracing::debug!(error = %err, "connection closed with error");
                    }
                });
            }
            Err(err) => tracing::warn!(error = %err, "accept failed"),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, catalog: Arc<Catalog>) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let mut session = PostgresSession::new_startup_required(catalog);

    // Startup phase. SSL requests are refused with a single 'N', after which
    // the client restarts the handshake in the clear.
    loop {
        let Some(packet) = read_startup_packet(&mut stream)? else {
            return Ok(());
        };
        match decode_startup_action(&packet) {
            Ok(StartupAction::SslRequest) => {
                stream.write_all(b"N")?;
                stream.flush()?;
            }
            Ok(StartupAction::CancelRequest { .. }) => return Ok(()),
            Ok(StartupAction::Startup { parameters }) => {
                let user = startup_parameter(&parameters, "user")
                    .unwrap_or_default()
                    .to_string();
                let database = startup_parameter(&parameters, "database").map(str::to_string);
                let out = session.run_sync([FrontendMessage::Startup {
                    user,
                    database,
                    parameters,
                }]);
                send_backend_messages(&mut stream, &out)?;
                break;
            }
            Err(err) => {
                tracing::debug!(error = %err, "malformed startup packet");
                return Ok(());
            }
        }
    }

    loop {
        let Some((tag, payload)) = read_tagged_message(&mut stream)? else {
            return Ok(());
        };
        let frontend = match decode_frontend_message(tag, &payload) {
            Ok(message) => message,
            Err(err) => {
                // Malformed framing drops the connection.
                tracing::debug!(error = %err, "malformed frontend message");
                return Ok(());
            }
        };
        if matches!(frontend, FrontendMessage::Terminate) {
            return Ok(());
        }

        let out = session.run_sync([frontend]);
        send_backend_messages(&mut stream, &out)?;
        if out
            .iter()
            .any(|message| matches!(message, BackendMessage::Terminate))
        {
            return Ok(());
        }
    }
}

fn send_backend_messages(stream: &mut TcpStream, messages: &[BackendMessage]) -> io::Result<()> {
    let mut buffer = Vec::new();
    for message in messages {
        if let Some(frame) = encode_backend_message(message) {
            buffer.extend_from_slice(&frame);
        }
    }
    stream.write_all(&buffer)?;
    stream.flush()
}

fn read_startup_packet(stream: &mut TcpStream) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if !(8..=65536).contains(&len) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "startup packet length is invalid",
        ));
    }
    let mut body = vec![0u8; len - 4];
    stream.read_exact(&mut body)?;
    let mut out = Vec::with_capacity(len);
    out.extend_from_slice(&len_buf);
    out.extend_from_slice(&body);
    Ok(Some(out))
}

fn read_tagged_message(stream: &mut TcpStream) -> io::Result<Option<(u8, Vec<u8>)>> {
    let mut tag_buf = [0u8; 1];
    match stream.read_exact(&mut tag_buf) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }

    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len < 4 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frontend message length is invalid",
        ));
    }
    let mut payload = vec![0u8; len - 4];
    stream.read_exact(&mut payload)?;
    Ok(Some((tag_buf[0], payload)))
}
