//! End-to-end wire-protocol tests: a real listener, a raw TCP client, and
//! the frame codec's client-side encoders.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use loamdb::catalog::Catalog;
use loamdb::protocol::messages::{
    encode_frontend_message, encode_ssl_request, encode_startup_message,
};
use loamdb::server::serve;
use loamdb::tcop::postgres::FrontendMessage;

fn startup_parameters(user: &str, database: Option<&str>) -> Vec<(String, String)> {
    let mut parameters = vec![("user".to_string(), user.to_string())];
    if let Some(database) = database {
        parameters.push(("database".to_string(), database.to_string()));
    }
    parameters
}

fn start_server() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    let catalog = Arc::new(Catalog::new());
    thread::spawn(move || {
        let _ = serve(listener, catalog);
    });
    addr
}

struct Client {
    stream: TcpStream,
}

impl Client {
    fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).expect("connect to server");
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .expect("set read timeout");
        Self { stream }
    }

    fn handshake(&mut self) {
        let parameters = startup_parameters("tester", Some("tester"));
        self.stream
            .write_all(&encode_startup_message(&parameters))
            .expect("send startup");
        self.read_until(b'Z');
    }

    fn send(&mut self, message: &FrontendMessage) {
        self.stream
            .write_all(&encode_frontend_message(message))
            .expect("send frontend message");
    }

    fn query(&mut self, sql: &str) -> Vec<(u8, Vec<u8>)> {
        self.send(&FrontendMessage::Query {
            sql: sql.to_string(),
        });
        self.read_until(b'Z')
    }

    /// Reads whole frames until (and including) the one with `stop_tag`.
    fn read_until(&mut self, stop_tag: u8) -> Vec<(u8, Vec<u8>)> {
        let mut frames = Vec::new();
        loop {
            let mut tag = [0u8; 1];
            self.stream.read_exact(&mut tag).expect("read frame tag");
            let mut len = [0u8; 4];
            self.stream.read_exact(&mut len).expect("read frame length");
            let len = u32::from_be_bytes(len) as usize;
            let mut payload = vec![0u8; len - 4];
            self.stream.read_exact(&mut payload).expect("read payload");
            let done = tag[0] == stop_tag;
            frames.push((tag[0], payload));
            if done {
                return frames;
            }
        }
    }
}

fn data_rows(frames: &[(u8, Vec<u8>)]) -> Vec<Vec<Option<String>>> {
    frames
        .iter()
        .filter(|(tag, _)| *tag == b'D')
        .map(|(_, payload)| {
            let count = i16::from_be_bytes([payload[0], payload[1]]) as usize;
            let mut idx = 2usize;
            let mut row = Vec::with_capacity(count);
            for _ in 0..count {
                let len = i32::from_be_bytes([
                    payload[idx],
                    payload[idx + 1],
                    payload[idx + 2],
                    payload[idx + 3],
                ]);
                idx += 4;
                if len < 0 {
                    row.push(None);
                } else {
                    let bytes = &payload[idx..idx + len as usize];
                    idx += len as usize;
                    row.push(Some(String::from_utf8(bytes.to_vec()).expect("utf8 cell")));
                }
            }
            row
        })
        .collect()
}

fn command_tags(frames: &[(u8, Vec<u8>)]) -> Vec<String> {
    frames
        .iter()
        .filter(|(tag, _)| *tag == b'C')
        .map(|(_, payload)| {
            let end = payload.iter().position(|b| *b == 0).unwrap_or(payload.len());
            String::from_utf8(payload[..end].to_vec()).expect("utf8 tag")
        })
        .collect()
}

#[test]
fn ssl_request_is_denied_with_single_byte() {
    let addr = start_server();
    let mut stream = TcpStream::connect(addr).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .expect("set read timeout");
    stream
        .write_all(&encode_ssl_request())
        .expect("send ssl request");
    let mut answer = [0u8; 1];
    stream.read_exact(&mut answer).expect("read ssl answer");
    assert_eq!(answer[0], b'N');

    // The handshake restarts in the clear on the same connection.
    stream
        .write_all(&encode_startup_message(&startup_parameters("tester", None)))
        .expect("send startup");
    let mut client = Client { stream };
    let frames = client.read_until(b'Z');
    assert_eq!(frames[0].0, b'R'); // AuthenticationOk
    assert!(frames.iter().any(|(tag, _)| *tag == b'S')); // ParameterStatus
    assert!(frames.iter().any(|(tag, _)| *tag == b'K')); // BackendKeyData
}

#[test]
fn simple_query_over_the_wire() {
    let addr = start_server();
    let mut client = Client::connect(addr);
    client.handshake();

    let frames = client.query("CREATE TABLE t (id int, name text)");
    assert_eq!(command_tags(&frames), vec!["CREATE TABLE"]);

    let frames = client.query("INSERT INTO t VALUES (1, 'a'), (2, 'b')");
    assert_eq!(command_tags(&frames), vec!["INSERT 0 2"]);

    let frames = client.query("SELECT name FROM t WHERE id = 2");
    assert!(frames.iter().any(|(tag, _)| *tag == b'T'));
    assert_eq!(data_rows(&frames), vec![vec![Some("b".to_string())]]);
    assert_eq!(command_tags(&frames), vec!["SELECT 1"]);

    let frames = client.query("SELECT id, name FROM t WHERE id = 99");
    assert!(data_rows(&frames).is_empty());
    assert_eq!(command_tags(&frames), vec!["SELECT 0"]);
}

#[test]
fn errors_keep_the_connection_alive() {
    let addr = start_server();
    let mut client = Client::connect(addr);
    client.handshake();

    let frames = client.query("SELECT FROM WHERE");
    assert!(frames.iter().any(|(tag, _)| *tag == b'E'));

    // The session is still usable afterwards.
    let frames = client.query("SELECT 1");
    assert_eq!(data_rows(&frames), vec![vec![Some("1".to_string())]]);
}

#[test]
fn extended_query_protocol_over_the_wire() {
    let addr = start_server();
    let mut client = Client::connect(addr);
    client.handshake();

    client.query("CREATE TABLE t (id int, name text)");
    client.query("INSERT INTO t VALUES (1, 'a'), (2, 'b'), (3, 'c')");

    client.send(&FrontendMessage::Parse {
        statement_name: "s1".to_string(),
        query: "SELECT name FROM t WHERE id >= $1".to_string(),
        parameter_types: vec![23],
    });
    client.send(&FrontendMessage::Bind {
        portal_name: "p1".to_string(),
        statement_name: "s1".to_string(),
        param_formats: vec![1],
        params: vec![Some(2i32.to_be_bytes().to_vec())],
        result_formats: vec![],
    });
    client.send(&FrontendMessage::DescribePortal {
        portal_name: "p1".to_string(),
    });
    client.send(&FrontendMessage::Execute {
        portal_name: "p1".to_string(),
        max_rows: 1,
    });
    client.send(&FrontendMessage::Sync);

    let frames = client.read_until(b'Z');
    assert_eq!(frames[0].0, b'1'); // ParseComplete
    assert_eq!(frames[1].0, b'2'); // BindComplete
    assert_eq!(frames[2].0, b'T'); // RowDescription from Describe
    assert_eq!(data_rows(&frames), vec![vec![Some("b".to_string())]]);
    assert!(frames.iter().any(|(tag, _)| *tag == b's')); // PortalSuspended

    // Resume the suspended portal.
    client.send(&FrontendMessage::Execute {
        portal_name: "p1".to_string(),
        max_rows: 0,
    });
    client.send(&FrontendMessage::Sync);
    let frames = client.read_until(b'Z');
    assert_eq!(data_rows(&frames), vec![vec![Some("c".to_string())]]);
    assert_eq!(command_tags(&frames), vec!["SELECT 2"]);

    client.send(&FrontendMessage::Terminate);
}
