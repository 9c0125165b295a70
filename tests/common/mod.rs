use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::rc::Rc;
use std::sync::{Mutex, mpsc};
use std::thread::JoinHandle;
use std::time::Duration;

use serde_json::{Value, json};
use strand::config::Config;
use strand::http::response::StatusCode;
use strand::http::websocket::{CLOSE_NORMAL, Message};
use strand::runtime::{Runtime, RuntimeConfig, RuntimeHandle};
use strand::server::Host;

pub const INDEX: &str = "<html>Hello /index.html</html>";

/// Close codes seen by the `/ws/bye` action after it closed first.
pub static PEER_CLOSE_CODES: Mutex<Vec<u16>> = Mutex::new(Vec::new());

/// A server running on its own thread, stopped on drop.
pub struct TestServer {
    pub addr: SocketAddr,
    pub upload_dir: tempfile::TempDir,
    handle: RuntimeHandle,
    thread: Option<JoinHandle<()>>,
    _documents: tempfile::TempDir,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn write_documents(dir: &Path) {
    std::fs::write(dir.join("index.html"), INDEX).unwrap();
    std::fs::create_dir(dir.join("docs")).unwrap();
    std::fs::write(dir.join("docs").join("index.html"), "<html>docs</html>").unwrap();
    std::fs::create_dir(dir.join("my docs")).unwrap();
}

fn write_signatures(path: &Path) {
    let doc = json!({
        "/form/user": {
            "request": {
                "fields": {
                    "name": {"type": "string", "required": true},
                    "age": {"type": "number"},
                    "email": {"role": "admin"},
                    "active": {"type": "boolean", "default": true}
                }
            },
            "query": {"fields": {"x": {"type": "number"}}}
        }
    });
    std::fs::write(path, doc.to_string()).unwrap();
}

fn config(documents: &Path, uploads: &Path, signatures: &Path) -> Value {
    json!({
        "web": {
            "listen": ["http://127.0.0.1:0"],
            "documents": documents,
            "routes": [
                {"match": "/api/", "handler": "action"},
                {"match": "/private/", "handler": "action", "role": "admin"},
                {"match": "/upload/", "handler": "action", "methods": ["post"]},
                {"match": "/ws/", "handler": "action"},
                {"match": "/form/", "handler": "action", "validate": true},
                {"match": "", "handler": "file"}
            ],
            "upload": {"dir": uploads},
            "signatures": {"path": signatures, "enable": true},
            "timeouts": {"parse": "5secs", "inactivity": "5secs", "request": "10secs"}
        }
    })
}

fn register_actions(host: &Host) {
    host.add_action("/api/echo", |web| {
        Box::pin(async move {
            let body = web.request().body.clone();
            web.set_header("Content-Type", "text/plain")?;
            web.set_content_length(body.len() as u64);
            web.write(&body).await?;
            Ok(())
        })
    });
    host.add_action("/private/", |web| {
        Box::pin(async move { web.write_json(&json!({"secret": true})).await })
    });
    host.add_action("/upload/", |web| {
        Box::pin(async move {
            let count = web.uploads().len();
            web.write_json(&json!({"uploads": count})).await
        })
    });
    host.add_action("/ws/", |web| {
        Box::pin(async move {
            let mut ws = web.websocket()?;
            while let Some(message) = ws.recv().await? {
                match message {
                    Message::Text(text) => ws.send_text(&text).await?,
                    Message::Binary(data) => ws.send_binary(&data).await?,
                }
            }
            Ok(())
        })
    });
    host.add_action("/ws/bye", |web| {
        Box::pin(async move {
            let mut ws = web.websocket()?;
            ws.send_text("bye").await?;
            ws.close(CLOSE_NORMAL, "").await?;
            while ws.recv().await?.is_some() {}
            if let Some(code) = ws.peer_close_code() {
                PEER_CLOSE_CODES.lock().unwrap().push(code);
            }
            Ok(())
        })
    });
    host.add_action("/form/", |web| {
        Box::pin(async move {
            let vars = web.request().vars.clone();
            web.write_json(&json!(vars)).await
        })
    });
    host.add_action("/api/fail", |web| {
        Box::pin(async move {
            web.set_status(StatusCode::Ok);
            Err(strand::Error::BadState("handler gave up"))
        })
    });
}

/// Starts a server with the test routes and documents.
pub fn start() -> TestServer {
    start_with(json!({}))
}

/// Starts a server with `overrides` blended over the test configuration.
pub fn start_with(overrides: Value) -> TestServer {
    let documents = tempfile::tempdir().unwrap();
    let upload_dir = tempfile::tempdir().unwrap();
    write_documents(documents.path());
    let signatures = documents.path().join("signatures.json");
    write_signatures(&signatures);
    let mut doc = config(documents.path(), upload_dir.path(), &signatures);
    strand::json::blend(&mut doc, &overrides, true);

    let (tx, rx) = mpsc::channel();
    let thread = std::thread::spawn(move || {
        let config = Config::from_value(doc).unwrap();
        let rt = Runtime::new(RuntimeConfig::default()).unwrap();
        let host = Rc::new(Host::new(config.web).unwrap());
        register_actions(&host);
        host.start(&rt).unwrap();
        tx.send((host.local_addrs()[0], rt.handle())).unwrap();
        rt.run().unwrap();
        host.stop();
        rt.close();
    });
    let (addr, handle) = rx.recv_timeout(Duration::from_secs(10)).unwrap();

    TestServer {
        addr,
        upload_dir,
        handle,
        thread: Some(thread),
        _documents: documents,
    }
}

pub fn connect(server: &TestServer) -> TcpStream {
    let stream = TcpStream::connect(server.addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    stream
}

/// Sends raw bytes and reads until the server closes the connection.
pub fn exchange(server: &TestServer, request: &[u8]) -> String {
    let mut stream = connect(server);
    stream.write_all(request).unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

/// Reads one response head from `stream`, returning it without the body.
pub fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte).unwrap() == 0 {
            break;
        }
        head.push(byte[0]);
    }
    String::from_utf8_lossy(&head).into_owned()
}

pub fn status(response: &str) -> u16 {
    response
        .split(' ')
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

pub fn header<'a>(response: &'a str, name: &str) -> Option<&'a str> {
    let head = response.split("\r\n\r\n").next()?;
    head.lines().skip(1).find_map(|line| {
        let (n, v) = line.split_once(':')?;
        n.eq_ignore_ascii_case(name).then(|| v.trim())
    })
}

pub fn body(response: &str) -> &str {
    response.split_once("\r\n\r\n").map_or("", |(_, b)| b)
}
