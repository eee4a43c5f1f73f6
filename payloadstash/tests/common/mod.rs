//! Shared helpers for end-to-end tests: a local HTTP server that records
//! every request it receives, and a runner for the compiled binary.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

/// One request as seen by the test server.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub url: String,
    pub body: String,
    pub headers: Vec<(String, String)>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A local test server plus the requests it has served.
pub struct TestServer {
    /// Base URL, e.g. `http://127.0.0.1:41234`.
    pub url: String,
    pub requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl TestServer {
    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn recorded(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

/// Starts a server whose handler maps (request ordinal, request) to
/// (status, content-type, body). Requests are handled one at a time.
pub fn start_server<F>(handler: F) -> TestServer
where
    F: Fn(usize, &RecordedRequest) -> (u16, &'static str, String) + Send + Sync + 'static,
{
    let server = tiny_http::Server::http("127.0.0.1:0").expect("bind test server");
    let url = format!(
        "http://{}",
        server.server_addr().to_ip().expect("server ip address")
    );
    let requests = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&requests);

    thread::spawn(move || {
        let counter = AtomicUsize::new(0);
        for mut request in server.incoming_requests() {
            let mut body = String::new();
            request.as_reader().read_to_string(&mut body).ok();
            let entry = RecordedRequest {
                method: request.method().to_string(),
                url: request.url().to_string(),
                body,
                headers: request
                    .headers()
                    .iter()
                    .map(|h| (h.field.to_string(), h.value.to_string()))
                    .collect(),
            };
            let ordinal = counter.fetch_add(1, Ordering::SeqCst);
            let (status, content_type, response_body) = handler(ordinal, &entry);
            recorded.lock().unwrap().push(entry);
            let response = tiny_http::Response::from_string(response_body)
                .with_status_code(status)
                .with_header(
                    tiny_http::Header::from_bytes(&b"Content-Type"[..], content_type.as_bytes())
                        .expect("content-type header"),
                );
            let _ = request.respond(response);
        }
    });

    TestServer { url, requests }
}

/// Runs the compiled `payloadstash` binary with the given arguments.
pub fn run_cli(args: &[&str]) -> Output {
    std::process::Command::new(env!("CARGO_BIN_EXE_payloadstash"))
        .args(args)
        .output()
        .expect("run payloadstash binary")
}

/// Writes `contents` to `<dir>/<name>` and returns the path.
pub fn write_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).expect("write test file");
    path
}

/// Returns the single run directory under `<out>/<stash-name>/`.
pub fn run_dir(out: &Path, stash_name: &str) -> PathBuf {
    let parent = out.join(stash_name);
    let mut entries: Vec<PathBuf> = std::fs::read_dir(&parent)
        .expect("run parent directory")
        .map(|e| e.expect("dir entry").path())
        .collect();
    assert_eq!(entries.len(), 1, "expected exactly one run directory");
    entries.remove(0)
}
