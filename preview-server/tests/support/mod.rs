use std::fs;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;

pub const PREVIEW_DOMAIN: &str = "preview.test";
const STATIC_DEV_COMMAND: &str = "python3 -m http.server {port} --bind 127.0.0.1";

fn workspace_root() -> PathBuf {
    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    manifest_dir
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| manifest_dir.to_path_buf())
}

fn apply_coverage_env(cmd: &mut Command) {
    let Some(profile) = std::env::var_os("LLVM_PROFILE_FILE") else {
        return;
    };
    let profile = PathBuf::from(profile);
    if profile.is_absolute() {
        return;
    }
    let absolute = workspace_root().join(profile);
    if let Some(parent) = absolute.parent() {
        let _ = fs::create_dir_all(parent);
    }
    cmd.env("LLVM_PROFILE_FILE", absolute);
}

fn tool_ok(program: &str) -> bool {
    Command::new(program)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[allow(dead_code)]
pub fn git_ok() -> bool {
    tool_ok("git")
}

#[allow(dead_code)]
pub fn python3_ok() -> bool {
    tool_ok("python3")
}

#[allow(dead_code)]
pub fn wait_for<F>(timeout: Duration, mut f: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        thread::sleep(Duration::from_millis(100));
    }
    false
}

pub fn can_bind_local_ports() -> bool {
    TcpListener::bind("127.0.0.1:0").is_ok()
}

fn pick_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

#[allow(dead_code)]
fn sh_git(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_AUTHOR_NAME", "Test")
        .env("GIT_AUTHOR_EMAIL", "test@test.com")
        .env("GIT_COMMITTER_NAME", "Test")
        .env("GIT_COMMITTER_EMAIL", "test@test.com")
        .output()
        .expect("run git");
    assert!(
        out.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

/// Bare repository with a single commit on `main`, addressed by a file:// URL.
#[allow(dead_code)]
pub struct OriginRepo {
    pub url: String,
    bare: PathBuf,
}

#[allow(dead_code)]
impl OriginRepo {
    pub fn create(root: &Path, files: &[(&str, &str)]) -> Self {
        let seed = root.join("seed");
        fs::create_dir_all(&seed).unwrap();
        sh_git(&seed, &["init", "-b", "main"]);
        for (path, contents) in files {
            let file = seed.join(path);
            if let Some(parent) = file.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(file, contents).unwrap();
        }
        sh_git(&seed, &["add", "-A"]);
        sh_git(&seed, &["commit", "-m", "Initial commit"]);

        let bare = root.join("origin.git");
        sh_git(
            root,
            &[
                "clone",
                "--bare",
                seed.to_str().unwrap(),
                bare.to_str().unwrap(),
            ],
        );
        Self {
            url: format!("file://{}", bare.display()),
            bare,
        }
    }

    /// Subject of the newest commit on `branch`.
    pub fn head_subject(&self, branch: &str) -> String {
        sh_git(&self.bare, &["log", "-1", "--format=%s", branch])
    }

    pub fn branches(&self) -> Vec<String> {
        sh_git(
            &self.bare,
            &["for-each-ref", "--format=%(refname:short)", "refs/heads"],
        )
        .lines()
        .map(str::to_string)
        .collect()
    }
}

pub struct HttpResponse {
    pub status: u16,
    pub head: String,
    pub body: String,
}

#[allow(dead_code)]
impl HttpResponse {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body)
            .unwrap_or_else(|e| panic!("invalid json body ({e}): {}", self.body))
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.head.lines().skip(1).find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case(name)
                .then(|| value.trim().to_string())
        })
    }
}

fn parse_response(raw: &[u8]) -> HttpResponse {
    let text = String::from_utf8_lossy(raw).to_string();
    let (head, body) = text.split_once("\r\n\r\n").unwrap_or((text.as_str(), ""));
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let chunked = head
        .to_ascii_lowercase()
        .contains("transfer-encoding: chunked");
    let body = if chunked {
        dechunk(body)
    } else {
        body.to_string()
    };
    HttpResponse {
        status,
        head: head.to_string(),
        body,
    }
}

fn dechunk(mut rest: &str) -> String {
    let mut out = String::new();
    while let Some((size_line, tail)) = rest.split_once("\r\n") {
        let Ok(size) = usize::from_str_radix(size_line.trim(), 16) else {
            break;
        };
        if size == 0 || tail.len() < size {
            break;
        }
        out.push_str(&tail[..size]);
        rest = tail[size..].trim_start_matches("\r\n");
    }
    out
}

#[allow(dead_code)]
pub struct TestServer {
    child: Option<Child>,
    pub http_port: u16,
    pub workspaces_dir: PathBuf,
    _data_dir: TempDir,
}

#[allow(dead_code)]
impl TestServer {
    /// Start the server with python's http.server as the dev command.
    pub fn start(extra_args: &[&str]) -> Self {
        Self::start_with(STATIC_DEV_COMMAND, 20, extra_args)
    }

    pub fn start_with(dev_command: &str, readiness_timeout_secs: u64, extra_args: &[&str]) -> Self {
        let data_dir = TempDir::new().unwrap();
        let workspaces_dir = data_dir.path().join("workspaces");
        let http_port = pick_port();
        let first_preview_port = pick_port();

        let mut cmd = Command::new(env!("CARGO_BIN_EXE_preview-server"));
        cmd.args([
            "--port",
            &http_port.to_string(),
            "--workspaces-dir",
            workspaces_dir.to_string_lossy().as_ref(),
            "--preview-domain",
            PREVIEW_DOMAIN,
            "--preview-scheme",
            "http",
            "--dev-command",
            dev_command,
            "--install-command",
            "true",
            "--package-install-command",
            "true",
            "--readiness-timeout-secs",
            &readiness_timeout_secs.to_string(),
            "--first-preview-port",
            &first_preview_port.to_string(),
            "--git-author-name",
            "Test",
            "--git-author-email",
            "test@test.com",
        ])
        .args(extra_args)
        .env("RUST_LOG", "warn")
        .env_remove("GITHUB_TOKEN")
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
        apply_coverage_env(&mut cmd);
        let mut child = cmd.spawn().expect("failed to start preview-server");

        let deadline = Instant::now() + Duration::from_secs(10);
        let mut startup_error: Option<String> = None;
        while Instant::now() < deadline {
            if let Ok(Some(status)) = child.try_wait() {
                startup_error = Some(format!("preview-server exited early: {}", status));
                break;
            }

            if TcpStream::connect(("127.0.0.1", http_port)).is_ok() {
                let server = Self {
                    child: Some(child),
                    http_port,
                    workspaces_dir,
                    _data_dir: data_dir,
                };
                if wait_for(Duration::from_secs(5), || {
                    server.try_request("GET", "localhost", "/health", None).is_some()
                }) {
                    return server;
                }
                panic!("preview-server accepted connections but /health never answered");
            }

            thread::sleep(Duration::from_millis(100));
        }

        let _ = child.kill();
        let _ = child.wait();
        panic!(
            "{}",
            startup_error.unwrap_or_else(|| "preview-server never started listening".to_string())
        );
    }

    fn try_request(
        &self,
        method: &str,
        host: &str,
        path: &str,
        body: Option<&str>,
    ) -> Option<HttpResponse> {
        let mut stream = TcpStream::connect(("127.0.0.1", self.http_port)).ok()?;
        stream
            .set_read_timeout(Some(Duration::from_secs(120)))
            .ok()?;

        let body = body.unwrap_or("");
        let request = format!(
            "{method} {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(request.as_bytes()).ok()?;

        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).ok()?;
        let response = parse_response(&buf);
        (response.status != 0).then_some(response)
    }

    pub fn request(&self, method: &str, host: &str, path: &str, body: Option<&str>) -> HttpResponse {
        self.try_request(method, host, path, body)
            .unwrap_or_else(|| panic!("{method} {path} (Host: {host}) got no response"))
    }

    /// POST a JSON body to the API.
    pub fn api(&self, path: &str, body: serde_json::Value) -> HttpResponse {
        self.request("POST", "localhost", path, Some(&body.to_string()))
    }

    pub fn preview_get(&self, site_id: &str, path: &str) -> HttpResponse {
        let host = format!("{site_id}.{PREVIEW_DOMAIN}");
        self.request("GET", &host, path, None)
    }

    pub fn preview_post(&self, site_id: &str, path: &str, body: &str) -> HttpResponse {
        let host = format!("{site_id}.{PREVIEW_DOMAIN}");
        self.request("POST", &host, path, Some(body))
    }

    /// Send a WebSocket handshake to a preview host and return the response
    /// head with the still-open connection.
    pub fn preview_upgrade(&self, site_id: &str, path: &str) -> (String, TcpStream) {
        let mut stream =
            TcpStream::connect(("127.0.0.1", self.http_port)).expect("connect http");
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        let request = format!(
            "GET {path} HTTP/1.1\r\nHost: {site_id}.{PREVIEW_DOMAIN}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Version: 13\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n"
        );
        stream.write_all(request.as_bytes()).unwrap();

        // Byte by byte so nothing after the head is consumed.
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            match stream.read(&mut byte) {
                Ok(1) => head.push(byte[0]),
                _ => break,
            }
        }
        (String::from_utf8_lossy(&head).to_string(), stream)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            // SIGTERM lets the server stop its dev servers before exiting.
            unsafe {
                libc::kill(child.id() as i32, libc::SIGTERM);
            }
            if !wait_for(Duration::from_secs(5), || {
                matches!(child.try_wait(), Ok(Some(_)))
            }) {
                let _ = child.kill();
            }
            let _ = child.wait();
        }
    }
}
