//! Shared helpers for toolbridge integration tests.
//!
//! Providers are instances of the `toolbridge_echo_provider` binary built
//! alongside the tests; see its module docs for the tools it offers.

// Test utilities; rustc can't see usage across test crates.
#![allow(dead_code)]

use axum::body::{Body, to_bytes};
use axum::http::Request;
use axum::response::Response;
use serde_json::Value;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, mpsc};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use toolbridge_http::{BridgeConfig, ProviderRegistry, ProviderSpec, RpcSession, build_app};

pub const ECHO_PROVIDER: &str = env!("CARGO_BIN_EXE_toolbridge_echo_provider");
pub const TOOLBRIDGE: &str = env!("CARGO_BIN_EXE_toolbridge");

/// Spec for an echo provider reporting itself as `name`.
pub fn echo_spec(name: &str) -> ProviderSpec {
    ProviderSpec::new(name, ECHO_PROVIDER).with_env("ECHO_PROVIDER_NAME", name)
}

/// Counts provider starts through `ECHO_PROVIDER_SPAWN_LOG`.
pub struct SpawnLog {
    dir: TempDir,
}

impl SpawnLog {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.path().join("spawns.log")
    }

    /// Attach this log to a provider spec.
    pub fn attach(&self, spec: ProviderSpec) -> ProviderSpec {
        spec.with_env("ECHO_PROVIDER_SPAWN_LOG", self.path().to_string_lossy())
    }

    pub fn count(&self) -> usize {
        std::fs::read_to_string(self.path())
            .map(|content| content.lines().count())
            .unwrap_or(0)
    }
}

pub fn session(spec: ProviderSpec, init_timeout: Duration, call_timeout: Duration) -> RpcSession {
    RpcSession::new(spec, init_timeout, call_timeout, false)
}

pub fn config(providers: Vec<ProviderSpec>) -> BridgeConfig {
    BridgeConfig {
        providers,
        init_timeout: Duration::from_secs(10),
        call_timeout: Duration::from_secs(10),
        ..BridgeConfig::default()
    }
}

pub fn registry(config: &BridgeConfig) -> Arc<ProviderRegistry> {
    Arc::new(ProviderRegistry::from_config(config).unwrap())
}

pub fn app(config: &BridgeConfig) -> (axum::Router, Arc<ProviderRegistry>) {
    let registry = registry(config);
    (build_app(registry.clone(), &config.bind_addr), registry)
}

pub fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

pub fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub async fn body_json(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Poll `condition` every 20ms until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

/// A `toolbridge` binary running on a dynamically assigned port.
pub struct BridgeProcess {
    child: Child,
    pub port: u16,
}

impl BridgeProcess {
    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }
}

impl Drop for BridgeProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn wire_output_reader<R: std::io::Read + Send + 'static>(reader: R, sender: mpsc::Sender<String>) {
    std::thread::spawn(move || {
        let reader = BufReader::new(reader);
        for line in reader.lines().map_while(Result::ok) {
            let _ = sender.send(line);
        }
    });
}

fn wait_for_bound_port(receiver: &mpsc::Receiver<String>, timeout: Duration) -> Option<u16> {
    let start = Instant::now();
    while start.elapsed() <= timeout {
        match receiver.recv_timeout(Duration::from_millis(200)) {
            Ok(line) => {
                eprintln!("{}", line);
                if let Some(idx) = line.find("TOOLBRIDGE_BOUND_PORT=") {
                    let port_str = &line[idx + "TOOLBRIDGE_BOUND_PORT=".len()..];
                    if let Ok(port) = port_str.trim().parse::<u16>() {
                        return Some(port);
                    }
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    None
}

/// Start the `toolbridge` binary on port 0 with `args` and wait for its port.
pub fn spawn_bridge(args: &[String]) -> Result<BridgeProcess, String> {
    let mut child = Command::new(TOOLBRIDGE)
        .arg("--bind-addr")
        .arg("127.0.0.1:0")
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| format!("Failed to spawn toolbridge: {}", e))?;

    let stdout = child.stdout.take().ok_or("Failed to capture stdout")?;
    let stderr = child.stderr.take().ok_or("Failed to capture stderr")?;
    let (line_tx, line_rx) = mpsc::channel::<String>();
    wire_output_reader(stdout, line_tx.clone());
    wire_output_reader(stderr, line_tx);

    // Keep draining output so the bridge never blocks on a full pipe.
    let port = wait_for_bound_port(&line_rx, Duration::from_secs(10));
    std::thread::spawn(move || while line_rx.recv().is_ok() {});

    match port {
        Some(port) => Ok(BridgeProcess { child, port }),
        None => {
            let _ = child.kill();
            let _ = child.wait();
            Err("Timeout waiting for toolbridge to report its port".to_string())
        }
    }
}
