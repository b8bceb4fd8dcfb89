//! Minimal stdio JSON-RPC tool provider.
//!
//! Useful for smoke-testing a bridge deployment without real credentials:
//!
//! ```sh
//! toolbridge --provider echo=toolbridge_echo_provider
//! curl -X POST localhost:3000/tools/echo.echo -d '{"arguments":{"hello":"world"}}'
//! ```
//!
//! Tools:
//! - `echo`: returns its arguments.
//! - `whoami`: returns the provider name and process id.
//! - `sleep`: answers after `arguments.ms` milliseconds on another thread,
//!   so answers may overtake each other.
//! - `crash`: exits with `arguments.code` (default 1) without answering.
//! - `log`: prints a non-JSON line before answering.
//! - `duplicate`: answers twice with the same id.
//! - `chatty`: sends a notification and a request of its own, then answers
//!   inside a batch array.
//! - `error`: answers with a JSON-RPC error.
//!
//! Environment:
//! - `ECHO_PROVIDER_NAME`: name reported in results (default `echo`).
//! - `ECHO_PROVIDER_TOOLS`: comma-separated names listed by `tools/list`.
//! - `ECHO_PROVIDER_SPAWN_LOG`: file that gets one line appended per start.
//! - `ECHO_PROVIDER_INIT_DELAY_MS`: delay before answering `initialize`.
//! - `ECHO_PROVIDER_INIT_ERROR`: answer `initialize` with this error message.

use serde_json::{Value, json};
use std::io::{self, BufRead, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const DEFAULT_TOOLS: &str = "echo,whoami,sleep,crash,log,duplicate,chatty,error";

type SharedOut = Arc<Mutex<io::Stdout>>;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn write_line(out: &SharedOut, line: &str) {
    let mut out = out.lock().unwrap_or_else(|e| e.into_inner());
    // A closed stdout means the bridge is gone; nothing left to do.
    if writeln!(out, "{line}").and_then(|_| out.flush()).is_err() {
        std::process::exit(0);
    }
}

fn send(out: &SharedOut, message: &Value) {
    write_line(out, &message.to_string());
}

fn result(id: &Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

fn error(id: &Value, code: i64, message: &str) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
}

fn record_spawn() -> io::Result<()> {
    if let Ok(path) = std::env::var("ECHO_PROVIDER_SPAWN_LOG") {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        writeln!(file, "{}", std::process::id())?;
    }
    Ok(())
}

fn tool_list() -> Value {
    let tools: Vec<Value> = env_or("ECHO_PROVIDER_TOOLS", DEFAULT_TOOLS)
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| {
            json!({
                "name": name,
                "description": format!("{name} test tool"),
                "inputSchema": {"type": "object"},
            })
        })
        .collect();
    json!({ "tools": tools })
}

fn call_tool(out: &SharedOut, provider: &str, id: Value, params: &Value) {
    let tool = params.get("name").and_then(Value::as_str).unwrap_or("");
    let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
    let echo = json!({
        "content": [{"type": "text", "text": arguments.to_string()}],
        "provider": provider,
        "tool": tool,
        "arguments": arguments,
    });

    match tool {
        "whoami" => send(
            out,
            &result(&id, json!({"provider": provider, "pid": std::process::id()})),
        ),
        "sleep" => {
            let ms = arguments.get("ms").and_then(Value::as_u64).unwrap_or(100);
            let out = out.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(ms));
                send(&out, &result(&id, echo));
            });
        }
        "crash" => {
            let code = arguments.get("code").and_then(Value::as_i64).unwrap_or(1);
            eprintln!("crashing on request with code {code}");
            std::process::exit(code as i32);
        }
        "log" => {
            write_line(out, "[echo] about to answer (this line is not JSON)");
            send(out, &result(&id, echo));
        }
        "duplicate" => {
            send(out, &result(&id, echo.clone()));
            send(out, &result(&id, json!({"duplicate": true})));
        }
        "chatty" => {
            send(
                out,
                &json!({"jsonrpc": "2.0", "method": "notifications/message", "params": {"level": "info"}}),
            );
            send(
                out,
                &json!({"jsonrpc": "2.0", "id": "provider-1", "method": "roots/list"}),
            );
            send(out, &json!([result(&id, echo)]));
        }
        "error" => send(out, &error(&id, -32000, "tool failed on request")),
        _ => send(out, &result(&id, echo)),
    }
}

fn main() {
    let provider = env_or("ECHO_PROVIDER_NAME", "echo");
    if let Err(e) = record_spawn() {
        eprintln!("failed to record spawn: {e}");
    }

    let out: SharedOut = Arc::new(Mutex::new(io::stdout()));
    // Startup banner on stdout, as many real providers do.
    write_line(&out, &format!("{provider} provider starting (pid {})", std::process::id()));
    eprintln!("{provider} provider ready for input");

    for line in io::stdin().lock().lines() {
        let Ok(line) = line else { break };
        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            eprintln!("ignoring non-JSON input: {line}");
            continue;
        };
        let method = message.get("method").and_then(Value::as_str).unwrap_or("");
        let Some(id) = message.get("id").cloned() else {
            // Notifications need no answer.
            continue;
        };
        let params = message.get("params").cloned().unwrap_or_else(|| json!({}));

        match method {
            "initialize" => {
                let delay = env_or("ECHO_PROVIDER_INIT_DELAY_MS", "0").parse().unwrap_or(0);
                std::thread::sleep(Duration::from_millis(delay));
                match std::env::var("ECHO_PROVIDER_INIT_ERROR") {
                    Ok(message) => send(&out, &error(&id, -32000, &message)),
                    Err(_) => send(
                        &out,
                        &result(
                            &id,
                            json!({
                                "protocolVersion": "2024-11-05",
                                "capabilities": {"tools": {}},
                                "serverInfo": {"name": provider, "version": env!("CARGO_PKG_VERSION")},
                            }),
                        ),
                    ),
                }
            }
            "ping" => send(&out, &result(&id, json!({}))),
            "tools/list" => send(&out, &result(&id, tool_list())),
            "tools/call" => call_tool(&out, &provider, id, &params),
            other => send(&out, &error(&id, -32601, &format!("Method not found: {other}"))),
        }
    }
}
