//! Minimal MCP stdio provider used only for integration tests.
//!
//! This intentionally does not depend on the bridge's production code paths;
//! it speaks JSON-RPC over stdio directly (one JSON message per line) and
//! exposes a single `echo` tool.

use serde_json::{Value, json};
use std::io::{BufRead as _, Write};

fn main() -> anyhow::Result<()> {
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout().lock();

    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        if let Some(response) = handle_line(&line) {
            writeln!(stdout, "{}", serde_json::to_string(&response)?)?;
            stdout.flush()?;
        }
    }

    Ok(())
}

fn handle_line(line: &str) -> Option<Value> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let msg: Value = serde_json::from_str(line).ok()?;
    let method = msg.get("method").and_then(Value::as_str)?;

    // Ignore notifications (no `id`).
    let id = msg.get("id")?.clone();

    match method {
        "initialize" => Some(ok(&id, &json!({
            "protocolVersion": msg
                .pointer("/params/protocolVersion")
                .and_then(Value::as_str)
                .unwrap_or("2024-11-05"),
            "capabilities": { "tools": {} },
            "serverInfo": { "name": "tether-echo-provider", "version": "0" }
        }))),
        "tools/list" => Some(ok(&id, &json!({
            "tools": [{
                "name": "echo",
                "description": "echoes",
                "inputSchema": {
                    "type": "object",
                    "properties": { "text": { "type": "string" } }
                }
            }]
        }))),
        "tools/call" => {
            let name = msg.pointer("/params/name").and_then(Value::as_str).unwrap_or("");
            if name != "echo" {
                return Some(err(&id, -32601, "unknown tool"));
            }
            let text = msg
                .pointer("/params/arguments/text")
                .and_then(Value::as_str)
                .unwrap_or("");
            Some(ok(&id, &json!({
                "content": [{ "type": "text", "text": text }]
            })))
        }
        _ => Some(err(&id, -32601, "method not found")),
    }
}

fn ok(id: &Value, result: &Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn err(id: &Value, code: i64, message: &str) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
}
