//! `handle` subcommand: forward a hook payload from stdin.
//!
//! Called by the hook runtime with the event name as an argument and the
//! raw payload on stdin. Enrichment happens server-side, so this stays a
//! thin forwarding shim with the discovery fast path in front.

use beacon_protocol::MAX_BODY_BYTES;
use serde_json::Value;
use std::io::Read;

use crate::emitter::Emitter;

pub fn run(name: &str, emitter: &mut Emitter) -> Result<(), String> {
    let port = match emitter.server_port() {
        Some(port) => port,
        // No daemon advertised: the fast path is a silent no-op.
        None => return Ok(()),
    };

    let payload = read_payload()?;
    emitter.emit_hook(name, &payload, port);
    Ok(())
}

fn read_payload() -> Result<Value, String> {
    let mut input = String::new();
    std::io::stdin()
        .take(MAX_BODY_BYTES as u64)
        .read_to_string(&mut input)
        .map_err(|err| format!("Failed to read hook payload from stdin: {}", err))?;

    if input.trim().is_empty() {
        return Err("Hook payload was empty".to_string());
    }

    let payload: Value = serde_json::from_str(&input)
        .map_err(|err| format!("Hook payload was not valid JSON: {}", err))?;
    if !payload.is_object() {
        return Err("Hook payload must be a JSON object".to_string());
    }

    Ok(payload)
}
