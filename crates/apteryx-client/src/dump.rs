//! `dump`: a client-side convenience that walks the store depth-first
//! via repeated `search`/`get` calls and writes `path = value` lines to
//! a sink, hex-escaping values that aren't valid UTF-8. Not a daemon
//! RPC of its own — see §6.

use std::io::Write;

use crate::{Client, ClientError};

pub fn dump(client: &Client, path: &str, sink: &mut impl Write) -> Result<(), ClientError> {
    let dir = if path.ends_with('/') || path.is_empty() || path == "*" || path == "/*" {
        path.to_string()
    } else {
        format!("{path}/")
    };
    walk(client, &dir, sink)
}

fn walk(client: &Client, dir: &str, sink: &mut impl Write) -> Result<(), ClientError> {
    for child in client.search(dir)? {
        if let Some(value) = client.get(&child)? {
            writeln!(sink, "{child} = {}", format_value(&value)).ok();
        }
        walk(client, &format!("{child}/"), sink)?;
    }
    Ok(())
}

fn format_value(value: &[u8]) -> String {
    match std::str::from_utf8(value) {
        Ok(s) => s.to_string(),
        Err(_) => value.iter().map(|b| format!("{b:02x}")).collect(),
    }
}
