//! META test: free-form `key:value` entries describing the client.

use common::error::{ErrorKind, SessionError};
use control::{ControlConnection, MessageType};

const INVALID_META: &str = "Server (META test): Invalid meta data received";

pub const MAX_KEY_LEN: usize = 63;
pub const MAX_VALUE_LEN: usize = 255;

const ENTRY_CAPACITY: usize = 8192;

fn truncate(text: &str, max: usize) -> String {
    let mut end = text.len().min(max);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

/// Splits one entry; keys and values are kept verbatim up to their length limits.
pub fn parse_entry(text: &str) -> Option<(String, String)> {
    let (key, value) = text.split_once(':')?;
    if key.is_empty() {
        return None;
    }
    Some((truncate(key, MAX_KEY_LEN), truncate(value, MAX_VALUE_LEN)))
}

#[tracing::instrument(skip_all, name = "meta")]
pub async fn run(conn: &mut ControlConnection) -> Result<Vec<(String, String)>, SessionError> {
    conn.send_empty(MessageType::TestPrepare).await?;
    conn.send_empty(MessageType::TestStart).await?;
    let mut entries = Vec::new();
    loop {
        let message = conn.recv(ENTRY_CAPACITY).await?;
        if message.kind == MessageType::TestMsg && message.payload.is_empty() {
            break;
        }
        let entry = (message.kind == MessageType::TestMsg)
            .then(|| parse_entry(&message.text()))
            .flatten();
        let Some(entry) = entry else {
            conn.send_text(MessageType::Error, INVALID_META).await?;
            return Err(SessionError::exchange(
                anyhow::anyhow!("{INVALID_META}: {} {:?}", message.kind, message.text()),
                ErrorKind::ProtocolViolation,
            ));
        };
        tracing::debug!("meta {}={}", entry.0, entry.1);
        entries.push(entry);
    }
    conn.send_empty(MessageType::TestFinalize).await?;
    Ok(entries)
}
