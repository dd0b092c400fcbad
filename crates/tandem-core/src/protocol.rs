//! Channel wire protocol
//!
//! Every message is one text line: `<type> <field> <field> ...`, fields
//! separated by single spaces. Free-text fields (usernames, paths) and all
//! payload fragments are base64 so that no field ever contains a space.
//!
//! ```text
//! ping
//! pong
//! greeting        <id> <username>
//! disconnect      <id>
//! nfsupdate                <index> <total> <fragment>
//! requestFile     <path>
//! fileData        <path>   <index> <total> <fragment>
//! applyEdit       <path>   <index> <total> <fragment>
//! selectionChange <path>   <start-line> <start-char> <end-line> <end-char>
//! ```
//!
//! Chunked payloads (snapshot JSON, file bytes, edit JSON) are base64-encoded
//! whole and the encoded text is split, so each fragment is a slice of one
//! base64 string.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::chunk::{self, TransferKey, TransferKind};
use crate::config::ConfigError;
use crate::edit::{Position, Range};
use crate::error::ProtocolError;

/// One fragment of a chunked transfer as it appears on the wire
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    pub index: u32,
    pub total: u32,
    /// Slice of the base64-encoded payload
    pub data: String,
}

/// All messages carried on the data channel
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelMessage {
    Ping,
    Pong,
    Greeting { id: String, username: String },
    Disconnect { id: String },
    WorkspaceUpdate(Chunk),
    RequestFile { path: String },
    FileData { path: String, chunk: Chunk },
    ApplyEdit { path: String, chunk: Chunk },
    SelectionChange { path: String, range: Range },
}

impl ChannelMessage {
    /// Wire name of this message's type
    pub fn type_name(&self) -> &'static str {
        match self {
            ChannelMessage::Ping => "ping",
            ChannelMessage::Pong => "pong",
            ChannelMessage::Greeting { .. } => "greeting",
            ChannelMessage::Disconnect { .. } => "disconnect",
            ChannelMessage::WorkspaceUpdate(_) => "nfsupdate",
            ChannelMessage::RequestFile { .. } => "requestFile",
            ChannelMessage::FileData { .. } => "fileData",
            ChannelMessage::ApplyEdit { .. } => "applyEdit",
            ChannelMessage::SelectionChange { .. } => "selectionChange",
        }
    }

    /// Transfer this message contributes to, for chunked types
    pub fn transfer(&self) -> Option<(TransferKey, &Chunk)> {
        match self {
            ChannelMessage::WorkspaceUpdate(chunk) => Some((TransferKey::workspace(), chunk)),
            ChannelMessage::FileData { path, chunk } => Some((TransferKey::file(path), chunk)),
            ChannelMessage::ApplyEdit { path, chunk } => Some((TransferKey::edit(path), chunk)),
            _ => None,
        }
    }

    /// Encode as one wire line
    pub fn to_line(&self) -> String {
        let ty = self.type_name();
        match self {
            ChannelMessage::Ping | ChannelMessage::Pong => ty.to_string(),
            ChannelMessage::Greeting { id, username } => {
                format!("{ty} {} {}", id, STANDARD.encode(username))
            }
            ChannelMessage::Disconnect { id } => format!("{ty} {id}"),
            ChannelMessage::WorkspaceUpdate(chunk) => {
                format!("{ty} {} {} {}", chunk.index, chunk.total, chunk.data)
            }
            ChannelMessage::RequestFile { path } => format!("{ty} {}", STANDARD.encode(path)),
            ChannelMessage::FileData { path, chunk } | ChannelMessage::ApplyEdit { path, chunk } => {
                format!(
                    "{ty} {} {} {} {}",
                    STANDARD.encode(path),
                    chunk.index,
                    chunk.total,
                    chunk.data
                )
            }
            ChannelMessage::SelectionChange { path, range } => format!(
                "{ty} {} {} {} {} {}",
                STANDARD.encode(path),
                range.start.line,
                range.start.character,
                range.end.line,
                range.end.character
            ),
        }
    }

    /// Decode one wire line
    pub fn from_line(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return Err(ProtocolError::Empty);
        }
        let mut rest = line.split(' ');
        let ty = rest.next().unwrap_or_default();
        let mut fields = Fields { kind: ty, rest };

        let msg = match ty {
            "ping" => ChannelMessage::Ping,
            "pong" => ChannelMessage::Pong,
            "greeting" => ChannelMessage::Greeting {
                id: fields.word()?.to_string(),
                username: fields.text()?,
            },
            "disconnect" => ChannelMessage::Disconnect {
                id: fields.word()?.to_string(),
            },
            "nfsupdate" => ChannelMessage::WorkspaceUpdate(fields.chunk()?),
            "requestFile" => ChannelMessage::RequestFile {
                path: fields.text()?,
            },
            "fileData" => ChannelMessage::FileData {
                path: fields.text()?,
                chunk: fields.chunk()?,
            },
            "applyEdit" => ChannelMessage::ApplyEdit {
                path: fields.text()?,
                chunk: fields.chunk()?,
            },
            "selectionChange" => {
                let path = fields.text()?;
                let start = Position::new(fields.number()?, fields.number()?);
                let end = Position::new(fields.number()?, fields.number()?);
                ChannelMessage::SelectionChange {
                    path,
                    range: Range::new(start, end),
                }
            }
            other => return Err(ProtocolError::UnknownType(other.into())),
        };

        fields.finish()?;
        Ok(msg)
    }
}

/// Encode `payload` and split it into wire chunks of at most `max_fragment_size`
/// base64 characters. Always yields at least one chunk.
pub fn chunk_payload(payload: &[u8], max_fragment_size: usize) -> Result<Vec<Chunk>, ConfigError> {
    let encoded = STANDARD.encode(payload);
    let fragments = chunk::split(encoded.as_bytes(), max_fragment_size)?;
    if fragments.is_empty() {
        return Ok(vec![Chunk {
            index: 0,
            total: 1,
            data: String::new(),
        }]);
    }

    let total = fragments.len() as u32;
    Ok(fragments
        .into_iter()
        .enumerate()
        .map(|(i, fragment)| Chunk {
            index: i as u32,
            total,
            // base64 output is ASCII, so any byte boundary is a char boundary
            data: String::from_utf8_lossy(fragment).into_owned(),
        })
        .collect())
}

/// Build the chunked messages for one transfer
pub fn chunked_messages(
    kind: TransferKind,
    target: Option<&str>,
    payload: &[u8],
    max_fragment_size: usize,
) -> Result<Vec<ChannelMessage>, ConfigError> {
    let chunks = chunk_payload(payload, max_fragment_size)?;
    let path = || target.unwrap_or_default().to_string();
    Ok(chunks
        .into_iter()
        .map(|chunk| match kind {
            TransferKind::WorkspaceSnapshot => ChannelMessage::WorkspaceUpdate(chunk),
            TransferKind::FileContent => ChannelMessage::FileData {
                path: path(),
                chunk,
            },
            TransferKind::Edit => ChannelMessage::ApplyEdit {
                path: path(),
                chunk,
            },
        })
        .collect())
}

/// Decode a reassembled base64 payload
pub fn decode_payload(encoded: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    Ok(STANDARD.decode(encoded)?)
}

/// Remaining fields of one line; `kind` names the type in errors
struct Fields<'a> {
    kind: &'a str,
    rest: std::str::Split<'a, char>,
}

impl<'a> Fields<'a> {
    fn word(&mut self) -> Result<&'a str, ProtocolError> {
        self.rest
            .next()
            .ok_or_else(|| ProtocolError::malformed(self.kind, "missing field"))
    }

    fn text(&mut self) -> Result<String, ProtocolError> {
        let raw = self.word()?;
        let bytes = STANDARD.decode(raw)?;
        String::from_utf8(bytes).map_err(|e| ProtocolError::Encoding(e.to_string()))
    }

    fn number(&mut self) -> Result<u32, ProtocolError> {
        let raw = self.word()?;
        raw.parse()
            .map_err(|_| ProtocolError::malformed(self.kind, format!("not a number: {raw:?}")))
    }

    fn chunk(&mut self) -> Result<Chunk, ProtocolError> {
        let index = self.number()?;
        let total = self.number()?;
        if index >= total {
            return Err(ProtocolError::ChunkOutOfRange { index, total });
        }
        let data = self.word()?.to_string();
        Ok(Chunk { index, total, data })
    }

    fn finish(mut self) -> Result<(), ProtocolError> {
        match self.rest.next() {
            None => Ok(()),
            Some(_) => Err(ProtocolError::malformed(self.kind, "unexpected trailing field")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::TransferRegistry;
    use std::time::Duration;

    fn chunk(index: u32, total: u32, data: &str) -> Chunk {
        Chunk {
            index,
            total,
            data: data.into(),
        }
    }

    #[test]
    fn test_line_layouts() {
        assert_eq!(ChannelMessage::Ping.to_line(), "ping");
        assert_eq!(
            ChannelMessage::WorkspaceUpdate(chunk(0, 2, "eyJy")).to_line(),
            "nfsupdate 0 2 eyJy"
        );
        assert_eq!(
            ChannelMessage::RequestFile {
                path: "a.txt".into()
            }
            .to_line(),
            "requestFile YS50eHQ="
        );
        assert_eq!(
            ChannelMessage::FileData {
                path: "a.txt".into(),
                chunk: chunk(1, 3, "aGk=")
            }
            .to_line(),
            "fileData YS50eHQ= 1 3 aGk="
        );
    }

    #[test]
    fn test_decode_every_type() {
        let messages = vec![
            ChannelMessage::Ping,
            ChannelMessage::Pong,
            ChannelMessage::Greeting {
                id: "0123abcd".into(),
                username: "Ada Lovelace".into(),
            },
            ChannelMessage::Disconnect {
                id: "0123abcd".into(),
            },
            ChannelMessage::WorkspaceUpdate(chunk(2, 3, "e30=")),
            ChannelMessage::RequestFile {
                path: "dir with space/ü.txt".into(),
            },
            ChannelMessage::FileData {
                path: "a.txt".into(),
                chunk: chunk(0, 1, ""),
            },
            ChannelMessage::ApplyEdit {
                path: "src/main.rs".into(),
                chunk: chunk(0, 2, "abcd"),
            },
            ChannelMessage::SelectionChange {
                path: "a.txt".into(),
                range: Range::new(Position::new(1, 2), Position::new(3, 4)),
            },
        ];
        for msg in messages {
            let line = msg.to_line();
            assert_eq!(ChannelMessage::from_line(&line).unwrap(), msg, "{line}");
        }
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(ChannelMessage::from_line(""), Err(ProtocolError::Empty));
        assert_eq!(
            ChannelMessage::from_line("shout 1 2"),
            Err(ProtocolError::UnknownType("shout".into()))
        );
        assert!(matches!(
            ChannelMessage::from_line("nfsupdate 0"),
            Err(ProtocolError::Malformed { kind, .. }) if kind == "nfsupdate"
        ));
        assert!(matches!(
            ChannelMessage::from_line("nfsupdate x 2 abc"),
            Err(ProtocolError::Malformed { .. })
        ));
        assert_eq!(
            ChannelMessage::from_line("nfsupdate 5 2 abc"),
            Err(ProtocolError::ChunkOutOfRange { index: 5, total: 2 })
        );
        assert!(matches!(
            ChannelMessage::from_line("requestFile !!!"),
            Err(ProtocolError::Encoding(_))
        ));
        assert!(matches!(
            ChannelMessage::from_line("ping extra"),
            Err(ProtocolError::Malformed { .. })
        ));
    }

    #[test]
    fn test_chunk_payload_sizes() {
        let payload = vec![7u8; 1000];
        let chunks = chunk_payload(&payload, 100).unwrap();
        // 1000 bytes -> 1336 base64 chars -> 14 fragments
        assert_eq!(chunks.len(), 14);
        assert!(chunks.iter().all(|c| c.total == 14 && c.data.len() <= 100));

        let empty = chunk_payload(b"", 100).unwrap();
        assert_eq!(empty, vec![chunk(0, 1, "")]);

        assert!(chunk_payload(b"x", 0).is_err());
    }

    #[test]
    fn test_chunked_messages_reassemble_through_lines() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(5000).collect();
        let messages =
            chunked_messages(TransferKind::FileContent, Some("bin/blob"), &payload, 512).unwrap();
        assert!(messages.len() > 1);

        let mut registry = TransferRegistry::new(Duration::from_secs(60));
        let mut result = None;
        for line in messages.iter().rev().map(ChannelMessage::to_line) {
            let msg = ChannelMessage::from_line(&line).unwrap();
            let (key, c) = msg.transfer().unwrap();
            assert_eq!(key, TransferKey::file("bin/blob"));
            if let Some(done) = registry
                .accept(key, c.index, c.total, c.data.clone().into_bytes())
                .unwrap()
            {
                result = Some(decode_payload(&done).unwrap());
            }
        }
        assert_eq!(result, Some(payload));
    }
}
