//! `FILE_*` exchanges, written by clients submitting local changes and by
//! the server passing applied changes on.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, SyncError};
use crate::protocol::{Header, Message, MessageType, MAX_PATH_LEN};
use crate::watcher::{ChangeEvent, ChangeKind};
use crate::wire::WireCodec;

/// File content to send with a creation or modification, and its length.
pub type Content<'a> = (&'a mut (dyn AsyncRead + Unpin + Send), u64);

/// Everything of a change that precedes its file content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeHead {
    pub event: ChangeEvent,
    /// Length of the content that follows; set for creations and modifications.
    pub content_len: Option<u64>,
}

pub fn message_type(kind: ChangeKind) -> MessageType {
    match kind {
        ChangeKind::Created => MessageType::FileCreated,
        ChangeKind::Modified => MessageType::FileModified,
        ChangeKind::Deleted => MessageType::FileDeleted,
        ChangeKind::Renamed => MessageType::FileRenamed,
    }
}

pub fn change_kind(kind: MessageType) -> Option<ChangeKind> {
    match kind {
        MessageType::FileCreated => Some(ChangeKind::Created),
        MessageType::FileModified => Some(ChangeKind::Modified),
        MessageType::FileDeleted => Some(ChangeKind::Deleted),
        MessageType::FileRenamed => Some(ChangeKind::Renamed),
        _ => None,
    }
}

/// The path that goes into the header payload: the old one for a rename.
fn header_path(change: &ChangeEvent) -> Result<&str> {
    match change.kind {
        ChangeKind::Renamed => change.old_path.as_deref().ok_or_else(|| {
            SyncError::Protocol(format!("rename of {} has no old path", change.path))
        }),
        _ => Ok(&change.path),
    }
}

fn check_path_len(path: &str) -> Result<()> {
    if path.len() as u64 > MAX_PATH_LEN {
        return Err(SyncError::Protocol(format!(
            "path of {} bytes exceeds {MAX_PATH_LEN}",
            path.len()
        )));
    }
    Ok(())
}

/// Checks that `change` can be put on the wire at all.
pub fn validate(change: &ChangeEvent) -> Result<()> {
    check_path_len(header_path(change)?)?;
    check_path_len(&change.path)
}

/// Writes `change` and, for creations and modifications, its content.
pub async fn write_change<W: AsyncWrite + Unpin>(
    codec: &WireCodec,
    writer: &mut W,
    change: &ChangeEvent,
    content: Option<Content<'_>>,
) -> Result<()> {
    validate(change)?;
    let kind = message_type(change.kind);
    let carries_content = matches!(change.kind, ChangeKind::Created | ChangeKind::Modified);
    if carries_content != content.is_some() {
        return Err(SyncError::Protocol(format!(
            "{kind} {} and its content do not match",
            change.path
        )));
    }

    codec
        .write_message(writer, &Message::with_payload(kind, header_path(change)?))
        .await?;
    if let Some((source, len)) = content {
        codec.write_field(writer, len).await?;
        codec.send_stream(source, writer, len).await?;
    } else if change.kind == ChangeKind::Renamed {
        let new_path = change.path.as_bytes();
        codec.write_field(writer, new_path.len() as u64).await?;
        codec.write_frame(writer, new_path).await?;
        writer.flush().await.map_err(SyncError::ShortWrite)?;
    }
    Ok(())
}

/// Reads the path frames of a change announced by `header`, and the content
/// length if content follows. The content itself is left on the stream.
pub async fn read_change_head<R: AsyncRead + Unpin>(
    codec: &WireCodec,
    reader: &mut R,
    header: &Header,
) -> Result<ChangeHead> {
    let kind = change_kind(header.kind)
        .ok_or_else(|| SyncError::Protocol(format!("{} is not a file change", header.kind)))?;
    let path = read_path(codec, reader, header.payload_size).await?;

    let head = match kind {
        ChangeKind::Created | ChangeKind::Modified => {
            let len = codec
                .read_field(reader)
                .await
                .map_err(|e| e.into_transfer("file size"))?;
            let event = if kind == ChangeKind::Created {
                ChangeEvent::created(path)
            } else {
                ChangeEvent::modified(path)
            };
            ChangeHead {
                event,
                content_len: Some(len),
            }
        }
        ChangeKind::Deleted => ChangeHead {
            event: ChangeEvent::deleted(path),
            content_len: None,
        },
        ChangeKind::Renamed => {
            let to_len = codec
                .read_field(reader)
                .await
                .map_err(|e| e.into_transfer("new path length"))?;
            let to = read_path(codec, reader, to_len).await?;
            ChangeHead {
                event: ChangeEvent::renamed(path, to),
                content_len: None,
            }
        }
    };
    Ok(head)
}

async fn read_path<R: AsyncRead + Unpin>(codec: &WireCodec, reader: &mut R, len: u64) -> Result<String> {
    let header = Header::new(MessageType::FileCreated, len);
    let bytes = codec
        .read_payload(reader, &header, MAX_PATH_LEN)
        .await
        .map_err(|e| e.into_transfer("path"))?;
    String::from_utf8(bytes).map_err(|_| SyncError::Protocol("path is not valid UTF-8".into()))
}
