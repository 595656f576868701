//! Wire codec for the peer protocol.
//!
//! Frames are length-prefixed for TCP streaming:
//!
//! - 4 bytes: frame length (u32 little-endian, excluding this prefix)
//! - 1 byte: frame tag
//! - N bytes: tag-specific payload
//!
//! # Frame tags
//!
//! - 0: `Hello` (connection handshake, carries the sender's node id)
//! - 1: `AppendEntries`
//! - 2: `AppendEntriesResponse`
//! - 3: `RequestVote`
//! - 4: `RequestVoteResponse`
//! - 5: `Snapshot` (reserved)
//!
//! All integers are little-endian. Command payloads are length-prefixed
//! byte strings.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use gavel_core::limits::{MAX_COMMAND_BYTES, MAX_ENTRIES_PER_APPEND, MAX_FRAME_BYTES};
use gavel_core::{Command, CommandKind, LogIndex, MsgSeq, NodeId, TermId};
use gavel_raft::{
    AppendEntriesRequest, AppendEntriesResponse, LogRecord, Message, RequestVoteRequest,
    RequestVoteResponse, SnapshotRequest,
};
use thiserror::Error;

const TAG_HELLO: u8 = 0;
const TAG_APPEND_ENTRIES: u8 = 1;
const TAG_APPEND_ENTRIES_RESPONSE: u8 = 2;
const TAG_REQUEST_VOTE: u8 = 3;
const TAG_REQUEST_VOTE_RESPONSE: u8 = 4;
const TAG_SNAPSHOT: u8 = 5;

/// Codec errors.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Frame exceeds the maximum allowed size.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Actual size.
        size: usize,
        /// Maximum allowed.
        max: usize,
    },

    /// Unknown frame tag.
    #[error("unknown frame tag: {tag}")]
    UnknownFrameTag {
        /// The unknown tag value.
        tag: u8,
    },

    /// Unknown command kind tag inside a log record.
    #[error("unknown command kind: {tag}")]
    UnknownCommandKind {
        /// The unknown tag value.
        tag: u8,
    },

    /// A declared count or length exceeds its bound.
    #[error("limit exceeded: {what} (max={max}, actual={actual})")]
    LimitExceeded {
        /// Which limit was exceeded.
        what: &'static str,
        /// The maximum allowed value.
        max: u64,
        /// The declared value.
        actual: u64,
    },

    /// Not enough buffered data to decode a full frame. The caller should
    /// read more bytes and retry.
    #[error("insufficient data: need {need} bytes, have {have}")]
    InsufficientData {
        /// Bytes needed.
        need: usize,
        /// Bytes available.
        have: usize,
    },

    /// A frame's payload ended before its fields did.
    #[error("truncated frame payload")]
    Truncated,
}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// One frame of the peer protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Connection handshake: the first frame on every outbound connection.
    Hello {
        /// The connecting node.
        node_id: NodeId,
    },
    /// A consensus message.
    Peer(Message),
}

/// Encodes a frame to wire bytes.
///
/// # Errors
/// Returns an error if the frame exceeds [`MAX_FRAME_BYTES`].
pub fn encode_frame(frame: &Frame) -> CodecResult<Bytes> {
    let mut buf = BytesMut::with_capacity(256);

    // Length prefix is filled in at the end.
    buf.put_u32_le(0);

    match frame {
        Frame::Hello { node_id } => {
            buf.put_u8(TAG_HELLO);
            buf.put_u64_le(node_id.get());
        }
        Frame::Peer(Message::AppendEntries(req)) => {
            buf.put_u8(TAG_APPEND_ENTRIES);
            encode_append_entries(&mut buf, req);
        }
        Frame::Peer(Message::AppendEntriesResponse(resp)) => {
            buf.put_u8(TAG_APPEND_ENTRIES_RESPONSE);
            encode_append_entries_response(&mut buf, resp);
        }
        Frame::Peer(Message::RequestVote(req)) => {
            buf.put_u8(TAG_REQUEST_VOTE);
            encode_request_vote(&mut buf, req);
        }
        Frame::Peer(Message::RequestVoteResponse(resp)) => {
            buf.put_u8(TAG_REQUEST_VOTE_RESPONSE);
            encode_request_vote_response(&mut buf, resp);
        }
        Frame::Peer(Message::Snapshot(req)) => {
            buf.put_u8(TAG_SNAPSHOT);
            encode_snapshot(&mut buf, req);
        }
    }

    let len = buf.len() - 4;
    if len > MAX_FRAME_BYTES {
        return Err(CodecError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_BYTES,
        });
    }

    // Safe cast: bounded by MAX_FRAME_BYTES which fits in u32.
    #[allow(clippy::cast_possible_truncation)]
    let len_u32 = len as u32;
    buf[0..4].copy_from_slice(&len_u32.to_le_bytes());

    Ok(buf.freeze())
}

/// Decodes one frame from the front of `data`.
///
/// Returns the frame and the number of bytes consumed, so callers can
/// decode a stream of concatenated frames.
///
/// # Errors
/// [`CodecError::InsufficientData`] means the buffer does not yet hold a
/// full frame; read more and retry. Anything else is a protocol error.
pub fn decode_frame(data: &[u8]) -> CodecResult<(Frame, usize)> {
    if data.len() < 4 {
        return Err(CodecError::InsufficientData {
            need: 4,
            have: data.len(),
        });
    }

    let len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(CodecError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_BYTES,
        });
    }

    let total = 4 + len;
    if data.len() < total {
        return Err(CodecError::InsufficientData {
            need: total,
            have: data.len(),
        });
    }

    let mut body = &data[4..total];
    if body.is_empty() {
        return Err(CodecError::Truncated);
    }
    let tag = body.get_u8();

    let frame = match tag {
        TAG_HELLO => Frame::Hello {
            node_id: NodeId::new(take_u64(&mut body)?),
        },
        TAG_APPEND_ENTRIES => Frame::Peer(Message::AppendEntries(decode_append_entries(
            &mut body,
        )?)),
        TAG_APPEND_ENTRIES_RESPONSE => Frame::Peer(Message::AppendEntriesResponse(
            decode_append_entries_response(&mut body)?,
        )),
        TAG_REQUEST_VOTE => Frame::Peer(Message::RequestVote(decode_request_vote(&mut body)?)),
        TAG_REQUEST_VOTE_RESPONSE => Frame::Peer(Message::RequestVoteResponse(
            decode_request_vote_response(&mut body)?,
        )),
        TAG_SNAPSHOT => Frame::Peer(Message::Snapshot(decode_snapshot(&mut body)?)),
        _ => return Err(CodecError::UnknownFrameTag { tag }),
    };

    Ok((frame, total))
}

fn encode_append_entries(buf: &mut BytesMut, req: &AppendEntriesRequest) {
    buf.put_u64_le(req.term.get());
    buf.put_u64_le(req.leader_id.get());
    buf.put_u64_le(req.seq.get());
    buf.put_u64_le(req.prev_log_index.get());
    buf.put_u64_le(req.prev_log_term.get());
    buf.put_u64_le(req.leader_commit.get());
    // Safe cast: entry count is bounded by MAX_ENTRIES_PER_APPEND.
    #[allow(clippy::cast_possible_truncation)]
    let count = req.entries.len() as u32;
    buf.put_u32_le(count);
    for record in &req.entries {
        buf.put_u64_le(record.term.get());
        buf.put_u64_le(record.index.get());
        buf.put_u8(record.command.kind.as_u8());
        // Safe cast: payload length is bounded by MAX_COMMAND_BYTES.
        #[allow(clippy::cast_possible_truncation)]
        let payload_len = record.command.payload.len() as u32;
        buf.put_u32_le(payload_len);
        buf.put_slice(&record.command.payload);
    }
}

fn decode_append_entries(buf: &mut &[u8]) -> CodecResult<AppendEntriesRequest> {
    let term = TermId::new(take_u64(buf)?);
    let leader_id = NodeId::new(take_u64(buf)?);
    let seq = MsgSeq::new(take_u64(buf)?);
    let prev_log_index = LogIndex::new(take_u64(buf)?);
    let prev_log_term = TermId::new(take_u64(buf)?);
    let leader_commit = LogIndex::new(take_u64(buf)?);

    let count = take_u32(buf)? as usize;
    if count > MAX_ENTRIES_PER_APPEND {
        return Err(CodecError::LimitExceeded {
            what: "entries per append",
            max: MAX_ENTRIES_PER_APPEND as u64,
            actual: count as u64,
        });
    }

    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let record_term = TermId::new(take_u64(buf)?);
        let index = LogIndex::new(take_u64(buf)?);
        let kind_tag = take_u8(buf)?;
        let kind = CommandKind::from_u8(kind_tag)
            .ok_or(CodecError::UnknownCommandKind { tag: kind_tag })?;
        let payload = take_bytes(buf)?;
        entries.push(LogRecord::new(
            record_term,
            index,
            Command::new(kind, payload),
        ));
    }

    Ok(AppendEntriesRequest {
        term,
        leader_id,
        seq,
        prev_log_index,
        prev_log_term,
        entries,
        leader_commit,
    })
}

fn encode_append_entries_response(buf: &mut BytesMut, resp: &AppendEntriesResponse) {
    buf.put_u64_le(resp.term.get());
    buf.put_u64_le(resp.from.get());
    buf.put_u64_le(resp.seq.get());
    buf.put_u8(u8::from(resp.success));
    buf.put_u64_le(resp.commit_index.get());
    buf.put_u64_le(resp.last_applied.get());
}

fn decode_append_entries_response(buf: &mut &[u8]) -> CodecResult<AppendEntriesResponse> {
    Ok(AppendEntriesResponse {
        term: TermId::new(take_u64(buf)?),
        from: NodeId::new(take_u64(buf)?),
        seq: MsgSeq::new(take_u64(buf)?),
        success: take_u8(buf)? != 0,
        commit_index: LogIndex::new(take_u64(buf)?),
        last_applied: LogIndex::new(take_u64(buf)?),
    })
}

fn encode_request_vote(buf: &mut BytesMut, req: &RequestVoteRequest) {
    buf.put_u64_le(req.term.get());
    buf.put_u64_le(req.candidate_id.get());
    buf.put_u64_le(req.seq.get());
    buf.put_u64_le(req.last_log_index.get());
    buf.put_u64_le(req.last_log_term.get());
}

fn decode_request_vote(buf: &mut &[u8]) -> CodecResult<RequestVoteRequest> {
    Ok(RequestVoteRequest {
        term: TermId::new(take_u64(buf)?),
        candidate_id: NodeId::new(take_u64(buf)?),
        seq: MsgSeq::new(take_u64(buf)?),
        last_log_index: LogIndex::new(take_u64(buf)?),
        last_log_term: TermId::new(take_u64(buf)?),
    })
}

fn encode_request_vote_response(buf: &mut BytesMut, resp: &RequestVoteResponse) {
    buf.put_u64_le(resp.term.get());
    buf.put_u64_le(resp.from.get());
    buf.put_u64_le(resp.seq.get());
    buf.put_u8(u8::from(resp.vote_granted));
}

fn decode_request_vote_response(buf: &mut &[u8]) -> CodecResult<RequestVoteResponse> {
    Ok(RequestVoteResponse {
        term: TermId::new(take_u64(buf)?),
        from: NodeId::new(take_u64(buf)?),
        seq: MsgSeq::new(take_u64(buf)?),
        vote_granted: take_u8(buf)? != 0,
    })
}

fn encode_snapshot(buf: &mut BytesMut, req: &SnapshotRequest) {
    buf.put_u64_le(req.term.get());
    buf.put_u64_le(req.from.get());
    buf.put_u64_le(req.seq.get());
}

fn decode_snapshot(buf: &mut &[u8]) -> CodecResult<SnapshotRequest> {
    Ok(SnapshotRequest {
        term: TermId::new(take_u64(buf)?),
        from: NodeId::new(take_u64(buf)?),
        seq: MsgSeq::new(take_u64(buf)?),
    })
}

fn take_u8(buf: &mut &[u8]) -> CodecResult<u8> {
    if buf.remaining() < 1 {
        return Err(CodecError::Truncated);
    }
    Ok(buf.get_u8())
}

fn take_u32(buf: &mut &[u8]) -> CodecResult<u32> {
    if buf.remaining() < 4 {
        return Err(CodecError::Truncated);
    }
    Ok(buf.get_u32_le())
}

fn take_u64(buf: &mut &[u8]) -> CodecResult<u64> {
    if buf.remaining() < 8 {
        return Err(CodecError::Truncated);
    }
    Ok(buf.get_u64_le())
}

fn take_bytes(buf: &mut &[u8]) -> CodecResult<Bytes> {
    let len = take_u32(buf)? as usize;
    if len > MAX_COMMAND_BYTES {
        return Err(CodecError::LimitExceeded {
            what: "command payload bytes",
            max: MAX_COMMAND_BYTES as u64,
            actual: len as u64,
        });
    }
    if buf.remaining() < len {
        return Err(CodecError::Truncated);
    }
    Ok(buf.copy_to_bytes(len))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(frame: &Frame) -> Frame {
        let encoded = encode_frame(frame).unwrap();
        let (decoded, consumed) = decode_frame(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        decoded
    }

    fn sample_append() -> Message {
        Message::AppendEntries(AppendEntriesRequest {
            term: TermId::new(3),
            leader_id: NodeId::new(1),
            seq: MsgSeq::new(12),
            prev_log_index: LogIndex::new(4),
            prev_log_term: TermId::new(2),
            entries: vec![
                LogRecord::new(
                    TermId::new(3),
                    LogIndex::new(5),
                    Command::new(CommandKind::NewUser, Bytes::from(r#"{"u":"x","p":"y"}"#)),
                ),
                LogRecord::new(
                    TermId::new(3),
                    LogIndex::new(6),
                    Command::new(CommandKind::NewBid, Bytes::new()),
                ),
            ],
            leader_commit: LogIndex::new(4),
        })
    }

    #[test]
    fn test_hello_round_trip() {
        let frame = Frame::Hello {
            node_id: NodeId::new(7),
        };
        assert_eq!(round_trip(&frame), frame);
    }

    #[test]
    fn test_append_entries_round_trip() {
        let frame = Frame::Peer(sample_append());
        assert_eq!(round_trip(&frame), frame);
    }

    #[test]
    fn test_append_entries_response_round_trip() {
        let frame = Frame::Peer(Message::AppendEntriesResponse(AppendEntriesResponse {
            term: TermId::new(3),
            from: NodeId::new(2),
            seq: MsgSeq::new(12),
            success: true,
            commit_index: LogIndex::new(4),
            last_applied: LogIndex::new(3),
        }));
        assert_eq!(round_trip(&frame), frame);
    }

    #[test]
    fn test_request_vote_round_trip() {
        let frame = Frame::Peer(Message::RequestVote(RequestVoteRequest {
            term: TermId::new(5),
            candidate_id: NodeId::new(3),
            seq: MsgSeq::new(0),
            last_log_index: LogIndex::new(9),
            last_log_term: TermId::new(4),
        }));
        assert_eq!(round_trip(&frame), frame);

        let frame = Frame::Peer(Message::RequestVoteResponse(RequestVoteResponse {
            term: TermId::new(5),
            from: NodeId::new(1),
            seq: MsgSeq::new(0),
            vote_granted: false,
        }));
        assert_eq!(round_trip(&frame), frame);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let frame = Frame::Peer(Message::Snapshot(SnapshotRequest {
            term: TermId::new(1),
            from: NodeId::new(2),
            seq: MsgSeq::new(3),
        }));
        assert_eq!(round_trip(&frame), frame);
    }

    #[test]
    fn test_partial_frame_needs_more_data() {
        let encoded = encode_frame(&Frame::Peer(sample_append())).unwrap();

        assert!(matches!(
            decode_frame(&encoded[..2]),
            Err(CodecError::InsufficientData { .. })
        ));
        assert!(matches!(
            decode_frame(&encoded[..encoded.len() - 1]),
            Err(CodecError::InsufficientData { .. })
        ));
    }

    #[test]
    fn test_stream_of_frames() {
        let first = encode_frame(&Frame::Hello {
            node_id: NodeId::new(1),
        })
        .unwrap();
        let second = encode_frame(&Frame::Peer(sample_append())).unwrap();

        let mut stream = BytesMut::new();
        stream.extend_from_slice(&first);
        stream.extend_from_slice(&second);

        let (frame, consumed) = decode_frame(&stream).unwrap();
        assert!(matches!(frame, Frame::Hello { .. }));

        let (frame, rest) = decode_frame(&stream[consumed..]).unwrap();
        assert!(matches!(frame, Frame::Peer(Message::AppendEntries(_))));
        assert_eq!(consumed + rest, stream.len());
    }

    #[test]
    fn test_unknown_frame_tag_rejected() {
        let mut bad = BytesMut::new();
        bad.put_u32_le(1);
        bad.put_u8(99);
        assert!(matches!(
            decode_frame(&bad),
            Err(CodecError::UnknownFrameTag { tag: 99 })
        ));
    }

    #[test]
    fn test_unknown_command_kind_rejected() {
        let frame = Frame::Peer(sample_append());
        let encoded = encode_frame(&frame).unwrap();

        // Corrupt the first record's kind tag: it sits after the frame
        // header (5), six u64 fields (48), the entry count (4) and the
        // record's term and index (16).
        let mut corrupted = BytesMut::from(&encoded[..]);
        corrupted[5 + 48 + 4 + 16] = 250;

        assert!(matches!(
            decode_frame(&corrupted),
            Err(CodecError::UnknownCommandKind { tag: 250 })
        ));
    }

    #[test]
    fn test_oversized_entry_count_rejected() {
        let mut bad = BytesMut::new();
        bad.put_u32_le(1 + 6 * 8 + 4);
        bad.put_u8(TAG_APPEND_ENTRIES);
        for _ in 0..6 {
            bad.put_u64_le(0);
        }
        // Safe cast in test: the declared count deliberately exceeds the bound.
        bad.put_u32_le(u32::try_from(MAX_ENTRIES_PER_APPEND).unwrap() + 1);

        assert!(matches!(
            decode_frame(&bad),
            Err(CodecError::LimitExceeded { .. })
        ));
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let mut bad = BytesMut::new();
        bad.put_u32_le(1 + 8); // declares a body shorter than the fields
        bad.put_u8(TAG_REQUEST_VOTE);
        bad.put_u64_le(1);

        assert!(matches!(decode_frame(&bad), Err(CodecError::Truncated)));
    }
}
