//! Framing: APRS-IS text lines for messages and acks.
//!
//! Message: `FROM>APP614,TCPIP*::TO_______:payload{seq`
//! Ack:     `FROM>APP614,TCPIP*::TO_______:ackseq`

use crate::callsign::{Callsign, CallsignError, MAX_CALLSIGN_LEN};
use crate::protocol::{Frame, MAX_PAYLOAD_LEN, MAX_SEQ, TCPIP_PATH, TOCALL};

/// Strip the `{` and `:` delimiters and anything that is not printable ASCII, then
/// truncate to [`MAX_PAYLOAD_LEN`] characters.
pub fn sanitize_text(text: &str) -> String {
    text.chars()
        .filter(|c| *c != '{' && *c != ':')
        .filter(|c| c.is_ascii() && !c.is_ascii_control())
        .take(MAX_PAYLOAD_LEN)
        .collect()
}

/// Build a numbered message line. `text` is sanitized here.
pub fn build_message_frame(from: &Callsign, to: &Callsign, text: &str, seq: u32) -> String {
    format!("{}{}{{{}", header(from, to), sanitize_text(text), seq)
}

/// Build an ack line for message `seq` received from `to`.
pub fn build_ack_frame(from: &Callsign, to: &Callsign, seq: u32) -> String {
    format!("{}ack{}", header(from, to), seq)
}

fn header(from: &Callsign, to: &Callsign) -> String {
    format!(
        "{}>{},{}::{:<width$}:",
        from.as_str(),
        TOCALL,
        TCPIP_PATH,
        to.as_str(),
        width = MAX_CALLSIGN_LEN
    )
}

/// True for APRS-IS server lines (banner, keepalive, logresp).
pub fn is_server_comment(line: &[u8]) -> bool {
    line.first() == Some(&b'#')
}

/// Classify one received line. Never fails: anything that is not a well-formed
/// numbered message or ack comes back as [`Frame::Unparseable`].
pub fn parse_frame(line: &[u8]) -> Frame {
    let text = String::from_utf8_lossy(line);
    match decode_frame(&text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::debug!(error = %e, line = %text.trim_end(), "unparseable frame");
            Frame::Unparseable
        }
    }
}

/// Strict decode of one line; [`parse_frame`] is the lenient entry point.
pub fn decode_frame(line: &str) -> Result<Frame, FrameDecodeError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.starts_with('#') {
        return Err(FrameDecodeError::ServerComment);
    }
    let (header, body) = line.split_once(':').ok_or(FrameDecodeError::MissingBody)?;
    let (source, path) = header
        .split_once('>')
        .ok_or(FrameDecodeError::MalformedHeader)?;
    let from = Callsign::new(source).map_err(FrameDecodeError::Source)?;

    let body = body.strip_prefix(':').ok_or(FrameDecodeError::NotAMessage)?;
    let addressee = body
        .get(..MAX_CALLSIGN_LEN)
        .ok_or(FrameDecodeError::MalformedAddressee)?;
    let text = body
        .get(MAX_CALLSIGN_LEN..)
        .and_then(|rest| rest.strip_prefix(':'))
        .ok_or(FrameDecodeError::MalformedAddressee)?;
    let to = Callsign::new(addressee).map_err(FrameDecodeError::Addressee)?;

    // "acknowledged{5" is a message, not an ack.
    if let Some(seq) = text.strip_prefix("ack").and_then(|rest| parse_seq(rest).ok()) {
        return Ok(Frame::Ack { from, to, seq });
    }
    if text.strip_prefix("rej").is_some_and(|rest| parse_seq(rest).is_ok()) {
        return Err(FrameDecodeError::Reject);
    }
    let (payload, seq) = text.rsplit_once('{').ok_or(FrameDecodeError::MissingSeq)?;
    let seq = parse_seq(seq)?;
    Ok(Frame::Message {
        from,
        to,
        text: payload.to_string(),
        seq,
        via: via_from_path(path),
    })
}

/// Accepts `12`, and the reply-ack form `12}AB` (only `12` is used). At most five digits.
fn parse_seq(raw: &str) -> Result<u32, FrameDecodeError> {
    let digits = raw.split('}').next().unwrap_or_default().trim();
    match digits.parse::<u32>() {
        Ok(seq) if (1..=MAX_SEQ).contains(&seq) && digits.bytes().all(|b| b.is_ascii_digit()) => {
            Ok(seq)
        }
        _ => Err(FrameDecodeError::InvalidSeq(raw.to_string())),
    }
}

/// The igate follows the `qAx` construct: `APRS,WIDE1-1,qAR,K8IGT` -> `K8IGT`.
fn via_from_path(path: &str) -> Option<String> {
    let mut parts = path.split(',');
    parts.find(|p| p.starts_with("qA"))?;
    parts.next().map(str::to_string)
}

/// Why a line was not a usable message or ack.
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("server comment line")]
    ServerComment,
    #[error("no information field")]
    MissingBody,
    #[error("malformed header")]
    MalformedHeader,
    #[error("bad source callsign: {0}")]
    Source(CallsignError),
    #[error("not a message packet")]
    NotAMessage,
    #[error("malformed addressee field")]
    MalformedAddressee,
    #[error("bad addressee callsign: {0}")]
    Addressee(CallsignError),
    #[error("message reject")]
    Reject,
    #[error("message has no sequence number")]
    MissingSeq,
    #[error("invalid sequence number {0:?}")]
    InvalidSeq(String),
}
