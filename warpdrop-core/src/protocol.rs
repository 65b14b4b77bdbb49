use anyhow::{Result, bail, ensure};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

/// ASCII magic bytes that open every Warpdrop frame.
const MAGIC: &[u8; 5] = b"WARPD";
/// Protocol version understood by this build.
const VERSION: u8 = 0x01;
/// Total header size: magic(5) + version(1) + type(1) + flags(2) + length(4).
const HEADER_LEN: usize = 13;
/// Upper bound on a single frame payload to protect against malicious peers.
const MAX_PAYLOAD_LEN: usize = 64 * 1024;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 5;
const OFF_TYPE: usize = 6;
const OFF_FLAGS: usize = 7;
const OFF_LENGTH: usize = 9;

/// Protocol-level message type codes (v1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Hello = 0x01,
    HelloAck = 0x02,
    RegistrationRequest = 0x10,
    RegistrationResponse = 0x11,
    Error = 0x7F,
}

impl TryFrom<u8> for MessageType {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Hello),
            0x02 => Ok(Self::HelloAck),
            0x10 => Ok(Self::RegistrationRequest),
            0x11 => Ok(Self::RegistrationResponse),
            0x7F => Ok(Self::Error),
            other => bail!("unknown message type: 0x{other:02X}"),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(mt: MessageType) -> u8 {
        mt as u8
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub msg_type: MessageType,
    /// Reserved flags — MUST be `0x0000` in v1.
    pub flags: u16,
    pub payload_length: u32,
}

/// A fully decoded control frame (header + payload).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub payload: Vec<u8>,
}

/// Attempts to decode one complete frame from the front of `buf`.
///
/// * `Ok(Some(frame))` — a full frame was present; its bytes have been consumed
///   from `buf`.
/// * `Ok(None)` — not enough bytes yet; `buf` is left untouched.  The caller
///   should read more data and try again.
/// * `Err(..)` — protocol violation (bad magic, unsupported version, unknown
///   message type, oversized payload).  The caller should close the connection.
///
/// # Errors
///
/// Returns an error on protocol violations: bad magic, unsupported version,
/// unknown message type, or payload exceeding [`MAX_PAYLOAD_LEN`].
///
/// # Panics
///
/// Cannot panic. The `expect` calls on slice conversions are guarded by the
/// `HEADER_LEN` check at the top of the function.
pub fn try_decode_frame(buf: &mut BytesMut) -> Result<Option<Frame>> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }

    ensure!(
        &buf[OFF_MAGIC..OFF_MAGIC + MAGIC.len()] == MAGIC,
        "bad magic: expected WARPD"
    );

    let version = buf[OFF_VERSION];
    ensure!(version == VERSION, "unsupported version: 0x{version:02X}");

    let msg_type = MessageType::try_from(buf[OFF_TYPE])?;

    // These slices are exactly 2 and 4 bytes respectively (guaranteed by
    // the HEADER_LEN check above), so the conversions cannot fail.
    let flags = u16::from_be_bytes(
        buf[OFF_FLAGS..OFF_FLAGS + 2]
            .try_into()
            .expect("flags slice is exactly 2 bytes"),
    );

    let payload_len = u32::from_be_bytes(
        buf[OFF_LENGTH..OFF_LENGTH + 4]
            .try_into()
            .expect("length slice is exactly 4 bytes"),
    ) as usize;

    ensure!(
        payload_len <= MAX_PAYLOAD_LEN,
        "payload too large: {payload_len} bytes (max {MAX_PAYLOAD_LEN})"
    );

    if buf.len() < HEADER_LEN + payload_len {
        return Ok(None);
    }

    buf.advance(HEADER_LEN);
    let payload = buf.split_to(payload_len).to_vec();

    let header = Header {
        version,
        msg_type,
        flags,
        #[allow(clippy::cast_possible_truncation)] // guarded by MAX_PAYLOAD_LEN (fits in u32)
        payload_length: payload_len as u32,
    };

    Ok(Some(Frame { header, payload }))
}

/// Encodes a frame into `buf`.
///
/// Appends the 13-byte header followed by `payload` to the buffer.
pub fn encode_frame(msg_type: MessageType, payload: &[u8], buf: &mut BytesMut) {
    buf.reserve(HEADER_LEN + payload.len());
    buf.put_slice(MAGIC);
    buf.put_u8(VERSION);
    buf.put_u8(msg_type.into());
    buf.put_u16(0x0000);
    #[allow(clippy::cast_possible_truncation)] // frame payloads are bounded by MAX_PAYLOAD_LEN
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
}

/// Convenience wrapper that allocates and returns a new `BytesMut`.
#[must_use]
pub fn encode_frame_to_bytes(msg_type: MessageType, payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    encode_frame(msg_type, payload, &mut buf);
    buf
}

// ── JSON payload types ──────────────────────────────────────────────

/// Payload for [`MessageType::Hello`], sent on a freshly secured channel
/// to identify the caller before anything else happens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloPayload {
    pub identity: String,
    pub hostname: String,
    pub api_version: String,
}

/// Payload for [`MessageType::HelloAck`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloAckPayload {
    pub ok: bool,
    pub identity: String,
}

/// Payload for [`MessageType::RegistrationRequest`] (connecting peer →
/// registration endpoint).
///
/// Carries the caller's certificate so both sides end up pinning each
/// other after a single exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationRequestPayload {
    pub identity: String,
    pub hostname: String,
    /// DER certificate, base64-encoded for the JSON payload.
    pub certificate_b64: String,
}

/// Payload for [`MessageType::RegistrationResponse`] (registration
/// endpoint → connecting peer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationResponsePayload {
    pub identity: String,
    pub hostname: String,
    /// DER certificate, base64-encoded for the JSON payload.
    pub certificate_b64: String,
}

/// Payload for [`MessageType::Error`] (either direction).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

/// Encodes raw DER certificate bytes for transport inside a JSON payload.
#[must_use]
pub fn encode_certificate(der: &[u8]) -> String {
    BASE64.encode(der)
}

/// Decodes a base64 certificate field back into DER bytes.
///
/// # Errors
///
/// Returns an error if the field is not valid base64.
pub fn decode_certificate(b64: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(b64)
        .map_err(|e| anyhow::anyhow!("invalid certificate encoding: {e}"))
}

/// Encodes a serializable payload into a protocol frame stored in a new
/// [`BytesMut`].
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn encode_payload_frame<T: Serialize>(msg_type: MessageType, payload: &T) -> Result<BytesMut> {
    let json = serde_json::to_vec(payload)?;
    Ok(encode_frame_to_bytes(msg_type, &json))
}

/// Decodes a frame's payload bytes into the requested type.
///
/// # Errors
///
/// Returns an error if the payload is not valid JSON or does not match `T`.
pub fn decode_payload<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).map_err(Into::into)
}
