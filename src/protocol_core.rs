//! Framing shared by the daemon client and server
//!
//! Every message is one frame: an 11-byte header followed by the payload.
//! Object bytes travel as a run of DATA frames closed by END; the
//! [`DataWriter`] and [`DataReader`] adapters turn such a run into an
//! ordinary `Write`/`Read` stream.

use crate::protocol::{frame, DATA_CHUNK_SIZE, HEADER_LEN, MAGIC, MAX_FRAME_SIZE, VERSION};
use crate::store::{StoreError, StoreResult};
use std::io::{self, Read, Write};

/// Validate frame payload size against protocol::MAX_FRAME_SIZE
pub fn validate_frame_size(size: usize) -> StoreResult<()> {
    if size > MAX_FRAME_SIZE {
        return Err(StoreError::Protocol(format!(
            "frame payload too large: {} bytes (max: {})",
            size, MAX_FRAME_SIZE
        )));
    }
    Ok(())
}

/// Build frame header (11 bytes)
/// Format: MAGIC (4) | VERSION (2) | TYPE (1) | LENGTH (4)
pub fn build_frame_header(frame_type: u8, payload_len: u32) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(MAGIC);
    header[4..6].copy_from_slice(&VERSION.to_le_bytes());
    header[6] = frame_type;
    header[7..11].copy_from_slice(&payload_len.to_le_bytes());
    header
}

/// Parse frame header
/// Returns: (frame_type, payload_length)
pub fn parse_frame_header(header: &[u8; HEADER_LEN]) -> StoreResult<(u8, u32)> {
    if &header[0..4] != MAGIC {
        return Err(StoreError::Protocol("invalid magic in frame header".into()));
    }

    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != VERSION {
        return Err(StoreError::Protocol(format!(
            "protocol version mismatch: got {}, expected {}",
            version, VERSION
        )));
    }

    let frame_type = header[6];
    let payload_len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]);

    Ok((frame_type, payload_len))
}

pub fn write_frame<W: Write + ?Sized>(stream: &mut W, t: u8, payload: &[u8]) -> StoreResult<()> {
    validate_frame_size(payload.len())?;
    let header = build_frame_header(t, payload.len() as u32);
    stream.write_all(&header)?;
    stream.write_all(payload)?;
    Ok(())
}

pub fn read_frame<R: Read + ?Sized>(stream: &mut R) -> StoreResult<(u8, Vec<u8>)> {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header)?;
    let (t, len) = parse_frame_header(&header)?;
    let len = len as usize;
    validate_frame_size(len)?;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload)?;
    Ok((t, payload))
}

/// OK payload carrying a byte count.
pub fn encode_count(count: u64) -> [u8; 8] {
    count.to_le_bytes()
}

pub fn decode_count(payload: &[u8]) -> StoreResult<u64> {
    let bytes: [u8; 8] = payload
        .try_into()
        .map_err(|_| StoreError::Protocol(format!("bad count payload ({} bytes)", payload.len())))?;
    Ok(u64::from_le_bytes(bytes))
}

pub fn decode_text(payload: &[u8]) -> StoreResult<String> {
    String::from_utf8(payload.to_vec())
        .map_err(|_| StoreError::Protocol("payload is not valid UTF-8".into()))
}

/// Map an ERROR frame message to the store error it stands for.
pub fn remote_error(message: String) -> StoreError {
    match message.strip_prefix(crate::protocol::NOT_FOUND_PREFIX) {
        Some(object) => StoreError::NotFound(object.to_string()),
        None => StoreError::Remote(message),
    }
}

fn to_io(err: StoreError) -> io::Error {
    match err {
        StoreError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
    }
}

/// `Write` adapter emitting DATA frames of up to [`DATA_CHUNK_SIZE`] bytes.
///
/// `finish()` flushes the tail and sends END; dropping without it leaves the
/// run unterminated.
pub struct DataWriter<'a, W: Write + ?Sized> {
    stream: &'a mut W,
    buffer: Vec<u8>,
}

impl<'a, W: Write + ?Sized> DataWriter<'a, W> {
    pub fn new(stream: &'a mut W) -> Self {
        Self {
            stream,
            buffer: Vec::with_capacity(DATA_CHUNK_SIZE),
        }
    }

    fn send_buffer(&mut self) -> StoreResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        write_frame(&mut *self.stream, frame::DATA, &self.buffer)?;
        self.buffer.clear();
        Ok(())
    }

    pub fn finish(mut self) -> StoreResult<()> {
        self.send_buffer()?;
        write_frame(&mut *self.stream, frame::END, &[])?;
        self.stream.flush()?;
        Ok(())
    }
}

impl<W: Write + ?Sized> Write for DataWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let room = DATA_CHUNK_SIZE - self.buffer.len();
        let n = buf.len().min(room);
        self.buffer.extend_from_slice(&buf[..n]);
        if self.buffer.len() >= DATA_CHUNK_SIZE {
            self.send_buffer().map_err(to_io)?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_buffer().map_err(to_io)?;
        self.stream.flush()
    }
}

/// `Read` adapter over a run of DATA frames.
///
/// END is end-of-stream. An ERROR frame ends the run with an error and its
/// message is kept in [`DataReader::remote_error`].
pub struct DataReader<'a, R: Read + ?Sized> {
    stream: &'a mut R,
    current: Vec<u8>,
    pos: usize,
    done: bool,
    remote_error: Option<String>,
}

impl<'a, R: Read + ?Sized> DataReader<'a, R> {
    pub fn new(stream: &'a mut R) -> Self {
        Self {
            stream,
            current: Vec::new(),
            pos: 0,
            done: false,
            remote_error: None,
        }
    }

    /// Message of the ERROR frame that ended the run, if any.
    pub fn remote_error(&self) -> Option<&str> {
        self.remote_error.as_deref()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}

impl<R: Read + ?Sized> Read for DataReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.current.len() {
            if self.done {
                return Ok(0);
            }
            if let Some(ref message) = self.remote_error {
                return Err(io::Error::other(message.clone()));
            }
            let (t, payload) = read_frame(&mut *self.stream).map_err(to_io)?;
            match t {
                frame::DATA => {
                    self.current = payload;
                    self.pos = 0;
                }
                frame::END => self.done = true,
                frame::ERROR => {
                    let message = String::from_utf8_lossy(&payload).into_owned();
                    self.remote_error = Some(message);
                }
                other => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("unexpected frame type {} in data stream", other),
                    ))
                }
            }
        }

        let n = buf.len().min(self.current.len() - self.pos);
        buf[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_frame_header_round_trip() {
        let header = build_frame_header(frame::DATA, 12345);
        let (parsed_type, parsed_len) = parse_frame_header(&header).unwrap();
        assert_eq!(parsed_type, frame::DATA);
        assert_eq!(parsed_len, 12345);
        assert_eq!(&header[0..4], b"TLFT");
    }

    #[test]
    fn test_parse_frame_header_invalid_magic() {
        let mut header = build_frame_header(frame::PUT, 100);
        header[0..4].copy_from_slice(b"WRNG");
        assert!(matches!(
            parse_frame_header(&header),
            Err(StoreError::Protocol(_))
        ));
    }

    #[test]
    fn test_parse_frame_header_wrong_version() {
        let mut header = build_frame_header(frame::PUT, 100);
        header[4..6].copy_from_slice(&999u16.to_le_bytes());
        assert!(parse_frame_header(&header).is_err());
    }

    #[test]
    fn test_validate_frame_size_edge_cases() {
        assert!(validate_frame_size(0).is_ok());
        assert!(validate_frame_size(MAX_FRAME_SIZE).is_ok());
        assert!(validate_frame_size(MAX_FRAME_SIZE + 1).is_err());
    }

    #[test]
    fn oversized_length_is_rejected_before_allocation() {
        let header = build_frame_header(frame::DATA, u32::MAX);
        let err = read_frame(&mut Cursor::new(header.to_vec())).unwrap_err();
        assert!(matches!(err, StoreError::Protocol(_)));
    }

    #[test]
    fn data_run_streams_through_adapters() {
        let payload: Vec<u8> = (0..DATA_CHUNK_SIZE * 2 + 5).map(|i| i as u8).collect();
        let mut wire = Vec::new();
        {
            let mut writer = DataWriter::new(&mut wire);
            writer.write_all(&payload).unwrap();
            writer.finish().unwrap();
        }

        let mut cursor = Cursor::new(wire);
        let mut reader = DataReader::new(&mut cursor);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert!(reader.is_done());
        assert_eq!(out, payload);
    }

    #[test]
    fn error_frame_ends_data_run() {
        let mut wire = Vec::new();
        write_frame(&mut wire, frame::DATA, b"partial").unwrap();
        write_frame(&mut wire, frame::ERROR, b"disk full").unwrap();

        let mut cursor = Cursor::new(wire);
        let mut reader = DataReader::new(&mut cursor);
        let mut out = Vec::new();
        assert!(reader.read_to_end(&mut out).is_err());
        assert_eq!(reader.remote_error(), Some("disk full"));
        assert_eq!(out, b"partial");
    }

    #[test]
    fn not_found_message_maps_to_not_found() {
        assert!(matches!(
            remote_error("not found: runs/x.tar.gz".into()),
            StoreError::NotFound(o) if o == "runs/x.tar.gz"
        ));
        assert!(matches!(
            remote_error("permission denied".into()),
            StoreError::Remote(_)
        ));
    }

    #[test]
    fn count_payload_round_trip() {
        assert_eq!(decode_count(&encode_count(3072)).unwrap(), 3072);
        assert!(decode_count(b"short").is_err());
    }
}
