//! Client side of the tarliftd object daemon.

use super::{copy_with_progress, ObjectRef, ObjectStore, StoreError, StoreResult};
use crate::protocol::{frame, timeouts};
use crate::protocol_core::{
    decode_count, decode_text, read_frame, remote_error, write_frame, DataReader, DataWriter,
};
use std::io::{BufReader, BufWriter, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::debug;

/// Talks to a `tarliftd` at `host:port`, one connection per operation.
#[derive(Debug, Clone)]
pub struct DaemonStore {
    addr: String,
}

impl DaemonStore {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn connect(&self) -> StoreResult<TcpStream> {
        let connect_err = |source| StoreError::Connect {
            addr: self.addr.clone(),
            source,
        };
        let addrs: Vec<_> = self
            .addr
            .to_socket_addrs()
            .map_err(connect_err)?
            .collect();

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, Duration::from_millis(timeouts::CONNECT_MS)) {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    stream.set_read_timeout(Some(Duration::from_millis(timeouts::IDLE_READ_MS)))?;
                    debug!("Connected to daemon at {}", addr);
                    return Ok(stream);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(connect_err(last_err.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "address resolved to nothing")
        })))
    }

    /// Read the server's reply to a request; OK payload on success.
    fn expect_ok(stream: &mut dyn Read) -> StoreResult<Vec<u8>> {
        let (t, payload) = read_frame(stream)?;
        match t {
            frame::OK => Ok(payload),
            frame::ERROR => Err(remote_error(decode_text(&payload)?)),
            other => Err(StoreError::Protocol(format!(
                "expected OK or ERROR, got frame type {}",
                other
            ))),
        }
    }
}

impl ObjectStore for DaemonStore {
    fn upload(
        &self,
        object: &ObjectRef,
        source: &mut dyn Read,
        progress: &mut dyn FnMut(u64),
    ) -> StoreResult<u64> {
        let stream = self.connect()?;
        let mut reader = BufReader::new(stream.try_clone()?);
        let mut writer = BufWriter::new(stream);

        write_frame(&mut writer, frame::PUT, object.to_string().as_bytes())?;
        writer.flush()?;
        Self::expect_ok(&mut reader)?;

        let mut source = SourceReader {
            inner: source,
            failed: false,
        };
        let mut data = DataWriter::new(&mut writer);
        let streamed = copy_with_progress(&mut source, &mut data, progress)
            .map_err(StoreError::from)
            .and_then(|sent| data.finish().map(|()| sent));
        let sent = match streamed {
            Ok(sent) => sent,
            Err(e) if source.failed => return Err(e),
            Err(e) => {
                // A failing daemon sends ERROR and then closes.
                debug!("upload of {} interrupted: {}", object, e);
                return match Self::expect_ok(&mut reader) {
                    Err(remote @ (StoreError::Remote(_) | StoreError::NotFound(_))) => Err(remote),
                    _ => Err(e),
                };
            }
        };

        let stored = decode_count(&Self::expect_ok(&mut reader)?)?;
        if stored != sent {
            return Err(StoreError::Protocol(format!(
                "daemon stored {} bytes, sent {}",
                stored, sent
            )));
        }
        Ok(stored)
    }

    fn download(
        &self,
        object: &ObjectRef,
        sink: &mut dyn Write,
        progress: &mut dyn FnMut(u64),
    ) -> StoreResult<u64> {
        let stream = self.connect()?;
        let mut reader = BufReader::new(stream.try_clone()?);
        let mut writer = BufWriter::new(stream);

        write_frame(&mut writer, frame::GET, object.to_string().as_bytes())?;
        writer.flush()?;

        let mut data = DataReader::new(&mut reader);
        match copy_with_progress(&mut data, sink, progress) {
            Ok(n) => Ok(n),
            Err(e) => match data.remote_error() {
                Some(message) => Err(remote_error(message.to_string())),
                None => Err(e.into()),
            },
        }
    }

    fn backend_name(&self) -> &'static str {
        "daemon"
    }
}

/// Remembers whether a failure came from the local source rather than the
/// connection.
struct SourceReader<'a> {
    inner: &'a mut dyn Read,
    failed: bool,
}

impl Read for SourceReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf).inspect_err(|e| {
            if e.kind() != std::io::ErrorKind::Interrupted {
                self.failed = true;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn unreachable_daemon_is_connect_error() {
        // Bind then drop so nothing listens on the port.
        let port = {
            let sock = TcpListener::bind("127.0.0.1:0").unwrap();
            sock.local_addr().unwrap().port()
        };
        let store = DaemonStore::new(format!("127.0.0.1:{}", port));
        let object = ObjectRef::new("b", "k").unwrap();
        let err = store
            .download(&object, &mut Vec::new(), &mut |_| {})
            .unwrap_err();
        assert!(matches!(err, StoreError::Connect { .. }), "got {err}");
    }

    #[test]
    fn unresolvable_address_is_connect_error() {
        let store = DaemonStore::new("no-port-here");
        let object = ObjectRef::new("b", "k").unwrap();
        let err = store
            .upload(&object, &mut std::io::empty(), &mut |_| {})
            .unwrap_err();
        assert!(matches!(err, StoreError::Connect { .. }));
    }

    #[test]
    fn daemon_error_mid_upload_keeps_its_message() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        // Accept one PUT, take one DATA frame, then fail like a full disk.
        let daemon = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            stream.set_nodelay(true).unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut writer = BufWriter::new(stream);
            assert_eq!(read_frame(&mut reader).unwrap().0, frame::PUT);
            write_frame(&mut writer, frame::OK, &[]).unwrap();
            writer.flush().unwrap();
            assert_eq!(read_frame(&mut reader).unwrap().0, frame::DATA);
            write_frame(&mut writer, frame::ERROR, b"No space left on device").unwrap();
            writer.flush().unwrap();
            std::thread::sleep(Duration::from_millis(200));
        });

        let store = DaemonStore::new(addr);
        let object = ObjectRef::new("b", "k").unwrap();
        let mut source = std::io::repeat(7).take(64 * 1024 * 1024);
        let err = store.upload(&object, &mut source, &mut |_| {}).unwrap_err();
        daemon.join().unwrap();
        assert!(
            matches!(&err, StoreError::Remote(m) if m.contains("No space left")),
            "got {err}"
        );
    }
}
