//! The tarliftd object daemon: a thread per connection, one request per
//! connection, objects kept in a [`FilesystemStore`].

use crate::protocol::{frame, timeouts, NOT_FOUND_PREFIX};
use crate::protocol_core::{decode_text, encode_count, read_frame, write_frame, DataReader, DataWriter};
use crate::store::{FilesystemStore, ObjectRef, ObjectStore, StoreError, StoreResult};
use std::io::{BufReader, BufWriter, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

pub fn serve(bind: &str, root: &Path) -> StoreResult<()> {
    let store = Arc::new(FilesystemStore::new(root)?);
    let listener = TcpListener::bind(bind).map_err(|source| StoreError::Connect {
        addr: bind.to_string(),
        source,
    })?;
    info!(
        "tarliftd listening on {} root={}",
        bind,
        store.root().display()
    );
    serve_listener(listener, store)
}

/// Accept connections on an already-bound listener until it fails.
pub fn serve_listener(listener: TcpListener, store: Arc<FilesystemStore>) -> StoreResult<()> {
    for conn in listener.incoming() {
        match conn {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                let peer = stream
                    .peer_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|_| "unknown".to_string());
                debug!("conn from {}", peer);
                let store = Arc::clone(&store);
                let spawned = thread::Builder::new()
                    .name("tarliftd-conn".into())
                    .spawn(move || {
                        if let Err(e) = handle_conn(stream, store.as_ref()) {
                            warn!(
                                "connection error from {} (possible client disconnect): {}",
                                peer, e
                            );
                        }
                    });
                if let Err(e) = spawned {
                    warn!("failed to spawn connection thread: {}", e);
                }
            }
            Err(e) => {
                warn!("accept error: {}", e);
            }
        }
    }
    Ok(())
}

fn error_message(err: &StoreError) -> String {
    match err {
        StoreError::NotFound(object) => format!("{}{}", NOT_FOUND_PREFIX, object),
        other => other.to_string(),
    }
}

fn handle_conn(stream: TcpStream, store: &FilesystemStore) -> StoreResult<()> {
    stream.set_read_timeout(Some(Duration::from_millis(timeouts::IDLE_READ_MS)))?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = BufWriter::new(stream);

    let (typ, payload) = read_frame(&mut reader)?;
    let object = match decode_text(&payload).and_then(|s| s.parse::<ObjectRef>()) {
        Ok(object) => object,
        Err(e) => {
            write_frame(&mut writer, frame::ERROR, error_message(&e).as_bytes())?;
            writer.flush()?;
            return Err(e);
        }
    };

    match typ {
        frame::PUT => handle_put(&mut reader, &mut writer, store, &object),
        frame::GET => handle_get(&mut writer, store, &object),
        other => {
            let message = format!("unexpected request frame type {}", other);
            write_frame(&mut writer, frame::ERROR, message.as_bytes())?;
            writer.flush()?;
            Err(StoreError::Protocol(message))
        }
    }
}

fn handle_put(
    reader: &mut BufReader<TcpStream>,
    writer: &mut BufWriter<TcpStream>,
    store: &FilesystemStore,
    object: &ObjectRef,
) -> StoreResult<()> {
    write_frame(writer, frame::OK, &[])?;
    writer.flush()?;

    let mut data = DataReader::new(reader);
    match store.upload(object, &mut data, &mut |_| {}) {
        Ok(n) => {
            info!("stored {} ({} bytes)", object, n);
            write_frame(writer, frame::OK, &encode_count(n))?;
            writer.flush()?;
            Ok(())
        }
        Err(e) => {
            // The client may already be gone; report if we can.
            let _ = write_frame(writer, frame::ERROR, error_message(&e).as_bytes());
            let _ = writer.flush();
            Err(e)
        }
    }
}

fn handle_get(
    writer: &mut BufWriter<TcpStream>,
    store: &FilesystemStore,
    object: &ObjectRef,
) -> StoreResult<()> {
    let mut data = DataWriter::new(writer);
    let result = store.download(object, &mut data, &mut |_| {});
    match result {
        Ok(n) => {
            data.finish()?;
            info!("served {} ({} bytes)", object, n);
            Ok(())
        }
        Err(e) => {
            drop(data);
            write_frame(writer, frame::ERROR, error_message(&e).as_bytes())?;
            writer.flush()?;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DaemonStore;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn start_daemon(root: &Path) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let store = Arc::new(FilesystemStore::new(root).unwrap());
        thread::spawn(move || {
            let _ = serve_listener(listener, store);
        });
        addr
    }

    #[test]
    fn put_then_get_through_daemon() {
        let root = TempDir::new().unwrap();
        let client = DaemonStore::new(start_daemon(root.path()));
        let object = ObjectRef::new("runs", "run7.tar.gz").unwrap();

        let payload: Vec<u8> = (0..3_000_000).map(|i| (i % 241) as u8).collect();
        let n = client
            .upload(&object, &mut Cursor::new(&payload), &mut |_| {})
            .unwrap();
        assert_eq!(n, payload.len() as u64);
        assert_eq!(
            std::fs::read(root.path().join("runs/run7.tar.gz")).unwrap(),
            payload
        );

        let mut out = Vec::new();
        let mut seen = 0u64;
        client
            .download(&object, &mut out, &mut |c| seen += c)
            .unwrap();
        assert_eq!(out, payload);
        assert_eq!(seen, payload.len() as u64);
    }

    #[test]
    fn missing_object_maps_to_not_found() {
        let root = TempDir::new().unwrap();
        let client = DaemonStore::new(start_daemon(root.path()));
        let object = ObjectRef::new("runs", "nothing-here").unwrap();
        let err = client
            .download(&object, &mut Vec::new(), &mut |_| {})
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)), "got {err}");
    }

    #[test]
    fn empty_object_round_trips() {
        let root = TempDir::new().unwrap();
        let client = DaemonStore::new(start_daemon(root.path()));
        let object = ObjectRef::new("runs", "empty").unwrap();
        assert_eq!(
            client
                .upload(&object, &mut std::io::empty(), &mut |_| {})
                .unwrap(),
            0
        );
        let mut out = Vec::new();
        assert_eq!(client.download(&object, &mut out, &mut |_| {}).unwrap(), 0);
        assert!(out.is_empty());
    }
}
