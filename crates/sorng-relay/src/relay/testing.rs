//! In-memory [`RemoteFs`] used by the unit tests.

use crate::relay::session::{RemoteFs, RemoteWrite};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Accepts TCP connections and never says a word. Returns the port.
pub fn silent_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    std::thread::spawn(move || {
        let mut held = Vec::new();
        for stream in listener.incoming().flatten() {
            held.push(stream);
        }
    });
    port
}

#[derive(Default)]
struct Inner {
    files: Mutex<HashMap<String, Vec<u8>>>,
    denied_prefixes: Mutex<Vec<String>>,
    fail_reads_after: Mutex<Option<usize>>,
    fail_writes_after: Mutex<Option<usize>>,
    fail_close: AtomicBool,
    open_handles: AtomicUsize,
    read_opens: AtomicUsize,
    write_opens: AtomicUsize,
    largest_read: AtomicUsize,
}

pub struct MemoryFs {
    label: String,
    inner: Arc<Inner>,
}

impl MemoryFs {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            inner: Arc::new(Inner::default()),
        }
    }

    pub fn put(&self, path: &str, data: Vec<u8>) {
        self.inner
            .files
            .lock()
            .unwrap()
            .insert(path.to_string(), data);
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.inner.files.lock().unwrap().get(path).cloned()
    }

    pub fn deny_writes_under(&self, prefix: &str) {
        self.inner
            .denied_prefixes
            .lock()
            .unwrap()
            .push(prefix.to_string());
    }

    /// Reads fail with a reset once `n` bytes have been served.
    pub fn fail_reads_after(&self, n: usize) {
        *self.inner.fail_reads_after.lock().unwrap() = Some(n);
    }

    /// Writes fail once `n` bytes have been accepted.
    pub fn fail_writes_after(&self, n: usize) {
        *self.inner.fail_writes_after.lock().unwrap() = Some(n);
    }

    /// Closing a write handle reports an error.
    pub fn fail_close(&self) {
        self.inner.fail_close.store(true, Ordering::SeqCst);
    }

    pub fn open_handles(&self) -> usize {
        self.inner.open_handles.load(Ordering::SeqCst)
    }

    pub fn read_opens(&self) -> usize {
        self.inner.read_opens.load(Ordering::SeqCst)
    }

    pub fn write_opens(&self) -> usize {
        self.inner.write_opens.load(Ordering::SeqCst)
    }

    pub fn largest_read(&self) -> usize {
        self.inner.largest_read.load(Ordering::SeqCst)
    }
}

impl RemoteFs for MemoryFs {
    fn describe(&self) -> String {
        self.label.clone()
    }

    fn open_read<'a>(&'a self, path: &str) -> io::Result<Box<dyn Read + 'a>> {
        let data = self
            .get(path)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such file"))?;
        self.inner.read_opens.fetch_add(1, Ordering::SeqCst);
        self.inner.open_handles.fetch_add(1, Ordering::SeqCst);
        let fail_after = *self.inner.fail_reads_after.lock().unwrap();
        Ok(Box::new(MemoryReader {
            inner: &self.inner,
            data,
            pos: 0,
            fail_after,
        }))
    }

    fn open_write<'a>(&'a self, path: &str) -> io::Result<Box<dyn RemoteWrite + 'a>> {
        let denied = self
            .inner
            .denied_prefixes
            .lock()
            .unwrap()
            .iter()
            .any(|p| path.starts_with(p.as_str()));
        if denied {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "permission denied",
            ));
        }
        self.put(path, Vec::new());
        self.inner.write_opens.fetch_add(1, Ordering::SeqCst);
        self.inner.open_handles.fetch_add(1, Ordering::SeqCst);
        let fail_after = *self.inner.fail_writes_after.lock().unwrap();
        Ok(Box::new(MemoryWriter {
            inner: &self.inner,
            path: path.to_string(),
            written: 0,
            fail_after,
        }))
    }
}

struct MemoryReader<'a> {
    inner: &'a Inner,
    data: Vec<u8>,
    pos: usize,
    fail_after: Option<usize>,
}

impl Read for MemoryReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.largest_read.fetch_max(buf.len(), Ordering::SeqCst);
        let mut end = self.data.len().min(self.pos + buf.len());
        if let Some(limit) = self.fail_after {
            if self.pos >= limit {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "connection reset by peer",
                ));
            }
            end = end.min(limit);
        }
        let n = end - self.pos;
        buf[..n].copy_from_slice(&self.data[self.pos..end]);
        self.pos = end;
        Ok(n)
    }
}

impl Drop for MemoryReader<'_> {
    fn drop(&mut self) {
        self.inner.open_handles.fetch_sub(1, Ordering::SeqCst);
    }
}

struct MemoryWriter<'a> {
    inner: &'a Inner,
    path: String,
    written: usize,
    fail_after: Option<usize>,
}

impl Write for MemoryWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut n = buf.len();
        if let Some(limit) = self.fail_after {
            let left = limit.saturating_sub(self.written);
            if left == 0 {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"));
            }
            n = n.min(left);
        }
        self.inner
            .files
            .lock()
            .unwrap()
            .entry(self.path.clone())
            .or_default()
            .extend_from_slice(&buf[..n]);
        self.written += n;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl RemoteWrite for MemoryWriter<'_> {
    fn finish(self: Box<Self>) -> io::Result<()> {
        if self.inner.fail_close.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "close refused"));
        }
        Ok(())
    }
}

impl Drop for MemoryWriter<'_> {
    fn drop(&mut self) {
        self.inner.open_handles.fetch_sub(1, Ordering::SeqCst);
    }
}
