//! Asynchronous DNS offload.
//!
//! Grounded in `original_source/src/dns/dns_resolver.c`: a worker thread
//! drains a bounded `Mutex`+`Condvar` queue and calls a blocking resolver,
//! signalling the main loop through a self-pipe. The source writes a whole
//! pointer down the pipe; `io::Result<Vec<SocketAddr>>` isn't `Copy`, so
//! only a `u64` sequence number crosses the pipe here, with the actual
//! result held in a small completion table behind the same mutex.

use mio::unix::pipe;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, warn};

const MAX_QUEUE_SIZE: usize = 100;

struct Request {
    token: u64,
    host: String,
    port: u16,
}

struct Shared {
    queue: Mutex<VecDeque<Request>>,
    not_empty: Condvar,
    shutdown: Mutex<bool>,
    completions: Mutex<std::collections::HashMap<u64, io::Result<Vec<SocketAddr>>>>,
}

/// Handle to the running resolver: submit lookups, read completions off the
/// self-pipe, and join the worker at shutdown. The sending half of the pipe
/// lives entirely on the worker thread; the main thread only ever reads.
pub struct DnsResolver {
    shared: Arc<Shared>,
    pub receiver: pipe::Receiver,
    worker: Option<JoinHandle<()>>,
}

impl DnsResolver {
    pub fn spawn() -> io::Result<Self> {
        let (sender, receiver) = pipe::new()?;
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            shutdown: Mutex::new(false),
            completions: Mutex::new(std::collections::HashMap::new()),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("dns-resolver".to_string())
            .spawn(move || worker_loop(worker_shared, sender))?;

        Ok(DnsResolver {
            shared,
            receiver,
            worker: Some(worker),
        })
    }

    /// Submit a lookup. Returns `Err` synchronously if the queue is full —
    /// callers reply with a general-failure status and tear the connection
    /// down rather than blocking the event loop.
    pub fn submit(&self, token: u64, host: String, port: u16) -> Result<(), ()> {
        let mut queue = self.shared.queue.lock().unwrap();
        if queue.len() >= MAX_QUEUE_SIZE {
            return Err(());
        }
        queue.push_back(Request { token, host, port });
        self.shared.not_empty.notify_one();
        Ok(())
    }

    /// Drain every completion currently buffered for tokens the caller
    /// cares about. Called once the self-pipe reports readable; reads and
    /// discards whatever bytes are pending (their content is just a count
    /// signal, the real payload lives in the completion table).
    pub fn drain_completions(&mut self) -> Vec<(u64, io::Result<Vec<SocketAddr>>)> {
        let mut buf = [0u8; 256];
        loop {
            match self.receiver.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
        let mut completions = self.shared.completions.lock().unwrap();
        completions.drain().collect()
    }

    pub fn shutdown(mut self) {
        *self.shared.shutdown.lock().unwrap() = true;
        self.shared.not_empty.notify_all();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: Arc<Shared>, mut sender: pipe::Sender) {
    loop {
        let request = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if *shared.shutdown.lock().unwrap() {
                    return;
                }
                if let Some(req) = queue.pop_front() {
                    break Some(req);
                }
                queue = shared.not_empty.wait(queue).unwrap();
            }
        };

        let Some(request) = request else { return };
        debug!(host = %request.host, port = request.port, "resolving");
        let result = (request.host.as_str(), request.port)
            .to_socket_addrs()
            .map(|iter| iter.collect::<Vec<_>>());

        shared
            .completions
            .lock()
            .unwrap()
            .insert(request.token, result);

        if let Err(e) = sender.write_all(&request.token.to_ne_bytes()) {
            warn!(error = %e, "dns worker failed to signal completion");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_and_resolve_loopback() {
        let mut resolver = DnsResolver::spawn().expect("spawn resolver");
        resolver.submit(1, "localhost".to_string(), 80).unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        let mut got = Vec::new();
        while std::time::Instant::now() < deadline && got.is_empty() {
            std::thread::sleep(std::time::Duration::from_millis(10));
            got = resolver.drain_completions();
        }
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, 1);
        assert!(got[0].1.is_ok());
        resolver.shutdown();
    }

    #[test]
    fn test_queue_capacity_enforced() {
        let resolver = DnsResolver::spawn().expect("spawn resolver");
        {
            let mut queue = resolver.shared.queue.lock().unwrap();
            for i in 0..MAX_QUEUE_SIZE {
                queue.push_back(Request {
                    token: i as u64,
                    host: "example.com".to_string(),
                    port: 80,
                });
            }
        }
        assert!(resolver
            .submit(9999, "example.com".to_string(), 80)
            .is_err());
        resolver.shutdown();
    }
}
