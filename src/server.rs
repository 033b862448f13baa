//! The acceptor and its worker pool.
//!
//! # Architecture
//!
//! One named thread runs the accept loop.  `capacity` worker threads pull
//! admitted connections from a bounded queue and run one [`Session`] each, to
//! completion, before taking the next.
//!
//! Admission is decided by a single counting semaphore ([`Admission`]) of the
//! same size as the pool.  A permit is taken on accept and released when the
//! session ends, so at most `capacity` connections are ever queued or running
//! and the queue send never blocks the acceptor.

use crate::admission::{Admission, Permit};
use crate::config::ProxyConfig;
use crate::error::Error;
use crate::logging::{self, Event};
use crate::session::Session;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Pause after a failed accept so descriptor exhaustion doesn't spin the loop.
pub const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// An admitted connection waiting for a worker.
struct Job {
    stream: TcpStream,
    addr: SocketAddr,
    permit: Permit,
}

/// A running proxy server.
pub struct Server {
    local_addr: SocketAddr,
    admission: Admission,
    acceptor: JoinHandle<()>,
}

impl Server {
    /// Binds the listening socket and starts the acceptor and worker threads.
    pub fn start(config: ProxyConfig) -> Result<Server, Error> {
        let listener = TcpListener::bind(&config.listen_addr)?;
        let local_addr = listener.local_addr()?;
        let config = Arc::new(config);
        let admission = Admission::new(config.capacity);

        let (sender, receiver) = std::sync::mpsc::sync_channel::<Job>(config.capacity);
        let receiver = Arc::new(Mutex::new(receiver));
        for id in 0..config.capacity {
            let receiver = receiver.clone();
            let config = config.clone();
            std::thread::Builder::new()
                .name(format!("sockspy::worker-{id}"))
                .spawn(move || worker(receiver, config))?;
        }

        let move_admission = admission.clone();
        let acceptor = std::thread::Builder::new()
            .name("sockspy::listen".to_string())
            .spawn(move || accept_loop(listener, move_admission, sender))?;
        logging::log(&format!("Listening on {}", local_addr));

        Ok(Server {
            local_addr,
            admission,
            acceptor,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Sessions currently admitted, queued or running.
    pub fn active_sessions(&self) -> usize {
        self.admission.active()
    }

    /// Blocks until the acceptor thread exits.
    pub fn wait(self) {
        if self.acceptor.join().is_err() {
            logging::log("Acceptor thread panicked");
        }
    }
}

fn accept_loop(listener: TcpListener, admission: Admission, sender: SyncSender<Job>) {
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                logging::log(&format!("Accept error: {}", e));
                std::thread::sleep(ACCEPT_BACKOFF);
                continue;
            }
        };
        let addr = match stream.peer_addr() {
            Ok(addr) => addr,
            Err(e) => {
                logwise::warn_sync!(
                    "Dropping connection without peer address: {e}",
                    e = logwise::privacy::LogIt(&e)
                );
                continue;
            }
        };
        let Some(permit) = admission.try_admit() else {
            let _ = stream.shutdown(Shutdown::Both);
            logging::report(&Event::Rejected(&Error::AdmissionRejected { peer: addr }));
            continue;
        };
        if sender.send(Job {
            stream,
            addr,
            permit,
        })
        .is_err()
        {
            logging::log("Worker pool is gone, no longer accepting connections");
            return;
        }
    }
}

fn worker(receiver: Arc<Mutex<Receiver<Job>>>, config: Arc<ProxyConfig>) {
    loop {
        let job = {
            let guard = match receiver.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.recv()
        };
        let Ok(Job {
            stream,
            addr,
            permit,
        }) = job
        else {
            return; // acceptor gone
        };
        let config = config.clone();
        // keep the worker alive even if a session panics
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _ = Session::new(stream, addr, config).run();
        }));
        if outcome.is_err() {
            logwise::error_sync!(
                "Session for {addr} panicked",
                addr = logwise::privacy::LogIt(&addr)
            );
        }
        drop(permit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::time::Instant;

    fn wait_for(server: &Server, active: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while server.active_sessions() != active {
            assert!(Instant::now() < deadline, "never reached {active} sessions");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn over_capacity_connection_is_closed_untouched() {
        let server = Server::start(ProxyConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            capacity: 2,
            handshake_timeout_ms: 10_000,
            ..ProxyConfig::default()
        })
        .unwrap();
        let _a = TcpStream::connect(server.local_addr()).unwrap();
        let _b = TcpStream::connect(server.local_addr()).unwrap();
        wait_for(&server, 2);

        let mut rejected = TcpStream::connect(server.local_addr()).unwrap();
        rejected
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(rejected.read(&mut buf).unwrap(), 0);
        assert_eq!(server.active_sessions(), 2);
    }

    fn local_server() -> Server {
        Server::start(ProxyConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            handshake_timeout_ms: 10_000,
            ..ProxyConfig::default()
        })
        .unwrap()
    }

    /// A one-shot origin that records the request head and answers with `response`.
    fn origin(response: &'static [u8]) -> (u16, std::thread::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = std::io::BufReader::new(&stream);
            let mut seen = Vec::new();
            while let Some(line) = crate::relay::read_line(&mut reader).unwrap() {
                seen.extend_from_slice(line.raw());
                if line.is_empty() {
                    break;
                }
            }
            std::io::Write::write_all(&mut &stream, response).unwrap();
            seen
        });
        (port, handle)
    }

    fn socks4_request(port: u16, address: [u8; 4], hostname: Option<&str>) -> Vec<u8> {
        let mut request = vec![4, 1];
        request.extend_from_slice(&port.to_be_bytes());
        request.extend_from_slice(&address);
        request.extend_from_slice(b"tester\0");
        if let Some(hostname) = hostname {
            request.extend_from_slice(hostname.as_bytes());
            request.push(0);
        }
        request
    }

    fn exchange(server: &Server, bytes: &[u8]) -> Vec<u8> {
        let mut client = TcpStream::connect(server.local_addr()).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        std::io::Write::write_all(&mut client, bytes).unwrap();
        let mut received = Vec::new();
        client.read_to_end(&mut received).unwrap();
        received
    }

    #[test]
    fn socks4_content_length_exchange() {
        let server = local_server();
        let (port, origin) = origin(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello");
        let mut bytes = socks4_request(port, [127, 0, 0, 1], None);
        bytes.extend_from_slice(
            b"GET /secret HTTP/1.1\r\nHost: origin\r\nAuthorization: Basic dXNlcjpwYXNz\r\n\r\n",
        );
        let received = exchange(&server, &bytes);
        assert_eq!(&received[..8], &[0, 0x5a, 0, 0, 0, 0, 0, 0]);
        assert_eq!(
            &received[8..],
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello"
        );
        assert_eq!(
            origin.join().unwrap(),
            b"GET /secret HTTP/1.1\r\nHost: origin\r\nAuthorization: Basic dXNlcjpwYXNz\r\n\r\n"
        );
        wait_for(&server, 0);
    }

    #[test]
    fn socks4a_hostname_with_chunked_response() {
        let server = local_server();
        let response: &[u8] =
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n";
        let (port, origin) = origin(response);
        let mut bytes = socks4_request(port, [0, 0, 0, 1], Some("localhost"));
        bytes.extend_from_slice(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n");
        let received = exchange(&server, &bytes);
        assert_eq!(&received[..8], &[0, 0x5a, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&received[8..], response);
        origin.join().unwrap();
    }

    #[test]
    fn socks5_client_gets_one_failure_reply() {
        let server = local_server();
        assert_eq!(exchange(&server, &[5]), vec![0, 0x5b, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn unreachable_destination_gets_failure_reply() {
        // bind then drop to find a port nobody listens on
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let server = local_server();
        let received = exchange(&server, &socks4_request(port, [127, 0, 0, 1], None));
        assert_eq!(received, vec![0, 0x5b, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn twenty_first_connection_is_refused_at_default_capacity() {
        let server = local_server();
        let held = (0..crate::config::CAPACITY)
            .map(|_| TcpStream::connect(server.local_addr()).unwrap())
            .collect::<Vec<_>>();
        wait_for(&server, crate::config::CAPACITY);

        let mut rejected = TcpStream::connect(server.local_addr()).unwrap();
        rejected
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(rejected.read(&mut buf).unwrap(), 0);
        assert_eq!(server.active_sessions(), crate::config::CAPACITY);
        drop(held);
    }

    #[test]
    fn slot_is_released_when_session_ends() {
        let server = Server::start(ProxyConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            capacity: 1,
            ..ProxyConfig::default()
        })
        .unwrap();
        let mut client = TcpStream::connect(server.local_addr()).unwrap();
        // not a SOCKS version: the session ends at once
        std::io::Write::write_all(&mut client, &[0x01]).unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
        wait_for(&server, 0);
    }
}
