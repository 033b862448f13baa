//! The per-connection handler.
//!
//! A [`Session`] owns one accepted client socket and, once the handshake
//! succeeds, one destination socket.  It walks the states
//!
//! ```text
//! Init -> Handshake -> Connecting -> RequestRelay -> ResponseRelay -> BodyRelay -> Closed
//! ```
//!
//! and may jump to `Closed` from any of them on a timeout, I/O or protocol
//! error.  Whatever the path, `Closed` shuts down both sockets.

use crate::config::ProxyConfig;
use crate::connector;
use crate::error::Error;
use crate::handshake::{self, ProxyRequest, Reply};
use crate::logging::{self, Event};
use crate::relay::{self, RelayState};
use std::fmt::Display;
use std::io::{BufReader, BufWriter};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Init,
    Handshake,
    Connecting,
    RequestRelay,
    ResponseRelay,
    BodyRelay,
    Closed,
}

impl Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            State::Init => "initializing",
            State::Handshake => "parsing request",
            State::Connecting => "connecting to destination",
            State::RequestRelay => "relaying request headers",
            State::ResponseRelay => "relaying response headers",
            State::BodyRelay => "relaying response body",
            State::Closed => "closed",
        };
        f.write_str(s)
    }
}

pub struct Session {
    client: TcpStream,
    client_addr: SocketAddr,
    destination: Option<TcpStream>,
    request: Option<ProxyRequest>,
    state: State,
    started: Instant,
    config: Arc<ProxyConfig>,
}

impl Session {
    pub fn new(client: TcpStream, client_addr: SocketAddr, config: Arc<ProxyConfig>) -> Self {
        Session {
            client,
            client_addr,
            destination: None,
            request: None,
            state: State::Init,
            started: Instant::now(),
            config,
        }
    }

    /// Runs the session to completion and closes both sockets.
    ///
    /// Errors are logged before they are returned; the return value exists for
    /// callers that want to inspect the outcome.
    pub fn run(mut self) -> Result<RelayState, Error> {
        let result = self.drive();
        let destination = self.request.as_ref().map(ProxyRequest::destination);
        match &result {
            Ok(_) => logging::report(&Event::Closing {
                client: self.client_addr,
                destination: destination.as_deref(),
            }),
            Err(error) => {
                // a reply is only owed while the handshake is still open
                if matches!(self.state, State::Handshake | State::Connecting)
                    && let Some(reply) = error.reply()
                {
                    let _ = connector::send_reply(&mut &self.client, reply);
                }
                logging::report(&Event::Failed {
                    client: self.client_addr,
                    state: self.state,
                    destination: destination.as_deref(),
                    error,
                });
            }
        }
        self.close();
        result
    }

    fn drive(&mut self) -> Result<RelayState, Error> {
        self.state = State::Handshake;
        self.client
            .set_read_timeout(Some(self.config.handshake_timeout()))?;
        self.client.set_write_timeout(Some(self.config.io_timeout()))?;
        let mut client_reader = BufReader::new(self.client.try_clone()?);
        let request = handshake::read_request(&mut client_reader)?;
        logwise::info_sync!(
            "{client} requested {request}",
            client = logwise::privacy::LogIt(&self.client_addr),
            request = logwise::privacy::LogIt(&request)
        );
        let request = self.request.insert(request);

        self.state = State::Connecting;
        let destination = connector::connect(
            request,
            self.config.connect_timeout(),
            self.config.io_timeout(),
        )?;
        connector::send_reply(&mut &self.client, Reply::Granted)?;
        logging::report(&Event::Connected {
            client: self.client_addr,
            destination: request.destination(),
        });
        let destination = self.destination.insert(destination);
        self.client.set_read_timeout(Some(self.config.io_timeout()))?;

        self.state = State::RequestRelay;
        let credential = relay::relay_request(&mut client_reader, &mut BufWriter::new(&*destination))?;
        if let Some(credential) = credential {
            logging::report(&Event::PasswordFound(&credential));
        }

        self.state = State::ResponseRelay;
        let mut destination_reader = BufReader::new(&*destination);
        let mut to_client = BufWriter::new(&self.client);
        let mut relay_state = relay::relay_response_headers(&mut destination_reader, &mut to_client)?;

        self.state = State::BodyRelay;
        relay::relay_body(
            &mut destination_reader,
            &mut to_client,
            &mut relay_state,
            self.config.chunk_line_ending,
        )?;
        Ok(relay_state)
    }

    /// Best-effort teardown of both sockets.
    fn close(&mut self) {
        self.state = State::Closed;
        let _ = self.client.shutdown(Shutdown::Both);
        if let Some(destination) = self.destination.take() {
            let _ = destination.shutdown(Shutdown::Both);
        }
        logwise::info_sync!(
            "session {client} closed after {elapsed}",
            client = logwise::privacy::LogIt(&self.client_addr),
            elapsed = logwise::privacy::LogIt(&self.started.elapsed())
        );
    }
}
