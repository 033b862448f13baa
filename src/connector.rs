//! Opens the outbound connection for a parsed request.

use crate::error::Error;
use crate::handshake::{ProxyRequest, Reply};
use std::io::Write;
use std::net::{SocketAddr, SocketAddrV4, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Connects to the destination named by `request`.
///
/// SOCKS4 requests connect to the literal address.  SOCKS4A requests resolve
/// the hostname and try each resolved address in order until one connects.
/// Each attempt is bounded by `connect_timeout`; the returned stream carries
/// `io_timeout` read and write deadlines.
pub fn connect(
    request: &ProxyRequest,
    connect_timeout: Duration,
    io_timeout: Duration,
) -> Result<TcpStream, Error> {
    let candidates = resolve(request)?;
    let mut last_error = None;
    for addr in candidates {
        match TcpStream::connect_timeout(&addr, connect_timeout) {
            Ok(stream) => {
                stream.set_read_timeout(Some(io_timeout))?;
                stream.set_write_timeout(Some(io_timeout))?;
                return Ok(stream);
            }
            Err(e) => {
                logwise::info_sync!(
                    "connect attempt to {addr} failed: {e}",
                    addr = logwise::privacy::LogIt(&addr),
                    e = logwise::privacy::LogIt(&e)
                );
                last_error = Some(e);
            }
        }
    }
    let destination = request.destination();
    match last_error {
        Some(e)
            if e.kind() == std::io::ErrorKind::TimedOut
                || e.kind() == std::io::ErrorKind::WouldBlock =>
        {
            Err(Error::ConnectTimeout { destination })
        }
        Some(source) => Err(Error::ConnectFailed {
            destination,
            source,
        }),
        // resolve() never returns an empty list
        None => Err(Error::AddressResolutionFailure {
            host: destination,
            source: None,
        }),
    }
}

/// Candidate socket addresses for `request`, in connection order.
pub fn resolve(request: &ProxyRequest) -> Result<Vec<SocketAddr>, Error> {
    let Some(host) = &request.hostname else {
        return Ok(vec![SocketAddr::V4(SocketAddrV4::new(
            request.address,
            request.port,
        ))]);
    };
    let addrs = (host.as_str(), request.port)
        .to_socket_addrs()
        .map_err(|e| Error::AddressResolutionFailure {
            host: host.clone(),
            source: Some(e),
        })?
        .collect::<Vec<_>>();
    if addrs.is_empty() {
        return Err(Error::AddressResolutionFailure {
            host: host.clone(),
            source: None,
        });
    }
    Ok(addrs)
}

/// Writes the 8-byte handshake reply and flushes it.
pub fn send_reply<W: Write>(client: &mut W, reply: Reply) -> Result<(), Error> {
    client.write_all(&reply.to_bytes())?;
    client.flush()?;
    Ok(())
}
