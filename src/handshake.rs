//! SOCKS4/4A request parsing and reply encoding.
//!
//! # Wire format
//!
//! ```text
//! +----+----+----+----+----+----+----+----+----+----+....+----+
//! | VN | CD | DSTPORT |      DSTIP        | USERID       |NULL|
//! +----+----+----+----+----+----+----+----+----+----+....+----+
//!    1    1      2              4           variable       1
//! ```
//!
//! When `DSTIP` is `0.0.0.x` with `x != 0` (SOCKS4A), a second null-terminated
//! field with the destination hostname follows the user ID.
//!
//! Replies are always 8 bytes: `00 CD 00 00 00 00 00 00`.

use crate::error::Error;
use std::io::Read;
use std::net::{Ipv4Addr, SocketAddrV4};

pub const VERSION_4: u8 = 4;
pub const VERSION_5: u8 = 5;
pub const CMD_CONNECT: u8 = 0x01;

/// Longest user ID or hostname accepted, excluding the terminating null.
pub const MAX_FIELD_LEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Socks4,
    /// SOCKS4 with the hostname extension.
    Socks4a,
}

/// A decoded SOCKS4/4A request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRequest {
    pub version: Version,
    pub command: u8,
    pub port: u16,
    /// The literal address, or the `0.0.0.x` placeholder for SOCKS4A.
    pub address: Ipv4Addr,
    pub user_id: Vec<u8>,
    /// Present iff `version` is [`Version::Socks4a`].
    pub hostname: Option<String>,
}

impl ProxyRequest {
    /// `host:port` as the client asked for it.
    pub fn destination(&self) -> String {
        match &self.hostname {
            Some(host) => format!("{host}:{}", self.port),
            None => SocketAddrV4::new(self.address, self.port).to_string(),
        }
    }
}

/// True for the SOCKS4A placeholder address `0.0.0.x`, `x != 0`.
pub fn is_socks4a_placeholder(address: Ipv4Addr) -> bool {
    let [a, b, c, d] = address.octets();
    a == 0 && b == 0 && c == 0 && d != 0
}

/// The handshake reply sent to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Granted,
    Rejected,
}

impl Reply {
    pub fn code(self) -> u8 {
        match self {
            Reply::Granted => 0x5A,
            Reply::Rejected => 0x5B,
        }
    }

    pub fn to_bytes(self) -> [u8; 8] {
        [0x00, self.code(), 0, 0, 0, 0, 0, 0]
    }
}

/// Reads one SOCKS request from `reader`.
///
/// Only the version byte is consumed when the version is unsupported.  The
/// caller is responsible for any reply; see [`Error::reply`].
pub fn read_request<R: Read>(reader: &mut R) -> Result<ProxyRequest, Error> {
    let version = read_u8(reader)?;
    if version != VERSION_4 {
        return Err(Error::UnsupportedVersion(version));
    }
    let command = read_u8(reader)?;
    let mut port = [0u8; 2];
    reader.read_exact(&mut port)?;
    let mut ip = [0u8; 4];
    reader.read_exact(&mut ip)?;
    let user_id = read_null_terminated(reader, "user id")?;

    let address = Ipv4Addr::from(ip);
    let (version, hostname) = if is_socks4a_placeholder(address) {
        let raw = read_null_terminated(reader, "hostname")?;
        if raw.is_empty() {
            return Err(Error::framing("empty SOCKS4A hostname"));
        }
        // hostnames are ASCII on the wire; widen bytes one-to-one
        let hostname = raw.iter().map(|&b| b as char).collect::<String>();
        (Version::Socks4a, Some(hostname))
    } else {
        (Version::Socks4, None)
    };

    let request = ProxyRequest {
        version,
        command,
        port: u16::from_be_bytes(port),
        address,
        user_id,
        hostname,
    };
    if request.command != CMD_CONNECT {
        return Err(Error::UnsupportedCommand(request.command));
    }
    Ok(request)
}

fn read_u8<R: Read>(reader: &mut R) -> Result<u8, Error> {
    let mut byte = [0u8; 1];
    reader.read_exact(&mut byte)?;
    Ok(byte[0])
}

fn read_null_terminated<R: Read>(reader: &mut R, field: &str) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    loop {
        let byte = read_u8(reader)?;
        if byte == 0 {
            return Ok(out);
        }
        if out.len() == MAX_FIELD_LEN {
            return Err(Error::framing(format!(
                "{field} longer than {MAX_FIELD_LEN} bytes"
            )));
        }
        out.push(byte);
    }
}
