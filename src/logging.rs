//! Operator-facing event log.
//!
//! The proxy reports a small, fixed set of events, one line each, on stderr:
//! rejected admissions, successful connects, session errors, teardown and
//! discovered credentials.  [`Event`] owns the wording so it can be checked
//! without capturing stderr.
//!
//! Internal diagnostics that are only interesting while debugging the proxy
//! itself go through `logwise` instead.
//!
//! # Examples
//!
//! ```
//! use sockspy::logging::Event;
//!
//! let client = "127.0.0.1:50000".parse().unwrap();
//! let event = Event::Connected { client, destination: "93.184.216.34:80".to_string() };
//! assert_eq!(
//!     event.to_string(),
//!     "Successful connection from 127.0.0.1:50000 to 93.184.216.34:80"
//! );
//! ```

use crate::error::Error;
use crate::relay::Credential;
use crate::session::State;
use std::fmt::Display;
use std::net::SocketAddr;

/// Writes one line to stderr.
pub fn log(str: &str) {
    eprintln!("{}", str);
}

/// Reports `event` on stderr.
pub fn report(event: &Event<'_>) {
    log(&event.to_string());
}

#[derive(Debug)]
pub enum Event<'a> {
    /// The server was full; the connection was closed before the handshake.
    Rejected(&'a Error),
    Connected {
        client: SocketAddr,
        destination: String,
    },
    /// A session ended with an error.
    Failed {
        client: SocketAddr,
        state: State,
        destination: Option<&'a str>,
        error: &'a Error,
    },
    Closing {
        client: SocketAddr,
        destination: Option<&'a str>,
    },
    PasswordFound(&'a Credential),
}

impl Display for Event<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Rejected(error) => write!(f, "{error}"),
            Event::Connected {
                client,
                destination,
            } => write!(f, "Successful connection from {client} to {destination}"),
            Event::Failed {
                client,
                state,
                destination,
                error,
            } => {
                write!(f, "Connection error: while {state}: {error}; closing connection from {client}")?;
                if let Some(destination) = destination {
                    write!(f, " to {destination}")?;
                }
                Ok(())
            }
            Event::Closing {
                client,
                destination,
            } => {
                write!(f, "Closing connection from {client}")?;
                if let Some(destination) = destination {
                    write!(f, " to {destination}")?;
                }
                Ok(())
            }
            Event::PasswordFound(credential) => write!(f, "Password Found! {credential}"),
        }
    }
}
