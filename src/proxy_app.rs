//! The `sockspy` binary.
//!
//! ```text
//! sockspy [CONFIG.json]
//! ```
//!
//! Without arguments the proxy listens on `0.0.0.0:8080` with the default
//! limits.  A JSON file may override any field of
//! [`ProxyConfig`](sockspy::config::ProxyConfig).

use sockspy::config::ProxyConfig;
use sockspy::server::Server;

fn main() {
    let args = std::env::args().skip(1).collect::<Vec<String>>();
    if args.len() > 1 || args.first().is_some_and(|a| a == "-h" || a == "--help") {
        help();
        return;
    }
    let config = match args.first() {
        None => ProxyConfig::default(),
        Some(path) => match ProxyConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("{}", e);
                std::process::exit(1);
            }
        },
    };
    match Server::start(config) {
        Ok(server) => server.wait(),
        Err(e) => {
            eprintln!("Can't open socket: {}", e);
            std::process::exit(1);
        }
    }
}

fn help() {
    eprintln!(
        "Usage: sockspy [CONFIG.json]

A SOCKS4/4A proxy that relays one HTTP exchange per connection and reports
Basic-auth credentials on stderr.

CONFIG.json may set any of:
  listen_addr           (default \"0.0.0.0:8080\")
  capacity              concurrent sessions (default 20)
  handshake_timeout_ms  (default 5000)
  connect_timeout_ms    (default 5000)
  io_timeout_ms         (default 5000)
  chunk_line_ending     \"verbatim\" or \"lf\" (default \"verbatim\")"
    );
}
