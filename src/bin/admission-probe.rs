//! Probe client for a running acceptor.
//!
//! Connects in plaintext or TLS, sends a payload and prints what comes back.
//! Exits non-zero when the connection, the handshake or the echo fails.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use rustls::pki_types::ServerName;

use hostd_admission::config::TlsConfig;
use hostd_admission::net::tls::{TlsContext, TlsVersion};

#[derive(Parser)]
#[command(name = "admission-probe")]
#[command(about = "Probe a hostd-admission listener", long_about = None)]
struct Cli {
    /// Address of the listener
    #[arg(short, long, default_value = "127.0.0.1:54321")]
    address: String,

    /// Payload to send; the plaintext default opens a STOMP session
    #[arg(long, default_value = "CONNECT\n\n\0")]
    payload: String,

    /// Seconds to wait for the reply
    #[arg(long, default_value_t = 5)]
    timeout: u64,

    #[command(flatten)]
    tls: TlsArgs,
}

#[derive(clap::Args)]
struct TlsArgs {
    /// Use TLS; requires --cert, --key and --ca
    #[arg(long)]
    tls: bool,

    /// Client certificate (PEM)
    #[arg(long, requires = "tls")]
    cert: Option<String>,

    /// Client private key (PEM)
    #[arg(long, requires = "tls")]
    key: Option<String>,

    /// CA bundle used to verify the server (PEM)
    #[arg(long, requires = "tls")]
    ca: Option<String>,

    /// Pin a single protocol version
    #[arg(long, value_enum, requires = "tls")]
    protocol: Option<Protocol>,

    /// Name expected in the server certificate
    #[arg(long, default_value = "localhost")]
    server_name: String,
}

#[derive(Clone, Copy, ValueEnum)]
enum Protocol {
    Tls12,
    Tls13,
}

impl From<Protocol> for TlsVersion {
    fn from(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Tls12 => TlsVersion::Tls1_2,
            Protocol::Tls13 => TlsVersion::Tls1_3,
        }
    }
}

fn exchange<S: Read + Write>(stream: &mut S, payload: &[u8]) -> std::io::Result<Vec<u8>> {
    stream.write_all(payload)?;
    stream.flush()?;

    let mut reply = vec![0u8; payload.len()];
    stream.read_exact(&mut reply)?;
    Ok(reply)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let sock = TcpStream::connect(&cli.address)?;
    sock.set_read_timeout(Some(Duration::from_secs(cli.timeout)))?;
    let payload = cli.payload.as_bytes();

    let reply = if cli.tls.tls {
        let (Some(cert), Some(key), Some(ca)) = (&cli.tls.cert, &cli.tls.key, &cli.tls.ca) else {
            return Err("--tls needs --cert, --key and --ca".into());
        };
        let context = TlsContext::load(&TlsConfig::new(cert, key, Some(ca)))?;
        let server_name = ServerName::try_from(cli.tls.server_name.clone())?;
        let mut stream = context.wrap_client(sock, server_name, cli.tls.protocol.map(Into::into))?;
        println!(
            "negotiated {:?}",
            stream.conn.protocol_version().map(|v| format!("{:?}", v))
        );
        exchange(&mut stream, payload)?
    } else {
        let mut sock = sock;
        let reply = exchange(&mut sock, payload)?;
        let _ = sock.shutdown(Shutdown::Both);
        reply
    };

    println!("{}", String::from_utf8_lossy(&reply));
    if reply != payload {
        return Err("reply differs from payload".into());
    }
    Ok(())
}
