#![cfg(test)]
#![allow(dead_code)]

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rustls::client::ServerName;
use rustls::{Certificate, ClientConfig, ClientConnection, RootCertStore, StreamOwned};
use std::error::Error;
use std::io::{self, Cursor, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;

pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
    pub peer_certificate: Vec<u8>,
}

/// Issues a blocking `GET` over TLS, trusting only `ca_pem`.
pub fn https_get(
    addr: SocketAddr,
    ca_pem: &str,
    path: &str,
    basic_auth: Option<(&str, &str)>,
) -> Result<HttpResponse, Box<dyn Error + Send + Sync>> {
    let mut roots = RootCertStore::empty();
    for der in rustls_pemfile::certs(&mut Cursor::new(ca_pem.as_bytes()))? {
        roots.add(&Certificate(der))?;
    }
    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let conn = ClientConnection::new(
        Arc::new(config),
        ServerName::try_from("localhost").map_err(|_| "invalid host")?,
    )?;
    let stream = TcpStream::connect(addr)?;
    let mut tls = StreamOwned::new(conn, stream);

    let mut request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n");
    if let Some((user, password)) = basic_auth {
        let encoded = STANDARD.encode(format!("{user}:{password}"));
        request.push_str(&format!("Authorization: Basic {encoded}\r\n"));
    }
    request.push_str("\r\n");
    tls.write_all(request.as_bytes())?;

    let mut response = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match tls.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => response.extend_from_slice(&buf[..n]),
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(Box::new(err)),
        }
    }
    let peer_certificate = tls
        .conn
        .peer_certificates()
        .and_then(|chain| chain.first())
        .map(|cert| cert.0.clone())
        .unwrap_or_default();
    let (status, body) = parse_http_response(&response)?;
    Ok(HttpResponse {
        status,
        body: body.to_vec(),
        peer_certificate,
    })
}

fn parse_http_response(buffer: &[u8]) -> Result<(u16, &[u8]), Box<dyn Error + Send + Sync>> {
    let header_end = buffer
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .ok_or("response missing header terminator")?;
    let header = std::str::from_utf8(&buffer[..header_end])?;
    let status = header
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .ok_or("missing HTTP status code")?
        .parse::<u16>()?;
    Ok((status, &buffer[header_end + 4..]))
}
