use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

use crate::config::AppConfig;
use crate::delivery::DeliveryTable;
use crate::hal::Hal;
use crate::nightmode::NightController;
use crate::orchestrator::MediaControl;
use crate::osd::OsdCompositor;
use crate::record::Recorder;

use super::routes;

const MAX_REQUEST_BYTES: usize = 32 * 1024;

pub struct Request {
    pub method: String,
    pub uri: String,
    pub query: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    pub payload: Vec<u8>,
    pub peer: SocketAddr,
}

/// Shared state every connection handler and route dispatches against.
pub struct AppState {
    pub config: RwLock<AppConfig>,
    pub hal: Arc<dyn Hal>,
    pub delivery: Arc<DeliveryTable>,
    pub night: Arc<NightController>,
    pub osd: Arc<OsdCompositor>,
    pub recorder: Arc<Recorder>,
    pub media: Arc<MediaControl>,
    pub start: Instant,
    pub exit_requested: AtomicBool,
    pub config_path: PathBuf,
}

pub struct HttpServer {
    state: Arc<AppState>,
}

impl HttpServer {
    pub fn new(state: Arc<AppState>) -> Self {
        HttpServer { state }
    }

    pub fn spawn(self, bind: &str, port: u16) -> std::io::Result<std::thread::JoinHandle<()>> {
        let listener = TcpListener::bind((bind, port))?;
        let state = self.state;
        Ok(std::thread::Builder::new()
            .name("http-server".into())
            .spawn(move || accept_loop(listener, state))
            .expect("spawn http-server thread"))
    }
}

fn accept_loop(listener: TcpListener, state: Arc<AppState>) {
    for stream in listener.incoming() {
        let Ok(stream) = stream else { continue };
        let state = state.clone();
        std::thread::spawn(move || handle_connection(stream, state));
    }
}

fn handle_connection(mut stream: TcpStream, state: Arc<AppState>) {
    let peer = match stream.peer_addr() {
        Ok(p) => p,
        Err(_) => return,
    };

    let request = match read_request(&mut stream, peer) {
        Some(r) => r,
        None => return,
    };

    if !method_allowed(&request.method) {
        send_error(&mut stream, 405);
        return;
    }

    if !whitelist_allows(&state, peer.ip()) {
        send_error(&mut stream, 403);
        return;
    }

    if request.uri.starts_with("/onvif") {
        if request.method != "POST" {
            send_error(&mut stream, 405);
            return;
        }
        let response = onvif_dispatch(&state, &request);
        let _ = stream.write_all(response.as_bytes());
        return;
    }

    if !auth_ok(&state, &request, peer.ip()) {
        let body = b"HTTP/1.1 401 Unauthorized\r\nContent-Type: text/plain\r\n\
            WWW-Authenticate: Basic realm=\"Access the camera services\"\r\nConnection: close\r\n\r\n";
        let _ = stream.write_all(body);
        return;
    }

    routes::dispatch(&state, &request, stream);
}

fn method_allowed(method: &str) -> bool {
    method == "GET" || method == "POST"
}

fn read_request(stream: &mut TcpStream, peer: SocketAddr) -> Option<Request> {
    let mut reader = BufReader::new(stream.try_clone().ok()?);
    let mut line = String::new();
    if reader.read_line(&mut line).unwrap_or(0) == 0 {
        return None;
    }
    let mut parts = line.trim_end().splitn(3, ' ');
    let method = parts.next()?.to_string();
    let raw_uri = parts.next()?.to_string();
    let _proto = parts.next()?;

    let (uri, query) = split_query(&raw_uri);

    let mut headers = HashMap::new();
    loop {
        let mut header_line = String::new();
        if reader.read_line(&mut header_line).unwrap_or(0) == 0 {
            break;
        }
        let trimmed = header_line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        if let Some((k, v)) = trimmed.split_once(':') {
            headers.insert(k.trim().to_ascii_lowercase(), v.trim().to_string());
        }
        if headers.len() > 64 {
            break;
        }
    }

    let content_length: usize = headers.get("content-length").and_then(|v| v.parse().ok()).unwrap_or(0);
    let content_length = content_length.min(MAX_REQUEST_BYTES);
    let mut payload = vec![0u8; content_length];
    if content_length > 0 {
        let _ = reader.read_exact(&mut payload);
    }

    Some(Request { method, uri, query, headers, payload, peer })
}

fn split_query(raw_uri: &str) -> (String, HashMap<String, String>) {
    let Some((path, qs)) = raw_uri.split_once('?') else {
        return (raw_uri.to_string(), HashMap::new());
    };
    let mut query = HashMap::new();
    for pair in qs.split('&') {
        if pair.is_empty() {
            continue;
        }
        match pair.split_once('=') {
            Some((k, v)) => {
                query.insert(k.to_string(), v.to_string());
            }
            None => {
                query.insert(pair.to_string(), String::new());
            }
        }
    }
    (path.to_string(), query)
}

fn whitelist_allows(state: &AppState, client_ip: IpAddr) -> bool {
    let config = state.config.read();
    let whitelist: Vec<&String> = config.system.web_whitelist.iter().filter(|e| !e.trim().is_empty()).collect();
    if whitelist.is_empty() {
        return true;
    }
    whitelist.iter().any(|cidr| ip_in_cidr(client_ip, cidr))
}

/// Parses an IPv4 CIDR (`a.b.c.d/n`, or a bare address meaning `/32`) and
/// tests membership. IPv6 whitelist entries are rejected (never match),
/// matching the address family this firmware's network stack targets.
fn ip_in_cidr(ip: IpAddr, cidr: &str) -> bool {
    let IpAddr::V4(ip) = ip else { return false };
    let cidr = cidr.trim();
    let (addr_part, bits) = match cidr.split_once('/') {
        Some((a, b)) => (a, b.parse::<u32>().unwrap_or(32)),
        None => (cidr, 32),
    };
    let Ok(network) = addr_part.parse::<Ipv4Addr>() else { return false };
    let bits = bits.min(32);
    let mask = if bits == 0 { 0u32 } else { u32::MAX << (32 - bits) };
    (u32::from(ip) & mask) == (u32::from(network) & mask)
}

fn is_local_address(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

fn auth_ok(state: &AppState, request: &Request, peer_ip: IpAddr) -> bool {
    let config = state.config.read();
    if !config.system.web_enable_auth {
        return true;
    }
    if config.system.web_auth_skiplocal && is_local_address(peer_ip) {
        return true;
    }
    let expected = format!(
        "Basic {}",
        crate::util::base64_encode(format!("{}:{}", config.system.web_auth_user, config.system.web_auth_pass).as_bytes())
    );
    request.headers.get("authorization").is_some_and(|v| v == &expected)
}

fn onvif_dispatch(state: &AppState, request: &Request) -> String {
    super::onvif::handle(state, request)
}

pub fn send_error(stream: &mut TcpStream, code: u16) {
    let (msg, desc) = error_text(code);
    let body = format!("{{\"error\":\"{msg}\",\"description\":\"{desc}\"}}");
    let response = format!(
        "HTTP/1.1 {code} {msg}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = stream.write_all(response.as_bytes());
}

fn error_text(code: u16) -> (&'static str, &'static str) {
    match code {
        400 => ("Bad Request", "The server has no handler to the request."),
        401 => ("Unauthorized", "You are not authorized to access this resource."),
        403 => ("Forbidden", "You have been denied access to this resource."),
        404 => ("Not Found", "The requested resource was not found."),
        405 => ("Method Not Allowed", "This method is not handled on this endpoint."),
        500 => ("Internal Server Error", "An invalid operation was caught on this request."),
        501 => ("Not Implemented", "The server does not support the functionality."),
        _ => ("Error", "Unspecified error."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cidr_matches_exact_host_as_slash_32() {
        assert!(ip_in_cidr("192.168.1.5".parse().unwrap(), "192.168.1.5"));
        assert!(!ip_in_cidr("192.168.1.6".parse().unwrap(), "192.168.1.5"));
    }

    #[test]
    fn cidr_matches_subnet() {
        assert!(ip_in_cidr("10.0.0.200".parse().unwrap(), "10.0.0.0/24"));
        assert!(!ip_in_cidr("10.0.1.1".parse().unwrap(), "10.0.0.0/24"));
    }

    #[test]
    fn query_string_splits_into_pairs() {
        let (path, query) = split_query("/api/osd/2?save=1&text=hi");
        assert_eq!(path, "/api/osd/2");
        assert_eq!(query.get("save").map(String::as_str), Some("1"));
        assert_eq!(query.get("text").map(String::as_str), Some("hi"));
    }
}
