//! Blocking HTTP/1.1 control API: listener, request parsing, CIDR
//! whitelist, basic-auth gate, and route dispatch.
//!
//! Ports `server.c`'s accept loop and `parse_request()`/`respond_request()`
//! pair, trading the fixed-size `http_request_t`/`client_fds` arrays for
//! owned `String`/`Vec<u8>` buffers and a thread-per-connection model.

pub mod onvif;
pub mod post;
pub mod routes;
mod server;

pub use server::{AppState, HttpServer, Request};
