//! HTTP POST snapshot pusher: a worker thread that periodically POSTs a
//! JPEG snapshot to a remote URL over a plain blocking TCP connection.
//!
//! Named by the original firmware's `http_post.h` orchestrator step but not
//! itself part of the filtered source pack; grounded on `http::server`'s
//! basic-auth header construction and blocking-socket idiom.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::HttpPostConfig;
use crate::hal::Hal;

pub struct PostSender {
    hal: Arc<dyn Hal>,
    config: HttpPostConfig,
    running: AtomicBool,
}

impl PostSender {
    pub fn new(hal: Arc<dyn Hal>, config: HttpPostConfig) -> Self {
        PostSender { hal, config, running: AtomicBool::new(true) }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn spawn(self: Arc<Self>) -> std::thread::JoinHandle<()> {
        std::thread::Builder::new()
            .name("http-post".into())
            .spawn(move || self.run())
            .expect("spawn http-post thread")
    }

    fn run(&self) {
        let interval = Duration::from_secs(self.config.interval.max(1) as u64);
        while self.running.load(Ordering::SeqCst) {
            if let Err(e) = self.send_once() {
                tracing::warn!(error = %e, host = %self.config.host, "http post snapshot failed");
            }
            std::thread::sleep(interval);
        }
    }

    fn send_once(&self) -> std::io::Result<()> {
        let jpeg = self.hal.snapshot(self.config.width, self.config.height, self.config.qfactor).map_err(std::io::Error::other)?;

        let mut stream = TcpStream::connect(&self.config.host)?;
        stream.set_write_timeout(Some(Duration::from_secs(10)))?;
        stream.set_read_timeout(Some(Duration::from_secs(10)))?;

        let mut request = format!(
            "POST {} HTTP/1.1\r\nHost: {}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n",
            self.config.url,
            self.config.host,
            jpeg.len()
        );
        if !self.config.login.is_empty() {
            let credentials = format!("{}:{}", self.config.login, self.config.password);
            request.push_str(&format!("Authorization: Basic {}\r\n", crate::util::base64_encode(credentials.as_bytes())));
        }
        request.push_str("Connection: close\r\n\r\n");

        stream.write_all(request.as_bytes())?;
        stream.write_all(&jpeg)?;

        // Drain and discard the response; only errors matter here.
        let mut buf = [0u8; 512];
        while stream.read(&mut buf)? > 0 {}
        Ok(())
    }
}

