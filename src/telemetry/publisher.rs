use std::io::{ErrorKind, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};

use anyhow::{bail, Context};
use log::{debug, info, warn};

use crate::telemetry::{TelemetryMessage, TelemetrySink};

/// `tcp://*:5555` -> `0.0.0.0:5555`
fn socket_address(address: &str) -> Result<String, anyhow::Error> {
    let Some(rest) = address.strip_prefix("tcp://") else {
        bail!("unsupported telemetry transport in '{}', expected tcp://host:port", address);
    };
    match rest.strip_prefix("*:") {
        Some(port) => Ok(format!("0.0.0.0:{}", port)),
        None => Ok(rest.to_string()),
    }
}

/// Newline-delimited JSON over TCP.  Subscribers connect at any time; a subscriber that
/// cannot take a message right away is disconnected.
#[derive(Debug)]
pub struct TcpPublisher {
    listener: Option<TcpListener>,
    subscribers: Vec<TcpStream>,
    sent: u64,
    dropped_subscribers: u64,
}

impl TcpPublisher {
    pub fn bind(address: &str) -> Result<Self, anyhow::Error> {
        let addr = socket_address(address)?;
        let listener =
            TcpListener::bind(&addr).with_context(|| format!("cannot bind telemetry to {}", addr))?;
        listener.set_nonblocking(true)?;
        info!("telemetry publisher listening on {}", addr);
        Ok(Self {
            listener: Some(listener),
            subscribers: Vec::new(),
            sent: 0,
            dropped_subscribers: 0,
        })
    }

    /// Binds, or returns a publisher that drops everything.
    pub fn bind_or_disabled(address: &str) -> Self {
        Self::bind(address).unwrap_or_else(|err| {
            warn!("{:#}; telemetry disabled", err);
            Self::disabled()
        })
    }

    pub fn disabled() -> Self {
        Self {
            listener: None,
            subscribers: Vec::new(),
            sent: 0,
            dropped_subscribers: 0,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn dropped_subscribers(&self) -> u64 {
        self.dropped_subscribers
    }

    fn accept_pending(&mut self) {
        let Some(listener) = &self.listener else {
            return;
        };
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if stream.set_nonblocking(true).is_ok() {
                        debug!("telemetry subscriber {} connected", peer);
                        self.subscribers.push(stream);
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => {
                    debug!("telemetry accept failed: {}", err);
                    break;
                }
            }
        }
    }
}

impl TelemetrySink for TcpPublisher {
    fn is_enabled(&self) -> bool {
        self.listener.is_some()
    }

    fn publish(&mut self, message: &TelemetryMessage) {
        if self.listener.is_none() {
            return;
        }
        self.accept_pending();
        if self.subscribers.is_empty() {
            return;
        }

        let mut line = message.to_line();
        line.push('\n');
        let before = self.subscribers.len();
        self.subscribers
            .retain_mut(|sub| sub.write_all(line.as_bytes()).is_ok());
        self.dropped_subscribers += (before - self.subscribers.len()) as u64;
        self.sent += 1;
    }
}
