//! Concurrent TCP reachability probing.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{self, Instant};
use tracing::{debug, warn};

use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScanOptions {
    pub concurrency: usize,
    pub connect_timeout: Duration,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            concurrency: 64,
            connect_timeout: Duration::from_millis(500),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PortProbe {
    pub port: u16,
    pub open: bool,
    pub latency_ms: Option<u64>,
}

/// Probes every port with at most `concurrency` connects in flight and
/// returns one result per distinct port, ordered by port.
pub async fn scan_ports(host: &str, ports: &[u16], opts: ScanOptions) -> Vec<PortProbe> {
    let mut ports = ports.to_vec();
    ports.sort_unstable();
    ports.dedup();

    let limit = Arc::new(Semaphore::new(opts.concurrency.max(1)));
    let host: Arc<str> = Arc::from(host);
    let mut probes = JoinSet::new();

    for port in ports.iter().copied() {
        let limit = Arc::clone(&limit);
        let host = Arc::clone(&host);
        let timeout = opts.connect_timeout;
        probes.spawn(async move {
            let _permit = limit.acquire_owned().await;
            probe(&host, port, timeout).await
        });
    }

    let mut results = Vec::with_capacity(ports.len());
    while let Some(joined) = probes.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(err) => warn!(error = %err, "port probe task failed"),
        }
    }
    results.sort_by_key(|r| r.port);
    results
}

async fn probe(host: &str, port: u16, timeout: Duration) -> PortProbe {
    let started = Instant::now();
    match time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(_stream)) => PortProbe {
            port,
            open: true,
            latency_ms: Some(started.elapsed().as_millis() as u64),
        },
        Ok(Err(err)) => {
            debug!(host, port, error = %err, "connect refused");
            PortProbe {
                port,
                open: false,
                latency_ms: None,
            }
        }
        Err(_) => PortProbe {
            port,
            open: false,
            latency_ms: None,
        },
    }
}

/// Parses `22,80,8000-8010` into a port list.
pub fn parse_port_list(spec: &str) -> Result<Vec<u16>> {
    let mut ports = Vec::new();
    for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let bad = || Error::InvalidArgument(format!("invalid port or range: {part}"));
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: u16 = lo.trim().parse().map_err(|_| bad())?;
                let hi: u16 = hi.trim().parse().map_err(|_| bad())?;
                if lo == 0 || lo > hi {
                    return Err(bad());
                }
                ports.extend(lo..=hi);
            }
            None => {
                let port: u16 = part.parse().map_err(|_| bad())?;
                if port == 0 {
                    return Err(bad());
                }
                ports.push(port);
            }
        }
    }
    if ports.is_empty() {
        return Err(Error::InvalidArgument("no ports given".into()));
    }
    Ok(ports)
}
