//! TCP port discovery and advisory in-process reservations.
//!
//! Availability is decided by binding a throwaway listener and dropping it
//! again. Nothing stops another process from taking the port between the probe
//! and the real bind, so a returned port is a strong hint, not a guarantee.
//! Reservations only stop *this* process from handing the same port out twice.

use anyhow::{anyhow, Result};
use port_killer::kill as kill_processes_on_port;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, span, warn, Instrument, Level};

/// Host used for probe binds. The wildcard address conflicts with listeners on
/// any interface, which is what the dashboard binds to.
pub const PROBE_HOST: &str = "0.0.0.0";
const DEFAULT_RANGE_SPAN: u16 = 100;
const MAX_CLAIM_ATTEMPTS: usize = 16;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PortError {
    #[error("no available port: preferred {preferred}, searched {start}-{end}")]
    NoPortAvailable { preferred: u16, start: u16, end: u16 },
    #[error("invalid port range {start}-{end}")]
    InvalidRange { start: u16, end: u16 },
}

#[derive(Debug, Clone, Default)]
pub struct PortSearch {
    /// Inclusive range to scan. Defaults to `preferred..=preferred + 100`.
    pub range: Option<(u16, u16)>,
    /// Ports never to return, regardless of bindability.
    pub avoid: Vec<u16>,
    /// Also skip ports held in this allocator's reservation set.
    pub respect_reservations: bool,
}

impl PortSearch {
    pub fn new() -> Self {
        Self {
            range: None,
            avoid: Vec::new(),
            respect_reservations: true,
        }
    }

    pub fn range(mut self, start: u16, end: u16) -> Self {
        self.range = Some((start, end));
        self
    }

    pub fn avoid(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.avoid.extend(ports);
        self
    }

    pub fn ignore_reservations(mut self) -> Self {
        self.respect_reservations = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PortAllocation {
    pub port: u16,
    pub is_preferred: bool,
    pub message: String,
}

/// Owns the set of ports this process has claimed.
#[derive(Debug, Default)]
pub struct PortAllocator {
    reserved: Mutex<HashMap<u16, String>>,
}

/// Returns true when a listener can be bound on `port` right now.
pub async fn is_port_available(port: u16) -> bool {
    match tokio::net::TcpListener::bind((PROBE_HOST, port)).await {
        Ok(listener) => {
            drop(listener);
            true
        }
        Err(e) => {
            debug!(target: "viralcast::terminal::port", port, error = %e, "Probe bind failed.");
            false
        }
    }
}

fn candidate_ports(preferred: u16, search: &PortSearch) -> Result<Vec<u16>, PortError> {
    let (start, end) = search
        .range
        .unwrap_or((preferred, preferred.saturating_add(DEFAULT_RANGE_SPAN)));
    if start > end || start == 0 {
        return Err(PortError::InvalidRange { start, end });
    }

    if (start..=end).contains(&preferred) {
        Ok((preferred..=end).collect())
    } else {
        let mut ports = Vec::with_capacity(usize::from(end - start) + 2);
        if preferred != 0 {
            ports.push(preferred);
        }
        ports.extend(start..=end);
        Ok(ports)
    }
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scans for a bindable port, starting at `preferred`.
    pub async fn find_available_port(
        &self,
        preferred: u16,
        search: &PortSearch,
    ) -> Result<PortAllocation, PortError> {
        let span = span!(Level::DEBUG, "find_available_port", preferred);
        self.scan(preferred, search).instrument(span).await
    }

    async fn scan(&self, preferred: u16, search: &PortSearch) -> Result<PortAllocation, PortError> {
        let candidates = candidate_ports(preferred, search)?;
        let (start, end) = search
            .range
            .unwrap_or((preferred, preferred.saturating_add(DEFAULT_RANGE_SPAN)));

        for port in candidates {
            if search.avoid.contains(&port) {
                debug!(target: "viralcast::terminal::port", port, "Skipping excluded port.");
                continue;
            }
            if search.respect_reservations && self.is_reserved(port) {
                debug!(target: "viralcast::terminal::port", port, "Skipping reserved port.");
                continue;
            }
            if is_port_available(port).await {
                let is_preferred = port == preferred;
                let message = if is_preferred {
                    format!("Using preferred port {}", port)
                } else {
                    format!("Port {} is in use, using port {} instead", preferred, port)
                };
                info!(target: "viralcast::terminal::port", port, preferred, is_preferred, "Found available port.");
                return Ok(PortAllocation {
                    port,
                    is_preferred,
                    message,
                });
            }
        }

        warn!(target: "viralcast::terminal::port", preferred, start, end, "No available port in range.");
        Err(PortError::NoPortAvailable {
            preferred,
            start,
            end,
        })
    }

    /// Finds a port and reserves it under `tag`.
    pub async fn claim(
        &self,
        preferred: u16,
        search: &PortSearch,
        tag: &str,
    ) -> Result<PortAllocation, PortError> {
        let mut search = search.clone();
        search.respect_reservations = true;
        let mut last_err = None;
        for _ in 0..MAX_CLAIM_ATTEMPTS {
            match self.find_available_port(preferred, &search).await {
                Ok(allocation) => {
                    if self.reserve(allocation.port, tag) {
                        return Ok(allocation);
                    }
                    // Lost the race to another in-process caller.
                    search.avoid.push(allocation.port);
                }
                Err(e) => {
                    last_err = Some(e);
                    break;
                }
            }
        }
        Err(last_err.unwrap_or(PortError::NoPortAvailable {
            preferred,
            start: preferred,
            end: preferred.saturating_add(DEFAULT_RANGE_SPAN),
        }))
    }

    /// Reserves `port` for `tag`. Returns false if another tag holds it.
    pub fn reserve(&self, port: u16, tag: &str) -> bool {
        let mut reserved = self.reserved.lock().unwrap_or_else(|p| p.into_inner());
        match reserved.get(&port) {
            Some(holder) => holder == tag,
            None => {
                reserved.insert(port, tag.to_string());
                debug!(target: "viralcast::terminal::port", port, tag, "Port reserved.");
                true
            }
        }
    }

    pub fn release(&self, port: u16) -> bool {
        let mut reserved = self.reserved.lock().unwrap_or_else(|p| p.into_inner());
        reserved.remove(&port).is_some()
    }

    pub fn release_all(&self) {
        let mut reserved = self.reserved.lock().unwrap_or_else(|p| p.into_inner());
        if !reserved.is_empty() {
            info!(target: "viralcast::terminal::port", count = reserved.len(), "Releasing all port reservations.");
        }
        reserved.clear();
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        let reserved = self.reserved.lock().unwrap_or_else(|p| p.into_inner());
        reserved.contains_key(&port)
    }

    /// Snapshot of current reservations, sorted by port.
    pub fn reservations(&self) -> Vec<(u16, String)> {
        let reserved = self.reserved.lock().unwrap_or_else(|p| p.into_inner());
        let mut out: Vec<_> = reserved.iter().map(|(p, t)| (*p, t.clone())).collect();
        out.sort_by_key(|(p, _)| *p);
        out
    }
}

/// Ensures that a given TCP port is free. If occupied, it attempts to terminate the process.
pub async fn ensure_port_is_free(port: u16, service_name: &str) -> Result<()> {
    let span = span!(Level::INFO, "ensure_port_is_free", %port, service_name);
    let _enter = span.enter();

    if is_port_available(port).await {
        debug!(target: "viralcast::terminal::port", port, service_name, "Port already free.");
        return Ok(());
    }

    match kill_processes_on_port(port) {
        Ok(true) => {
            info!(
                target: "viralcast::terminal::port",
                port,
                service_name,
                "Killed process(es) holding the port. Verifying release..."
            );
            sleep(Duration::from_millis(1000)).await;

            if is_port_available(port).await {
                info!(target: "viralcast::terminal::port", port, service_name, "Port freed and verified by test bind.");
                Ok(())
            } else {
                error!(target: "viralcast::terminal::port", port, service_name, "Port still in use after kill.");
                Err(anyhow!(
                    "terminal::port::ensure_port_is_free: port {} for {} is still in use after killing its holder",
                    port,
                    service_name
                ))
            }
        }
        Ok(false) => {
            warn!(target: "viralcast::terminal::port", port, service_name, "Port is busy but no owning process was found.");
            Err(anyhow!(
                "terminal::port::ensure_port_is_free: port {} for {} is busy and its owner could not be found",
                port,
                service_name
            ))
        }
        Err(e) => {
            error!(target: "viralcast::terminal::port", port, service_name, error = ?e, "port_killer::kill failed.");
            Err(anyhow!(e).context(format!(
                "terminal::port::ensure_port_is_free: port_killer::kill failed for port {} (service: {})",
                port, service_name
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener as StdListener;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    fn hold(port: u16) -> StdListener {
        StdListener::bind(("127.0.0.1", port))
            .unwrap_or_else(|e| panic!("test setup could not bind port {}: {}", port, e))
    }

    #[tokio::test]
    async fn preferred_port_is_used_when_free() {
        init_tracing();
        let allocator = PortAllocator::new();
        let result = allocator
            .find_available_port(47310, &PortSearch::new().range(47310, 47315))
            .await
            .unwrap();
        assert_eq!(result.port, 47310);
        assert!(result.is_preferred);
    }

    #[tokio::test]
    async fn skips_externally_bound_ports() {
        init_tracing();
        let _a = hold(47320);
        let _b = hold(47321);
        let _c = hold(47322);
        let allocator = PortAllocator::new();
        let result = allocator
            .find_available_port(47320, &PortSearch::new().range(47320, 47325))
            .await
            .unwrap();
        assert_eq!(result.port, 47323);
        assert!(!result.is_preferred);
        assert!(result.message.contains("47323"));
    }

    #[tokio::test]
    async fn fails_when_range_is_exhausted() {
        init_tracing();
        let _a = hold(47330);
        let _b = hold(47331);
        let allocator = PortAllocator::new();
        let err = allocator
            .find_available_port(47330, &PortSearch::new().range(47330, 47331))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            PortError::NoPortAvailable {
                preferred: 47330,
                start: 47330,
                end: 47331
            }
        );
    }

    #[tokio::test]
    async fn reserved_and_avoided_ports_are_skipped() {
        init_tracing();
        let allocator = PortAllocator::new();
        assert!(allocator.reserve(47340, "dashboard"));
        let result = allocator
            .find_available_port(47340, &PortSearch::new().range(47340, 47345).avoid([47341]))
            .await
            .unwrap();
        assert_eq!(result.port, 47342);

        let ignoring = allocator
            .find_available_port(47340, &PortSearch::new().range(47340, 47345).ignore_reservations())
            .await
            .unwrap();
        assert_eq!(ignoring.port, 47340);
    }

    #[tokio::test]
    async fn preferred_outside_range_is_tried_first() {
        init_tracing();
        let allocator = PortAllocator::new();
        let result = allocator
            .find_available_port(47350, &PortSearch::new().range(47360, 47362))
            .await
            .unwrap();
        assert_eq!(result.port, 47350);

        let _held = hold(47351);
        let fallback = allocator
            .find_available_port(47351, &PortSearch::new().range(47360, 47362))
            .await
            .unwrap();
        assert_eq!(fallback.port, 47360);
    }

    #[tokio::test]
    async fn claim_never_hands_out_a_held_reservation() {
        init_tracing();
        let allocator = PortAllocator::new();
        let first = allocator
            .claim(47370, &PortSearch::new().range(47370, 47375), "first")
            .await
            .unwrap();
        let second = allocator
            .claim(47370, &PortSearch::new().range(47370, 47375), "second")
            .await
            .unwrap();
        assert_eq!(first.port, 47370);
        assert_ne!(first.port, second.port);
        assert_eq!(allocator.reservations().len(), 2);

        allocator.release_all();
        assert!(allocator.reservations().is_empty());
    }

    #[test]
    fn reservation_has_set_semantics() {
        let allocator = PortAllocator::new();
        assert!(allocator.reserve(47380, "a"));
        assert!(allocator.reserve(47380, "a"));
        assert!(!allocator.reserve(47380, "b"));
        assert_eq!(allocator.reservations(), vec![(47380, "a".to_string())]);
        assert!(allocator.release(47380));
        assert!(!allocator.release(47380));
        assert!(!allocator.is_reserved(47380));
    }

    #[tokio::test]
    async fn scan_can_run_on_a_spawned_task() {
        init_tracing();
        let allocator = std::sync::Arc::new(PortAllocator::new());
        let shared = allocator.clone();
        // tokio::spawn requires a Send future across every await.
        let allocation = tokio::spawn(async move {
            shared
                .find_available_port(47395, &PortSearch::new().range(47395, 47399))
                .await
        })
        .await
        .unwrap()
        .unwrap();
        assert!((47395..=47399).contains(&allocation.port));
    }

    #[test]
    fn rejects_inverted_range() {
        let err = candidate_ports(10, &PortSearch::new().range(20, 10)).unwrap_err();
        assert_eq!(err, PortError::InvalidRange { start: 20, end: 10 });
    }

    #[tokio::test]
    async fn ensure_port_is_free_succeeds_for_free_port() {
        init_tracing();
        let result = ensure_port_is_free(47390, "test_free_port_service").await;
        assert!(result.is_ok(), "ensure_port_is_free failed: {:?}", result.err());
    }
}
