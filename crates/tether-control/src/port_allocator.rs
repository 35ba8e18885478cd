//! Public port allocation for agent sessions

use rand::seq::SliceRandom;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Default number of attempts for [`bind_public_listener`]
pub const DEFAULT_BIND_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum PortAllocatorError {
    #[error("No port available in range {0}")]
    NoPortAvailable(PortRange),

    #[error("Invalid port range '{input}': {reason}")]
    InvalidRange { input: String, reason: String },

    #[error("Failed to bind public listener on {address}:{port}: {reason}")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

/// Inclusive range of public ports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    start: u16,
    end: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 60000,
            end: 60999,
        }
    }
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Result<Self, PortAllocatorError> {
        if start == 0 {
            return Err(PortAllocatorError::InvalidRange {
                input: format!("{}-{}", start, end),
                reason: "port 0 is not allocatable".to_string(),
            });
        }
        if start > end {
            return Err(PortAllocatorError::InvalidRange {
                input: format!("{}-{}", start, end),
                reason: "start is greater than end".to_string(),
            });
        }
        Ok(Self { start, end })
    }

    /// Parse `"start-end"`, or a single port
    pub fn parse(input: &str) -> Result<Self, PortAllocatorError> {
        let invalid = |reason: &str| PortAllocatorError::InvalidRange {
            input: input.to_string(),
            reason: reason.to_string(),
        };

        let (start, end) = match input.trim().split_once('-') {
            Some((start, end)) => (start.trim(), end.trim()),
            None => (input.trim(), input.trim()),
        };

        let start: u16 = start.parse().map_err(|_| invalid("start is not a port number"))?;
        let end: u16 = end.parse().map_err(|_| invalid("end is not a port number"))?;
        Self::new(start, end)
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn end(&self) -> u16 {
        self.end
    }

    /// Number of ports in the range, never zero
    pub fn port_count(&self) -> u32 {
        u32::from(self.end) - u32::from(self.start) + 1
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    /// Reject ranges that overlap the control port or exceed `max_allowed_port`
    pub fn validate(&self, control_port: u16, max_allowed_port: u16) -> Result<(), PortAllocatorError> {
        if self.contains(control_port) {
            return Err(PortAllocatorError::InvalidRange {
                input: self.to_string(),
                reason: format!("range contains the control port {}", control_port),
            });
        }
        if self.end > max_allowed_port {
            return Err(PortAllocatorError::InvalidRange {
                input: self.to_string(),
                reason: format!("ports above {} are not allowed", max_allowed_port),
            });
        }
        Ok(())
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl FromStr for PortRange {
    type Err = PortAllocatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Picks a free public port for a new agent session
///
/// Implementations must be safe to call from concurrent handshakes.
pub trait PortAllocator: Send + Sync {
    fn allocate(&self) -> Result<u16, PortAllocatorError>;
}

/// Probes a randomized permutation of the range
#[derive(Debug, Clone)]
pub struct RandomPortAllocator {
    bind_ip: IpAddr,
    range: PortRange,
}

impl RandomPortAllocator {
    pub fn new(bind_ip: IpAddr, range: PortRange) -> Self {
        Self { bind_ip, range }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Check if a port is actually available at the OS level
    fn is_port_available(&self, port: u16) -> bool {
        std::net::TcpListener::bind((self.bind_ip, port)).is_ok()
    }
}

impl PortAllocator for RandomPortAllocator {
    fn allocate(&self) -> Result<u16, PortAllocatorError> {
        let mut offsets: Vec<u32> = (0..self.range.port_count()).collect();
        offsets.shuffle(&mut rand::thread_rng());

        for offset in offsets {
            // offset < port_count, so this stays within start..=end
            let port = self.range.start + offset as u16;
            if self.is_port_available(port) {
                debug!("Allocated port {} from {}", port, self.range);
                return Ok(port);
            }
        }

        warn!("No free port left in range {}", self.range);
        Err(PortAllocatorError::NoPortAvailable(self.range))
    }
}

/// Allocate a port and bind the public listener on it.
///
/// The allocator's probe releases the port before we bind, so another
/// process can grab it in between. `AddrInUse` triggers a fresh allocation,
/// up to `attempts` times.
pub async fn bind_public_listener(
    allocator: &dyn PortAllocator,
    bind_ip: IpAddr,
    attempts: u32,
) -> Result<TcpListener, PortAllocatorError> {
    let attempts = attempts.max(1);

    for attempt in 1..=attempts {
        let port = allocator.allocate()?;

        match TcpListener::bind((bind_ip, port)).await {
            Ok(listener) => {
                if attempt > 1 {
                    info!(
                        "Successfully bound to {}:{} on attempt {}/{}",
                        bind_ip, port, attempt, attempts
                    );
                }
                return Ok(listener);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && attempt < attempts => {
                warn!(
                    "Port {} was taken after probing (attempt {}/{}), allocating another",
                    port, attempt, attempts
                );
            }
            Err(e) => {
                return Err(PortAllocatorError::BindError {
                    address: bind_ip.to_string(),
                    port,
                    reason: e.to_string(),
                });
            }
        }
    }

    Err(PortAllocatorError::BindError {
        address: bind_ip.to_string(),
        port: 0,
        reason: format!("Address in use after {} attempts", attempts),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[test]
    fn test_parse_range() {
        let range = PortRange::parse("60000-61000").unwrap();
        assert_eq!(range.start(), 60000);
        assert_eq!(range.end(), 61000);
        assert_eq!(range.port_count(), 1001);
        assert_eq!(range.to_string(), "60000-61000");

        let single: PortRange = "7000".parse().unwrap();
        assert_eq!(single.port_count(), 1);
        assert!(single.contains(7000));
    }

    #[test]
    fn test_parse_range_rejects_garbage() {
        assert!(PortRange::parse("abc-100").is_err());
        assert!(PortRange::parse("100-").is_err());
        assert!(PortRange::parse("2000-1000").is_err());
        assert!(PortRange::parse("0-10").is_err());
        assert!(PortRange::parse("70000-70001").is_err());
    }

    #[test]
    fn test_validate_against_control_port_and_maximum() {
        let range = PortRange::new(60000, 61000).unwrap();
        assert!(range.validate(8080, 65535).is_ok());
        assert!(range.validate(60500, 65535).is_err());
        assert!(range.validate(8080, 60999).is_err());
    }

    #[test]
    fn test_random_allocator_stays_in_range() {
        // Grab an OS-assigned port and build a small range around it
        let probe = std::net::TcpListener::bind((LOCALHOST, 0)).unwrap();
        let base = probe.local_addr().unwrap().port();
        drop(probe);

        let start = base.saturating_sub(5).clamp(1024, 65000);
        let range = PortRange::new(start, start + 10).unwrap();
        let allocator = RandomPortAllocator::new(LOCALHOST, range);

        for _ in 0..5 {
            let port = allocator.allocate().unwrap();
            assert!(range.contains(port));
        }
    }

    #[test]
    fn test_exhausted_range() {
        let held = std::net::TcpListener::bind((LOCALHOST, 0)).unwrap();
        let port = held.local_addr().unwrap().port();

        let allocator = RandomPortAllocator::new(LOCALHOST, PortRange::new(port, port).unwrap());
        assert!(matches!(
            allocator.allocate(),
            Err(PortAllocatorError::NoPortAvailable(_))
        ));
    }

    /// Hands out a fixed sequence of ports
    struct ScriptedAllocator {
        ports: Mutex<Vec<u16>>,
    }

    impl PortAllocator for ScriptedAllocator {
        fn allocate(&self) -> Result<u16, PortAllocatorError> {
            self.ports
                .lock()
                .unwrap()
                .pop()
                .ok_or(PortAllocatorError::NoPortAvailable(PortRange::default()))
        }
    }

    #[tokio::test]
    async fn test_bind_retries_after_addr_in_use() {
        let held = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        let taken = held.local_addr().unwrap().port();

        // pop() order: taken first, then 0 (any free port)
        let allocator = ScriptedAllocator {
            ports: Mutex::new(vec![0, taken]),
        };

        let listener = bind_public_listener(&allocator, LOCALHOST, 3).await.unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), taken);
    }

    #[tokio::test]
    async fn test_bind_gives_up_after_attempts() {
        let held = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        let taken = held.local_addr().unwrap().port();

        let allocator = ScriptedAllocator {
            ports: Mutex::new(vec![taken, taken]),
        };

        let result = bind_public_listener(&allocator, LOCALHOST, 2).await;
        assert!(matches!(result, Err(PortAllocatorError::BindError { .. })));
    }
}
