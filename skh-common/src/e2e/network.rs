//! Network reachability probe for scenarios that talk to a remote repository.

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use crate::config::EnvParser;
use crate::errors::{HarnessError, HarnessResult};

/// Hosts tried in order; the first successful TCP connect wins.
pub const PROBE_TARGETS: [&str; 3] = [
    "github.com:443",
    "raw.githubusercontent.com:443",
    "8.8.8.8:443",
];

/// Forces the probe to report no network.
pub const OFFLINE_ENV_VAR: &str = "SKH_OFFLINE";

/// [`OFFLINE_ENV_VAR`] without the parser's `SKH_` prefix.
const OFFLINE_KEY: &str = "OFFLINE";

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Per-target probe results.
#[derive(Debug, Clone, Serialize)]
pub struct NetworkStatus {
    pub available: bool,
    pub forced_offline: bool,
    pub reachable: Vec<String>,
    pub unreachable: Vec<String>,
}

fn connect(target: &str, timeout: Duration) -> bool {
    let addrs: Vec<SocketAddr> = match target.to_socket_addrs() {
        Ok(addrs) => addrs.collect(),
        Err(err) => {
            debug!(target, error = %err, "Name resolution failed");
            return false;
        }
    };
    addrs
        .iter()
        .any(|addr| TcpStream::connect_timeout(addr, timeout).is_ok())
}

fn forced_offline() -> bool {
    forced_offline_in(&mut EnvParser::new())
}

fn forced_offline_in(parser: &mut EnvParser) -> bool {
    parser.get_bool(OFFLINE_KEY, false)
}

/// Whether any probe target accepts a TCP connection within `timeout`.
pub fn is_network_available(timeout: Duration) -> bool {
    if forced_offline() {
        debug!("Network probe skipped: offline mode forced");
        return false;
    }
    PROBE_TARGETS.iter().any(|target| connect(target, timeout))
}

/// Probe every target and report which were reachable.
pub fn network_status(timeout: Duration) -> NetworkStatus {
    if forced_offline() {
        return NetworkStatus {
            available: false,
            forced_offline: true,
            reachable: Vec::new(),
            unreachable: PROBE_TARGETS.iter().map(ToString::to_string).collect(),
        };
    }
    let (reachable, unreachable): (Vec<&str>, Vec<&str>) = PROBE_TARGETS
        .iter()
        .partition(|target| connect(target, timeout));
    NetworkStatus {
        available: !reachable.is_empty(),
        forced_offline: false,
        reachable: reachable.into_iter().map(str::to_string).collect(),
        unreachable: unreachable.into_iter().map(str::to_string).collect(),
    }
}

/// Fails with `EnvironmentSetup` when the network is unreachable, so
/// callers can skip network-dependent scenarios.
pub fn require_network() -> HarnessResult<()> {
    if is_network_available(DEFAULT_PROBE_TIMEOUT) {
        Ok(())
    } else {
        info!("Network unavailable, skipping network-dependent scenario");
        Err(HarnessError::EnvironmentSetup(
            "network unavailable".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_offline_flag_read_under_full_name() {
        let vars = |key: &str| HashMap::from([(key.to_string(), "1".to_string())]);
        assert!(forced_offline_in(&mut EnvParser::from_map(vars(OFFLINE_ENV_VAR))));
        assert!(!forced_offline_in(&mut EnvParser::from_map(vars("SKH_SKH_OFFLINE"))));
        assert!(!forced_offline_in(&mut EnvParser::from_map(HashMap::new())));
    }

    #[test]
    fn test_unresolvable_target_is_unreachable() {
        assert!(!connect("host.invalid:443", Duration::from_millis(200)));
    }

    #[test]
    fn test_local_listener_reachability() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(connect(&addr.to_string(), Duration::from_millis(200)));
    }
}
