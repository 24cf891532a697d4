//! Network change monitor
//!
//! Polls the endpoint interface every few seconds for up/down transitions
//! or a primary IPv4 change (DHCP renewal, WiFi roam). Either invalidates
//! the UDP stream pool and kicks every endpoint into reconnect: the old
//! crafted flows are dead the moment the source address moved.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use super::Client;

/// Poll interval.
pub(crate) const CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Snapshot of the interface state used for change detection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct NetworkState {
    pub interface_up: bool,
    pub local_ip: Option<Ipv4Addr>,
}

/// True when the state moved in a way that invalidates existing flows.
pub(crate) fn changed(prev: &NetworkState, curr: &NetworkState) -> bool {
    if prev.interface_up != curr.interface_up {
        return true;
    }
    matches!((&prev.local_ip, &curr.local_ip), (Some(a), Some(b)) if a != b)
}

pub(crate) async fn run(client: Arc<Client>) {
    let mut ticker = tokio::time::interval(CHECK_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let iface = client.cfg.network.interface.clone();
    let mut last = current_state(&iface);

    loop {
        tokio::select! {
            _ = client.cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let curr = current_state(&iface);
        if changed(&last, &curr) {
            tracing::info!(
                "network change detected (interface: {}->{}, IP: {:?}->{:?})",
                last.interface_up,
                curr.interface_up,
                last.local_ip,
                curr.local_ip
            );
            client.handle_network_change();
        }
        last = curr;
    }
}

#[cfg(target_os = "linux")]
pub(crate) fn current_state(interface: &str) -> NetworkState {
    NetworkState {
        interface_up: interface_up(interface),
        local_ip: primary_ipv4(interface),
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn current_state(_interface: &str) -> NetworkState {
    NetworkState::default()
}

#[cfg(target_os = "linux")]
fn interface_up(interface: &str) -> bool {
    let path = format!("/sys/class/net/{}/operstate", interface);
    match std::fs::read_to_string(path) {
        // "unknown" covers interfaces that never report carrier (tun,
        // loopback); treat those as up.
        Ok(state) => matches!(state.trim(), "up" | "unknown"),
        Err(_) => false,
    }
}

// First IPv4 address on the interface, via getifaddrs.
#[cfg(target_os = "linux")]
fn primary_ipv4(interface: &str) -> Option<Ipv4Addr> {
    use std::ffi::CStr;

    let mut addrs: *mut libc::ifaddrs = std::ptr::null_mut();
    if unsafe { libc::getifaddrs(&mut addrs) } != 0 {
        return None;
    }

    let mut found = None;
    let mut cursor = addrs;
    while !cursor.is_null() {
        let entry = unsafe { &*cursor };
        cursor = entry.ifa_next;

        if entry.ifa_name.is_null() || entry.ifa_addr.is_null() {
            continue;
        }
        let name = unsafe { CStr::from_ptr(entry.ifa_name) };
        if name.to_string_lossy() != interface {
            continue;
        }
        let sa = unsafe { &*entry.ifa_addr };
        if sa.sa_family as i32 != libc::AF_INET {
            continue;
        }
        let sin = unsafe { &*(entry.ifa_addr as *const libc::sockaddr_in) };
        found = Some(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)));
        break;
    }

    unsafe { libc::freeifaddrs(addrs) };
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(up: bool, ip: Option<&str>) -> NetworkState {
        NetworkState {
            interface_up: up,
            local_ip: ip.map(|s| s.parse().unwrap()),
        }
    }

    #[test]
    fn test_interface_flap_detected() {
        assert!(changed(
            &state(true, Some("10.0.0.1")),
            &state(false, Some("10.0.0.1"))
        ));
        assert!(changed(&state(false, None), &state(true, None)));
    }

    #[test]
    fn test_ip_change_detected() {
        assert!(changed(
            &state(true, Some("10.0.0.1")),
            &state(true, Some("10.0.0.2"))
        ));
    }

    #[test]
    fn test_transient_none_ignored() {
        // Losing or gaining the address alone is not a change; the flap
        // detection covers real outages.
        assert!(!changed(&state(true, Some("10.0.0.1")), &state(true, None)));
        assert!(!changed(&state(true, None), &state(true, Some("10.0.0.1"))));
    }

    #[test]
    fn test_steady_state_quiet() {
        assert!(!changed(
            &state(true, Some("10.0.0.1")),
            &state(true, Some("10.0.0.1"))
        ));
    }
}
