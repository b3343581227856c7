//! Socket tasks executing the commands of the two state machines.

use core::net::{IpAddr, Ipv4Addr};

use embassy_net::{Stack, dns::DnsQueryType};

pub mod tcp;
pub mod udp;

/// First IPv4 address of `host`, or `None` when the lookup fails.
async fn resolve(stack: Stack<'static>, host: &str) -> Option<Ipv4Addr> {
    let addresses = match stack.dns_query(host, DnsQueryType::A).await {
        Ok(addresses) => addresses,
        Err(err) => {
            log::debug!("DNS query for {host} failed: {err:?}");
            return None;
        }
    };
    addresses.iter().find_map(|&address| match IpAddr::from(address) {
        IpAddr::V4(address) => Some(address),
        IpAddr::V6(_) => None,
    })
}
