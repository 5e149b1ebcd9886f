//! Polls the host routing table for the active network path.
use super::NetworkObservation;
use futures::Stream;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

const ROUTE_TABLE: &str = "/proc/net/route";

#[derive(Debug, Clone)]
pub struct MonitorOptions {
    pub poll_interval: Duration,
    /// Endpoint whose reachability marks a path as validated
    pub probe_address: SocketAddr,
    pub probe_timeout: Duration,
}

/// Stream of path observations, yielding only when the
/// `(interface, validated)` pair changes.
pub fn route_monitor(options: MonitorOptions) -> Pin<Box<dyn Stream<Item = NetworkObservation> + Send>> {
    let stream = async_stream::stream! {
        info!(
            interval_ms = options.poll_interval.as_millis() as u64,
            probe = %options.probe_address,
            "Monitoring default route changes."
        );

        let mut ticker = tokio::time::interval(options.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last: Option<NetworkObservation> = None;

        loop {
            ticker.tick().await;

            let table = match tokio::fs::read_to_string(ROUTE_TABLE).await {
                Ok(table) => table,
                Err(e) => {
                    warn!("Failed to read {}: {}", ROUTE_TABLE, e);
                    return;
                }
            };

            let Some(interface) = default_route_interface(&table) else {
                debug!("No default route");
                continue;
            };

            let validated = probe(options.probe_address, options.probe_timeout).await;
            let observation = NetworkObservation::new(interface, validated);
            if last.as_ref() != Some(&observation) {
                debug!(network = %observation.network_id, validated, "Network path changed");
                last = Some(observation.clone());
                yield observation;
            }
        }
    };

    Box::pin(stream)
}

async fn probe(address: SocketAddr, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(address)).await,
        Ok(Ok(_))
    )
}

/// Interface of the lowest-metric default route in a `/proc/net/route` dump.
pub fn default_route_interface(table: &str) -> Option<String> {
    const RTF_UP: u32 = 0x1;

    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 8 {
                return None;
            }
            let flags = u32::from_str_radix(fields[3], 16).ok()?;
            let metric: u32 = fields[6].parse().ok()?;
            let is_default = fields[1] == "00000000" && fields[7] == "00000000";
            (is_default && flags & RTF_UP != 0).then(|| (metric, fields[0]))
        })
        .min_by_key(|(metric, _)| *metric)
        .map(|(_, interface)| interface.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str =
        "Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT";

    #[test]
    fn test_picks_lowest_metric_default_route() {
        let table = format!(
            "{HEADER}\n\
             wlan0\t00000000\t0101A8C0\t0003\t0\t0\t600\t00000000\t0\t0\t0\n\
             eth0\t00000000\t0100000A\t0003\t0\t0\t100\t00000000\t0\t0\t0\n\
             eth0\t0000000A\t00000000\t0001\t0\t0\t100\t00FFFFFF\t0\t0\t0\n"
        );
        assert_eq!(default_route_interface(&table).as_deref(), Some("eth0"));
    }

    #[test]
    fn test_ignores_routes_that_are_down() {
        let table = format!(
            "{HEADER}\n\
             eth0\t00000000\t0100000A\t0002\t0\t0\t100\t00000000\t0\t0\t0\n"
        );
        assert_eq!(default_route_interface(&table), None);
    }

    #[test]
    fn test_no_default_route() {
        let table = format!(
            "{HEADER}\n\
             eth0\t0000000A\t00000000\t0001\t0\t0\t100\t00FFFFFF\t0\t0\t0\n"
        );
        assert_eq!(default_route_interface(&table), None);
        assert_eq!(default_route_interface(""), None);
    }

    #[tokio::test]
    async fn test_probe_reports_reachability() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        assert!(probe(address, Duration::from_secs(1)).await);

        drop(listener);
        assert!(!probe(address, Duration::from_secs(1)).await);
    }
}
