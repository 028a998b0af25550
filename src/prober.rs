use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::NetworkConfig;
use crate::database::CameraEndpoint;
use crate::errors::Result;
use crate::onvif::extract_xml_value;
use crate::utils::parse_cidr;

const DISCOVERY_ADDR: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
const DISCOVERY_PORT: u16 = 3702;

/// WS-Discovery probe type. Devices usually answer only one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DiscoveryDialect {
    NetworkVideoTransmitter,
    Device,
}

impl DiscoveryDialect {
    fn probe_type(&self) -> &'static str {
        match self {
            DiscoveryDialect::NetworkVideoTransmitter => "dn:NetworkVideoTransmitter",
            DiscoveryDialect::Device => "tds:Device",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource {
    Multicast(DiscoveryDialect),
    SubnetScan,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CameraCandidate {
    pub ip: String,
    pub port: u16,
    pub xaddr: Option<String>,
    pub source: CandidateSource,
}

impl CameraCandidate {
    pub fn endpoint(&self) -> CameraEndpoint {
        CameraEndpoint::new(self.ip.clone(), self.port)
    }
}

/// Network-level discovery. Holds no state between calls.
pub struct DeviceProber {
    network: NetworkConfig,
}

impl DeviceProber {
    pub fn new(network: NetworkConfig) -> Self {
        Self { network }
    }

    /// Runs both multicast dialects concurrently and merges by IP,
    /// preferring the NetworkVideoTransmitter answer
    pub async fn probe(&self) -> Result<Vec<CameraCandidate>> {
        let (primary, secondary) = tokio::join!(
            self.multicast_probe(DiscoveryDialect::NetworkVideoTransmitter),
            self.multicast_probe(DiscoveryDialect::Device),
        );

        let primary = primary.unwrap_or_else(|e| {
            warn!("NetworkVideoTransmitter discovery failed: {}", e);
            Vec::new()
        });
        let secondary = secondary.unwrap_or_else(|e| {
            warn!("Device discovery failed: {}", e);
            Vec::new()
        });

        let merged = merge_by_ip(primary, secondary);
        info!("Multicast discovery found {} camera candidates", merged.len());
        Ok(merged)
    }

    /// Multicast discovery followed by the subnet scan; multicast answers win per IP
    pub async fn discover(&self) -> Result<Vec<CameraCandidate>> {
        let multicast = self.probe().await?;
        let scanned = self.subnet_probe().await?;
        Ok(merge_by_ip(multicast, scanned))
    }

    async fn multicast_probe(&self, dialect: DiscoveryDialect) -> Result<Vec<CameraCandidate>> {
        let socket = self.discovery_socket()?;
        let message_id = format!("uuid:{}", Uuid::new_v4());
        let message = probe_message(dialect, &message_id);

        socket.send_to(message.as_bytes(), SocketAddr::new(IpAddr::V4(DISCOVERY_ADDR), DISCOVERY_PORT)).await?;
        debug!("Sent WS-Discovery probe ({:?}) {}", dialect, message_id);

        let deadline = Instant::now() + Duration::from_millis(self.network.multicast_wait_ms);
        let mut candidates = Vec::new();
        let mut buf = vec![0u8; 16 * 1024];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match timeout(remaining, socket.recv_from(&mut buf)).await {
                Ok(Ok((len, from))) => {
                    let xml = String::from_utf8_lossy(&buf[..len]);
                    trace!("WS-Discovery response from {}: {}", from, xml);
                    candidates.extend(parse_probe_match(&xml, dialect));
                }
                Ok(Err(e)) => {
                    warn!("WS-Discovery receive error: {}", e);
                    break;
                }
                Err(_) => break,
            }
        }

        Ok(candidates)
    }

    fn discovery_socket(&self) -> Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_multicast_ttl_v4(4)?;
        if let Some(interface) = &self.network.interface {
            let addr: Ipv4Addr = interface.parse()?;
            socket.set_multicast_if_v4(&addr)?;
        }
        socket.bind(&SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0).into())?;
        socket.set_nonblocking(true)?;
        Ok(UdpSocket::from_std(socket.into())?)
    }

    /// Every configured host × port, in address order; only accepting hosts are returned
    pub async fn subnet_probe(&self) -> Result<Vec<CameraCandidate>> {
        let mut targets = Vec::new();
        for subnet in &self.network.subnets {
            for ip in parse_cidr(subnet)? {
                for &port in &self.network.ports {
                    targets.push(SocketAddr::new(ip, port));
                }
            }
        }

        if targets.is_empty() {
            debug!("No subnets configured, skipping subnet probe");
            return Ok(Vec::new());
        }

        info!("Subnet probe over {} host/port pairs", targets.len());
        let socket_timeout = self.network.socket_timeout();

        let mut open: Vec<SocketAddr> = stream::iter(targets)
            .map(|addr| async move {
                match timeout(socket_timeout, TcpStream::connect(addr)).await {
                    Ok(Ok(_)) => Some(addr),
                    _ => None,
                }
            })
            .buffer_unordered(self.network.scan_concurrency.max(1))
            .filter_map(|addr| async move { addr })
            .collect()
            .await;

        open.sort();
        Ok(open.into_iter()
            .map(|addr| CameraCandidate {
                ip: addr.ip().to_string(),
                port: addr.port(),
                xaddr: None,
                source: CandidateSource::SubnetScan,
            })
            .collect())
    }

    /// Repeated timed connects until one succeeds or the probe window closes
    pub async fn is_reachable(&self, endpoint: &CameraEndpoint) -> bool {
        let addr = match endpoint.ip.parse::<IpAddr>() {
            Ok(ip) => SocketAddr::new(ip, endpoint.port),
            Err(_) => return false,
        };
        let deadline = Instant::now() + self.network.probe_timeout();
        let socket_timeout = self.network.socket_timeout();

        while Instant::now() < deadline {
            let attempt = socket_timeout.min(deadline.saturating_duration_since(Instant::now()));
            match timeout(attempt, TcpStream::connect(addr)).await {
                Ok(Ok(_)) => return true,
                Ok(Err(_)) => tokio::time::sleep(Duration::from_millis(100)).await,
                Err(_) => {}
            }
        }
        false
    }
}

pub fn probe_message(dialect: DiscoveryDialect, message_id: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <e:Envelope xmlns:e=\"http://www.w3.org/2003/05/soap-envelope\" \
          xmlns:w=\"http://schemas.xmlsoap.org/ws/2004/08/addressing\" \
          xmlns:d=\"http://schemas.xmlsoap.org/ws/2005/04/discovery\" \
          xmlns:dn=\"http://www.onvif.org/ver10/network/wsdl\" \
          xmlns:tds=\"http://www.onvif.org/ver10/device/wsdl\">\
         <e:Header>\
          <w:MessageID>{}</w:MessageID>\
          <w:To e:mustUnderstand=\"true\">urn:schemas-xmlsoap-org:ws:2005:04:discovery</w:To>\
          <w:Action e:mustUnderstand=\"true\">http://schemas.xmlsoap.org/ws/2005/04/discovery/Probe</w:Action>\
         </e:Header>\
         <e:Body><d:Probe><d:Types>{}</d:Types></d:Probe></e:Body>\
         </e:Envelope>",
        message_id,
        dialect.probe_type()
    )
}

/// Extracts IPv4 device service addresses from a ProbeMatches response
pub fn parse_probe_match(xml: &str, dialect: DiscoveryDialect) -> Vec<CameraCandidate> {
    if !xml.contains("ProbeMatch") {
        return Vec::new();
    }
    let xaddrs = match extract_xml_value(xml, "XAddrs") {
        Some(xaddrs) => xaddrs,
        None => return Vec::new(),
    };

    xaddrs.split_whitespace()
        .filter_map(|xaddr| {
            let url = url::Url::parse(xaddr).ok()?;
            let host = url.host_str()?;
            let ip: Ipv4Addr = host.parse().ok()?;
            Some(CameraCandidate {
                ip: ip.to_string(),
                port: url.port_or_known_default().unwrap_or(80),
                xaddr: Some(xaddr.to_string()),
                source: CandidateSource::Multicast(dialect),
            })
        })
        .collect()
}

/// One candidate per IP; entries from `primary` win over `secondary`
pub fn merge_by_ip(primary: Vec<CameraCandidate>, secondary: Vec<CameraCandidate>) -> Vec<CameraCandidate> {
    let mut merged: BTreeMap<String, CameraCandidate> = BTreeMap::new();
    for candidate in secondary {
        merged.entry(candidate.ip.clone()).or_insert(candidate);
    }
    let mut seen_primary = std::collections::HashSet::new();
    for candidate in primary {
        if seen_primary.insert(candidate.ip.clone()) {
            merged.insert(candidate.ip.clone(), candidate);
        }
    }
    merged.into_values().collect()
}

impl std::fmt::Display for CameraCandidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} ({:?})", self.ip, self.port, self.source)
    }
}
