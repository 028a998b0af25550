use std::net::{IpAddr, Ipv4Addr};
use crate::errors::{Result, EdgeError};

/// Expand CIDR notation (or a single address) into the list of host addresses.
/// Network and broadcast addresses are skipped except for /31 and /32.
pub fn parse_cidr(cidr: &str) -> Result<Vec<IpAddr>> {
    if !cidr.contains('/') {
        let ip: IpAddr = cidr.trim().parse()?;
        return Ok(vec![ip]);
    }

    let (base, prefix) = cidr.split_once('/')
        .ok_or_else(|| EdgeError::config(format!("Invalid CIDR format: {}", cidr)))?;

    let base_ip: Ipv4Addr = base.trim().parse()?;
    let prefix: u8 = prefix.trim().parse()
        .map_err(|_| EdgeError::config(format!("Invalid prefix in CIDR: {}", cidr)))?;

    if prefix > 32 {
        return Err(EdgeError::config(format!("Invalid prefix: {} (must be 0-32)", prefix)));
    }
    if prefix < 16 {
        return Err(EdgeError::config(format!("Refusing to scan /{} network {}, use /16 or smaller", prefix, cidr)));
    }

    let base_u32 = u32::from(base_ip);
    let mask = if prefix == 0 { 0 } else { !((1u32 << (32 - prefix)) - 1) };
    let network = base_u32 & mask;
    let broadcast = network | !mask;

    let (start, end) = if prefix >= 31 {
        (network, broadcast)
    } else {
        (network + 1, broadcast - 1)
    };

    Ok((start..=end).map(|ip| IpAddr::V4(Ipv4Addr::from(ip))).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cidr() {
        let hosts = parse_cidr("192.168.1.0/24").unwrap();
        assert_eq!(hosts.len(), 254);
        assert_eq!(hosts[0], "192.168.1.1".parse::<IpAddr>().unwrap());
        assert_eq!(hosts[253], "192.168.1.254".parse::<IpAddr>().unwrap());

        let hosts = parse_cidr("10.0.0.17/30").unwrap();
        assert_eq!(hosts, vec![
            "10.0.0.17".parse::<IpAddr>().unwrap(),
            "10.0.0.18".parse::<IpAddr>().unwrap(),
        ]);

        assert_eq!(parse_cidr("10.0.0.5").unwrap().len(), 1);
        assert!(parse_cidr("10.0.0.0/33").is_err());
        assert!(parse_cidr("10.0.0.0/8").is_err());
        assert!(parse_cidr("not-an-ip/24").is_err());
    }
}
