use std::net::IpAddr;
use anyhow::anyhow;
use tracing::debug;

/// Resolve a host name (or an IP address literal) to the first address the system resolver
///  returns for it
pub async fn lookup(hostname: &str) -> anyhow::Result<IpAddr> {
    resolve(hostname, |_| true).await
}

/// Resolve a host name to its first IPv4 address
pub async fn lookup_ipv4(hostname: &str) -> anyhow::Result<IpAddr> {
    resolve(hostname, |addr| addr.is_ipv4()).await
}

async fn resolve(hostname: &str, filter: impl Fn(&IpAddr) -> bool) -> anyhow::Result<IpAddr> {
    debug!("resolving host name {}", hostname);
    let result = tokio::net::lookup_host((hostname, 0)).await?
        .map(|addr| addr.ip())
        .find(|addr| filter(addr))
        .ok_or_else(|| anyhow!("no matching address found for {}", hostname))?;

    debug!("host name {} is {}", hostname, result);
    Ok(result)
}
