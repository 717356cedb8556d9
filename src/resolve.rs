//! Address resolution for forced address families.

use crate::error::{classify_io, TransportError, TransportErrorKind};
use crate::proxy::AddressFamily;

use std::net::SocketAddr;

/// Resolve `host` with the system resolver and keep the first address of `family`.
///
/// A lookup failure is transient; a host without any address of the family is not.
pub async fn resolve_family(
    host: &str,
    port: u16,
    family: AddressFamily,
) -> Result<SocketAddr, TransportError> {
    let host = host.trim_matches(|c| c == '[' || c == ']');
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| TransportError::new(classify_io(&e), format!("resolving {host}: {e}")))?;

    addrs.find(|addr| family.matches(&addr.ip())).ok_or_else(|| {
        TransportError::new(
            TransportErrorKind::Builder,
            format!("{host} has no {family:?} address"),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn literal_of_matching_family() {
        let addr = resolve_family("127.0.0.1", 8080, AddressFamily::Ipv4).await.unwrap();
        assert_eq!(addr, "127.0.0.1:8080".parse::<SocketAddr>().unwrap());

        let addr = resolve_family("[::1]", 443, AddressFamily::Ipv6).await.unwrap();
        assert_eq!(addr, "[::1]:443".parse::<SocketAddr>().unwrap());
    }

    #[tokio::test]
    async fn literal_of_other_family_is_fatal() {
        let err = resolve_family("127.0.0.1", 80, AddressFamily::Ipv6).await.unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::Builder);
        assert!(!err.is_transient());
    }
}
