//! Socket address handling: name/service pairs and raw sockaddr plumbing.

use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};

use crate::error::{Error, Result};

/// Address as configured (host name + service) plus its resolution.
///
/// Equality and hashing consider the resolved address and port only, so two
/// differently spelled names of the same endpoint collapse into one key.
#[derive(Debug, Clone)]
pub struct SocketAddress {
  name: String,
  service: String,
  resolved: Option<SocketAddr>,
}

impl SocketAddress {
  pub fn new(name: impl Into<String>, service: impl Into<String>) -> Self {
    SocketAddress { name: name.into(), service: service.into(), resolved: None }
  }

  pub fn from_addr(addr: SocketAddr) -> Self {
    SocketAddress {
      name: addr.ip().to_string(),
      service: addr.port().to_string(),
      resolved: Some(addr),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn service(&self) -> &str {
    &self.service
  }

  pub fn is_resolved(&self) -> bool {
    self.resolved.is_some()
  }

  pub fn resolved(&self) -> Option<SocketAddr> {
    self.resolved
  }

  /// Resolves the name/service pair, caching the first result.
  pub fn resolve(&mut self) -> Result<SocketAddr> {
    if let Some(addr) = self.resolved {
      return Ok(addr);
    }
    let spec = format!("{}:{}", self.name, self.service);
    let addr = spec
      .to_socket_addrs()
      .map_err(|e| Error::NotFound(format!("cannot resolve {spec}: {e}")))?
      .next()
      .ok_or_else(|| Error::NotFound(format!("no addresses for {spec}")))?;
    self.resolved = Some(addr);
    Ok(addr)
  }

  pub fn to_string_repr(&self) -> String {
    match self.resolved {
      Some(addr) => addr.to_string(),
      None => format!("{}:{}", self.name, self.service),
    }
  }
}

impl PartialEq for SocketAddress {
  fn eq(&self, other: &Self) -> bool {
    match (self.resolved, other.resolved) {
      (Some(a), Some(b)) => a.ip() == b.ip() && a.port() == b.port(),
      _ => self.name == other.name && self.service == other.service,
    }
  }
}

impl Eq for SocketAddress {}

impl Hash for SocketAddress {
  fn hash<H: Hasher>(&self, state: &mut H) {
    match self.resolved {
      Some(addr) => {
        addr.ip().hash(state);
        addr.port().hash(state);
      }
      None => {
        self.name.hash(state);
        self.service.hash(state);
      }
    }
  }
}

impl std::fmt::Display for SocketAddress {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.to_string_repr())
  }
}

/// Converts a filled `sockaddr_storage` into a std address.
pub(crate) fn sockaddr_to_std(
  storage: &libc::sockaddr_storage,
) -> Option<SocketAddr> {
  match storage.ss_family as libc::c_int {
    libc::AF_INET => {
      let v4: &libc::sockaddr_in =
        unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
      let ip = Ipv4Addr::from(u32::from_be(v4.sin_addr.s_addr));
      Some(SocketAddr::new(IpAddr::V4(ip), u16::from_be(v4.sin_port)))
    }
    libc::AF_INET6 => {
      let v6: &libc::sockaddr_in6 =
        unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
      let ip = Ipv6Addr::from(v6.sin6_addr.s6_addr);
      Some(SocketAddr::new(IpAddr::V6(ip), u16::from_be(v6.sin6_port)))
    }
    _ => None,
  }
}

/// Converts a std address into `sockaddr_storage` plus its length.
pub(crate) fn std_to_sockaddr(
  addr: &SocketAddr,
) -> (libc::sockaddr_storage, libc::socklen_t) {
  let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
  match addr {
    SocketAddr::V4(v4) => {
      let sin: &mut libc::sockaddr_in =
        unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
      sin.sin_family = libc::AF_INET as libc::sa_family_t;
      sin.sin_port = v4.port().to_be();
      sin.sin_addr.s_addr = u32::from(*v4.ip()).to_be();
      (storage, std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
    }
    SocketAddr::V6(v6) => {
      let sin6: &mut libc::sockaddr_in6 =
        unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
      sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
      sin6.sin6_port = v6.port().to_be();
      sin6.sin6_addr.s6_addr = v6.ip().octets();
      sin6.sin6_scope_id = v6.scope_id();
      (storage, std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashSet;

  #[test]
  fn test_equality_ignores_name_spelling() {
    let a = SocketAddress::from_addr("127.0.0.1:5555".parse().unwrap());
    let mut b = SocketAddress::new("localhost", "5555");
    b.resolve().unwrap();
    if b.resolved().unwrap().is_ipv4() {
      assert_eq!(a, b);
    }
  }

  #[test]
  fn test_hashable_by_addr_and_port() {
    let mut set = HashSet::new();
    set.insert(SocketAddress::from_addr("10.0.0.1:1".parse().unwrap()));
    set.insert(SocketAddress::from_addr("10.0.0.1:1".parse().unwrap()));
    set.insert(SocketAddress::from_addr("10.0.0.1:2".parse().unwrap()));
    assert_eq!(set.len(), 2);
  }

  #[test]
  fn test_sockaddr_roundtrip_v4() {
    let addr: SocketAddr = "192.168.1.7:8080".parse().unwrap();
    let (storage, _) = std_to_sockaddr(&addr);
    assert_eq!(sockaddr_to_std(&storage), Some(addr));
  }

  #[test]
  fn test_sockaddr_roundtrip_v6() {
    let addr: SocketAddr = "[::1]:9999".parse().unwrap();
    let (storage, _) = std_to_sockaddr(&addr);
    assert_eq!(sockaddr_to_std(&storage), Some(addr));
  }

  #[test]
  fn test_resolve_failure() {
    let mut addr = SocketAddress::new("definitely-not-a-host.invalid", "80");
    assert!(addr.resolve().is_err());
  }
}
