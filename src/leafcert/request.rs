use std::net::IpAddr;
use std::time::Duration;

use crate::domain::{ServiceKind, DEFAULT_NAMESPACE, DEFAULT_PARTITION};
use crate::utils::hash_key;

/// Which identity a leaf certificate is requested for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeafIdentity {
    /// Service name, not instance id
    Service(String),
    /// Agent (node) name
    Agent(String),
    /// The server in the request's datacenter
    Server,
    /// Non-service workload kind; only mesh gateways can be issued for
    Kind(ServiceKind),
}

/// Request for a leaf certificate.
///
/// `min_query_index == 0` asks for the current value (revalidated against the
/// active root); a non-zero index blocks until a newer value exists or
/// `max_query_time` elapses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafCertRequest {
    pub token: String,
    pub datacenter: String,
    pub identity: LeafIdentity,
    pub partition: String,
    pub namespace: String,
    pub dns_san: Vec<String>,
    pub ip_san: Vec<IpAddr>,
    pub min_query_index: u64,
    /// Zero means the default of ten minutes.
    pub max_query_time: Duration,
    pub must_revalidate: bool,
}

impl LeafCertRequest {
    pub fn new(datacenter: impl Into<String>, identity: LeafIdentity) -> Self {
        Self {
            token: String::new(),
            datacenter: datacenter.into(),
            identity,
            partition: DEFAULT_PARTITION.to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            dns_san: Vec::new(),
            ip_san: Vec::new(),
            min_query_index: 0,
            max_query_time: Duration::ZERO,
            must_revalidate: false,
        }
    }

    pub fn service(datacenter: impl Into<String>, service: impl Into<String>) -> Self {
        Self::new(datacenter, LeafIdentity::Service(service.into()))
    }

    pub fn agent(datacenter: impl Into<String>, agent: impl Into<String>) -> Self {
        Self::new(datacenter, LeafIdentity::Agent(agent.into()))
    }

    pub fn server(datacenter: impl Into<String>) -> Self {
        Self::new(datacenter, LeafIdentity::Server)
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    pub fn with_dns_san(mut self, dns_san: Vec<String>) -> Self {
        self.dns_san = dns_san;
        self
    }

    pub fn with_ip_san(mut self, ip_san: Vec<IpAddr>) -> Self {
        self.ip_san = ip_san;
        self
    }

    pub fn with_min_query_index(mut self, index: u64) -> Self {
        self.min_query_index = index;
        self
    }

    pub fn with_max_query_time(mut self, max_query_time: Duration) -> Self {
        self.max_query_time = max_query_time;
        self
    }

    pub fn target_partition(&self) -> &str {
        if self.partition.is_empty() {
            DEFAULT_PARTITION
        } else {
            &self.partition
        }
    }

    pub fn target_namespace(&self) -> &str {
        if self.namespace.is_empty() {
            DEFAULT_NAMESPACE
        } else {
            &self.namespace
        }
    }

    /// Cache key for this request, `None` for identities that cannot be cached.
    ///
    /// SANs only take part for identities whose certificate carries them
    /// verbatim; the agent and server keys ignore them.
    pub fn key(&self) -> Option<String> {
        match &self.identity {
            LeafIdentity::Agent(agent) => hash_key("agent", &(agent, self.target_partition())),
            LeafIdentity::Kind(ServiceKind::MeshGateway) => {
                hash_key("kind", &(self.target_partition(), &self.dns_san, &self.ip_san))
            }
            LeafIdentity::Kind(_) => None,
            LeafIdentity::Server => hash_key("server", &("server", &self.datacenter)),
            LeafIdentity::Service(service) => hash_key(
                "service",
                &(service, self.target_partition(), self.target_namespace(), &self.dns_san, &self.ip_san),
            ),
        }
    }
}

/// Metadata describing a `get` result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResultMeta {
    /// The value came straight from the cache on the first pass
    pub hit: bool,
    /// Time since the value was fetched
    pub age: Duration,
    /// Index of the returned value
    pub index: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_key_depends_on_sans_and_tenancy() {
        let base = LeafCertRequest::service("dc1", "web");
        let same = LeafCertRequest::service("dc1", "web").with_max_query_time(Duration::from_secs(5));
        assert_eq!(base.key(), same.key());

        let with_dns = base.clone().with_dns_san(vec!["test.example.com".to_string()]);
        assert_ne!(base.key(), with_dns.key());

        let with_ip = base.clone().with_ip_san(vec!["10.0.0.1".parse().unwrap()]);
        assert_ne!(base.key(), with_ip.key());

        let mut other_ns = base.clone();
        other_ns.namespace = "payments".to_string();
        assert_ne!(base.key(), other_ns.key());

        assert!(base.key().unwrap().starts_with("service:"));
    }

    #[test]
    fn empty_tenancy_normalises_to_default() {
        let mut blank = LeafCertRequest::service("dc1", "web");
        blank.partition = String::new();
        blank.namespace = String::new();
        assert_eq!(blank.key(), LeafCertRequest::service("dc1", "web").key());
    }

    #[test]
    fn agent_key_ignores_sans_and_datacenter() {
        let a = LeafCertRequest::agent("dc1", "node-1");
        let b = LeafCertRequest::agent("dc2", "node-1").with_dns_san(vec!["x.example.com".to_string()]);
        assert_eq!(a.key(), b.key());
        assert!(a.key().unwrap().starts_with("agent:"));
        assert_ne!(a.key(), LeafCertRequest::agent("dc1", "node-2").key());
    }

    #[test]
    fn server_key_is_per_datacenter() {
        let a = LeafCertRequest::server("dc1");
        assert_eq!(a.key(), LeafCertRequest::server("dc1").with_dns_san(vec!["a".to_string()]).key());
        assert_ne!(a.key(), LeafCertRequest::server("dc2").key());
    }

    #[test]
    fn only_mesh_gateway_kind_has_a_key() {
        let gateway = LeafCertRequest::new("dc1", LeafIdentity::Kind(ServiceKind::MeshGateway));
        assert!(gateway.key().unwrap().starts_with("kind:"));

        let ingress = LeafCertRequest::new("dc1", LeafIdentity::Kind(ServiceKind::IngressGateway));
        assert_eq!(ingress.key(), None);
    }

    #[test]
    fn identities_do_not_collide() {
        let service = LeafCertRequest::service("dc1", "node-1");
        let agent = LeafCertRequest::agent("dc1", "node-1");
        assert_ne!(service.key(), agent.key());
    }
}
