//! SPIFFE identities encoded into leaf certificates.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Partition and namespace used when a request does not name one.
pub const DEFAULT_PARTITION: &str = "default";
pub const DEFAULT_NAMESPACE: &str = "default";

/// Kind of a non-service workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceKind {
    ConnectProxy,
    MeshGateway,
    TerminatingGateway,
    IngressGateway,
    ApiGateway,
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::ConnectProxy => "connect-proxy",
            Self::MeshGateway => "mesh-gateway",
            Self::TerminatingGateway => "terminating-gateway",
            Self::IngressGateway => "ingress-gateway",
            Self::ApiGateway => "api-gateway",
        };
        f.write_str(kind)
    }
}

/// Identity a leaf certificate is issued for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpiffeId {
    Service { host: String, partition: String, namespace: String, datacenter: String, service: String },
    Agent { host: String, partition: String, datacenter: String, agent: String },
    MeshGateway { host: String, partition: String, datacenter: String },
    Server { host: String, datacenter: String },
}

impl SpiffeId {
    /// `spiffe://` URI placed in the certificate's URI SAN.
    pub fn uri(&self) -> String {
        match self {
            Self::Service { host, partition, namespace, datacenter, service } => format!(
                "spiffe://{}{}/ns/{}/dc/{}/svc/{}",
                host,
                partition_segment(partition),
                namespace,
                datacenter,
                service
            ),
            Self::Agent { host, partition, datacenter, agent } => format!(
                "spiffe://{}{}/agent/client/dc/{}/id/{}",
                host,
                partition_segment(partition),
                datacenter,
                agent
            ),
            Self::MeshGateway { host, partition, datacenter } => {
                format!("spiffe://{}{}/gateway/mesh/dc/{}", host, partition_segment(partition), datacenter)
            }
            Self::Server { host, datacenter } => format!("spiffe://{}/agent/server/dc/{}", host, datacenter),
        }
    }
}

impl fmt::Display for SpiffeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri())
    }
}

fn partition_segment(partition: &str) -> String {
    if partition.is_empty() || partition == DEFAULT_PARTITION {
        String::new()
    } else {
        format!("/ap/{}", partition)
    }
}
