use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Cloud-assigned node / volume identifier, parsed into one shape per
/// provider so downstream reconciliation joins on a single canonical form.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum ProviderId {
    Aws {
        zone: String,
        instance_id: String,
    },
    Azure {
        subscription: String,
        resource_group: String,
        resource: String,
    },
    Gcp {
        project: String,
        zone: String,
        instance: String,
    },
    /// Anything we cannot classify is carried verbatim.
    Raw(String),
}

fn aws_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^aws:///([^/]+)/(i-[0-9a-f]+)$").unwrap())
}

fn azure_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^azure:///subscriptions/([^/]+)/resourceGroups/([^/]+)/providers/Microsoft\.Compute/[^/]+/(.+)$",
        )
        .unwrap()
    })
}

fn gcp_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^gce://([^/]+)/([^/]+)/([^/]+)$").unwrap())
}

impl ProviderId {
    /// Parse a raw provider-id string as reported by the orchestrator.
    pub fn parse(raw: &str) -> ProviderId {
        let raw = raw.trim();
        if let Some(c) = aws_re().captures(raw) {
            return ProviderId::Aws {
                zone: c[1].to_string(),
                instance_id: c[2].to_string(),
            };
        }
        if let Some(c) = azure_re().captures(raw) {
            return ProviderId::Azure {
                subscription: c[1].to_lowercase(),
                resource_group: c[2].to_lowercase(),
                resource: c[3].to_lowercase(),
            };
        }
        if let Some(c) = gcp_re().captures(raw) {
            return ProviderId::Gcp {
                project: c[1].to_string(),
                zone: c[2].to_string(),
                instance: c[3].to_string(),
            };
        }
        ProviderId::Raw(raw.to_string())
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderId::Aws { instance_id, .. } => write!(f, "{}", instance_id),
            ProviderId::Azure { resource, .. } => write!(f, "{}", resource),
            ProviderId::Gcp { instance, .. } => write!(f, "{}", instance),
            ProviderId::Raw(s) => write!(f, "{}", s),
        }
    }
}

/// True when the address falls in one of the RFC1918 private ranges.
/// Non-IPv4 strings (hostnames, IPv6) are treated as public.
pub fn is_private_ip(addr: &str) -> bool {
    match addr.parse::<std::net::Ipv4Addr>() {
        Ok(ip) => ip.is_private(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_aws() {
        let id = ProviderId::parse("aws:///us-east-2a/i-055274d3576800444");
        assert_eq!(
            id,
            ProviderId::Aws {
                zone: "us-east-2a".into(),
                instance_id: "i-055274d3576800444".into(),
            }
        );
        assert_eq!(id.to_string(), "i-055274d3576800444");
    }

    #[test]
    fn parses_azure_case_insensitively() {
        let id = ProviderId::parse(
            "azure:///subscriptions/0badafdf-1234/resourceGroups/MC_test/providers/Microsoft.Compute/virtualMachines/aks-agentpool-0",
        );
        assert_eq!(
            id,
            ProviderId::Azure {
                subscription: "0badafdf-1234".into(),
                resource_group: "mc_test".into(),
                resource: "aks-agentpool-0".into(),
            }
        );
    }

    #[test]
    fn parses_gcp() {
        let id = ProviderId::parse("gce://my-project/us-central1-a/gke-node-1");
        assert_eq!(id.to_string(), "gke-node-1");
    }

    #[test]
    fn unknown_is_raw() {
        assert_eq!(
            ProviderId::parse("metal-rack-7"),
            ProviderId::Raw("metal-rack-7".into())
        );
    }

    #[test]
    fn private_ip_ranges() {
        assert!(is_private_ip("10.0.0.1"));
        assert!(is_private_ip("172.16.4.2"));
        assert!(is_private_ip("192.168.1.1"));
        assert!(!is_private_ip("8.8.8.8"));
        assert!(!is_private_ip("172.32.0.1"));
        assert!(!is_private_ip("lb.example.com"));
    }
}
