//! Queue keys identifying claims

use std::fmt;
use std::str::FromStr;

use k8s_openapi::api::core::v1::PersistentVolumeClaim;

use resizer_common::Error;

/// `namespace/name` of a PersistentVolumeClaim
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClaimKey {
    /// Claim namespace
    pub namespace: String,
    /// Claim name
    pub name: String,
}

impl ClaimKey {
    /// Build a key from its parts
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a claim object; `None` when the object lacks a name or namespace
    pub fn from_claim(claim: &PersistentVolumeClaim) -> Option<Self> {
        let namespace = claim.metadata.namespace.clone()?;
        let name = claim.metadata.name.clone()?;
        Some(Self { namespace, name })
    }
}

impl fmt::Display for ClaimKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for ClaimKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(ns, name))
            }
            _ => Err(Error::internal_with_context(
                "key",
                format!("invalid claim key {s:?}, expected namespace/name"),
            )),
        }
    }
}
