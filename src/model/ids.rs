use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ObserveError;

/// Opaque tenant identifier; all multi-tenant state is partitioned by it.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(pub String);

impl ProjectId {
    pub fn new(id: impl Into<String>) -> Self {
        ProjectId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProjectId {
    fn from(s: &str) -> Self {
        ProjectId(s.to_string())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ApplicationKind {
    Deployment,
    StatefulSet,
    DaemonSet,
    CronJob,
    Job,
    ReplicaSet,
    Pod,
    ExternalService,
    #[default]
    Unknown,
    Other(String),
}

impl ApplicationKind {
    pub fn as_str(&self) -> &str {
        match self {
            ApplicationKind::Deployment => "Deployment",
            ApplicationKind::StatefulSet => "StatefulSet",
            ApplicationKind::DaemonSet => "DaemonSet",
            ApplicationKind::CronJob => "CronJob",
            ApplicationKind::Job => "Job",
            ApplicationKind::ReplicaSet => "ReplicaSet",
            ApplicationKind::Pod => "Pod",
            ApplicationKind::ExternalService => "ExternalService",
            ApplicationKind::Unknown => "Unknown",
            ApplicationKind::Other(s) => s,
        }
    }
}

impl From<&str> for ApplicationKind {
    fn from(s: &str) -> Self {
        match s {
            "Deployment" => ApplicationKind::Deployment,
            "StatefulSet" => ApplicationKind::StatefulSet,
            "DaemonSet" => ApplicationKind::DaemonSet,
            "CronJob" => ApplicationKind::CronJob,
            "Job" => ApplicationKind::Job,
            "ReplicaSet" => ApplicationKind::ReplicaSet,
            "Pod" => ApplicationKind::Pod,
            "ExternalService" => ApplicationKind::ExternalService,
            "Unknown" | "" => ApplicationKind::Unknown,
            other => ApplicationKind::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ApplicationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `(cluster, namespace, kind, name)`; the string form is `cluster:ns:kind:name`.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ApplicationId {
    pub cluster_id: String,
    pub namespace: String,
    pub kind: ApplicationKind,
    pub name: String,
}

impl ApplicationId {
    pub fn new(
        cluster_id: impl Into<String>,
        namespace: impl Into<String>,
        kind: ApplicationKind,
        name: impl Into<String>,
    ) -> Self {
        let mut id = Self {
            cluster_id: cluster_id.into(),
            namespace: namespace.into(),
            kind,
            name: name.into(),
        };
        if id.cluster_id.is_empty() {
            id.cluster_id = "_".to_string();
        }
        if id.namespace.is_empty() {
            id.namespace = "_".to_string();
        }
        id
    }

    pub fn is_zero(&self) -> bool {
        *self == ApplicationId::default()
    }

    /// `ns:kind:name`, the form application selectors match against.
    pub fn string_without_cluster(&self) -> String {
        format!("{}:{}:{}", self.namespace, self.kind, self.name)
    }
}

impl fmt::Display for ApplicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}:{}", self.cluster_id, self.namespace, self.kind, self.name)
    }
}

impl FromStr for ApplicationId {
    type Err = ObserveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(ApplicationId::default());
        }
        let parts: Vec<&str> = s.splitn(4, ':').collect();
        let mut id = match parts.as_slice() {
            [ns, kind, name] => ApplicationId {
                cluster_id: String::new(),
                namespace: ns.to_string(),
                kind: ApplicationKind::from(*kind),
                name: name.to_string(),
            },
            [cluster, ns, kind, name] => ApplicationId {
                cluster_id: cluster.to_string(),
                namespace: ns.to_string(),
                kind: ApplicationKind::from(*kind),
                name: name.to_string(),
            },
            _ => return Err(ObserveError::Internal(format!("invalid application id: {s}"))),
        };
        if id.kind == ApplicationKind::ExternalService {
            id.cluster_id = "external".to_string();
        }
        Ok(id)
    }
}

impl Serialize for ApplicationId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.is_zero() {
            return serializer.serialize_str("");
        }
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ApplicationId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_application_id_string_forms() {
        let id = ApplicationId::new("c1", "default", ApplicationKind::Deployment, "catalog");
        assert_eq!(id.to_string(), "c1:default:Deployment:catalog");
        assert_eq!(id.string_without_cluster(), "default:Deployment:catalog");
        let parsed: ApplicationId = "c1:default:Deployment:catalog".parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_application_id_without_cluster() {
        let parsed: ApplicationId = "ns:StatefulSet:db".parse().unwrap();
        assert_eq!(parsed.cluster_id, "");
        assert_eq!(parsed.kind, ApplicationKind::StatefulSet);
        assert!("broken".parse::<ApplicationId>().is_err());
        assert!("".parse::<ApplicationId>().unwrap().is_zero());
    }
}
