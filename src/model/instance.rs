use std::collections::HashMap;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::proto;

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub region: String,
    pub zone: String,
    pub campus: String,
}

/// One service instance inside an Instances snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub weight: u32,
    pub priority: u32,
    pub healthy: bool,
    pub isolate: bool,
    pub protocol: String,
    pub version: String,
    pub logic_set: String,
    pub vpc_id: String,
    pub revision: String,
    pub metadata: HashMap<String, String>,
    pub location: Location,
    /// `service_id << 32 | sequence`, stable across updates of the same id
    pub local_id: u64,
    /// Consistent-hash value, unique inside its snapshot
    pub hash: u64,
}

impl Instance {
    pub fn from_proto(instance: &proto::Instance) -> Self {
        let location = instance
            .location
            .as_ref()
            .map(|l| Location {
                region: l.region.clone(),
                zone: l.zone.clone(),
                campus: l.campus.clone(),
            })
            .unwrap_or_default();
        Self {
            id: instance.id.clone(),
            host: instance.host.clone(),
            port: u16::try_from(instance.port).unwrap_or(0),
            weight: instance.weight,
            priority: instance.priority,
            healthy: instance.healthy.unwrap_or(true),
            isolate: instance.isolate.unwrap_or(false),
            protocol: instance.protocol.clone(),
            version: instance.version.clone(),
            logic_set: instance.logic_set.clone(),
            vpc_id: instance.vpc_id.clone(),
            revision: instance.revision.clone(),
            metadata: instance.metadata.clone(),
            location,
            local_id: 0,
            hash: 0,
        }
    }

    /// Isolated or zero-weight instances never receive traffic.
    pub fn is_isolated(&self) -> bool {
        self.isolate || self.weight == 0
    }

    pub fn is_available(&self) -> bool {
        self.healthy && !self.is_isolated()
    }

    pub fn endpoint(&self) -> HostPort {
        HostPort::new(self.host.clone(), self.port)
    }
}

/// Address of an instance. IPv6 hosts are printed in brackets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    pub fn new(
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for HostPort {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}
