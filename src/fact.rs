//! Fact types, and the read-through TTL cache keyed by (session, fact kind).

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::session::SessionId;

/// The known HMON fact kinds, keyed by the numeric IDs from `spec.md` §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FactKind {
    Host,
    AccountInformation,
    Workspace,
    Threads,
    SuspendedThreads,
    ThreadCount,
}

impl FactKind {
    pub fn id(self) -> u32 {
        match self {
            FactKind::Host => 1,
            FactKind::AccountInformation => 2,
            FactKind::Workspace => 3,
            FactKind::Threads => 4,
            FactKind::SuspendedThreads => 5,
            FactKind::ThreadCount => 6,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FactKind::Host => "Host",
            FactKind::AccountInformation => "AccountInformation",
            FactKind::Workspace => "Workspace",
            FactKind::Threads => "Threads",
            FactKind::SuspendedThreads => "SuspendedThreads",
            FactKind::ThreadCount => "ThreadCount",
        }
    }

    pub fn from_id(id: u32) -> Option<Self> {
        match id {
            1 => Some(FactKind::Host),
            2 => Some(FactKind::AccountInformation),
            3 => Some(FactKind::Workspace),
            4 => Some(FactKind::Threads),
            5 => Some(FactKind::SuspendedThreads),
            6 => Some(FactKind::ThreadCount),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Host" => Some(FactKind::Host),
            "AccountInformation" => Some(FactKind::AccountInformation),
            "Workspace" => Some(FactKind::Workspace),
            "Threads" => Some(FactKind::Threads),
            "SuspendedThreads" => Some(FactKind::SuspendedThreads),
            "ThreadCount" => Some(FactKind::ThreadCount),
            _ => None,
        }
    }
}

impl fmt::Display for FactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Encodes as an integer on the wire. Decodes either an integer or the
/// kind's name string, per the open question in `spec.md` §9: "the exact
/// wire encoding of the `Facts` request list ... was observed in both
/// forms; implementations should accept either on decode and emit integers
/// on encode."
impl Serialize for FactKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.id())
    }
}

impl<'de> Deserialize<'de> for FactKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        match &value {
            serde_json::Value::Number(n) => {
                let id = n
                    .as_u64()
                    .ok_or_else(|| D::Error::custom(format!("invalid fact kind number: {n}")))?;
                FactKind::from_id(id as u32)
                    .ok_or_else(|| D::Error::custom(format!("unknown fact kind id: {id}")))
            }
            serde_json::Value::String(s) => FactKind::from_name(s)
                .ok_or_else(|| D::Error::custom(format!("unknown fact kind name: {s}"))),
            other => Err(D::Error::custom(format!(
                "fact kind must be an integer or string, got {other}"
            ))),
        }
    }
}

/// A point-in-time observation of interpreter state. The core does not
/// interpret fact semantics; `value` is forwarded verbatim. The `Unknown`
/// variant carries anything whose numeric ID doesn't match a known kind
/// rather than failing the whole `Facts` response.
#[derive(Debug, Clone, PartialEq)]
pub enum Fact {
    Host(serde_json::Value),
    AccountInformation(serde_json::Value),
    Workspace(serde_json::Value),
    Threads(serde_json::Value),
    SuspendedThreads(serde_json::Value),
    ThreadCount(serde_json::Value),
    Unknown {
        id: i64,
        name: String,
        value: serde_json::Value,
    },
}

impl Fact {
    pub fn kind(&self) -> Option<FactKind> {
        match self {
            Fact::Host(_) => Some(FactKind::Host),
            Fact::AccountInformation(_) => Some(FactKind::AccountInformation),
            Fact::Workspace(_) => Some(FactKind::Workspace),
            Fact::Threads(_) => Some(FactKind::Threads),
            Fact::SuspendedThreads(_) => Some(FactKind::SuspendedThreads),
            Fact::ThreadCount(_) => Some(FactKind::ThreadCount),
            Fact::Unknown { .. } => None,
        }
    }

    pub fn value(&self) -> &serde_json::Value {
        match self {
            Fact::Host(v)
            | Fact::AccountInformation(v)
            | Fact::Workspace(v)
            | Fact::Threads(v)
            | Fact::SuspendedThreads(v)
            | Fact::ThreadCount(v) => v,
            Fact::Unknown { value, .. } => value,
        }
    }
}

#[derive(Deserialize)]
struct RawFact {
    #[serde(rename = "ID")]
    id: i64,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Value", default)]
    value: serde_json::Value,
}

impl<'de> Deserialize<'de> for Fact {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawFact::deserialize(deserializer)?;
        let kind = u32::try_from(raw.id).ok().and_then(FactKind::from_id);
        Ok(match kind {
            Some(FactKind::Host) => Fact::Host(raw.value),
            Some(FactKind::AccountInformation) => Fact::AccountInformation(raw.value),
            Some(FactKind::Workspace) => Fact::Workspace(raw.value),
            Some(FactKind::Threads) => Fact::Threads(raw.value),
            Some(FactKind::SuspendedThreads) => Fact::SuspendedThreads(raw.value),
            Some(FactKind::ThreadCount) => Fact::ThreadCount(raw.value),
            None => Fact::Unknown {
                id: raw.id,
                name: raw.name,
                value: raw.value,
            },
        })
    }
}

impl Serialize for Fact {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let (id, name, value) = match self {
            Fact::Unknown { id, name, value } => (*id, name.as_str(), value),
            other => {
                let kind = other.kind().expect("non-Unknown fact always has a kind");
                (kind.id() as i64, kind.name(), other.value())
            }
        };
        let mut s = serializer.serialize_struct("Fact", 3)?;
        s.serialize_field("ID", &id)?;
        s.serialize_field("Name", name)?;
        s.serialize_field("Value", value)?;
        s.end()
    }
}

/// One cached fact with the instant it was last refreshed.
#[derive(Debug, Clone)]
pub struct FactCacheEntry {
    pub fact: Fact,
    pub last_updated: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey(SessionId, u32);

/// Read-through cache from `(SessionId, FactKind)` to the most recently
/// observed `Fact`, with read-time TTL invalidation per `spec.md` §4.5.
///
/// Guarantees no inter-kind consistency: each kind is refreshed
/// independently as `Facts` responses arrive.
#[derive(Clone)]
pub struct FactCache {
    inner: Arc<RwLock<HashMap<CacheKey, FactCacheEntry>>>,
    ttl: Duration,
}

impl FactCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    /// Insert or refresh the entry for one fact, stamped "now".
    pub fn put(&self, session: SessionId, fact: Fact) {
        let Some(kind) = fact.kind() else {
            return;
        };
        self.inner.write().unwrap().insert(
            CacheKey(session, kind.id()),
            FactCacheEntry {
                fact,
                last_updated: Instant::now(),
            },
        );
    }

    /// Fetch the cached fact if present and not older than the TTL.
    /// A TTL-expired entry is deleted as a side effect of the read, so a
    /// repeated read against the same expired entry is a no-op.
    pub fn get(&self, session: SessionId, kind: FactKind) -> Option<Fact> {
        let key = CacheKey(session, kind.id());
        let expired = {
            let guard = self.inner.read().unwrap();
            match guard.get(&key) {
                Some(entry) => entry.last_updated.elapsed() > self.ttl,
                None => return None,
            }
        };
        if expired {
            self.inner.write().unwrap().remove(&key);
            return None;
        }
        self.inner
            .read()
            .unwrap()
            .get(&key)
            .map(|e| e.fact.clone())
    }

    /// Drop every entry belonging to `session`. Invoked when a session
    /// leaves the registry, per `spec.md` §3 invariant 4.
    pub fn purge_session(&self, session: SessionId) {
        self.inner.write().unwrap().retain(|k, _| k.0 != session);
    }
}
