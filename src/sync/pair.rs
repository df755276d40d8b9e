use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// One replicated prefix: keys under `source` (read from `datacenter`, or the
/// local datacenter) are mirrored under `destination` in the local datacenter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPair {
    pub destination: String,
    pub source: String,
    pub datacenter: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PairError {
    #[error("empty sync spec")]
    Empty,
    #[error("missing prefix in {0:?}")]
    EmptyPrefix(String),
    #[error("missing datacenter after '@' in {0:?}")]
    EmptyDatacenter(String),
    #[error("{0:?} nests one local prefix inside the other")]
    Overlap(String),
}

impl SyncPair {
    pub fn new(destination: &str, source: &str, datacenter: Option<&str>) -> Self {
        Self {
            destination: clean_prefix(destination),
            source: clean_prefix(source),
            datacenter: datacenter.map(str::to_string),
        }
    }

    /// Maps a source key to its destination key. `None` when the key is not
    /// under the source prefix.
    pub fn destination_key(&self, source_key: &str) -> Option<String> {
        let suffix = source_key.strip_prefix(&self.source)?;
        Some(format!("{}{}", self.destination, suffix))
    }

    pub fn source_topic(&self) -> String {
        match &self.datacenter {
            Some(dc) => format!("{}@{}", self.source, dc),
            None => self.source.clone(),
        }
    }

    /// Reads and writes the same keys. Syncing such a pair changes nothing.
    pub fn is_identity(&self) -> bool {
        self.datacenter.is_none() && self.destination == self.source
    }

    /// Distinct local prefixes where one contains the other.
    fn nests(&self) -> bool {
        self.datacenter.is_none()
            && !self.is_identity()
            && (self.destination.starts_with(&self.source)
                || self.source.starts_with(&self.destination))
    }
}

impl FromStr for SyncPair {
    type Err = PairError;

    /// Accepts `path@dc` or `dest=source[@dc]`.
    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(PairError::Empty);
        }
        let (paths, datacenter) = match spec.rsplit_once('@') {
            Some((_, "")) => return Err(PairError::EmptyDatacenter(spec.to_string())),
            Some((paths, dc)) => (paths, Some(dc)),
            None => (spec, None),
        };
        let (destination, source) = match paths.split_once('=') {
            Some((destination, source)) => (destination, source),
            None => (paths, paths),
        };
        let pair = SyncPair::new(destination, source, datacenter);
        if pair.destination.is_empty() || pair.source.is_empty() {
            return Err(PairError::EmptyPrefix(spec.to_string()));
        }
        if pair.nests() {
            return Err(PairError::Overlap(spec.to_string()));
        }
        Ok(pair)
    }
}

impl fmt::Display for SyncPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <- {}", self.destination, self.source_topic())
    }
}

fn clean_prefix(raw: &str) -> String {
    raw.trim().trim_start_matches('/').to_string()
}
