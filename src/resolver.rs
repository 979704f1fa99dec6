use crate::ast::IncludeTarget;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    pub modified_at: DateTime<Utc>,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("{0} not found")]
    NotFound(IncludeTarget),
    #[error("access to {0} denied")]
    Denied(IncludeTarget),
    #[error("{0}")]
    Failed(String),
    /// Aborts the whole evaluation instead of degrading one directive.
    #[error("{0}")]
    Fatal(String),
}

impl ResolveError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Turns include targets into bytes or metadata.
///
/// The engine never touches the filesystem or network itself; paths arrive
/// with variable markers already substituted.
pub trait Resolver {
    fn resolve(&self, target: &IncludeTarget) -> Result<Vec<u8>, ResolveError>;

    fn metadata(&self, target: &IncludeTarget) -> Result<Metadata, ResolveError>;
}

impl<R: Resolver + ?Sized> Resolver for &R {
    fn resolve(&self, target: &IncludeTarget) -> Result<Vec<u8>, ResolveError> {
        (**self).resolve(target)
    }

    fn metadata(&self, target: &IncludeTarget) -> Result<Metadata, ResolveError> {
        (**self).metadata(target)
    }
}

#[derive(Debug, Clone)]
struct Entry {
    bytes: Vec<u8>,
    modified_at: DateTime<Utc>,
}

/// In-memory fixture map from targets to contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryResolver {
    entries: HashMap<IncludeTarget, Entry>,
}

impl MemoryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        target: IncludeTarget,
        bytes: impl Into<Vec<u8>>,
        modified_at: DateTime<Utc>,
    ) {
        self.entries.insert(
            target,
            Entry {
                bytes: bytes.into(),
                modified_at,
            },
        );
    }

    pub fn with_virtual(mut self, path: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        let target = IncludeTarget::Virtual(path.into());
        self.insert(target, bytes, DateTime::<Utc>::UNIX_EPOCH);
        self
    }

    pub fn with_file(mut self, path: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        let target = IncludeTarget::File(path.into());
        self.insert(target, bytes, DateTime::<Utc>::UNIX_EPOCH);
        self
    }

    /// Sets the modification time of an entry added earlier.
    pub fn modified(mut self, target: &IncludeTarget, modified_at: DateTime<Utc>) -> Self {
        if let Some(entry) = self.entries.get_mut(target) {
            entry.modified_at = modified_at;
        }
        self
    }

    fn entry(&self, target: &IncludeTarget) -> Result<&Entry, ResolveError> {
        self.entries
            .get(target)
            .ok_or_else(|| ResolveError::NotFound(target.clone()))
    }
}

impl Resolver for MemoryResolver {
    fn resolve(&self, target: &IncludeTarget) -> Result<Vec<u8>, ResolveError> {
        Ok(self.entry(target)?.bytes.clone())
    }

    fn metadata(&self, target: &IncludeTarget) -> Result<Metadata, ResolveError> {
        let entry = self.entry(target)?;
        Ok(Metadata {
            modified_at: entry.modified_at,
            size_bytes: entry.bytes.len() as u64,
        })
    }
}
