//! Per-request context handed to the rewriters

use crate::error::{ReproError, Result};
use crate::mapping::{Mapping, MappingTable};
use hyper::header::HOST;
use hyper::{HeaderMap, Uri};
use uuid::Uuid;

/// Read-only view of the mapping table for one request/response exchange.
///
/// Borrows the table owned by the engine; it is built when the request is
/// accepted and dropped once the response has been produced.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext<'a> {
    mappings: &'a MappingTable,
    mapping: &'a Mapping,
    trace_id: Uuid,
}

impl<'a> RequestContext<'a> {
    /// Resolve the mapping addressed by the inbound request.
    ///
    /// The `Host` header wins; an absolute-form request URI is used when the
    /// header is absent.
    pub fn resolve(mappings: &'a MappingTable, headers: &HeaderMap, uri: &Uri) -> Result<Self> {
        let host = headers
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string)
            .or_else(|| uri.authority().map(|a| a.to_string()))
            .filter(|h| !h.is_empty())
            .ok_or(ReproError::MissingHost)?;

        let mapping = mappings
            .find(&host)
            .map_err(|_| ReproError::UnknownHost { host })?;

        Ok(Self::new(mappings, mapping))
    }

    /// Build a context for a known mapping
    pub fn new(mappings: &'a MappingTable, mapping: &'a Mapping) -> Self {
        Self {
            mappings,
            mapping,
            trace_id: Uuid::new_v4(),
        }
    }

    /// All mappings, in table order
    pub fn host_mappings(&self) -> &'a MappingTable {
        self.mappings
    }

    /// The mapping this request was addressed to
    pub fn mapping(&self) -> &'a Mapping {
        self.mapping
    }

    pub fn trace_id(&self) -> Uuid {
        self.trace_id
    }
}
