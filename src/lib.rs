//! RustRepro - A local reverse proxy for remote hosts
//!
//! Lets services built for a remote deployment be exercised from a local machine:
//! - One listener per `local=scheme=remote` mapping
//! - Host references in headers rewritten in both directions
//! - Host references in response bodies rewritten on selected routes
//! - Optional insecure upstream TLS
//! - Diagnostic `x-repro-*` response headers

pub mod body;
pub mod config;
pub mod context;
pub mod error;
pub mod headers;
pub mod mapping;
pub mod proxy;
pub mod repro;
pub mod upstream;

pub use body::{BodyRewriter, LiteralBodyRewriter, RewriteRules};
pub use config::Config;
pub use context::RequestContext;
pub use error::{ReproError, Result};
pub use headers::{GenericHeaderRewriter, HeaderRewriter};
pub use mapping::{Mapping, MappingTable, Scheme};
pub use proxy::ProxyEngine;
pub use repro::{Completion, Repro};
pub use upstream::UpstreamConnector;

/// How [`run`] finished without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// No mappings configured; nothing was started
    NothingToDo,
    /// Every listener went away without a fatal error
    Stopped,
}

/// Start proxying for `config` and wait for the first fatal error
pub async fn run(config: Config) -> Result<RunOutcome> {
    if config.count_mappings() == 0 {
        return Ok(RunOutcome::NothingToDo);
    }

    let repro = Repro::new(config)?;
    repro.start().wait().await?;

    Ok(RunOutcome::Stopped)
}
