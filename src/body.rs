//! Response body rewriting for selected routes

use crate::context::RequestContext;
use crate::error::{ReproError, Result};
use bytes::Bytes;
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use regex::Regex;
use std::io::{self, Read, Write};

/// Ordered set of path patterns selecting which responses get their body rewritten
#[derive(Debug, Clone, Default)]
pub struct RewriteRules {
    rules: Vec<Regex>,
}

impl RewriteRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rewrite route
    pub fn add(&mut self, pattern: &str) -> Result<()> {
        let regex = Regex::new(pattern).map_err(|source| ReproError::InvalidRewriteRule {
            pattern: pattern.to_string(),
            source,
        })?;
        self.rules.push(regex);
        Ok(())
    }

    /// True when any rule matches the request path
    pub fn matches(&self, path: &str) -> bool {
        self.rules.iter().any(|rule| rule.is_match(path))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Rewrites host references inside a fully buffered, decoded body
pub trait BodyRewriter: Send + Sync {
    /// Returns the rewritten body, or `None` when nothing changed
    fn rewrite_body(&self, body: &[u8], ctx: &RequestContext<'_>) -> Option<Vec<u8>>;
}

/// Replaces every remote host string with its local alias, in table order
#[derive(Debug, Default, Clone, Copy)]
pub struct LiteralBodyRewriter;

impl BodyRewriter for LiteralBodyRewriter {
    fn rewrite_body(&self, body: &[u8], ctx: &RequestContext<'_>) -> Option<Vec<u8>> {
        let mut current: Option<Vec<u8>> = None;

        for mapping in ctx.host_mappings() {
            let haystack = current.as_deref().unwrap_or(body);
            if let Some(replaced) = replace_all(haystack, mapping.remote().as_bytes(), mapping.local().as_bytes()) {
                current = Some(replaced);
            }
        }

        current
    }
}

fn replace_all(haystack: &[u8], needle: &[u8], replacement: &[u8]) -> Option<Vec<u8>> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }

    let mut out = Vec::with_capacity(haystack.len());
    let mut last = 0;
    let mut i = 0;

    while i + needle.len() <= haystack.len() {
        if &haystack[i..i + needle.len()] == needle {
            out.extend_from_slice(&haystack[last..i]);
            out.extend_from_slice(replacement);
            i += needle.len();
            last = i;
        } else {
            i += 1;
        }
    }

    if last == 0 {
        return None;
    }

    out.extend_from_slice(&haystack[last..]);
    Some(out)
}

/// Result of rewriting a possibly encoded body
#[derive(Debug, PartialEq, Eq)]
pub enum BodyOutcome {
    /// Body changed; bytes are re-encoded with the original encoding
    Rewritten(Bytes),
    /// No host reference found
    Unchanged(Bytes),
    /// Body could not be rewritten safely and is forwarded untouched
    Skipped { body: Bytes, reason: String },
}

impl BodyOutcome {
    pub fn body(&self) -> &Bytes {
        match self {
            BodyOutcome::Rewritten(body) | BodyOutcome::Unchanged(body) => body,
            BodyOutcome::Skipped { body, .. } => body,
        }
    }

    pub fn into_body(self) -> Bytes {
        match self {
            BodyOutcome::Rewritten(body) | BodyOutcome::Unchanged(body) => body,
            BodyOutcome::Skipped { body, .. } => body,
        }
    }

    /// Value for the body diagnostic header
    pub fn describe(&self) -> String {
        match self {
            BodyOutcome::Rewritten(_) => "rewritten".to_string(),
            BodyOutcome::Unchanged(_) => "unchanged".to_string(),
            BodyOutcome::Skipped { reason, .. } => format!("skipped: {}", reason),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Encoding {
    Identity,
    Gzip,
    Deflate,
}

impl Encoding {
    fn parse(value: Option<&str>) -> std::result::Result<Self, String> {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            None | Some("") | Some("identity") => Ok(Encoding::Identity),
            Some("gzip") | Some("x-gzip") => Ok(Encoding::Gzip),
            Some("deflate") => Ok(Encoding::Deflate),
            Some(other) => Err(format!("unsupported content-encoding {}", other)),
        }
    }

    fn decode(self, bytes: &[u8]) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        match self {
            Encoding::Identity => out.extend_from_slice(bytes),
            Encoding::Gzip => {
                GzDecoder::new(bytes).read_to_end(&mut out)?;
            }
            Encoding::Deflate => {
                ZlibDecoder::new(bytes).read_to_end(&mut out)?;
            }
        }
        Ok(out)
    }

    fn encode(self, bytes: Vec<u8>) -> io::Result<Vec<u8>> {
        match self {
            Encoding::Identity => Ok(bytes),
            Encoding::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(&bytes)?;
                encoder.finish()
            }
            Encoding::Deflate => {
                let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(&bytes)?;
                encoder.finish()
            }
        }
    }
}

/// Decode, rewrite and re-encode a buffered body.
///
/// Bodies in an encoding that cannot be decoded come back untouched as
/// [`BodyOutcome::Skipped`].
pub fn rewrite_encoded(
    rewriter: &dyn BodyRewriter,
    body: Bytes,
    content_encoding: Option<&str>,
    ctx: &RequestContext<'_>,
) -> BodyOutcome {
    let encoding = match Encoding::parse(content_encoding) {
        Ok(encoding) => encoding,
        Err(reason) => return BodyOutcome::Skipped { body, reason },
    };

    let decoded = match encoding.decode(&body) {
        Ok(decoded) => decoded,
        Err(e) => {
            return BodyOutcome::Skipped {
                body,
                reason: format!("undecodable body: {}", e),
            }
        }
    };

    let Some(rewritten) = rewriter.rewrite_body(&decoded, ctx) else {
        return BodyOutcome::Unchanged(body);
    };

    match encoding.encode(rewritten) {
        Ok(encoded) => BodyOutcome::Rewritten(Bytes::from(encoded)),
        Err(e) => BodyOutcome::Skipped {
            body,
            reason: format!("re-encoding failed: {}", e),
        },
    }
}
