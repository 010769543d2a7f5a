//! Header rewriting between the local and remote perspective
//!
//! Header values are treated as free text: every literal occurrence of a host
//! string is substituted, mapping by mapping, in table order.

use crate::context::RequestContext;
use crate::mapping::{Mapping, MappingTable};
use hyper::header::{self, HeaderName, HeaderValue};
use hyper::HeaderMap;

/// Headers rewritten on requests flowing to the upstream (local -> remote)
pub static INBOUND_HEADERS: [HeaderName; 2] = [header::ORIGIN, header::REFERER];

/// Headers rewritten on responses flowing to the client (remote -> local)
pub static OUTBOUND_HEADERS: [HeaderName; 5] = [
    header::LOCATION,
    header::CONTENT_LOCATION,
    header::ACCESS_CONTROL_ALLOW_ORIGIN,
    header::REFRESH,
    header::LINK,
];

/// Rewrites host references in named headers
pub trait HeaderRewriter: Send + Sync {
    /// Server -> client: replace remote hosts with their local alias.
    /// Returns whether any value changed.
    fn rewrite_outbound(&self, keys: &[HeaderName], headers: &mut HeaderMap, ctx: &RequestContext<'_>) -> bool;

    /// Client -> server: replace local aliases with their remote host.
    /// Returns whether any value changed.
    fn rewrite_inbound(&self, keys: &[HeaderName], headers: &mut HeaderMap, ctx: &RequestContext<'_>) -> bool;
}

/// Literal substring substitution over header values
#[derive(Debug, Default, Clone, Copy)]
pub struct GenericHeaderRewriter;

impl HeaderRewriter for GenericHeaderRewriter {
    fn rewrite_outbound(&self, keys: &[HeaderName], headers: &mut HeaderMap, ctx: &RequestContext<'_>) -> bool {
        rewrite_specified_headers(keys, headers, ctx.host_mappings(), |m| (m.remote(), m.local()))
    }

    fn rewrite_inbound(&self, keys: &[HeaderName], headers: &mut HeaderMap, ctx: &RequestContext<'_>) -> bool {
        rewrite_specified_headers(keys, headers, ctx.host_mappings(), |m| (m.local(), m.remote()))
    }
}

fn rewrite_specified_headers(
    keys: &[HeaderName],
    headers: &mut HeaderMap,
    mappings: &MappingTable,
    direction: fn(&Mapping) -> (&str, &str),
) -> bool {
    let mut rewritten = false;

    for key in keys {
        let values: Vec<HeaderValue> = headers.get_all(key).iter().cloned().collect();
        let mut changed = false;

        let values: Vec<HeaderValue> = values
            .into_iter()
            .map(|value| match rewrite_value(&value, mappings, direction) {
                Some(new_value) => {
                    changed = true;
                    new_value
                }
                None => value,
            })
            .collect();

        if changed {
            headers.remove(key);
            for value in values {
                headers.append(key.clone(), value);
            }
            rewritten = true;
        }
    }

    rewritten
}

/// Substitute every mapping's host string in one value; `None` when untouched
fn rewrite_value(
    value: &HeaderValue,
    mappings: &MappingTable,
    direction: fn(&Mapping) -> (&str, &str),
) -> Option<HeaderValue> {
    let original = value.to_str().ok().filter(|v| !v.is_empty())?;
    let mut text = original.to_string();

    for mapping in mappings {
        let (from, to) = direction(mapping);
        if text.contains(from) {
            text = text.replace(from, to);
        }
    }

    if text == original {
        return None;
    }

    HeaderValue::from_str(&text).ok()
}
