//! Placeholder substitution for header and query transform values.
//!
//! A value is rendered by replacing every `{name}` with, in order of lookup:
//! a route placeholder binding, then a request-scoped variable such as
//! `{RemoteIpAddress}`. Unknown placeholders are left untouched.
//!
//! A header value of the form `"find, replace"` rewrites an existing header
//! instead of setting it.
use http::{HeaderMap, HeaderName, HeaderValue};

use crate::core::route_matcher::PathBindings;

pub const REMOTE_IP_ADDRESS: &str = "RemoteIpAddress";
pub const UPSTREAM_HOST: &str = "UpstreamHost";
pub const BASE_URL: &str = "BaseUrl";
pub const REQUEST_ID: &str = "RequestId";
pub const DOWNSTREAM_BASE_URL: &str = "DownstreamBaseUrl";

/// Variables available to a template beyond the route bindings.
#[derive(Debug, Default, Clone)]
pub struct TemplateVars<'a> {
    pub bindings: Option<&'a PathBindings>,
    pub remote_ip: Option<String>,
    pub upstream_host: Option<&'a str>,
    pub base_url: Option<&'a str>,
    pub request_id: Option<&'a str>,
    pub downstream_base_url: Option<&'a str>,
}

impl TemplateVars<'_> {
    fn lookup(&self, name: &str) -> Option<String> {
        if let Some(value) = self.bindings.and_then(|bindings| bindings.get(name)) {
            return Some(value.to_string());
        }
        match name {
            REMOTE_IP_ADDRESS => self.remote_ip.clone(),
            UPSTREAM_HOST => self.upstream_host.map(str::to_string),
            BASE_URL => self.base_url.map(str::to_string),
            REQUEST_ID => self.request_id.map(str::to_string),
            DOWNSTREAM_BASE_URL => self.downstream_base_url.map(str::to_string),
            _ => None,
        }
    }
}

/// Replace every known `{name}` in `template`.
pub fn render(template: &str, vars: &TemplateVars<'_>) -> String {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        output.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match vars.lookup(name) {
                    Some(value) => output.push_str(&value),
                    None => {
                        output.push('{');
                        output.push_str(name);
                        output.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                output.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    output.push_str(rest);
    output
}

/// Outcome of applying one header transform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderEdit {
    Set(HeaderValue),
    Replace { find: String, replace: String },
}

/// Interpret a configured header value.
pub fn header_edit(template: &str, vars: &TemplateVars<'_>) -> Result<HeaderEdit, String> {
    if let Some((find, replace)) = template.split_once(", ") {
        return Ok(HeaderEdit::Replace {
            find: render(find.trim(), vars),
            replace: render(replace.trim(), vars),
        });
    }

    let rendered = render(template, vars);
    HeaderValue::from_str(&rendered)
        .map(HeaderEdit::Set)
        .map_err(|e| format!("rendered header value is not valid: {e}"))
}

/// Apply an ordered list of `(name, template)` transforms to `headers`.
pub fn apply_header_transforms<'t, I>(
    headers: &mut HeaderMap,
    transforms: I,
    vars: &TemplateVars<'_>,
) -> Result<(), String>
where
    I: IntoIterator<Item = (&'t HeaderName, &'t str)>,
{
    for (name, template) in transforms {
        match header_edit(template, vars)? {
            HeaderEdit::Set(value) => {
                headers.insert(name.clone(), value);
            }
            HeaderEdit::Replace { find, replace } => {
                let Some(current) = headers.get(name).and_then(|v| v.to_str().ok()) else {
                    continue;
                };
                let updated = current.replace(&find, &replace);
                let value = HeaderValue::from_str(&updated)
                    .map_err(|e| format!("rewritten header '{name}' is not valid: {e}"))?;
                headers.insert(name.clone(), value);
            }
        }
    }
    Ok(())
}
