//! Request matchers
//!
//! A [`RequestMatcher`] recognizes requests either by exact byte equality or
//! by a regular expression over the request rendered as uppercase hex, and
//! carries the handler that builds the response.

use std::fmt;
use std::sync::Arc;

use regex::Regex;

use crate::error::{SimError, SimResult};
use crate::hex_util::{parse_hex, to_hex_upper};
use crate::response::ResponseContext;
use crate::storage::KeyedStorage;

/// Callback building the response for a matched request
pub type ResponseHandler = Arc<dyn Fn(&mut ResponseContext<'_>) -> SimResult<()> + Send + Sync>;

/// How a matcher recognizes requests
#[derive(Debug, Clone)]
pub enum RequestPattern {
    /// Payload must equal these bytes
    Bytes(Vec<u8>),
    /// Anchored expression over the uppercase hex rendering of the payload
    Regex(Regex),
}

impl RequestPattern {
    /// Compile `pattern` so it has to match the whole normalized string
    pub fn regex(pattern: &str) -> SimResult<Self> {
        Ok(RequestPattern::Regex(Regex::new(&format!("^(?:{})$", pattern))?))
    }

    /// Classify a request string.
    ///
    /// Strings containing `[`, `.` or `|` are templates: `[]` becomes `.*`,
    /// hex letters are uppercased, spaces are stripped and the result compiled
    /// as a regex. Escaped characters (`\d`, `\s`) are kept as written.
    /// Anything else is decoded as literal hex.
    pub fn parse(request: &str) -> SimResult<Self> {
        if request.contains(|c: char| matches!(c, '[' | '.' | '|')) {
            Self::regex(&normalize_template(request))
        } else {
            Ok(RequestPattern::Bytes(parse_hex(request)?))
        }
    }

    /// Whether `payload` matches; at most `regex_match_bytes` leading bytes
    /// are rendered for regex patterns
    pub fn matches(&self, payload: &[u8], regex_match_bytes: usize) -> bool {
        match self {
            RequestPattern::Bytes(bytes) => bytes.as_slice() == payload,
            RequestPattern::Regex(regex) => {
                let considered = &payload[..payload.len().min(regex_match_bytes)];
                regex.is_match(&to_hex_upper(considered))
            }
        }
    }
}

fn normalize_template(request: &str) -> String {
    let mut template = String::with_capacity(request.len());
    let mut escaped = false;
    for c in request.replace("[]", ".*").chars() {
        if escaped {
            template.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' => {
                escaped = true;
                template.push(c);
            }
            ' ' => {}
            c if c.is_ascii_hexdigit() => template.push(c.to_ascii_uppercase()),
            c => template.push(c),
        }
    }
    template
}

impl fmt::Display for RequestPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestPattern::Bytes(bytes) => write!(f, "{}", to_hex_upper(bytes)),
            RequestPattern::Regex(regex) => write!(f, "/{}/", regex.as_str()),
        }
    }
}

/// A single request rule with its handler and private storage
pub struct RequestMatcher {
    name: Option<String>,
    pattern: RequestPattern,
    handler: ResponseHandler,
    storage: KeyedStorage,
}

impl RequestMatcher {
    /// Build a matcher from exactly one of `bytes` and a `regex` pattern.
    ///
    /// The pattern is anchored so it has to match the whole normalized
    /// request. Flags go inline, e.g. `(?i)`.
    pub fn new(
        name: Option<String>,
        bytes: Option<Vec<u8>>,
        regex: Option<&str>,
        handler: ResponseHandler,
    ) -> SimResult<Self> {
        let pattern = match (bytes, regex) {
            (Some(bytes), None) => RequestPattern::Bytes(bytes),
            (None, Some(regex)) => RequestPattern::regex(regex)?,
            (Some(_), Some(_)) => {
                return Err(SimError::InvalidConfig(
                    "request matcher needs either bytes or a regex, not both".to_string(),
                ))
            }
            (None, None) => {
                return Err(SimError::InvalidConfig(
                    "request matcher needs either bytes or a regex".to_string(),
                ))
            }
        };
        Ok(Self::with_pattern(name, pattern, handler))
    }

    fn with_pattern(name: Option<String>, pattern: RequestPattern, handler: ResponseHandler) -> Self {
        Self {
            name,
            pattern,
            handler,
            storage: KeyedStorage::new(),
        }
    }

    /// Matcher for one exact payload
    pub fn exact<F>(bytes: impl Into<Vec<u8>>, handler: F) -> Self
    where
        F: Fn(&mut ResponseContext<'_>) -> SimResult<()> + Send + Sync + 'static,
    {
        Self::with_pattern(None, RequestPattern::Bytes(bytes.into()), Arc::new(handler))
    }

    /// Matcher for a regex over the uppercase hex request
    pub fn regex<F>(pattern: &str, handler: F) -> SimResult<Self>
    where
        F: Fn(&mut ResponseContext<'_>) -> SimResult<()> + Send + Sync + 'static,
    {
        Ok(Self::with_pattern(
            None,
            RequestPattern::regex(pattern)?,
            Arc::new(handler),
        ))
    }

    /// Matcher from the string form, see [`RequestPattern::parse`].
    ///
    /// Literal hex containing a `.` cannot be expressed this way; use
    /// [`exact`](Self::exact) instead.
    pub fn parse<F>(request: &str, handler: F) -> SimResult<Self>
    where
        F: Fn(&mut ResponseContext<'_>) -> SimResult<()> + Send + Sync + 'static,
    {
        Ok(Self::with_pattern(
            None,
            RequestPattern::parse(request)?,
            Arc::new(handler),
        ))
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn pattern(&self) -> &RequestPattern {
        &self.pattern
    }

    /// Storage that survives between requests until [`reset`](Self::reset)
    pub fn storage(&self) -> &KeyedStorage {
        &self.storage
    }

    pub fn matches(&self, payload: &[u8], regex_match_bytes: usize) -> bool {
        self.pattern.matches(payload, regex_match_bytes)
    }

    /// Clear this matcher's storage
    pub fn reset(&self) {
        self.storage.clear();
    }

    pub(crate) fn handle(&self, ctx: &mut ResponseContext<'_>) -> SimResult<()> {
        (self.handler)(ctx)
    }
}

impl fmt::Debug for RequestMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestMatcher")
            .field("name", &self.name)
            .field("pattern", &self.pattern.to_string())
            .finish_non_exhaustive()
    }
}
