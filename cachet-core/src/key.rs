//! Hierarchical cache key derivation and invalidation patterns.
//!
//! Every backend addresses storage through the same key scheme:
//!
//! ```text
//! prefix . static-tokens... . type-tag . additional-keys...
//! ```
//!
//! The type tag is the innermost generic argument of the cached type, so a
//! `Page<Widget>` and a `Vec<Widget>` both land under `Widget` and can be
//! invalidated together without knowing every wrapper shape used by callers.
//! Derivation is pure: the same namespace, tag and keys always produce the
//! same text, and the order of additional keys is significant.

use std::fmt;

/// Separator between key segments.
pub const SEPARATOR: char = '.';

/// Reserved trailing token addressing the freshness envelope of an entry.
pub const METADATA_TOKEN: &str = "MetaData";

/// Token callers may pass incidentally; it never contributes to an
/// untyped invalidation pattern.
pub const RESULT_SENTINEL: &str = "IResult";

/// Namespace shared by every key a provider derives.
///
/// A namespace without a prefix is unconfigured, and a provider holding one
/// reports itself unavailable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct KeyNamespace {
    prefix: String,
    static_tokens: Vec<String>,
}

impl KeyNamespace {
    /// Create a namespace from a prefix and its static uniqueness tokens
    /// (tenant, environment, schema version...).
    pub fn new<I, S>(prefix: impl Into<String>, static_tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            prefix: prefix.into(),
            static_tokens: static_tokens.into_iter().map(Into::into).collect(),
        }
    }

    /// The unset namespace.
    pub fn unset() -> Self {
        Self::default()
    }

    /// Returns true when a non-blank prefix is set.
    pub fn is_configured(&self) -> bool {
        !self.prefix.trim().is_empty()
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn static_tokens(&self) -> &[String] {
        &self.static_tokens
    }

    fn segments(&self) -> Vec<&str> {
        let mut segments = Vec::with_capacity(self.static_tokens.len() + 4);
        segments.push(self.prefix.as_str());
        segments.extend(self.static_tokens.iter().map(String::as_str));
        segments
    }
}

/// The value-type segment of a cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeTag(String);

impl TypeTag {
    /// Resolve the tag for `T`, unwrapping generic wrappers down to the
    /// innermost first generic argument.
    pub fn of<T: ?Sized>() -> Self {
        Self(resolve_type_tag(std::any::type_name::<T>()))
    }

    /// Use an explicit tag, e.g. when invalidating a type that is not in scope.
    pub fn named(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolve a type tag from a fully qualified type name.
///
/// Only the first generic argument is followed at each level, so
/// `HashMap<String, Widget>` resolves to `String`. Slices and arrays resolve
/// to their element and `str` to `String`, so borrowed and owned forms of a
/// value share a tag. Module paths are dropped.
pub fn resolve_type_tag(type_name: &str) -> String {
    let mut name = strip_sigils(type_name);
    loop {
        if let Some(element) = slice_element(name) {
            name = strip_sigils(element);
        } else if let Some(open) = name.find('<') {
            name = strip_sigils(first_generic_argument(&name[open + 1..]));
        } else {
            break;
        }
    }
    match strip_paths(name) {
        tag if tag == "str" => "String".to_string(),
        tag => tag,
    }
}

/// Element type of `[T]` or `[T; N]`.
fn slice_element(name: &str) -> Option<&str> {
    let inner = name.strip_prefix('[')?.strip_suffix(']')?;
    let mut depth = 0usize;
    for (idx, ch) in inner.char_indices() {
        match ch {
            '<' | '(' | '[' => depth += 1,
            '>' | ')' | ']' => depth = depth.saturating_sub(1),
            ';' if depth == 0 => return Some(&inner[..idx]),
            _ => {}
        }
    }
    Some(inner)
}

fn strip_sigils(mut name: &str) -> &str {
    loop {
        let trimmed = name.trim();
        let stripped = ["&", "mut ", "dyn ", "*const ", "*mut "]
            .iter()
            .find_map(|sigil| trimmed.strip_prefix(sigil));
        match stripped {
            Some(rest) => name = rest,
            None => return trimmed,
        }
    }
}

/// Text of the first argument in a generic argument list, given the text
/// that follows the opening `<`.
fn first_generic_argument(arguments: &str) -> &str {
    let mut depth = 0usize;
    for (idx, ch) in arguments.char_indices() {
        match ch {
            '<' | '(' | '[' => depth += 1,
            ')' | ']' => depth = depth.saturating_sub(1),
            '>' if depth == 0 => return &arguments[..idx],
            '>' => depth -= 1,
            ',' if depth == 0 => return &arguments[..idx],
            _ => {}
        }
    }
    arguments
}

/// Drop module paths from every identifier: `(i32, alloc::string::String)`
/// becomes `(i32, String)`.
fn strip_paths(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut ident = String::new();
    let mut chars = name.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch.is_alphanumeric() || ch == '_' {
            ident.push(ch);
        } else if ch == ':' && chars.peek() == Some(&':') {
            chars.next();
            ident.clear();
        } else {
            out.push_str(&ident);
            ident.clear();
            out.push(ch);
        }
    }
    out.push_str(&ident);
    out
}

fn join(segments: Vec<&str>) -> String {
    let mut buf = [0u8; 4];
    segments.join(SEPARATOR.encode_utf8(&mut buf))
}

/// Derive the storage key of a value.
pub fn derive_key<S: AsRef<str>>(
    namespace: &KeyNamespace,
    tag: &TypeTag,
    additional_keys: &[S],
) -> String {
    let mut segments = namespace.segments();
    segments.push(tag.as_str());
    segments.extend(additional_keys.iter().map(AsRef::as_ref));
    join(segments)
}

/// Derive the storage key of a value's freshness envelope.
pub fn derive_metadata_key<S: AsRef<str>>(
    namespace: &KeyNamespace,
    tag: &TypeTag,
    additional_keys: &[S],
) -> String {
    let mut key = derive_key(namespace, tag, additional_keys);
    key.push(SEPARATOR);
    key.push_str(METADATA_TOKEN);
    key
}

/// Wildcard covering a key and everything nested beneath it.
///
/// A key matches when it equals the base or continues it past a separator,
/// so invalidating `Widget` never touches `WidgetGroup`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationPattern {
    base: String,
}

impl InvalidationPattern {
    /// Every cached form of a type, regardless of additional keys.
    pub fn for_type(namespace: &KeyNamespace, tag: &TypeTag) -> Self {
        Self {
            base: derive_key::<&str>(namespace, tag, &[]),
        }
    }

    /// One typed entry plus everything nested under it (including its
    /// freshness envelope).
    pub fn for_entry<S: AsRef<str>>(
        namespace: &KeyNamespace,
        tag: &TypeTag,
        additional_keys: &[S],
    ) -> Self {
        Self {
            base: derive_key(namespace, tag, additional_keys),
        }
    }

    /// Untyped invalidation by arbitrary key segments under the namespace.
    pub fn for_keys<S: AsRef<str>>(namespace: &KeyNamespace, additional_keys: &[S]) -> Self {
        let mut segments = namespace.segments();
        segments.extend(
            additional_keys
                .iter()
                .map(AsRef::as_ref)
                .filter(|key| *key != RESULT_SENTINEL),
        );
        Self {
            base: join(segments),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Glob for backends with native pattern scans. Glob metacharacters in
    /// the base are escaped; callers still filter scan results with
    /// [`InvalidationPattern::matches`].
    pub fn glob(&self) -> String {
        let mut glob = String::with_capacity(self.base.len() + 2);
        for ch in self.base.chars() {
            if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
                glob.push('\\');
            }
            glob.push(ch);
        }
        glob.push('*');
        glob
    }

    pub fn matches(&self, key: &str) -> bool {
        match key.strip_prefix(self.base.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with(SEPARATOR),
            None => false,
        }
    }
}

impl fmt::Display for InvalidationPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}*", self.base)
    }
}
