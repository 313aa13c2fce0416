use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};

use regex::Regex;
use snafu::{ensure, ResultExt, Snafu};

use super::element::{Namespace, NamespaceElement};

pub(crate) const MIN_NAMESPACE_ELEMENTS: usize = 2;

const SEPARATOR: char = '/';
const STATIC_ANY: &str = "*";
const STATIC_RECURSIVE_ANY: &str = "**";

// Parsed segments are cached process-wide, keyed by raw segment text. Filter
// and non-filter parses are cached separately since the accepting-group
// variants differ between them.
static FILTER_SEGMENTS: LazyLock<Mutex<HashMap<String, NamespaceElement>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));
static SELECTOR_SEGMENTS: LazyLock<Mutex<HashMap<String, NamespaceElement>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

#[derive(Debug, Clone, Snafu)]
pub enum ParseError {
    #[snafu(display(
        "namespace `{namespace}` does not contain a valid number of elements (min. 2)"
    ))]
    TooFewElements { namespace: String },

    #[snafu(display("namespace `{namespace}` should start with `/`"))]
    NoLeadingSeparator { namespace: String },

    #[snafu(display("invalid character(s) used for element `{element}`"))]
    InvalidElement { element: String },

    #[snafu(display("invalid character(s) used for group name `{name}`"))]
    InvalidGroupName { name: String },

    #[snafu(display("invalid character(s) used for group value `{value}`"))]
    InvalidGroupValue { value: String },

    #[snafu(display("invalid regular expression `{pattern}`: {source}"))]
    InvalidRegex {
        pattern: String,
        source: regex::Error,
    },

    #[snafu(display("recursive any-matcher (**) can be placed only as the last element"))]
    RecursiveNotLast,

    #[snafu(display("element `{element}` is not concrete"))]
    NotConcrete { element: String },
}

/// Parses a whole selector (e.g. `/plugin/[group={re}]/group2/metric1`) into
/// its typed elements. Filter-side parses produce the accepting-group
/// variants of static elements.
pub fn parse_namespace(namespace: &str, is_filter: bool) -> Result<Namespace, ParseError> {
    let segments: Vec<&str> = namespace.split(SEPARATOR).collect();
    ensure!(
        segments.len().saturating_sub(1) >= MIN_NAMESPACE_ELEMENTS,
        TooFewElementsSnafu { namespace }
    );
    ensure!(segments[0].is_empty(), NoLeadingSeparatorSnafu { namespace });

    let segments = &segments[1..];
    let mut elements = Vec::with_capacity(segments.len());
    for (position, segment) in segments.iter().enumerate() {
        let element = cached_element(segment, is_filter)?;
        ensure!(
            !matches!(element, NamespaceElement::StaticRecursiveAny)
                || position == segments.len() - 1,
            RecursiveNotLastSnafu
        );
        elements.push(element);
    }

    Ok(Namespace::new(elements))
}

/// Parses a namespace that must be concrete (only literal and `[group=value]`
/// levels), as produced by user code at metric emission time.
pub fn parse_concrete_namespace(namespace: &str) -> Result<Namespace, ParseError> {
    let parsed = parse_namespace(namespace, false)?;
    if let Some(element) = parsed.elements().iter().find(|el| !el.is_concrete()) {
        return NotConcreteSnafu {
            element: element.to_string(),
        }
        .fail();
    }
    Ok(parsed)
}

fn cached_element(segment: &str, is_filter: bool) -> Result<NamespaceElement, ParseError> {
    let cache = if is_filter {
        &FILTER_SEGMENTS
    } else {
        &SELECTOR_SEGMENTS
    };

    if let Some(element) = cache.lock().expect("poisoned lock").get(segment) {
        return Ok(element.clone());
    }

    let element = parse_element(segment, is_filter)?;
    cache
        .lock()
        .expect("poisoned lock")
        .insert(segment.to_string(), element.clone());
    Ok(element)
}

/// Parses a single segment (e.g. `[group={re}]`).
fn parse_element(segment: &str, is_filter: bool) -> Result<NamespaceElement, ParseError> {
    if let Some(group) = surrounded(segment, '[', ']') {
        return match group.split_once('=') {
            Some((name, value)) => {
                ensure!(is_valid_identifier(name), InvalidGroupNameSnafu { name });
                if let Some(pattern) = surrounded(value, '{', '}') {
                    Ok(NamespaceElement::DynamicRegex {
                        group: name.to_string(),
                        pattern: compile_regex(pattern)?,
                    })
                } else if is_valid_identifier(value) {
                    Ok(NamespaceElement::DynamicSpecific {
                        group: name.to_string(),
                        value: value.to_string(),
                        accepts_bare: is_filter,
                    })
                } else {
                    InvalidGroupValueSnafu { value }.fail()
                }
            }
            None => {
                ensure!(is_valid_identifier(group), InvalidGroupNameSnafu { name: group });
                Ok(NamespaceElement::DynamicAny {
                    group: group.to_string(),
                })
            }
        };
    }

    if let Some(pattern) = surrounded(segment, '{', '}') {
        return Ok(NamespaceElement::StaticRegex {
            pattern: compile_regex(pattern)?,
            accepts_group: is_filter,
        });
    }

    if segment == STATIC_RECURSIVE_ANY {
        return Ok(NamespaceElement::StaticRecursiveAny);
    }

    if segment == STATIC_ANY {
        return Ok(NamespaceElement::StaticAny);
    }

    if is_valid_identifier(segment) {
        return Ok(NamespaceElement::StaticSpecific {
            name: segment.to_string(),
            accepts_group: is_filter,
        });
    }

    InvalidElementSnafu { element: segment }.fail()
}

fn compile_regex(pattern: &str) -> Result<Regex, ParseError> {
    Regex::new(pattern).context(InvalidRegexSnafu { pattern })
}

fn surrounded(segment: &str, open: char, close: char) -> Option<&str> {
    segment.strip_prefix(open)?.strip_suffix(close)
}

fn is_valid_identifier(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
