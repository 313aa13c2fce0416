use std::fmt;

use regex::Regex;

/// One level of a metric namespace or selector.
///
/// Concrete namespaces (the ones attached to emitted metrics) contain only
/// `StaticSpecific` and `DynamicSpecific` elements; the remaining variants
/// appear in selectors used for schema declarations and task filters.
#[derive(Debug, Clone)]
pub enum NamespaceElement {
    /// Matches a single level literally.
    StaticSpecific { name: String, accepts_group: bool },
    /// `*`: matches any single level.
    StaticAny,
    /// `**`: matches all remaining levels; legal only in terminal position.
    StaticRecursiveAny,
    /// `{re}`: matches a single level against a regular expression.
    StaticRegex { pattern: Regex, accepts_group: bool },
    /// `[group]`: matches a single level, binding its value to the group.
    DynamicAny { group: String },
    /// `[group=value]`: a group-bound level with a known value.
    DynamicSpecific {
        group: String,
        value: String,
        accepts_bare: bool,
    },
    /// `[group={re}]`: matches a bound level whose value satisfies the pattern.
    DynamicRegex { group: String, pattern: Regex },
}

impl NamespaceElement {
    /// Whether this selector element matches a single concrete element.
    ///
    /// Recursive wildcards consume all remaining levels and are handled by
    /// the tree walk, not here. The group duality is filter-side only: static
    /// elements built with `accepts_group` also match concrete group bindings
    /// by value, and a `[group=value]` element built with `accepts_bare`
    /// matches a bare concrete level equal to its value. Definition-side
    /// parses carry neither flag and take every level literally.
    pub(crate) fn matches(&self, concrete: &NamespaceElement) -> bool {
        match (self, concrete) {
            (
                Self::StaticSpecific { name, .. },
                Self::StaticSpecific { name: concrete_name, .. },
            ) => name == concrete_name,
            (
                Self::StaticSpecific {
                    name,
                    accepts_group,
                },
                Self::DynamicSpecific { value, .. },
            ) => *accepts_group && name == value,
            (Self::StaticAny | Self::StaticRecursiveAny, _) => true,
            (Self::StaticRegex { pattern, .. }, Self::StaticSpecific { name, .. }) => {
                pattern.is_match(name)
            }
            (
                Self::StaticRegex {
                    pattern,
                    accepts_group,
                },
                Self::DynamicSpecific { value, .. },
            ) => *accepts_group && pattern.is_match(value),
            (
                Self::DynamicAny { group },
                Self::DynamicSpecific {
                    group: concrete_group,
                    ..
                },
            ) => group == concrete_group,
            (
                Self::DynamicSpecific { group, value, .. },
                Self::DynamicSpecific {
                    group: concrete_group,
                    value: concrete_value,
                    ..
                },
            ) => group == concrete_group && value == concrete_value,
            (
                Self::DynamicSpecific {
                    value,
                    accepts_bare,
                    ..
                },
                Self::StaticSpecific { name, .. },
            ) => *accepts_bare && value == name,
            (
                Self::DynamicRegex { group, pattern },
                Self::DynamicSpecific {
                    group: concrete_group,
                    value,
                    ..
                },
            ) => group == concrete_group && pattern.is_match(value),
            _ => false,
        }
    }

    /// Whether the element may appear in a concrete namespace.
    pub fn is_concrete(&self) -> bool {
        matches!(
            self,
            Self::StaticSpecific { .. } | Self::DynamicSpecific { .. }
        )
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(
            self,
            Self::DynamicAny { .. } | Self::DynamicSpecific { .. } | Self::DynamicRegex { .. }
        )
    }

    /// Group name of a dynamic element; empty for static elements.
    pub fn name(&self) -> &str {
        match self {
            Self::DynamicAny { group }
            | Self::DynamicSpecific { group, .. }
            | Self::DynamicRegex { group, .. } => group,
            _ => "",
        }
    }

    /// Concrete value of the level; empty for non-concrete elements.
    pub fn value(&self) -> &str {
        match self {
            Self::StaticSpecific { name, .. } => name,
            Self::DynamicSpecific { value, .. } => value,
            _ => "",
        }
    }

    /// Ranking used to resolve ambiguous matches: lower is more specific.
    pub(crate) fn wildcard_weight(&self) -> u32 {
        match self {
            Self::StaticSpecific { .. } | Self::DynamicSpecific { .. } => 0,
            Self::StaticRegex { .. } | Self::DynamicRegex { .. } => 1,
            Self::StaticAny | Self::DynamicAny { .. } => 2,
            Self::StaticRecursiveAny => 3,
        }
    }
}

impl PartialEq for NamespaceElement {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Self::StaticSpecific {
                    name: a,
                    accepts_group: ga,
                },
                Self::StaticSpecific {
                    name: b,
                    accepts_group: gb,
                },
            ) => a == b && ga == gb,
            (Self::StaticAny, Self::StaticAny) => true,
            (Self::StaticRecursiveAny, Self::StaticRecursiveAny) => true,
            (
                Self::StaticRegex {
                    pattern: a,
                    accepts_group: ga,
                },
                Self::StaticRegex {
                    pattern: b,
                    accepts_group: gb,
                },
            ) => a.as_str() == b.as_str() && ga == gb,
            (Self::DynamicAny { group: a }, Self::DynamicAny { group: b }) => a == b,
            (
                Self::DynamicSpecific {
                    group: ga,
                    value: va,
                    accepts_bare: ba,
                },
                Self::DynamicSpecific {
                    group: gb,
                    value: vb,
                    accepts_bare: bb,
                },
            ) => ga == gb && va == vb && ba == bb,
            (
                Self::DynamicRegex {
                    group: ga,
                    pattern: pa,
                },
                Self::DynamicRegex {
                    group: gb,
                    pattern: pb,
                },
            ) => ga == gb && pa.as_str() == pb.as_str(),
            _ => false,
        }
    }
}

impl Eq for NamespaceElement {}

impl fmt::Display for NamespaceElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StaticSpecific { name, .. } => f.write_str(name),
            Self::StaticAny => f.write_str("*"),
            Self::StaticRecursiveAny => f.write_str("**"),
            Self::StaticRegex { pattern, .. } => write!(f, "{{{}}}", pattern.as_str()),
            Self::DynamicAny { group } => write!(f, "[{group}]"),
            Self::DynamicSpecific { group, value, .. } => write!(f, "[{group}={value}]"),
            Self::DynamicRegex { group, pattern } => {
                write!(f, "[{group}={{{}}}]", pattern.as_str())
            }
        }
    }
}

/// An ordered sequence of namespace elements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    elements: Vec<NamespaceElement>,
}

impl Namespace {
    pub(crate) fn new(elements: Vec<NamespaceElement>) -> Self {
        Self { elements }
    }

    pub fn elements(&self) -> &[NamespaceElement] {
        &self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn at(&self, position: usize) -> Option<&NamespaceElement> {
        self.elements.get(position)
    }

    pub fn is_concrete(&self) -> bool {
        self.elements.iter().all(NamespaceElement::is_concrete)
    }

    /// Whether any level carries the given concrete value.
    pub fn has_element(&self, value: &str) -> bool {
        self.elements.iter().any(|element| element.value() == value)
    }

    /// Whether the level at `position` carries the given concrete value.
    pub fn has_element_on(&self, value: &str, position: usize) -> bool {
        self.at(position)
            .is_some_and(|element| element.value() == value)
    }

    /// Whether this selector matches the concrete namespace in full.
    pub fn matches(&self, concrete: &Namespace) -> bool {
        for (position, element) in self.elements.iter().enumerate() {
            if matches!(element, NamespaceElement::StaticRecursiveAny) {
                return concrete.len() >= position;
            }
            match concrete.elements.get(position) {
                Some(concrete_element) if element.matches(concrete_element) => {}
                _ => return false,
            }
        }
        self.elements.len() == concrete.len()
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for element in &self.elements {
            write!(f, "/{element}")?;
        }
        Ok(())
    }
}
