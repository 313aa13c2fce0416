use super::element::{Namespace, NamespaceElement};
use super::parser::{parse_namespace, ParseError};

/// Outcome of matching a concrete namespace against a rule tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchOutcome {
    pub matched: bool,
    /// Selector text of the most specific matching rule, if any.
    pub definition: Option<String>,
}

impl MatchOutcome {
    fn miss() -> Self {
        Self {
            matched: false,
            definition: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TreeKind {
    /// Declared metric schema: unknown namespaces are rejected.
    Definition,
    /// Task filter: an empty tree matches everything.
    Filter,
}

/// A prefix tree whose edges are namespace elements.
///
/// The tree is built once during plugin startup (schema) or task load
/// (filter) and is read-only afterwards. Nodes live in an append-only arena
/// and reference each other by index.
#[derive(Debug)]
pub struct TreeValidator {
    kind: TreeKind,
    nodes: Vec<Node>,
    rules: Vec<String>,
}

#[derive(Debug)]
struct Node {
    element: Option<NamespaceElement>,
    children: Vec<usize>,
    /// Index of the rule terminating at this node.
    rule: Option<usize>,
}

impl Node {
    fn root() -> Self {
        Self {
            element: None,
            children: Vec::new(),
            rule: None,
        }
    }
}

impl TreeValidator {
    /// A validator for declared metric definitions.
    pub fn definition() -> Self {
        Self::new(TreeKind::Definition)
    }

    /// A validator for host-supplied metric filters.
    pub fn filter() -> Self {
        Self::new(TreeKind::Filter)
    }

    fn new(kind: TreeKind) -> Self {
        Self {
            kind,
            nodes: vec![Node::root()],
            rules: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Parses the selector and inserts it into the tree.
    pub fn add_rule(&mut self, selector: &str) -> Result<(), ParseError> {
        let parsed = parse_namespace(selector, self.kind == TreeKind::Filter)?;

        let rule = self.rules.len();
        self.rules.push(selector.to_string());

        let mut node = 0;
        for element in parsed.elements() {
            node = self.child(node, element);
        }
        if self.nodes[node].rule.is_none() {
            self.nodes[node].rule = Some(rule);
        }
        Ok(())
    }

    fn child(&mut self, parent: usize, element: &NamespaceElement) -> usize {
        let found = self.nodes[parent]
            .children
            .iter()
            .copied()
            .find(|&child| self.nodes[child].element.as_ref() == Some(element));
        if let Some(child) = found {
            return child;
        }

        let child = self.nodes.len();
        self.nodes.push(Node {
            element: Some(element.clone()),
            children: Vec::new(),
            rule: None,
        });
        self.nodes[parent].children.push(child);
        child
    }

    /// Walks the tree guided by the concrete namespace. When several rules
    /// match, the one with the fewest wildcards wins; ties are broken by
    /// insertion order.
    pub fn is_valid(&self, concrete: &Namespace) -> MatchOutcome {
        if self.kind == TreeKind::Filter && self.rules.is_empty() {
            return MatchOutcome {
                matched: true,
                definition: None,
            };
        }

        let mut best: Option<(u32, usize)> = None;
        self.walk(0, concrete.elements(), 0, &mut best);

        match best {
            Some((_, rule)) => MatchOutcome {
                matched: true,
                definition: Some(self.rules[rule].clone()),
            },
            None => MatchOutcome::miss(),
        }
    }

    fn walk(
        &self,
        node: usize,
        remaining: &[NamespaceElement],
        weight: u32,
        best: &mut Option<(u32, usize)>,
    ) {
        let current = &self.nodes[node];

        if remaining.is_empty() {
            if let Some(rule) = current.rule {
                record(best, weight, rule);
            }
            // A trailing `**` child matches zero remaining levels.
            for &child in &current.children {
                let child_node = &self.nodes[child];
                if let Some(element @ NamespaceElement::StaticRecursiveAny) = &child_node.element {
                    if let Some(rule) = child_node.rule {
                        record(best, weight + element.wildcard_weight(), rule);
                    }
                }
            }
            return;
        }

        for &child in &current.children {
            let child_node = &self.nodes[child];
            let element = match &child_node.element {
                Some(element) => element,
                None => continue,
            };

            if matches!(element, NamespaceElement::StaticRecursiveAny) {
                if let Some(rule) = child_node.rule {
                    record(best, weight + element.wildcard_weight(), rule);
                }
                continue;
            }

            if element.matches(&remaining[0]) {
                self.walk(child, &remaining[1..], weight + element.wildcard_weight(), best);
            }
        }
    }
}

fn record(best: &mut Option<(u32, usize)>, weight: u32, rule: usize) {
    let better = match best {
        None => true,
        Some((best_weight, best_rule)) => {
            weight < *best_weight || (weight == *best_weight && rule < *best_rule)
        }
    };
    if better {
        *best = Some((weight, rule));
    }
}
