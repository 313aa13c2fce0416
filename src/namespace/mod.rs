//! Hierarchical metric identifiers and the selector grammar used to declare
//! schemas and filters over them.

mod element;
mod parser;
mod tree;

pub use element::{Namespace, NamespaceElement};
pub use parser::{parse_concrete_namespace, parse_namespace, ParseError};
pub use tree::{MatchOutcome, TreeValidator};
