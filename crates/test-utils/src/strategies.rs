//! Proptest strategies for revtree tests.
//!
//! Strategies produce names, values and edit scripts that a test applies to a
//! write transaction. They are independent of the store crate so that any test
//! target can depend on them.
//!
//! # Usage
//!
//! ```no_run
//! use revtree_test_utils::strategies;
//! use proptest::prelude::*;
//!
//! proptest! {
//!     #[test]
//!     fn my_property(script in strategies::arb_edit_script()) {
//!         // apply each edit to a write transaction and check an invariant
//!     }
//! }
//! ```

use proptest::prelude::*;

/// One step of a random tree edit script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Edit {
    /// Insert an element as first child of the current node.
    ElementAsFirstChild(String),
    /// Insert an element as right sibling of the current node.
    ElementAsRightSibling(String),
    /// Insert a text node as first child of the current node.
    TextAsFirstChild(Vec<u8>),
    /// Insert a text node as right sibling of the current node.
    TextAsRightSibling(Vec<u8>),
    /// Insert (or overwrite) an attribute on the current node.
    Attribute(String, Vec<u8>),
    /// Remove the current node.
    Remove,
    /// Move to the parent.
    MoveToParent,
    /// Move to the first child.
    MoveToFirstChild,
    /// Move to the right sibling.
    MoveToRightSibling,
}

/// Generates an XML-like name of 1-16 characters matching `[a-z][a-z0-9_]{0,15}`.
pub fn arb_name() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,15}"
}

/// Generates a node value of 0-63 random bytes.
pub fn arb_value() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(any::<u8>(), 0..64)
}

/// Generates an arbitrary [`Edit`], weighted towards inserts.
pub fn arb_edit() -> impl Strategy<Value = Edit> {
    prop_oneof![
        3 => arb_name().prop_map(Edit::ElementAsFirstChild),
        3 => arb_name().prop_map(Edit::ElementAsRightSibling),
        1 => arb_value().prop_map(Edit::TextAsFirstChild),
        1 => arb_value().prop_map(Edit::TextAsRightSibling),
        2 => (arb_name(), arb_value()).prop_map(|(name, value)| Edit::Attribute(name, value)),
        1 => Just(Edit::Remove),
        2 => Just(Edit::MoveToParent),
        2 => Just(Edit::MoveToFirstChild),
        1 => Just(Edit::MoveToRightSibling),
    ]
}

/// Generates a script of 1-40 edits.
pub fn arb_edit_script() -> impl Strategy<Value = Vec<Edit>> {
    proptest::collection::vec(arb_edit(), 1..40)
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn strategy_produces_valid_names(name in arb_name()) {
            prop_assert!(!name.is_empty());
            prop_assert!(name.len() <= 16);
            prop_assert!(name.starts_with(|c: char| c.is_ascii_lowercase()));
        }

        #[test]
        fn strategy_produces_bounded_scripts(script in arb_edit_script()) {
            prop_assert!(!script.is_empty());
            prop_assert!(script.len() < 40);
            for edit in &script {
                if let Edit::ElementAsFirstChild(name) | Edit::ElementAsRightSibling(name) = edit {
                    prop_assert!(!name.is_empty());
                }
            }
        }
    }
}
