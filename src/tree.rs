//! Nested containers of values and their structure descriptions.
//!
//! Programs are called with an `(args, kwargs)` tree of values. Exporting
//! flattens the tree into a list of leaves plus a [`TreeSpec`] recording its
//! structure, so the structure can be checked and rebuilt later.

use std::convert::Infallible;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A nested container of values of type `T`.
#[derive(Clone, Debug, PartialEq)]
pub enum Tree<T> {
    Leaf(T),
    /// An absent value. This is part of the structure and has no leaves.
    None,
    Tuple(Vec<Tree<T>>),
    List(Vec<Tree<T>>),
    /// Mapping with keys in insertion order.
    Dict(Vec<(String, Tree<T>)>),
}

/// Structure of a [`Tree`], without the leaf values.
///
/// Two trees have equal specs if they have the same container types, lengths
/// and dict keys (in the same order).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TreeSpec {
    Leaf,
    None,
    Tuple(Vec<TreeSpec>),
    List(Vec<TreeSpec>),
    Dict {
        keys: Vec<String>,
        values: Vec<TreeSpec>,
    },
}

/// One step in the path from the root of a tree to a leaf.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum KeyEntry {
    /// Position in a tuple or list.
    Index(usize),
    /// Key in a dict.
    Key(String),
}

impl fmt::Display for KeyEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyEntry::Index(idx) => write!(f, "[{}]", idx),
            KeyEntry::Key(key) => write!(f, "['{}']", key),
        }
    }
}

/// Format a key path as eg. `[0]['mask']`.
pub fn keystr(path: &[KeyEntry]) -> String {
    path.iter().map(|k| k.to_string()).collect()
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum TreeError {
    #[error("tree spec expects {expected} leaves but {actual} were provided")]
    LeafCountMismatch { expected: usize, actual: usize },

    #[error("expected keyword arguments {expected:?} but got {actual:?}")]
    KwargsMismatch {
        expected: Vec<String>,
        actual: Vec<String>,
    },

    #[error("tree spec does not describe an (args, kwargs) call: {0}")]
    NotACallSpec(String),

    #[error("could not decode tree spec: {0}")]
    Decode(String),
}

impl<T> Tree<T> {
    /// Create the `(args, kwargs)` tree used as the input of a program call.
    pub fn call_args(args: Vec<Tree<T>>, kwargs: Vec<(String, Tree<T>)>) -> Tree<T> {
        Tree::Tuple(vec![Tree::Tuple(args), Tree::Dict(kwargs)])
    }

    pub fn as_leaf(&self) -> Option<&T> {
        match self {
            Tree::Leaf(x) => Some(x),
            _ => None,
        }
    }

    /// Return the item at `index` of a tuple or list.
    pub fn item(&self, index: usize) -> Option<&Tree<T>> {
        match self {
            Tree::Tuple(items) | Tree::List(items) => items.get(index),
            _ => None,
        }
    }

    /// Return the value for `key` of a dict.
    pub fn get(&self, key: &str) -> Option<&Tree<T>> {
        match self {
            Tree::Dict(items) => items.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Return positional argument `index` of an `(args, kwargs)` tree.
    pub fn arg(&self, index: usize) -> Option<&Tree<T>> {
        self.item(0)?.item(index)
    }

    /// Return keyword argument `key` of an `(args, kwargs)` tree.
    pub fn kwarg(&self, key: &str) -> Option<&Tree<T>> {
        self.item(1)?.get(key)
    }

    /// Return the structure of this tree.
    pub fn spec(&self) -> TreeSpec {
        match self {
            Tree::Leaf(_) => TreeSpec::Leaf,
            Tree::None => TreeSpec::None,
            Tree::Tuple(items) => TreeSpec::Tuple(items.iter().map(|t| t.spec()).collect()),
            Tree::List(items) => TreeSpec::List(items.iter().map(|t| t.spec()).collect()),
            Tree::Dict(items) => TreeSpec::Dict {
                keys: items.iter().map(|(k, _)| k.clone()).collect(),
                values: items.iter().map(|(_, v)| v.spec()).collect(),
            },
        }
    }

    /// Return a tree with the same structure that borrows the leaves of this one.
    pub fn as_ref(&self) -> Tree<&T> {
        match self {
            Tree::Leaf(x) => Tree::Leaf(x),
            Tree::None => Tree::None,
            Tree::Tuple(items) => Tree::Tuple(items.iter().map(|t| t.as_ref()).collect()),
            Tree::List(items) => Tree::List(items.iter().map(|t| t.as_ref()).collect()),
            Tree::Dict(items) => {
                Tree::Dict(items.iter().map(|(k, v)| (k.clone(), v.as_ref())).collect())
            }
        }
    }

    /// Flatten the tree into its leaves, in depth-first order, and its spec.
    pub fn flatten(self) -> (Vec<T>, TreeSpec) {
        let spec = self.spec();
        let mut leaves = Vec::new();
        self.collect_leaves(&mut leaves);
        (leaves, spec)
    }

    fn collect_leaves(self, leaves: &mut Vec<T>) {
        match self {
            Tree::Leaf(x) => leaves.push(x),
            Tree::None => {}
            Tree::Tuple(items) | Tree::List(items) => {
                for item in items {
                    item.collect_leaves(leaves);
                }
            }
            Tree::Dict(items) => {
                for (_, item) in items {
                    item.collect_leaves(leaves);
                }
            }
        }
    }

    /// Return references to the leaves in flattening order.
    pub fn leaves(&self) -> Vec<&T> {
        self.as_ref().flatten().0
    }

    /// Return mutable references to the leaves in flattening order.
    pub fn leaves_mut(&mut self) -> Vec<&mut T> {
        fn visit<'a, T>(tree: &'a mut Tree<T>, leaves: &mut Vec<&'a mut T>) {
            match tree {
                Tree::Leaf(x) => leaves.push(x),
                Tree::None => {}
                Tree::Tuple(items) | Tree::List(items) => {
                    for item in items {
                        visit(item, leaves);
                    }
                }
                Tree::Dict(items) => {
                    for (_, item) in items {
                        visit(item, leaves);
                    }
                }
            }
        }
        let mut leaves = Vec::new();
        visit(self, &mut leaves);
        leaves
    }

    /// Map each leaf, together with its key path, to a new value.
    ///
    /// Leaves are visited in flattening order.
    pub fn try_map_with_path<U, E>(
        self,
        f: &mut impl FnMut(&[KeyEntry], T) -> Result<U, E>,
    ) -> Result<Tree<U>, E> {
        let mut path = Vec::new();
        self.map_inner(&mut path, f)
    }

    fn map_inner<U, E>(
        self,
        path: &mut Vec<KeyEntry>,
        f: &mut impl FnMut(&[KeyEntry], T) -> Result<U, E>,
    ) -> Result<Tree<U>, E> {
        let mut map_items =
            |items: Vec<Tree<T>>, path: &mut Vec<KeyEntry>| -> Result<Vec<Tree<U>>, E> {
                items
                    .into_iter()
                    .enumerate()
                    .map(|(i, item)| {
                        path.push(KeyEntry::Index(i));
                        let mapped = item.map_inner(path, f);
                        path.pop();
                        mapped
                    })
                    .collect::<Result<Vec<_>, E>>()
            };

        match self {
            Tree::Leaf(x) => f(path, x).map(Tree::Leaf),
            Tree::None => Ok(Tree::None),
            Tree::Tuple(items) => map_items(items, path).map(Tree::Tuple),
            Tree::List(items) => map_items(items, path).map(Tree::List),
            Tree::Dict(items) => items
                .into_iter()
                .map(|(key, item)| {
                    path.push(KeyEntry::Key(key.clone()));
                    let mapped = item.map_inner(path, f);
                    path.pop();
                    mapped.map(|m| (key, m))
                })
                .collect::<Result<Vec<_>, E>>()
                .map(Tree::Dict),
        }
    }

    /// Map each leaf to a new value.
    pub fn map<U>(self, mut f: impl FnMut(T) -> U) -> Tree<U> {
        let result: Result<_, Infallible> = self.try_map_with_path(&mut |_, x| Ok(f(x)));
        match result {
            Ok(tree) => tree,
            Err(never) => match never {},
        }
    }

    /// Return the key path of every leaf, in flattening order.
    pub fn leaf_paths(&self) -> Vec<Vec<KeyEntry>> {
        let mut paths = Vec::new();
        let _: Result<_, Infallible> = self.as_ref().try_map_with_path(&mut |path, _| {
            paths.push(path.to_vec());
            Ok(())
        });
        paths
    }
}

impl TreeSpec {
    /// Return the number of leaves in trees with this structure.
    pub fn num_leaves(&self) -> usize {
        match self {
            TreeSpec::Leaf => 1,
            TreeSpec::None => 0,
            TreeSpec::Tuple(items) | TreeSpec::List(items) => {
                items.iter().map(|s| s.num_leaves()).sum()
            }
            TreeSpec::Dict { values, .. } => values.iter().map(|s| s.num_leaves()).sum(),
        }
    }

    /// Return the number of direct children.
    pub fn num_children(&self) -> usize {
        match self {
            TreeSpec::Leaf | TreeSpec::None => 0,
            TreeSpec::Tuple(items) | TreeSpec::List(items) => items.len(),
            TreeSpec::Dict { values, .. } => values.len(),
        }
    }

    /// Rebuild a tree with this structure from its leaves.
    pub fn unflatten<T>(&self, leaves: Vec<T>) -> Result<Tree<T>, TreeError> {
        let expected = self.num_leaves();
        if leaves.len() != expected {
            return Err(TreeError::LeafCountMismatch {
                expected,
                actual: leaves.len(),
            });
        }
        let mut leaves = leaves.into_iter();
        Ok(self.build(&mut leaves))
    }

    fn build<T>(&self, leaves: &mut impl Iterator<Item = T>) -> Tree<T> {
        match self {
            // Leaf count was checked by the caller.
            TreeSpec::Leaf => leaves.next().map(Tree::Leaf).unwrap_or(Tree::None),
            TreeSpec::None => Tree::None,
            TreeSpec::Tuple(items) => Tree::Tuple(items.iter().map(|s| s.build(leaves)).collect()),
            TreeSpec::List(items) => Tree::List(items.iter().map(|s| s.build(leaves)).collect()),
            TreeSpec::Dict { keys, values } => Tree::Dict(
                keys.iter()
                    .zip(values)
                    .map(|(k, s)| (k.clone(), s.build(leaves)))
                    .collect(),
            ),
        }
    }

    /// Return the spec of the positional arguments and the keyword argument
    /// names, if this is the spec of an `(args, kwargs)` call.
    pub fn as_call_spec(&self) -> Option<(&[TreeSpec], &[String])> {
        match self {
            TreeSpec::Tuple(items) => match items.as_slice() {
                [TreeSpec::Tuple(args), TreeSpec::Dict { keys, .. }] => {
                    Some((args.as_slice(), keys.as_slice()))
                }
                _ => None,
            },
            _ => None,
        }
    }

    /// Encode this spec for storage alongside a compiled artifact.
    pub fn to_bytes(&self) -> Vec<u8> {
        // Serializing a tree of enums and strings cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<TreeSpec, TreeError> {
        serde_json::from_slice(bytes).map_err(|err| TreeError::Decode(err.to_string()))
    }
}

impl fmt::Display for TreeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let write_items = |f: &mut fmt::Formatter<'_>, items: &[TreeSpec]| {
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", item)?;
            }
            Ok(())
        };
        match self {
            TreeSpec::Leaf => write!(f, "*"),
            TreeSpec::None => write!(f, "None"),
            TreeSpec::Tuple(items) => {
                write!(f, "(")?;
                write_items(f, items)?;
                if items.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")
            }
            TreeSpec::List(items) => {
                write!(f, "[")?;
                write_items(f, items)?;
                write!(f, "]")
            }
            TreeSpec::Dict { keys, values } => {
                write!(f, "{{")?;
                for (i, (key, value)) in keys.iter().zip(values).enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", key, value)?;
                }
                write!(f, "}}")
            }
        }
    }
}

/// Reorder keyword arguments to match the order recorded in `in_spec`.
///
/// Fails if the set of keyword names differs from the recorded one.
pub fn reorder_kwargs<T>(
    mut kwargs: Vec<(String, Tree<T>)>,
    in_spec: &TreeSpec,
) -> Result<Vec<(String, Tree<T>)>, TreeError> {
    let Some((_, keys)) = in_spec.as_call_spec() else {
        return Err(TreeError::NotACallSpec(in_spec.to_string()));
    };

    let mismatch = |kwargs: &[(String, Tree<T>)]| TreeError::KwargsMismatch {
        expected: keys.to_vec(),
        actual: kwargs.iter().map(|(k, _)| k.clone()).collect(),
    };
    if kwargs.len() != keys.len() {
        return Err(mismatch(&kwargs));
    }

    let mut reordered = Vec::with_capacity(keys.len());
    for key in keys {
        let Some(pos) = kwargs.iter().position(|(k, _)| k == key) else {
            return Err(mismatch(&kwargs));
        };
        reordered.push(kwargs.remove(pos));
    }
    Ok(reordered)
}

#[cfg(test)]
mod tests {
    use super::{keystr, reorder_kwargs, KeyEntry, Tree, TreeError, TreeSpec};

    fn example_tree() -> Tree<i32> {
        Tree::call_args(
            vec![
                Tree::Leaf(1),
                Tree::List(vec![Tree::Leaf(2), Tree::None, Tree::Leaf(3)]),
            ],
            vec![("mask".to_string(), Tree::Leaf(4))],
        )
    }

    #[test]
    fn test_flatten_unflatten() {
        let tree = example_tree();
        let (leaves, spec) = tree.clone().flatten();
        assert_eq!(leaves, [1, 2, 3, 4]);
        assert_eq!(spec.num_leaves(), 4);
        assert_eq!(spec.to_string(), "((*, [*, None, *]), {mask: *})");

        let rebuilt = spec.unflatten(leaves).unwrap();
        assert_eq!(rebuilt, tree);

        assert_eq!(
            spec.unflatten(vec![1, 2]),
            Err(TreeError::LeafCountMismatch {
                expected: 4,
                actual: 2
            })
        );
    }

    #[test]
    fn test_accessors() {
        let tree = example_tree();
        assert_eq!(tree.arg(0).and_then(Tree::as_leaf), Some(&1));
        assert_eq!(tree.arg(1).and_then(|t| t.item(2)), Some(&Tree::Leaf(3)));
        assert_eq!(tree.kwarg("mask").and_then(Tree::as_leaf), Some(&4));
        assert_eq!(tree.kwarg("missing"), None);
        assert_eq!(tree.arg(5), None);
    }

    #[test]
    fn test_leaf_paths() {
        let paths = example_tree().leaf_paths();
        let names: Vec<_> = paths.iter().map(|p| keystr(p)).collect();
        assert_eq!(names, ["[0][0]", "[0][1][0]", "[0][1][2]", "[1]['mask']"]);
        assert_eq!(paths[3][1], KeyEntry::Key("mask".into()));
    }

    #[test]
    fn test_spec_depends_on_kwarg_order() {
        let a: Tree<i32> = Tree::call_args(
            vec![],
            vec![("x".into(), Tree::Leaf(1)), ("y".into(), Tree::Leaf(2))],
        );
        let b: Tree<i32> = Tree::call_args(
            vec![],
            vec![("y".into(), Tree::Leaf(2)), ("x".into(), Tree::Leaf(1))],
        );
        assert_ne!(a.spec(), b.spec());
    }

    #[test]
    fn test_reorder_kwargs() {
        let spec = Tree::<i32>::call_args(
            vec![],
            vec![("x".into(), Tree::Leaf(0)), ("y".into(), Tree::Leaf(0))],
        )
        .spec();

        let kwargs = vec![("y".to_string(), Tree::Leaf(2)), ("x".into(), Tree::Leaf(1))];
        let reordered = reorder_kwargs(kwargs, &spec).unwrap();
        let keys: Vec<_> = reordered.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["x", "y"]);

        let kwargs = vec![("z".to_string(), Tree::Leaf(2)), ("x".into(), Tree::Leaf(1))];
        assert!(matches!(
            reorder_kwargs(kwargs, &spec),
            Err(TreeError::KwargsMismatch { .. })
        ));

        assert!(matches!(
            reorder_kwargs::<i32>(vec![], &TreeSpec::Leaf),
            Err(TreeError::NotACallSpec(_))
        ));
    }

    #[test]
    fn test_spec_bytes() {
        let spec = example_tree().spec();
        let decoded = TreeSpec::from_bytes(&spec.to_bytes()).unwrap();
        assert_eq!(decoded, spec);
        assert!(TreeSpec::from_bytes(b"not json").is_err());
    }
}
