//! Provenance of values and dimension sizes seen during tracing.

use std::fmt;

use crate::tree::KeyEntry;

/// Name of the local variable holding the `(args, kwargs)` call tree.
pub const ARGS_LOCAL: &str = "args";

/// Describes where a traced value or dimension size came from.
///
/// Sources are used to name symbols in error messages and to relate
/// constraints back to program inputs.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Source {
    /// A local variable.
    Local(String),
    /// An item of a tuple, list or dict.
    GetItem { base: Box<Source>, key: KeyEntry },
    /// An attribute of an object.
    Attr { base: Box<Source>, name: String },
    /// A property of a tensor, such as the size of one dimension.
    TensorProperty {
        base: Box<Source>,
        prop: TensorProperty,
        idx: usize,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TensorProperty {
    Size,
    Stride,
}

impl Source {
    pub fn local(name: &str) -> Source {
        Source::Local(name.to_string())
    }

    pub fn item(self, key: KeyEntry) -> Source {
        Source::GetItem {
            base: Box::new(self),
            key,
        }
    }

    pub fn attr(self, name: &str) -> Source {
        Source::Attr {
            base: Box::new(self),
            name: name.to_string(),
        }
    }

    /// Return the source of the size of dimension `dim` of this tensor.
    pub fn size(&self, dim: usize) -> Source {
        Source::TensorProperty {
            base: Box::new(self.clone()),
            prop: TensorProperty::Size,
            idx: dim,
        }
    }

    /// Return the canonical name of this source, eg. `args[0][1].size()[0]`.
    pub fn name(&self) -> String {
        self.to_string()
    }

    /// Return a name for this source which uses the program's parameter
    /// names in place of positions in the call tree.
    ///
    /// For example `args[0][1].size()[0]` becomes `y.size()[0]` if the
    /// second parameter is named `y`, and `args[1]['mask']` becomes `mask`.
    pub fn pretty_name(&self, param_names: &[String]) -> String {
        match self {
            Source::GetItem { base, key } => {
                if let Source::GetItem {
                    base: root,
                    key: KeyEntry::Index(group),
                } = base.as_ref()
                {
                    if root.as_ref() == &Source::local(ARGS_LOCAL) {
                        match (group, key) {
                            (0, KeyEntry::Index(i)) => {
                                if let Some(name) = param_names.get(*i) {
                                    return name.clone();
                                }
                            }
                            (1, KeyEntry::Key(name)) => return name.clone(),
                            _ => {}
                        }
                    }
                }
                format!("{}{}", base.pretty_name(param_names), key)
            }
            Source::Attr { base, name } => format!("{}.{}", base.pretty_name(param_names), name),
            Source::TensorProperty { base, prop, idx } => {
                format!("{}{}", base.pretty_name(param_names), prop.suffix(*idx))
            }
            Source::Local(name) => name.clone(),
        }
    }
}

impl TensorProperty {
    fn suffix(&self, idx: usize) -> String {
        match self {
            TensorProperty::Size => format!(".size()[{}]", idx),
            TensorProperty::Stride => format!(".stride()[{}]", idx),
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Local(name) => write!(f, "{}", name),
            Source::GetItem { base, key } => write!(f, "{}{}", base, key),
            Source::Attr { base, name } => write!(f, "{}.{}", base, name),
            Source::TensorProperty { base, prop, idx } => {
                write!(f, "{}{}", base, prop.suffix(*idx))
            }
        }
    }
}

/// Convert a source name such as `y['mask']` or `x.size()[0]` into an
/// identifier such as `y_mask` or `x_size_0`.
pub fn sanitize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            out.push(ch);
        } else if !out.is_empty() && !out.ends_with('_') {
            out.push('_');
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    if out.is_empty() || out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

/// Convert the key path of a leaf in the `(args, kwargs)` call tree into a
/// source rooted at the `args` local.
pub fn key_path_to_source(path: &[KeyEntry]) -> Source {
    path.iter()
        .fold(Source::local(ARGS_LOCAL), |source, key| source.item(key.clone()))
}

#[cfg(test)]
mod tests {
    use super::{key_path_to_source, sanitize_name, Source};
    use crate::tree::KeyEntry;

    #[test]
    fn test_source_names() {
        let src = key_path_to_source(&[KeyEntry::Index(0), KeyEntry::Index(1)]);
        assert_eq!(src.name(), "args[0][1]");
        assert_eq!(src.size(0).name(), "args[0][1].size()[0]");

        let params = vec!["x".to_string(), "y".to_string()];
        assert_eq!(src.size(0).pretty_name(&params), "y.size()[0]");

        let kwarg = key_path_to_source(&[KeyEntry::Index(1), KeyEntry::Key("mask".into())]);
        assert_eq!(kwarg.name(), "args[1]['mask']");
        assert_eq!(kwarg.size(1).pretty_name(&params), "mask.size()[1]");

        let nested = key_path_to_source(&[
            KeyEntry::Index(0),
            KeyEntry::Index(0),
            KeyEntry::Index(2),
        ]);
        assert_eq!(nested.pretty_name(&params), "x[2]");

        assert_eq!(sanitize_name("y['mask']"), "y_mask");
        assert_eq!(sanitize_name("x.size()[0]"), "x_size_0");
        assert_eq!(sanitize_name("x[2]"), "x_2");
        assert_eq!(sanitize_name("0"), "_0");

        let attr = Source::local("self").attr("fc").attr("weight");
        assert_eq!(attr.name(), "self.fc.weight");
    }
}
