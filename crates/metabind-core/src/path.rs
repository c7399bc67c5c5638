//! Property paths into structured document metadata.
//!
//! A path is an ordered list of steps, each either an object key or an array
//! index. The textual form mirrors how properties are written in field
//! declarations: `tags[0]`, `project.status`, `["odd.key"].value`.

use std::fmt::{self, Write as _};
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

/// Errors produced while parsing or resolving a property path.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PathError {
    /// The path has no steps.
    #[error("property path is empty")]
    Empty,

    /// The textual path could not be parsed.
    #[error("invalid property path {input:?}: {reason}")]
    Syntax { input: String, reason: String },

    /// A container on the way to the target does not exist.
    #[error("parent `{parent}` does not exist")]
    MissingParent { parent: PropertyPath },

    /// The parent exists but cannot hold the final step.
    #[error("`{parent}` cannot hold {step}")]
    NotAContainer { parent: PropertyPath, step: PathStep },

    /// An array index more than one past the end of the array.
    #[error("index {index} is out of bounds for `{parent}` (length {len})")]
    IndexOutOfBounds {
        parent: PropertyPath,
        index: usize,
        len: usize,
    },
}

/// One access step of a [`PropertyPath`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathStep {
    /// Named field of an object.
    Key(String),
    /// Position in an array.
    Index(usize),
}

impl PathStep {
    fn get<'a>(&self, value: &'a Value) -> Option<&'a Value> {
        match (self, value) {
            (PathStep::Key(key), Value::Object(map)) => map.get(key),
            (PathStep::Index(index), Value::Array(items)) => items.get(*index),
            _ => None,
        }
    }

    fn get_mut<'a>(&self, value: &'a mut Value) -> Option<&'a mut Value> {
        match (self, value) {
            (PathStep::Key(key), Value::Object(map)) => map.get_mut(key),
            (PathStep::Index(index), Value::Array(items)) => items.get_mut(*index),
            _ => None,
        }
    }

    fn fits(&self, parent: &Value) -> bool {
        matches!(
            (self, parent),
            (PathStep::Key(_), Value::Object(_)) | (PathStep::Index(_), Value::Array(_))
        )
    }
}

impl fmt::Display for PathStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathStep::Key(key) => write!(f, "key {key:?}"),
            PathStep::Index(index) => write!(f, "index {index}"),
        }
    }
}

impl From<&str> for PathStep {
    fn from(key: &str) -> Self {
        PathStep::Key(key.to_string())
    }
}

impl From<String> for PathStep {
    fn from(key: String) -> Self {
        PathStep::Key(key)
    }
}

impl From<usize> for PathStep {
    fn from(index: usize) -> Self {
        PathStep::Index(index)
    }
}

/// An immutable path into a metadata tree.
///
/// Equality is structural and order-sensitive: `a.b` and `b.a` differ, and
/// `a` does not equal `a.b`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PropertyPath {
    steps: Vec<PathStep>,
}

impl PropertyPath {
    /// Parse the textual form of a path.
    ///
    /// # Example
    ///
    /// ```
    /// use metabind_core::{PathStep, PropertyPath};
    ///
    /// let path = PropertyPath::parse("tasks[2].done").unwrap();
    /// assert_eq!(
    ///     path.steps(),
    ///     &[PathStep::from("tasks"), PathStep::Index(2), PathStep::from("done")]
    /// );
    /// assert_eq!(path.to_string(), "tasks[2].done");
    /// ```
    pub fn parse(input: &str) -> Result<Self, PathError> {
        let chars: Vec<char> = input.chars().collect();
        if chars.is_empty() {
            return Err(PathError::Empty);
        }

        let mut steps = Vec::new();
        let mut pos = 0;
        let mut after_dot = false;

        while pos < chars.len() {
            match chars[pos] {
                '[' => {
                    if after_dot {
                        return Err(syntax(input, pos, "expected a key after '.'"));
                    }
                    let (step, next) = parse_bracket(input, &chars, pos)?;
                    steps.push(step);
                    pos = next;
                }
                '.' => {
                    if steps.is_empty() || after_dot {
                        return Err(syntax(input, pos, "empty key"));
                    }
                    after_dot = true;
                    pos += 1;
                }
                ']' => return Err(syntax(input, pos, "unmatched ']'")),
                _ => {
                    if !steps.is_empty() && !after_dot {
                        return Err(syntax(input, pos, "expected '.' or '['"));
                    }
                    let start = pos;
                    while pos < chars.len() && !matches!(chars[pos], '.' | '[' | ']') {
                        pos += 1;
                    }
                    steps.push(PathStep::Key(chars[start..pos].iter().collect()));
                    after_dot = false;
                }
            }
        }

        if after_dot {
            return Err(syntax(input, pos, "trailing '.'"));
        }

        Ok(Self { steps })
    }

    /// Build a path from already-split steps.
    pub fn from_steps(steps: impl IntoIterator<Item = impl Into<PathStep>>) -> Self {
        Self {
            steps: steps.into_iter().map(Into::into).collect(),
        }
    }

    pub fn steps(&self) -> &[PathStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// The path with its last step removed, or `None` for an empty path.
    pub fn parent(&self) -> Option<PropertyPath> {
        self.steps.split_last().map(|(_, init)| Self {
            steps: init.to_vec(),
        })
    }

    /// A new path extended by one step.
    pub fn child(&self, step: impl Into<PathStep>) -> PropertyPath {
        let mut steps = self.steps.clone();
        steps.push(step.into());
        Self { steps }
    }

    /// True if `other` starts with every step of `self` (including equality).
    pub fn is_prefix_of(&self, other: &PropertyPath) -> bool {
        other.steps.starts_with(&self.steps)
    }

    /// True if `other` lies strictly below `self`.
    pub fn is_ancestor_of(&self, other: &PropertyPath) -> bool {
        other.steps.len() > self.steps.len() && self.is_prefix_of(other)
    }

    /// Look up the value at this path.
    ///
    /// Returns `None` when any step is absent; missing intermediate nodes are
    /// not an error here.
    pub fn traverse<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        self.steps
            .iter()
            .try_fold(root, |current, step| step.get(current))
    }

    /// Resolve the container that holds the last step.
    ///
    /// Every step before the last must already exist. Nothing is created on
    /// the way down.
    pub fn traverse_to_parent<'a>(
        &'a self,
        root: &'a mut Value,
    ) -> Result<ParentSlot<'a>, PathError> {
        let (last, init) = self.steps.split_last().ok_or(PathError::Empty)?;

        let mut current = root;
        for step in init {
            current = step
                .get_mut(current)
                .ok_or_else(|| PathError::MissingParent {
                    parent: PropertyPath::from_steps(init.iter().cloned()),
                })?;
        }

        if !last.fits(current) {
            return Err(PathError::NotAContainer {
                parent: PropertyPath::from_steps(init.iter().cloned()),
                step: last.clone(),
            });
        }

        Ok(ParentSlot {
            path: self,
            parent: current,
            step: last,
        })
    }
}

/// The container slot addressed by the last step of a path.
pub struct ParentSlot<'a> {
    path: &'a PropertyPath,
    parent: &'a mut Value,
    step: &'a PathStep,
}

impl ParentSlot<'_> {
    /// The value currently stored in the slot.
    pub fn current(&self) -> Option<&Value> {
        self.step.get(self.parent)
    }

    /// Store `value` in the slot.
    ///
    /// Array slots accept an index equal to the current length, which appends.
    pub fn assign(self, value: Value) -> Result<(), PathError> {
        let parent_path = || {
            self.path
                .parent()
                .unwrap_or_else(|| PropertyPath::from_steps(Vec::<PathStep>::new()))
        };
        match (self.step, &mut *self.parent) {
            (PathStep::Key(key), Value::Object(map)) => {
                map.insert(key.clone(), value);
                Ok(())
            }
            (PathStep::Index(index), Value::Array(items)) => {
                let len = items.len();
                if *index < len {
                    items[*index] = value;
                } else if *index == len {
                    items.push(value);
                } else {
                    return Err(PathError::IndexOutOfBounds {
                        parent: parent_path(),
                        index: *index,
                        len,
                    });
                }
                Ok(())
            }
            _ => Err(PathError::NotAContainer {
                parent: parent_path(),
                step: self.step.clone(),
            }),
        }
    }
}

fn syntax(input: &str, pos: usize, what: &str) -> PathError {
    PathError::Syntax {
        input: input.to_string(),
        reason: format!("{what} at position {pos}"),
    }
}

/// Parse a `[...]` step starting at `chars[pos] == '['`.
///
/// Returns the step and the position just past the closing bracket.
fn parse_bracket(input: &str, chars: &[char], pos: usize) -> Result<(PathStep, usize), PathError> {
    let mut i = pos + 1;

    if chars.get(i) == Some(&'"') {
        i += 1;
        let mut key = String::new();
        loop {
            match chars.get(i) {
                None => return Err(syntax(input, i, "unterminated quoted key")),
                Some('\\') => match chars.get(i + 1) {
                    Some(c @ ('"' | '\\')) => {
                        key.push(*c);
                        i += 2;
                    }
                    _ => return Err(syntax(input, i, "invalid escape")),
                },
                Some('"') => {
                    i += 1;
                    break;
                }
                Some(c) => {
                    key.push(*c);
                    i += 1;
                }
            }
        }
        if chars.get(i) != Some(&']') {
            return Err(syntax(input, i, "expected ']'"));
        }
        return Ok((PathStep::Key(key), i + 1));
    }

    let start = i;
    while chars.get(i).is_some_and(|c| c.is_ascii_digit()) {
        i += 1;
    }
    if i == start {
        return Err(syntax(input, i, "expected an index or a quoted key"));
    }
    if chars.get(i) != Some(&']') {
        return Err(syntax(input, i, "expected ']'"));
    }
    let digits: String = chars[start..i].iter().collect();
    let index = digits
        .parse::<usize>()
        .map_err(|_| syntax(input, start, "index too large"))?;
    Ok((PathStep::Index(index), i + 1))
}

fn is_plain_key(key: &str) -> bool {
    !key.is_empty() && !key.contains(['.', '[', ']'])
}

impl fmt::Display for PropertyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, step) in self.steps.iter().enumerate() {
            match step {
                PathStep::Key(key) if is_plain_key(key) => {
                    if i > 0 {
                        f.write_char('.')?;
                    }
                    f.write_str(key)?;
                }
                PathStep::Key(key) => {
                    f.write_str("[\"")?;
                    for c in key.chars() {
                        if matches!(c, '"' | '\\') {
                            f.write_char('\\')?;
                        }
                        f.write_char(c)?;
                    }
                    f.write_str("\"]")?;
                }
                PathStep::Index(index) => write!(f, "[{index}]")?,
            }
        }
        Ok(())
    }
}

impl FromStr for PropertyPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for PropertyPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PropertyPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn path(s: &str) -> PropertyPath {
        PropertyPath::parse(s).unwrap()
    }

    #[test]
    fn test_parse_dotted() {
        assert_eq!(path("a.b.c"), PropertyPath::from_steps(["a", "b", "c"]));
    }

    #[test]
    fn test_parse_indices_and_quoted_keys() {
        let p = path(r#"list[3]["odd.key"].x"#);
        assert_eq!(
            p.steps(),
            &[
                PathStep::from("list"),
                PathStep::Index(3),
                PathStep::from("odd.key"),
                PathStep::from("x"),
            ]
        );
    }

    #[test]
    fn test_parse_keeps_spaces_in_keys() {
        assert_eq!(path("due date").steps(), &[PathStep::from("due date")]);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(PropertyPath::parse(""), Err(PathError::Empty));
        for bad in [".a", "a.", "a..b", "a[", "a[x]", "a]", "a[0]b", r#"a["x"#, "a.[0]"] {
            let err = PropertyPath::parse(bad).unwrap_err();
            assert!(matches!(err, PathError::Syntax { .. }), "{bad}: {err:?}");
        }
    }

    #[test]
    fn test_display_quotes_when_needed() {
        let p = PropertyPath::from_steps([
            PathStep::from("a"),
            PathStep::from("b.c"),
            PathStep::Index(0),
            PathStep::from(r#"q"uote"#),
        ]);
        assert_eq!(p.to_string(), r#"a["b.c"][0]["q\"uote"]"#);
        assert_eq!(path(&p.to_string()), p);
    }

    #[test]
    fn test_equality_is_order_sensitive() {
        assert_ne!(path("a.b"), path("b.a"));
        assert_ne!(path("a"), path("a.b"));
        assert_eq!(
            path("a[0]"),
            PropertyPath::from_steps([PathStep::from("a"), PathStep::Index(0)])
        );
    }

    #[test]
    fn test_prefix_and_ancestor() {
        assert!(path("a").is_prefix_of(&path("a.b")));
        assert!(path("a").is_prefix_of(&path("a")));
        assert!(path("a").is_ancestor_of(&path("a.b")));
        assert!(!path("a").is_ancestor_of(&path("a")));
        assert!(!path("a.c").is_prefix_of(&path("a.b")));
    }

    #[test]
    fn test_parent_and_child() {
        assert_eq!(path("a.b[1]").parent(), Some(path("a.b")));
        assert_eq!(path("a").child(2usize), path("a[2]"));
    }

    #[test]
    fn test_traverse() {
        let root = json!({"a": {"b": [10, {"c": true}]}});
        assert_eq!(path("a.b[0]").traverse(&root), Some(&json!(10)));
        assert_eq!(path("a.b[1].c").traverse(&root), Some(&json!(true)));
        assert_eq!(path("a.x.y").traverse(&root), None);
        assert_eq!(path("a.b.c").traverse(&root), None);
        assert_eq!(path("a.b[5]").traverse(&root), None);
    }

    #[test]
    fn test_traverse_to_parent_assigns() {
        let mut root = json!({"a": {"b": 1}, "list": [1]});
        let p = path("a.b");
        let slot = p.traverse_to_parent(&mut root).unwrap();
        assert_eq!(slot.current(), Some(&json!(1)));
        slot.assign(json!(2)).unwrap();

        let p = path("list[1]");
        p.traverse_to_parent(&mut root).unwrap().assign(json!(2)).unwrap();

        assert_eq!(root, json!({"a": {"b": 2}, "list": [1, 2]}));
    }

    #[test]
    fn test_traverse_to_parent_missing_parent() {
        let mut root = json!({"a": {}});
        let p = path("a.b.c");
        let err = p.traverse_to_parent(&mut root).err().unwrap();
        assert_eq!(err, PathError::MissingParent { parent: path("a.b") });
        assert!(err.to_string().contains("a.b"));
        assert_eq!(root, json!({"a": {}}));
    }

    #[test]
    fn test_traverse_to_parent_wrong_container() {
        let mut root = json!({"a": "text", "list": []});
        assert!(matches!(
            path("a.b").traverse_to_parent(&mut root).err(),
            Some(PathError::NotAContainer { .. })
        ));
        assert!(matches!(
            path("list.x").traverse_to_parent(&mut root).err(),
            Some(PathError::NotAContainer { .. })
        ));
    }

    #[test]
    fn test_assign_index_out_of_bounds() {
        let mut root = json!({"list": [1]});
        let p = path("list[3]");
        let err = p
            .traverse_to_parent(&mut root)
            .unwrap()
            .assign(json!(0))
            .unwrap_err();
        assert_eq!(
            err,
            PathError::IndexOutOfBounds {
                parent: path("list"),
                index: 3,
                len: 1
            }
        );
        assert_eq!(root, json!({"list": [1]}));
    }

    #[test]
    fn test_empty_path_has_no_parent_slot() {
        let mut root = json!({});
        let empty = PropertyPath::from_steps(Vec::<PathStep>::new());
        assert_eq!(empty.traverse_to_parent(&mut root).err(), Some(PathError::Empty));
        assert_eq!(empty.traverse(&root), Some(&json!({})));
    }

    #[test]
    fn test_serde_as_string() {
        let p = path("meta.tags[0]");
        let encoded = serde_json::to_string(&p).unwrap();
        assert_eq!(encoded, r#""meta.tags[0]""#);
        let decoded: PropertyPath = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, p);
        assert!(serde_json::from_str::<PropertyPath>(r#""a..b""#).is_err());
    }

    fn step() -> impl Strategy<Value = PathStep> {
        prop_oneof![
            "[a-z][a-z0-9 _-]{0,8}".prop_map(PathStep::Key),
            "[a-z.\\[\\]\"\\\\]{1,6}".prop_map(PathStep::Key),
            (0usize..1000).prop_map(PathStep::Index),
        ]
    }

    proptest! {
        #[test]
        fn display_then_parse_is_identity(steps in prop::collection::vec(step(), 1..6)) {
            let original = PropertyPath::from_steps(steps);
            let reparsed = PropertyPath::parse(&original.to_string()).unwrap();
            prop_assert_eq!(reparsed, original);
        }
    }
}
