use std::collections::BTreeMap;

/// A label value. Labels are indexed by the backend, so they are restricted
/// to scalars.
#[derive(Debug, Clone, PartialEq)]
pub enum LabelValue {
    /// A string.
    Str(String),
    /// An integer.
    Int(i64),
    /// A float.
    Float(f64),
    /// A boolean.
    Bool(bool),
}

impl core::fmt::Display for LabelValue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Str(s) => f.write_str(s),
            Self::Int(i) => i.fmt(f),
            Self::Float(v) => v.fmt(f),
            Self::Bool(b) => b.fmt(f),
        }
    }
}

impl From<&str> for LabelValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for LabelValue {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<i64> for LabelValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<f64> for LabelValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for LabelValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// Labels attached to the ambient trace context.
///
/// Keys may not contain `.`, `*` or `"`; those characters are replaced by
/// `_` on insert, which is what APM servers expect.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Labels(BTreeMap<String, LabelValue>);

impl Labels {
    /// An empty label set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a label, builder style.
    pub fn with(mut self, key: &str, value: impl Into<LabelValue>) -> Self {
        self.insert(key, value);
        self
    }

    /// Add a label, replacing any previous value under the same key.
    pub fn insert(&mut self, key: &str, value: impl Into<LabelValue>) {
        self.0.insert(sanitize_key(key), value.into());
    }

    /// Look a label up by its sanitized key.
    pub fn get(&self, key: &str) -> Option<&LabelValue> {
        self.0.get(key)
    }

    /// Merge `other` into `self`. Labels from `other` win.
    pub fn merge(&mut self, other: Self) {
        self.0.extend(other.0);
    }

    /// Iterate labels in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &LabelValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of labels.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if there are no labels.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            '.' | '*' | '"' => '_',
            c => c,
        })
        .collect()
}

/// A value in the custom context. Unlike labels, custom context is not
/// indexed and may hold lists.
#[derive(Debug, Clone, PartialEq)]
pub enum ContextValue {
    /// A scalar.
    Scalar(LabelValue),
    /// A list of strings.
    List(Vec<String>),
}

macro_rules! scalar_context_value {
    ($($t:ty),*) => {
        $(
            impl From<$t> for ContextValue {
                fn from(value: $t) -> Self {
                    Self::Scalar(value.into())
                }
            }
        )*
    };
}

scalar_context_value!(&str, String, i64, f64, bool);

impl From<Vec<String>> for ContextValue {
    fn from(list: Vec<String>) -> Self {
        Self::List(list)
    }
}

impl<const N: usize> From<[&str; N]> for ContextValue {
    fn from(list: [&str; N]) -> Self {
        Self::List(list.iter().map(|s| s.to_string()).collect())
    }
}

/// Identity of the user on whose behalf work is traced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserContext {
    /// Stable user id.
    pub id: Option<String>,
    /// Display name.
    pub username: Option<String>,
    /// Contact address.
    pub email: Option<String>,
}

/// Arbitrary metadata attached to the ambient trace context.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CustomContext {
    /// User identity, if known.
    pub user: Option<UserContext>,
    /// Free-form fields.
    pub custom: BTreeMap<String, ContextValue>,
}

impl CustomContext {
    /// An empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the user identity.
    pub fn with_user(mut self, user: UserContext) -> Self {
        self.user = Some(user);
        self
    }

    /// Add a custom field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<ContextValue>) -> Self {
        self.custom.insert(key.into(), value.into());
        self
    }

    /// Merge `other` into `self`. A user in `other` replaces ours, fields
    /// from `other` win.
    pub fn merge(&mut self, other: Self) {
        if other.user.is_some() {
            self.user = other.user;
        }
        self.custom.extend(other.custom);
    }
}
