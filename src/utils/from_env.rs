use std::{
    convert::Infallible,
    env::VarError,
    num::ParseIntError,
    str::{
        FromStr,
        ParseBoolError,
    },
};

#[cfg(not(doctest))]
/// The `derive(FromEnv)` macro.
///
/// Generates a [`FromEnv`] implementation that loads every field of a struct
/// from its own environment variable (or, for nested [`FromEnv`] fields, from
/// that type's variables), plus a `<Struct>EnvError` enum with one variant per
/// fallible field.
///
/// ## Attributes
///
/// - `var = "NAME"`: the variable a [`FromEnvVar`] field is read from.
/// - `desc = "..."`: description for the inventory. Required with `var`.
/// - `optional`: informational, marks the variable optional in the
///   inventory. Use it on [`Option<T>`] fields.
/// - `infallible`: the field type's error is [`Infallible`], no error variant
///   is generated.
/// - `skip`: the field is filled with `Default::default()`.
///
/// Structs inside this crate must carry `#[from_env(crate)]` so the generated
/// code resolves the traits through `crate::utils::from_env`. See
/// [`PacingOverrides`] for an example.
///
/// ```
/// # #![allow(proc_macro_derive_resolution_fallback)]
/// use apm_smoke::utils::from_env::FromEnv;
///
/// #[derive(Debug, FromEnv)]
/// #[from_env(apm_smoke)]
/// pub struct ProbeCfg {
///     #[from_env(var = "PROBE_ATTEMPTS", desc = "How many probes to send")]
///     pub attempts: u8,
///
///     #[from_env(var = "PROBE_LABEL", desc = "Free-form probe label", optional, infallible)]
///     pub label: Option<String>,
/// }
/// # fn main() {}
/// ```
///
/// [`Infallible`]: std::convert::Infallible
/// [`PacingOverrides`]: crate::config::PacingOverrides
pub use init4_from_env_derive::FromEnv;

/// An environment variable read by a [`FromEnv`] type, used to print the
/// configuration surface and to check for missing required variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvItemInfo {
    /// The environment variable name.
    pub var: &'static str,
    /// What the variable controls.
    pub description: &'static str,
    /// Whether the variable may be left unset.
    pub optional: bool,
}

/// Error loading a value from the environment.
///
/// Environment-level failures (unset, empty) stay at the top level, while
/// `Inner` carries the parse failure of the concrete type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FromEnvErr<Inner> {
    /// The environment variable is missing.
    #[error("cannot read variable {0}: {1}")]
    EnvError(String, VarError),
    /// The environment variable is empty.
    #[error("environment variable {0} is empty")]
    Empty(String),
    /// The environment variable is present, but the value could not be parsed.
    #[error("failed to parse environment variable {0}")]
    ParseError(#[from] Inner),
}

impl FromEnvErr<Infallible> {
    /// Convert the error into another error type.
    pub fn infallible_into<T>(self) -> FromEnvErr<T> {
        match self {
            Self::EnvError(s, e) => FromEnvErr::EnvError(s, e),
            Self::Empty(s) => FromEnvErr::Empty(s),
            Self::ParseError(never) => match never {},
        }
    }
}

impl<Inner> FromEnvErr<Inner> {
    /// Create a new error from another error type.
    pub fn from<Other>(other: FromEnvErr<Other>) -> Self
    where
        Inner: From<Other>,
    {
        other.map(Inner::from)
    }

    /// Map the parse error, keeping environment-level failures intact.
    pub fn map<New>(self, f: impl FnOnce(Inner) -> New) -> FromEnvErr<New> {
        match self {
            Self::EnvError(s, e) => FromEnvErr::EnvError(s, e),
            Self::Empty(s) => FromEnvErr::Empty(s),
            Self::ParseError(e) => FromEnvErr::ParseError(f(e)),
        }
    }

    /// Missing env var.
    pub fn env_err(var: &str, e: VarError) -> Self {
        Self::EnvError(var.to_string(), e)
    }

    /// Empty env var.
    pub fn empty(var: &str) -> Self {
        Self::Empty(var.to_string())
    }

    /// Error while parsing.
    pub const fn parse_error(err: Inner) -> Self {
        Self::ParseError(err)
    }

    /// True if the variable was unset or empty. A non-UTF-8 value is
    /// present, and malformed.
    pub const fn is_absent(&self) -> bool {
        matches!(
            self,
            Self::EnvError(_, VarError::NotPresent) | Self::Empty(_)
        )
    }
}

/// Parse a value from the environment, if present and non-empty.
pub fn parse_env_if_present<T: FromStr>(env_var: &str) -> Result<T, FromEnvErr<T::Err>> {
    let s = std::env::var(env_var).map_err(|e| FromEnvErr::env_err(env_var, e))?;

    if s.is_empty() {
        Err(FromEnvErr::empty(env_var))
    } else {
        s.trim().parse().map_err(Into::into)
    }
}

/// A configuration object assembled from several environment variables.
///
/// Implementors know their variables at compile time and report them through
/// [`FromEnv::inventory`]. Leaf values are read with [`FromEnvVar`].
///
/// The associated `Error` is the *inner* parse error. Never use
/// [`FromEnvErr<T>`] as the associated type, or environment failures end up
/// nested inside parse failures.
pub trait FromEnv: core::fmt::Debug + Sized + 'static {
    /// Error type produced when loading from the environment.
    type Error: core::error::Error + Clone;

    /// Every variable this type reads, optional ones included.
    fn inventory() -> Vec<&'static EnvItemInfo>;

    /// Required variables from [`FromEnv::inventory`] that are not set.
    fn check_inventory() -> Result<(), Vec<&'static EnvItemInfo>> {
        let missing: Vec<_> = Self::inventory()
            .into_iter()
            .filter(|item| !item.optional && std::env::var(item.var).is_err())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(missing)
        }
    }

    /// Load from the environment.
    fn from_env() -> Result<Self, FromEnvErr<Self::Error>>;
}

impl<T> FromEnv for Option<T>
where
    T: FromEnv,
{
    type Error = T::Error;

    fn inventory() -> Vec<&'static EnvItemInfo> {
        T::inventory()
    }

    fn check_inventory() -> Result<(), Vec<&'static EnvItemInfo>> {
        T::check_inventory()
    }

    fn from_env() -> Result<Self, FromEnvErr<Self::Error>> {
        match T::from_env() {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.is_absent() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// A value read from exactly one environment variable, usually through its
/// [`FromStr`] impl.
///
/// Implemented for the integer and float primitives, [`String`], [`bool`],
/// [`url::Url`], [`tracing::Level`], comma-separated [`Vec`]s and
/// [`std::time::Duration`] (milliseconds).
///
/// ```
/// # use apm_smoke::utils::from_env::{parse_env_if_present, FromEnvErr, FromEnvVar};
/// #[derive(Debug)]
/// pub struct Region(String);
///
/// impl std::str::FromStr for Region {
///     type Err = std::convert::Infallible;
///
///     fn from_str(s: &str) -> Result<Self, Self::Err> {
///         Ok(Region(s.to_ascii_lowercase()))
///     }
/// }
///
/// impl FromEnvVar for Region {
///     type Error = std::convert::Infallible;
///
///     fn from_env_var(env_var: &str) -> Result<Self, FromEnvErr<Self::Error>> {
///         parse_env_if_present(env_var)
///     }
/// }
/// ```
pub trait FromEnvVar: core::fmt::Debug + Sized + 'static {
    /// Error type produced when parsing the primitive.
    type Error: core::error::Error;

    /// Load the primitive from the environment at the given variable.
    fn from_env_var(env_var: &str) -> Result<Self, FromEnvErr<Self::Error>>;

    /// As [`FromEnvVar::from_env_var`], returning `default` if the variable
    /// is unset or empty. A malformed value is still an error.
    fn from_env_var_or(env_var: &str, default: Self) -> Result<Self, FromEnvErr<Self::Error>> {
        Self::from_env_var_or_else(env_var, || default)
    }

    /// As [`FromEnvVar::from_env_var_or`], with a lazily computed default.
    fn from_env_var_or_else(
        env_var: &str,
        default: impl FnOnce() -> Self,
    ) -> Result<Self, FromEnvErr<Self::Error>> {
        match Self::from_env_var(env_var) {
            Ok(v) => Ok(v),
            Err(e) if e.is_absent() => Ok(default()),
            Err(e) => Err(e),
        }
    }

    /// As [`FromEnvVar::from_env_var_or`], defaulting to
    /// [`Default::default`].
    fn from_env_var_or_default(env_var: &str) -> Result<Self, FromEnvErr<Self::Error>>
    where
        Self: Default,
    {
        Self::from_env_var_or_else(env_var, Self::default)
    }
}

impl<T> FromEnvVar for Option<T>
where
    T: FromEnvVar,
{
    type Error = T::Error;

    fn from_env_var(env_var: &str) -> Result<Self, FromEnvErr<Self::Error>> {
        match std::env::var(env_var) {
            Ok(s) if s.is_empty() => Ok(None),
            Ok(_) => T::from_env_var(env_var).map(Some),
            Err(VarError::NotPresent) => Ok(None),
            Err(e) => Err(FromEnvErr::env_err(env_var, e)),
        }
    }
}

impl FromEnvVar for String {
    type Error = Infallible;

    fn from_env_var(env_var: &str) -> Result<Self, FromEnvErr<Self::Error>> {
        let s = std::env::var(env_var).map_err(|e| FromEnvErr::env_err(env_var, e))?;
        if s.is_empty() {
            Err(FromEnvErr::empty(env_var))
        } else {
            Ok(s)
        }
    }
}

impl FromEnvVar for std::time::Duration {
    type Error = ParseIntError;

    fn from_env_var(s: &str) -> Result<Self, FromEnvErr<Self::Error>> {
        u64::from_env_var(s).map(Self::from_millis)
    }
}

impl<T> FromEnvVar for Vec<T>
where
    T: From<String> + core::fmt::Debug + 'static,
{
    type Error = Infallible;

    fn from_env_var(env_var: &str) -> Result<Self, FromEnvErr<Self::Error>> {
        let s = std::env::var(env_var).map_err(|e| FromEnvErr::env_err(env_var, e))?;
        Ok(s.split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(|item| T::from(item.to_string()))
            .collect())
    }
}

macro_rules! impl_for_parseable {
    ($($t:ty),*) => {
        $(
            impl FromEnvVar for $t {
                type Error = <$t as FromStr>::Err;

                fn from_env_var(env_var: &str) -> Result<Self, FromEnvErr<Self::Error>> {
                    parse_env_if_present(env_var)
                }
            }
        )*
    }
}

impl_for_parseable!(
    u8,
    u16,
    u32,
    u64,
    usize,
    i32,
    i64,
    f32,
    f64,
    url::Url,
    tracing::Level
);

/// Flags accept `true`/`false`, `1`/`0`, `yes`/`no` and `on`/`off`, case
/// insensitive.
impl FromEnvVar for bool {
    type Error = ParseBoolError;

    fn from_env_var(env_var: &str) -> Result<Self, FromEnvErr<Self::Error>> {
        let s = String::from_env_var(env_var).map_err(FromEnvErr::infallible_into)?;
        match s.trim().to_ascii_lowercase().as_str() {
            "1" | "yes" | "on" => Ok(true),
            "0" | "no" | "off" => Ok(false),
            other => other.parse().map_err(FromEnvErr::parse_error),
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    fn set<T>(env: &str, val: &T)
    where
        T: ToString,
    {
        unsafe { std::env::set_var(env, val.to_string()) };
    }

    fn test<T>(env: &str, val: T)
    where
        T: ToString + FromEnvVar + PartialEq + std::fmt::Debug,
    {
        set(env, &val);

        let res = T::from_env_var(env).unwrap();
        assert_eq!(res, val);
    }

    #[test]
    fn test_primitives() {
        test("FE_U16", 8200u16);
        test("FE_U64", 42u64);
        test("FE_I64", -42i64);
        test("FE_F64", 0.25f64);
        test("FE_STRING", "test-app".to_string());
        test("FE_URL", url::Url::parse("http://localhost:8200").unwrap());
        test("FE_LEVEL", tracing::Level::WARN);
    }

    #[test]
    fn test_duration_is_millis() {
        set("FE_DURATION", &250);
        let res = Duration::from_env_var("FE_DURATION").unwrap();
        assert_eq!(res, Duration::from_millis(250));
    }

    #[test]
    fn test_flags() {
        for (raw, expected) in [
            ("true", true),
            ("TRUE", true),
            ("1", true),
            ("yes", true),
            ("on", true),
            ("false", false),
            ("0", false),
            ("No", false),
            ("off", false),
        ] {
            set("FE_FLAG", &raw);
            assert_eq!(bool::from_env_var("FE_FLAG").unwrap(), expected, "{raw}");
        }

        set("FE_FLAG_BAD", &"maybe");
        assert!(matches!(
            bool::from_env_var("FE_FLAG_BAD"),
            Err(FromEnvErr::ParseError(_))
        ));
    }

    #[test]
    fn test_defaults_only_cover_absent_values() {
        unsafe { std::env::remove_var("FE_UNSET") };
        assert_eq!(u16::from_env_var_or("FE_UNSET", 9).unwrap(), 9);

        set("FE_EMPTY", &"");
        assert_eq!(u16::from_env_var_or("FE_EMPTY", 9).unwrap(), 9);

        set("FE_GARBAGE", &"nine");
        assert!(u16::from_env_var_or("FE_GARBAGE", 9).is_err());
    }

    #[test]
    fn test_option_and_vec() {
        unsafe { std::env::remove_var("FE_OPT") };
        assert_eq!(Option::<u8>::from_env_var("FE_OPT").unwrap(), None);

        set("FE_OPT", &"7");
        assert_eq!(Option::<u8>::from_env_var("FE_OPT").unwrap(), Some(7));

        set("FE_LIST", &"flag_a, flag_b,,");
        let flags = Vec::<String>::from_env_var("FE_LIST").unwrap();
        assert_eq!(flags, vec!["flag_a".to_string(), "flag_b".to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn test_non_unicode_is_not_absent() {
        use std::{
            ffi::OsString,
            os::unix::ffi::OsStringExt,
        };

        unsafe { std::env::set_var("FE_NOT_UTF8", OsString::from_vec(vec![0x66, 0xff])) };
        let err = String::from_env_var_or("FE_NOT_UTF8", "fallback".into()).unwrap_err();
        assert!(!err.is_absent());
        assert!(matches!(err, FromEnvErr::EnvError(_, VarError::NotUnicode(_))));
        assert!(Option::<String>::from_env_var("FE_NOT_UTF8").is_err());
    }

    #[test]
    fn test_a_few_errors() {
        set("FE_U8", &30000u16);
        assert_eq!(
            u8::from_env_var("FE_U8").unwrap_err(),
            FromEnvErr::parse_error("30000".parse::<u8>().unwrap_err())
        );

        set("FE_U8", &"");
        assert_eq!(u8::from_env_var("FE_U8").unwrap_err(), FromEnvErr::empty("FE_U8"));
    }
}
