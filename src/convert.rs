//! Typed conversion of raw cell text.
//!
//! Both eager [`Cell`](crate::Cell)s and [`LazyCell`](crate::LazyCell)s
//! hold text exactly as the server sent it; conversion happens on each
//! access through [`FromCell`]. Conversions fail with a [`ResultError`]
//! instead of guessing.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

use crate::error::ResultError;
use crate::pg::types::decode_bytea_hex;

/// Options that loosen the default conversion rules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConvertOptions {
    /// Accept `1`/`0` as booleans.
    pub numeric_bool: bool,
}

impl ConvertOptions {
    pub fn numeric_bool(mut self, enabled: bool) -> Self {
        self.numeric_bool = enabled;
        self
    }
}

/// Conversion from a raw cell into a Rust value.
///
/// `raw` is `None` for SQL NULL. Non-optional targets reject NULL;
/// wrap the target in `Option` to accept it.
pub trait FromCell: Sized {
    /// Human-readable target name used in error messages.
    const TARGET: &'static str;

    fn from_cell(raw: Option<&[u8]>, opts: &ConvertOptions) -> Result<Self, ResultError>;
}

fn non_null<T: FromCell>(raw: Option<&[u8]>) -> Result<&[u8], ResultError> {
    raw.ok_or(ResultError::UnexpectedNull { target: T::TARGET })
}

fn text<T: FromCell>(raw: Option<&[u8]>) -> Result<&str, ResultError> {
    std::str::from_utf8(non_null::<T>(raw)?).map_err(|_| ResultError::InvalidUtf8)
}

fn conversion_error<T: FromCell>(value: &str) -> ResultError {
    ResultError::Conversion {
        value: value.to_string(),
        target: T::TARGET,
    }
}

/// Optional sign followed by at least one ASCII digit.
fn is_integer_text(s: &str) -> bool {
    let digits = s.strip_prefix(['+', '-']).unwrap_or(s);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

/// Decimal or exponent notation, or one of the server's special float spellings.
fn is_float_text(s: &str) -> bool {
    if matches!(s, "NaN" | "Infinity" | "-Infinity" | "+Infinity") {
        return true;
    }
    let mut digits = 0;
    for b in s.bytes() {
        match b {
            b'0'..=b'9' => digits += 1,
            b'+' | b'-' | b'.' | b'e' | b'E' => {}
            _ => return false,
        }
    }
    digits > 0
}

impl<T: FromCell> FromCell for Option<T> {
    const TARGET: &'static str = T::TARGET;

    fn from_cell(raw: Option<&[u8]>, opts: &ConvertOptions) -> Result<Self, ResultError> {
        match raw {
            None => Ok(None),
            Some(_) => T::from_cell(raw, opts).map(Some),
        }
    }
}

impl FromCell for String {
    const TARGET: &'static str = "String";

    fn from_cell(raw: Option<&[u8]>, _opts: &ConvertOptions) -> Result<Self, ResultError> {
        text::<Self>(raw).map(str::to_owned)
    }
}

impl FromCell for bool {
    const TARGET: &'static str = "bool";

    fn from_cell(raw: Option<&[u8]>, opts: &ConvertOptions) -> Result<Self, ResultError> {
        let s = text::<Self>(raw)?;
        match s {
            "t" | "true" => Ok(true),
            "f" | "false" => Ok(false),
            "1" if opts.numeric_bool => Ok(true),
            "0" if opts.numeric_bool => Ok(false),
            _ => Err(conversion_error::<Self>(s)),
        }
    }
}

macro_rules! impl_from_cell_int {
    ($($t:ty),*) => {
        $(
            impl FromCell for $t {
                const TARGET: &'static str = stringify!($t);

                fn from_cell(raw: Option<&[u8]>, _opts: &ConvertOptions) -> Result<Self, ResultError> {
                    let s = text::<Self>(raw)?;
                    if !is_integer_text(s) {
                        return Err(conversion_error::<Self>(s));
                    }
                    s.parse::<$t>().map_err(|_| conversion_error::<Self>(s))
                }
            }
        )*
    };
}

impl_from_cell_int!(i8, i16, i32, i64, i128, u8, u16, u32, u64, u128, isize, usize);

macro_rules! impl_from_cell_float {
    ($($t:ty),*) => {
        $(
            impl FromCell for $t {
                const TARGET: &'static str = stringify!($t);

                fn from_cell(raw: Option<&[u8]>, _opts: &ConvertOptions) -> Result<Self, ResultError> {
                    let s = text::<Self>(raw)?;
                    if !is_float_text(s) {
                        return Err(conversion_error::<Self>(s));
                    }
                    match s {
                        "Infinity" | "+Infinity" => Ok(<$t>::INFINITY),
                        "-Infinity" => Ok(<$t>::NEG_INFINITY),
                        _ => s.parse::<$t>().map_err(|_| conversion_error::<Self>(s)),
                    }
                }
            }
        )*
    };
}

impl_from_cell_float!(f32, f64);

/// BYTEA: `\x`-prefixed hex is decoded, anything else is taken as raw bytes
/// (streamed rows may already carry decoded binary).
impl FromCell for Vec<u8> {
    const TARGET: &'static str = "bytes";

    fn from_cell(raw: Option<&[u8]>, _opts: &ConvertOptions) -> Result<Self, ResultError> {
        let bytes = non_null::<Self>(raw)?;
        if bytes.starts_with(b"\\x") {
            decode_bytea_hex(bytes).ok_or_else(|| {
                conversion_error::<Self>(&String::from_utf8_lossy(bytes))
            })
        } else {
            Ok(bytes.to_vec())
        }
    }
}

impl FromCell for NaiveDate {
    const TARGET: &'static str = "NaiveDate";

    fn from_cell(raw: Option<&[u8]>, _opts: &ConvertOptions) -> Result<Self, ResultError> {
        let s = text::<Self>(raw)?;
        NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| conversion_error::<Self>(s))
    }
}

impl FromCell for NaiveTime {
    const TARGET: &'static str = "NaiveTime";

    fn from_cell(raw: Option<&[u8]>, _opts: &ConvertOptions) -> Result<Self, ResultError> {
        let s = text::<Self>(raw)?;
        NaiveTime::parse_from_str(s, "%H:%M:%S%.f").map_err(|_| conversion_error::<Self>(s))
    }
}

impl FromCell for NaiveDateTime {
    const TARGET: &'static str = "NaiveDateTime";

    fn from_cell(raw: Option<&[u8]>, _opts: &ConvertOptions) -> Result<Self, ResultError> {
        let s = text::<Self>(raw)?;
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
            .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f"))
            .map_err(|_| conversion_error::<Self>(s))
    }
}

impl FromCell for DateTime<Utc> {
    const TARGET: &'static str = "DateTime<Utc>";

    fn from_cell(raw: Option<&[u8]>, _opts: &ConvertOptions) -> Result<Self, ResultError> {
        let s = text::<Self>(raw)?;
        // timestamptz text output uses an hour-only offset, e.g. `+00`.
        DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%#z")
            .or_else(|_| DateTime::parse_from_rfc3339(s))
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| conversion_error::<Self>(s))
    }
}

impl FromCell for uuid::Uuid {
    const TARGET: &'static str = "Uuid";

    fn from_cell(raw: Option<&[u8]>, _opts: &ConvertOptions) -> Result<Self, ResultError> {
        let s = text::<Self>(raw)?;
        uuid::Uuid::parse_str(s).map_err(|_| conversion_error::<Self>(s))
    }
}

impl FromCell for serde_json::Value {
    const TARGET: &'static str = "JSON";

    fn from_cell(raw: Option<&[u8]>, _opts: &ConvertOptions) -> Result<Self, ResultError> {
        let s = text::<Self>(raw)?;
        serde_json::from_str(s).map_err(|_| conversion_error::<Self>(s))
    }
}
