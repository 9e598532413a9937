//! Conversion from [`Value`] into Rust types.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use uuid::Uuid;

use super::error::DbError;
use super::types::Value;

/// Converts a decoded cell into `Self`.
///
/// `Null` is rejected by every implementation except `Option<T>` and
/// [`Value`]; callers that want a default on NULL check for it first.
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Result<Self, DbError>;
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Result<Self, DbError> {
        Ok(value.clone())
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Result<Self, DbError> {
        match value {
            Value::Null => Ok(None),
            v => T::from_value(v).map(Some),
        }
    }
}

fn parse_text<T: std::str::FromStr>(target: &'static str, s: &str) -> Result<T, DbError> {
    s.trim()
        .parse()
        .map_err(|_| DbError::conversion(target, s))
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> Result<Self, DbError> {
        match value {
            Value::Int(i) => Ok(*i),
            Value::Bool(b) => Ok(i64::from(*b)),
            Value::Float(f) if f.fract() == 0.0 && f.abs() < 9.2e18 => Ok(*f as i64),
            Value::Money(c) if c % 100 == 0 => Ok(c / 100),
            Value::Numeric(s) | Value::Text(s) => parse_text::<i64>("i64", s).or_else(|err| {
                let f: f64 = parse_text("i64", s)?;
                if f.fract() == 0.0 && f.abs() < 9.2e18 {
                    Ok(f as i64)
                } else {
                    Err(err)
                }
            }),
            other => Err(DbError::conversion("i64", other.kind_name())),
        }
    }
}

macro_rules! narrow_int {
    ($($ty:ty),*) => {
        $(impl FromValue for $ty {
            fn from_value(value: &Value) -> Result<Self, DbError> {
                let wide = i64::from_value(value)?;
                <$ty>::try_from(wide).map_err(|_| DbError::conversion(stringify!($ty), wide))
            }
        })*
    };
}

narrow_int!(i32, i16, u32, u64, usize);

impl FromValue for f64 {
    fn from_value(value: &Value) -> Result<Self, DbError> {
        match value {
            Value::Float(f) => Ok(*f),
            Value::Int(i) => Ok(*i as f64),
            Value::Money(c) => Ok(*c as f64 / 100.0),
            Value::Numeric(s) | Value::Text(s) => parse_text("f64", s),
            other => Err(DbError::conversion("f64", other.kind_name())),
        }
    }
}

impl FromValue for f32 {
    fn from_value(value: &Value) -> Result<Self, DbError> {
        f64::from_value(value).map(|f| f as f32)
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Result<Self, DbError> {
        match value {
            Value::Bool(b) => Ok(*b),
            Value::Int(i) => Ok(*i != 0),
            Value::Numeric(s) | Value::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "t" | "y" | "yes" | "1" => Ok(true),
                "false" | "f" | "n" | "no" | "0" => Ok(false),
                _ => Err(DbError::conversion("bool", s)),
            },
            other => Err(DbError::conversion("bool", other.kind_name())),
        }
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self, DbError> {
        match value {
            Value::Null => Err(DbError::conversion("String", "null")),
            v => Ok(v.to_string()),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &Value) -> Result<Self, DbError> {
        match value {
            Value::Bytes(b) => Ok(b.clone()),
            Value::Text(s) | Value::Xml(s) => Ok(s.as_bytes().to_vec()),
            other => Err(DbError::conversion("Vec<u8>", other.kind_name())),
        }
    }
}

impl FromValue for Uuid {
    fn from_value(value: &Value) -> Result<Self, DbError> {
        match value {
            Value::Uuid(u) => Ok(*u),
            Value::Text(s) => parse_text("Uuid", s),
            Value::Bytes(b) => Uuid::from_slice(b).map_err(|_| DbError::conversion("Uuid", "bytes")),
            other => Err(DbError::conversion("Uuid", other.kind_name())),
        }
    }
}

impl FromValue for NaiveDate {
    fn from_value(value: &Value) -> Result<Self, DbError> {
        match value {
            Value::Date(d) => Ok(*d),
            Value::DateTime(dt) => Ok(dt.date()),
            Value::DateTimeTz(dt) => Ok(dt.date_naive()),
            Value::Text(s) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
                .map_err(|_| DbError::conversion("NaiveDate", s)),
            other => Err(DbError::conversion("NaiveDate", other.kind_name())),
        }
    }
}

impl FromValue for NaiveTime {
    fn from_value(value: &Value) -> Result<Self, DbError> {
        match value {
            Value::Time(t) => Ok(*t),
            Value::DateTime(dt) => Ok(dt.time()),
            Value::Text(s) => parse_text("NaiveTime", s),
            other => Err(DbError::conversion("NaiveTime", other.kind_name())),
        }
    }
}

impl FromValue for NaiveDateTime {
    fn from_value(value: &Value) -> Result<Self, DbError> {
        match value {
            Value::DateTime(dt) => Ok(*dt),
            Value::DateTimeTz(dt) => Ok(dt.naive_utc()),
            Value::Date(d) => Ok(d.and_time(NaiveTime::MIN)),
            Value::Text(s) => NaiveDateTime::parse_from_str(s.trim(), "%Y-%m-%d %H:%M:%S%.f")
                .or_else(|_| NaiveDateTime::parse_from_str(s.trim(), "%Y-%m-%dT%H:%M:%S%.f"))
                .map_err(|_| DbError::conversion("NaiveDateTime", s)),
            other => Err(DbError::conversion("NaiveDateTime", other.kind_name())),
        }
    }
}

impl FromValue for DateTime<FixedOffset> {
    fn from_value(value: &Value) -> Result<Self, DbError> {
        match value {
            Value::DateTimeTz(dt) => Ok(*dt),
            Value::DateTime(dt) => Ok(dt.and_utc().fixed_offset()),
            Value::Text(s) => DateTime::parse_from_rfc3339(s.trim())
                .map_err(|_| DbError::conversion("DateTime", s)),
            other => Err(DbError::conversion("DateTime", other.kind_name())),
        }
    }
}

impl FromValue for DateTime<Utc> {
    fn from_value(value: &Value) -> Result<Self, DbError> {
        DateTime::<FixedOffset>::from_value(value).map(|dt| dt.to_utc())
    }
}

impl FromValue for serde_json::Value {
    fn from_value(value: &Value) -> Result<Self, DbError> {
        match value {
            Value::Json(j) => Ok(j.clone()),
            Value::Text(s) => {
                serde_json::from_str(s).map_err(|_| DbError::conversion("json", s))
            }
            other => Err(DbError::conversion("json", other.kind_name())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_conversions() {
        assert_eq!(i64::from_value(&Value::Int(5)).unwrap(), 5);
        assert_eq!(i64::from_value(&Value::Numeric("42".into())).unwrap(), 42);
        assert_eq!(i64::from_value(&Value::Numeric("42.0".into())).unwrap(), 42);
        assert!(i64::from_value(&Value::Numeric("4.5".into())).is_err());
        assert_eq!(i32::from_value(&Value::Float(3.0)).unwrap(), 3);
        assert!(i16::from_value(&Value::Int(100_000)).is_err());
        assert!(i64::from_value(&Value::Null).is_err());
    }

    #[test]
    fn test_option_accepts_null() {
        assert_eq!(Option::<i64>::from_value(&Value::Null).unwrap(), None);
        assert_eq!(Option::<i64>::from_value(&Value::Int(1)).unwrap(), Some(1));
    }

    #[test]
    fn test_text_conversions() {
        assert_eq!(String::from_value(&Value::Int(7)).unwrap(), "7");
        assert!(bool::from_value(&Value::from("YES")).unwrap());
        assert_eq!(f64::from_value(&Value::Money(250)).unwrap(), 2.5);
    }

    #[test]
    fn test_date_conversions() {
        let d = NaiveDate::from_value(&Value::from("2024-05-01")).unwrap();
        assert_eq!(d, NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());

        let dt = NaiveDateTime::from_value(&Value::from("2024-05-01 10:20:30")).unwrap();
        assert_eq!(dt.date(), d);
    }
}
