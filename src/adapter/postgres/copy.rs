//! Encoder for `COPY ... FROM STDIN (FORMAT BINARY)`.
//!
//! Layout: an 11-byte signature, a flags word and a header-extension length,
//! then one tuple per row (field count, then length-prefixed fields with -1
//! for NULL), and a -1 trailer. Each cell is coerced to the wire type of its
//! target column.

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use uuid::Uuid;

use super::numeric::encode_numeric;
use crate::session::{DbError, FromValue, Value, format_money};

const SIGNATURE: &[u8] = b"PGCOPY\n\xff\r\n\0";

/// Days from 0001-01-01 (CE day 1) to 2000-01-01.
const PG_EPOCH_CE_DAYS: i32 = 730_120;
/// Unix seconds at 2000-01-01T00:00:00Z.
const PG_EPOCH_UNIX_SECS: i64 = 946_684_800;

/// Binary wire types the encoder can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WireType {
    Bool,
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    Numeric,
    Money,
    Text,
    Bytea,
    Uuid,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Interval,
    Json,
    Jsonb,
}

impl WireType {
    /// Maps a server type name (`INT4`, `VARCHAR`, ...) to its wire type.
    pub(crate) fn from_type_name(name: &str) -> Option<Self> {
        Some(match name.to_ascii_lowercase().as_str() {
            "bool" | "boolean" => WireType::Bool,
            "int2" | "smallint" => WireType::Int2,
            "int4" | "int" | "integer" => WireType::Int4,
            "int8" | "bigint" => WireType::Int8,
            "float4" | "real" => WireType::Float4,
            "float8" | "double precision" => WireType::Float8,
            "numeric" | "decimal" => WireType::Numeric,
            "money" => WireType::Money,
            "text" | "varchar" | "bpchar" | "char" | "name" | "citext" | "xml" => WireType::Text,
            "bytea" => WireType::Bytea,
            "uuid" => WireType::Uuid,
            "date" => WireType::Date,
            "time" => WireType::Time,
            "timestamp" => WireType::Timestamp,
            "timestamptz" => WireType::TimestampTz,
            "interval" => WireType::Interval,
            "json" => WireType::Json,
            "jsonb" => WireType::Jsonb,
            _ => return None,
        })
    }
}

fn pg_days(date: NaiveDate) -> i32 {
    date.num_days_from_ce() - PG_EPOCH_CE_DAYS
}

fn pg_micros(dt: NaiveDateTime) -> i64 {
    dt.and_utc().timestamp_micros() - PG_EPOCH_UNIX_SECS * 1_000_000
}

fn time_micros(t: NaiveTime) -> i64 {
    i64::from(t.num_seconds_from_midnight()) * 1_000_000 + i64::from(t.nanosecond() % 1_000_000_000) / 1_000
}

fn numeric_text(value: &Value) -> Result<String, DbError> {
    match value {
        Value::Numeric(s) | Value::Text(s) => Ok(s.clone()),
        Value::Int(i) => Ok(i.to_string()),
        Value::Float(f) if f.is_finite() => Ok(f.to_string()),
        Value::Money(c) => Ok(format_money(*c)),
        other => Err(DbError::conversion("numeric", other.kind_name())),
    }
}

/// Parses decimal text into cents, truncating past two places.
fn parse_cents(text: &str) -> Option<i64> {
    let s = text.trim().trim_start_matches('$');
    let (negative, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let (whole, frac) = body.split_once('.').unwrap_or((body, ""));
    let whole: i64 = if whole.is_empty() { 0 } else { whole.replace(',', "").parse().ok()? };
    let mut frac: String = frac.chars().take(2).collect();
    while frac.len() < 2 {
        frac.push('0');
    }
    let cents = whole.checked_mul(100)?.checked_add(frac.parse::<i64>().ok()?)?;
    Some(if negative { -cents } else { cents })
}

fn money_cents(value: &Value) -> Result<i64, DbError> {
    match value {
        Value::Money(c) => Ok(*c),
        Value::Int(i) => i
            .checked_mul(100)
            .ok_or_else(|| DbError::conversion("money", i)),
        Value::Float(f) if f.is_finite() => Ok((f * 100.0).round() as i64),
        Value::Numeric(s) | Value::Text(s) => {
            parse_cents(s).ok_or_else(|| DbError::conversion("money", s))
        }
        other => Err(DbError::conversion("money", other.kind_name())),
    }
}

fn json_text(value: &Value) -> Result<String, DbError> {
    match value {
        Value::Json(j) => Ok(j.to_string()),
        Value::Text(s) => Ok(s.clone()),
        other => Err(DbError::conversion("json", other.kind_name())),
    }
}

fn write_payload(ty: WireType, value: &Value, buf: &mut BytesMut) -> Result<(), DbError> {
    match ty {
        WireType::Bool => buf.put_u8(u8::from(bool::from_value(value)?)),
        WireType::Int2 => buf.put_i16(i16::from_value(value)?),
        WireType::Int4 => buf.put_i32(i32::from_value(value)?),
        WireType::Int8 => buf.put_i64(i64::from_value(value)?),
        WireType::Float4 => buf.put_f32(f32::from_value(value)?),
        WireType::Float8 => buf.put_f64(f64::from_value(value)?),
        WireType::Numeric => buf.put_slice(&encode_numeric(&numeric_text(value)?)?),
        WireType::Money => buf.put_i64(money_cents(value)?),
        WireType::Text => buf.put_slice(value.to_string().as_bytes()),
        WireType::Bytea => buf.put_slice(&Vec::<u8>::from_value(value)?),
        WireType::Uuid => buf.put_slice(Uuid::from_value(value)?.as_bytes()),
        WireType::Date => buf.put_i32(pg_days(NaiveDate::from_value(value)?)),
        WireType::Time => buf.put_i64(time_micros(NaiveTime::from_value(value)?)),
        WireType::Timestamp => buf.put_i64(pg_micros(NaiveDateTime::from_value(value)?)),
        WireType::TimestampTz => {
            let dt = DateTime::<FixedOffset>::from_value(value)?;
            buf.put_i64(pg_micros(dt.naive_utc()));
        }
        WireType::Interval => match value {
            Value::Interval {
                months,
                days,
                micros,
            } => {
                buf.put_i64(*micros);
                buf.put_i32(*days);
                buf.put_i32(*months);
            }
            other => return Err(DbError::conversion("interval", other.kind_name())),
        },
        WireType::Json => buf.put_slice(json_text(value)?.as_bytes()),
        WireType::Jsonb => {
            buf.put_u8(1);
            buf.put_slice(json_text(value)?.as_bytes());
        }
    }
    Ok(())
}

/// Streams rows into the binary COPY format.
#[derive(Debug)]
pub(crate) struct BinaryCopyEncoder {
    buf: BytesMut,
    types: Vec<WireType>,
}

impl BinaryCopyEncoder {
    pub(crate) fn new(types: Vec<WireType>) -> Self {
        let mut buf = BytesMut::with_capacity(64 * 1024);
        buf.put_slice(SIGNATURE);
        buf.put_i32(0);
        buf.put_i32(0);
        Self { buf, types }
    }

    /// Appends one row. On error the buffer is left unchanged.
    pub(crate) fn write_row(&mut self, row: &[Value]) -> Result<(), DbError> {
        if row.len() != self.types.len() {
            return Err(DbError::Bind(format!(
                "row has {} values but the copy has {} columns",
                row.len(),
                self.types.len()
            )));
        }
        let start = self.buf.len();
        self.buf.put_i16(row.len() as i16);
        for (column, (ty, value)) in self.types.clone().iter().zip(row).enumerate() {
            if let Err(err) = self.write_cell(*ty, value) {
                self.buf.truncate(start);
                return Err(DbError::Bind(format!(
                    "column {column} cannot be copied as {ty:?}: {err}"
                )));
            }
        }
        Ok(())
    }

    fn write_cell(&mut self, ty: WireType, value: &Value) -> Result<(), DbError> {
        if value.is_null() {
            self.buf.put_i32(-1);
            return Ok(());
        }
        let at = self.buf.len();
        self.buf.put_i32(0);
        write_payload(ty, value, &mut self.buf)?;
        let len = (self.buf.len() - at - 4) as i32;
        self.buf[at..at + 4].copy_from_slice(&len.to_be_bytes());
        Ok(())
    }

    /// Bytes encoded but not yet taken.
    pub(crate) fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Takes the encoded bytes so far.
    pub(crate) fn take(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    /// Appends the trailer and returns the remaining bytes.
    pub(crate) fn finish(mut self) -> Bytes {
        self.buf.put_i16(-1);
        self.buf.freeze()
    }
}
