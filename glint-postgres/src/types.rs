//! Type conversions for PostgreSQL.

use chrono::{DateTime, Utc};
use glint_migrate::schema::ColumnType;
use glint_migrate::SqlValue;
use tokio_postgres::types::ToSql;

use crate::error::{PgError, PgResult};

/// A boxed query parameter.
pub type Param = Box<dyn ToSql + Sync + Send>;

/// Convert a value to a parameter for a column of the given type.
///
/// NULLs are typed after the column so the server accepts them, and
/// integer widths are adjusted to the column.
pub fn to_param(value: &SqlValue, column: ColumnType) -> PgResult<Param> {
    Ok(match (value, column) {
        (SqlValue::Null, column) => null_param(column),
        (SqlValue::Bool(b), _) => Box::new(*b),
        (SqlValue::Int(i), ColumnType::BigInt) => Box::new(i64::from(*i)),
        (SqlValue::Int(i), ColumnType::Double) => Box::new(f64::from(*i)),
        (SqlValue::Int(i), _) => Box::new(*i),
        (SqlValue::BigInt(i), ColumnType::Integer) => {
            Box::new(i32::try_from(*i).map_err(|_| {
                PgError::type_conversion(format!("{} does not fit in an integer column", i))
            })?)
        }
        (SqlValue::BigInt(i), ColumnType::Double) => Box::new(*i as f64),
        (SqlValue::BigInt(i), _) => Box::new(*i),
        (SqlValue::Double(f), _) => Box::new(*f),
        (SqlValue::Text(s), _) => Box::new(s.clone()),
        (SqlValue::Timestamp(t), _) => Box::new(*t),
        (SqlValue::Json(v), _) => Box::new(v.clone()),
        (SqlValue::Uuid(u), _) => Box::new(*u),
    })
}

fn null_param(column: ColumnType) -> Param {
    match column {
        ColumnType::Uuid => Box::new(Option::<uuid::Uuid>::None),
        ColumnType::Text => Box::new(Option::<String>::None),
        ColumnType::Integer => Box::new(Option::<i32>::None),
        ColumnType::BigInt => Box::new(Option::<i64>::None),
        ColumnType::Double => Box::new(Option::<f64>::None),
        ColumnType::Boolean => Box::new(Option::<bool>::None),
        ColumnType::Timestamptz => Box::new(Option::<DateTime<Utc>>::None),
        ColumnType::Jsonb => Box::new(Option::<serde_json::Value>::None),
    }
}

/// Borrow boxed parameters as the slice the driver expects.
pub fn as_params(params: &[Param]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_param_conversions() {
        assert!(to_param(&SqlValue::Int(7), ColumnType::BigInt).is_ok());
        assert!(to_param(&SqlValue::BigInt(7), ColumnType::Integer).is_ok());
        assert!(to_param(&SqlValue::Null, ColumnType::Timestamptz).is_ok());
        assert!(to_param(&SqlValue::Text("x".into()), ColumnType::Text).is_ok());
    }

    #[test]
    fn test_to_param_rejects_overflow() {
        let err = to_param(&SqlValue::BigInt(i64::MAX), ColumnType::Integer).err();
        assert!(matches!(err, Some(PgError::TypeConversion(_))));
    }

    #[test]
    fn test_typed_nulls_match_columns() {
        for column in [
            ColumnType::Uuid,
            ColumnType::Text,
            ColumnType::Integer,
            ColumnType::BigInt,
            ColumnType::Double,
            ColumnType::Boolean,
            ColumnType::Timestamptz,
            ColumnType::Jsonb,
        ] {
            let param = null_param(column);
            assert_eq!(format!("{:?}", param), "None", "null for {:?}", column);
        }
    }
}
