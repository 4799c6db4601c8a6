//! Maps a conversion record's correlation prefix to a marketer.

use sqlx::PgConnection;
use tracing::debug;

use crate::database::marketer_repository;
use crate::models::{ConversionRecord, Marketer};

/// First hyphen-delimited segment of a correlation key.
///
/// `"MKT1-click123-src9"` -> `"MKT1"`; `""` -> `""`.
pub fn correlation_prefix(correlation_key: &str) -> &str {
    correlation_key.split('-').next().unwrap_or("")
}

/// Resolve the marketer a conversion belongs to.
///
/// An empty prefix or an unknown one yields `Ok(None)`: the conversion
/// exists but cannot be attributed. That is a legitimate terminal outcome,
/// not an error.
pub async fn resolve_marketer(
    conn: &mut PgConnection,
    conversion: &ConversionRecord,
) -> Result<Option<Marketer>, sqlx::Error> {
    let prefix = correlation_prefix(&conversion.trx_id);
    if prefix.is_empty() {
        debug!(trx_id = %conversion.trx_id, "conversion has no correlation prefix");
        return Ok(None);
    }

    let marketer = marketer_repository::find_by_prefix(conn, prefix).await?;
    if marketer.is_none() {
        debug!(prefix, "no marketer registered for correlation prefix");
    }
    Ok(marketer)
}
