// 📏 Unit Normalizer
//
// CONSAR publishes "Miles de Pesos"; the historical store keeps actual pesos.
// This is the only place values change scale, and each record carries a
// marker so a second pass is caught instead of multiplying by 1000 again.

use rust_decimal::Decimal;
use tracing::info;

use crate::error::{PipelineError, Result};
use crate::record::SieforeRecord;

/// Source unit (thousands) to store unit (pesos)
pub const SCALE_FACTOR: i64 = 1000;

/// Move every record from source units to store units, exactly once
///
/// The batch is checked up front: if any record is already normalized the
/// whole batch is refused and nothing is multiplied.
pub fn normalize(records: Vec<SieforeRecord>) -> Result<Vec<SieforeRecord>> {
    if let Some(already) = records.iter().find(|r| r.is_normalized()) {
        return Err(PipelineError::DoubleNormalization(already.describe()));
    }

    let factor = Decimal::from(SCALE_FACTOR);
    let mut normalized = Vec::with_capacity(records.len());

    for mut record in records {
        record.value_mxn = scale(record.value_mxn, factor, &record)?;
        record.value_usd = record
            .value_usd
            .map(|usd| scale(usd, factor, &record))
            .transpose()?;
        record.mark_normalized();
        normalized.push(record);
    }

    info!(records = normalized.len(), factor = SCALE_FACTOR, "normalized to store units");
    Ok(normalized)
}

fn scale(value: Decimal, factor: Decimal, record: &SieforeRecord) -> Result<Decimal> {
    value
        .checked_mul(factor)
        .ok_or_else(|| PipelineError::Overflow(record.describe()))
}
