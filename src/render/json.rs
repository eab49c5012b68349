use serde::Serialize;

use crate::error::BioQueryError;

pub fn to_pretty<T: Serialize>(value: &T) -> Result<String, BioQueryError> {
    Ok(serde_json::to_string_pretty(value)?)
}
