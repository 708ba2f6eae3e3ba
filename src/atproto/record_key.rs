//! Record URI parsing
//!
//! Block records are addressed as `at://<authority>/<collection>/<rkey>`.
//! Only that exact shape is accepted; anything else is a validation error
//! so a truncated key can never reach a delete call.

use std::fmt;
use std::str::FromStr;

use crate::error::AppError;

const MAX_RKEY_LEN: usize = 512;

/// A parsed record URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordUri {
    pub authority: String,
    pub collection: String,
    pub rkey: String,
}

impl FromStr for RecordUri {
    type Err = AppError;

    fn from_str(uri: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = uri.split('/').collect();
        let [scheme, empty, authority, collection, rkey] = parts.as_slice() else {
            return Err(AppError::Validation(format!(
                "record uri must have 5 '/'-separated segments, got {}: {uri}",
                parts.len()
            )));
        };

        if *scheme != "at:" || !empty.is_empty() {
            return Err(AppError::Validation(format!(
                "record uri must start with at://: {uri}"
            )));
        }
        if authority.is_empty() || collection.is_empty() {
            return Err(AppError::Validation(format!(
                "record uri is missing its authority or collection: {uri}"
            )));
        }
        ensure_valid_rkey(rkey).map_err(|reason| {
            AppError::Validation(format!("record uri has an invalid record key ({reason}): {uri}"))
        })?;

        Ok(Self {
            authority: authority.to_string(),
            collection: collection.to_string(),
            rkey: rkey.to_string(),
        })
    }
}

impl fmt::Display for RecordUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "at://{}/{}/{}", self.authority, self.collection, self.rkey)
    }
}

fn ensure_valid_rkey(rkey: &str) -> Result<(), &'static str> {
    if rkey.is_empty() || rkey.len() > MAX_RKEY_LEN {
        return Err("must be 1 to 512 characters");
    }
    if rkey == "." || rkey == ".." {
        return Err("can not be \".\" or \"..\"");
    }
    if !rkey
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '~' | '.' | ':' | '-'))
    {
        return Err("contains characters outside [A-Za-z0-9_~.:-]");
    }
    Ok(())
}

/// Extract the record key from a block record URI
pub fn parse_record_key(uri: &str) -> Result<String, AppError> {
    uri.parse::<RecordUri>().map(|parsed| parsed.rkey)
}
