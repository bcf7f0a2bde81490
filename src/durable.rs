//! Bincode encoding with a leading schema-version byte, shared by every
//! `redb` table the node registry (C7) and task store (C9) keep, in the
//! style of the teacher's `cache.rs` `FILES_TABLE`/`CacheEntry` pairing.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::SyncdError;

/// Bumped whenever a stored record's on-disk shape changes incompatibly.
const SCHEMA_VERSION: u8 = 1;

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, SyncdError> {
	let mut bytes = vec![SCHEMA_VERSION];
	bincode::serialize_into(&mut bytes, value).map_err(|e| SyncdError::Other { message: e.to_string() })?;
	Ok(bytes)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, SyncdError> {
	let (version, payload) =
		bytes.split_first().ok_or_else(|| SyncdError::Other { message: "empty stored record".to_string() })?;
	if *version != SCHEMA_VERSION {
		return Err(SyncdError::Other {
			message: format!("unsupported schema version {} (expected {})", version, SCHEMA_VERSION),
		});
	}
	bincode::deserialize(payload).map_err(|e| SyncdError::Other { message: e.to_string() })
}


// vim: ts=4
