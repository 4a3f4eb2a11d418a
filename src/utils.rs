use std::io::Cursor;
use std::time::SystemTime;

use murmur3::murmur3_32;
use rand::Rng;

use crate::{IcebergError, IcebergResult};

/// Returns the current time as milliseconds since Unix Epoch, as needed for
/// saving in the table metadata and snapshots.
pub fn current_time_ms() -> IcebergResult<i64> {
    let now = SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_err(|_| IcebergError::CustomError {
            message: "system clock before Unix Epoch time".to_string()
        })?;

    i64::try_from(now.as_millis())
        .map_err(|_| IcebergError::CustomError {
            message: "system clock does not fit in long".to_string()
        })
}

/// 8 hex digit murmur3 hash of a file name. Used as a directory prefix to spread
/// data files across object store partitions.
pub fn hash_prefix(filename: &str) -> IcebergResult<String> {
    let hash = murmur3_32(&mut Cursor::new(filename), 0)?;
    Ok(format!("{hash:08x}"))
}

/// Random alphanumeric id shared by the files of one write operation.
pub fn new_operation_id() -> String {
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(8)
        .map(char::from)
        .collect()
}
