use std::str::FromStr;

use anyhow::Context;
use mungos::mongodb::{
  bson::oid::ObjectId,
  error::{Error as MongoError, ErrorKind, WriteFailure},
};

/// Parses a string id into the ObjectId the driver wants.
pub fn oid(id: &str) -> anyhow::Result<ObjectId> {
  ObjectId::from_str(id)
    .with_context(|| format!("'{id}' is not a valid ObjectId"))
}

/// Unique-index violations surface as write error 11000. The
/// insert-racers re-query and adopt the winning row instead of
/// failing.
pub fn is_duplicate_key_error(e: &MongoError) -> bool {
  match &*e.kind {
    ErrorKind::Write(WriteFailure::WriteError(write_error)) => {
      write_error.code == 11000
    }
    _ => false,
  }
}

/// Truncated digest for human-facing summaries.
pub fn short_digest(digest: &str) -> &str {
  let trimmed =
    digest.strip_prefix("sha256:").unwrap_or(digest);
  &trimmed[..trimmed.len().min(12)]
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn digest_truncation() {
    assert_eq!(
      short_digest(
        "sha256:0123456789abcdef0123456789abcdef0123456789abcdef"
      ),
      "0123456789ab"
    );
    assert_eq!(short_digest("abc"), "abc");
  }

  #[test]
  fn oid_parsing() {
    assert!(oid("507f1f77bcf86cd799439011").is_ok());
    assert!(oid("nope").is_err());
  }
}
