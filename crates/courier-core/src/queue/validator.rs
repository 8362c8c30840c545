//! Checks applied to queue names and capacities before a queue is created.

use crate::message::Topics;
use crate::{CourierError, Result};

/// Name prefix reserved for server-generated temporary queues.
pub const TEMP_QUEUE_PREFIX: &str = "temp-";

pub struct QueueValidator;

impl QueueValidator {
    pub const MAX_CAPACITY: usize = 1_000_000;

    /// Validate a queue name chosen by a client.
    pub fn validate_name(name: &str) -> Result<()> {
        Topics::validate_name(name).map_err(|e| match e {
            CourierError::Validation { message, .. } => {
                CourierError::validation("queue name", message)
            }
            other => other,
        })?;
        if name.starts_with(TEMP_QUEUE_PREFIX) {
            return Err(CourierError::validation(
                "queue name",
                format!("the prefix '{}' is reserved for temporary queues", TEMP_QUEUE_PREFIX),
            ));
        }
        Ok(())
    }

    pub fn validate_capacity(capacity: usize) -> Result<()> {
        if capacity == 0 || capacity > Self::MAX_CAPACITY {
            return Err(CourierError::validation(
                "capacity",
                format!("must be between 1 and {}, got {}", Self::MAX_CAPACITY, capacity),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        assert!(QueueValidator::validate_name("orders").is_ok());
        assert!(QueueValidator::validate_name("billing/invoices").is_ok());
    }

    #[test]
    fn test_invalid_names() {
        assert!(QueueValidator::validate_name("").is_err());
        assert!(QueueValidator::validate_name("has space").is_err());
        assert!(QueueValidator::validate_name(&"q".repeat(300)).is_err());
        assert!(QueueValidator::validate_name("temp-123").is_err());
    }

    #[test]
    fn test_capacity_bounds() {
        assert!(QueueValidator::validate_capacity(0).is_err());
        assert!(QueueValidator::validate_capacity(1).is_ok());
        assert!(QueueValidator::validate_capacity(QueueValidator::MAX_CAPACITY).is_ok());
        assert!(QueueValidator::validate_capacity(QueueValidator::MAX_CAPACITY + 1).is_err());
    }
}
