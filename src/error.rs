use sqlx::mysql::MySqlDatabaseError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sql: {0}")]
    Sql(#[from] sqlx::Error),
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("corrupt record at {key}: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("{0}")]
    Invalid(String),
    #[error("storage is closed")]
    Closed,
}

// lock wait timeout, query timeout, too many connections, out of resources,
// out of memory, out of sort memory, can't create thread, too many delayed
// threads, binlog purge emfile, too many concurrent trxs, engine out of memory
const MYSQL_RECOVERABLE: &[u16] = &[1205, 3024, 1040, 1041, 1037, 1038, 1135, 1151, 1587, 1637, 3015];

// SQLITE_BUSY, SQLITE_LOCKED, SQLITE_NOMEM, SQLITE_IOERR, SQLITE_FULL
const SQLITE_RECOVERABLE: &[i32] = &[5, 6, 7, 10, 13];

impl StorageError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }

    pub fn corrupt(key: impl Into<String>, reason: impl ToString) -> Self {
        Self::Corrupt { key: key.into(), reason: reason.to_string() }
    }

    /// Whether a retry has a reasonable chance of succeeding.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Sql(err) => sql_recoverable(err),
            Self::Redis(err) => redis_recoverable(err),
            Self::Corrupt { .. } | Self::Invalid(_) | Self::Closed => false,
        }
    }
}

fn sql_recoverable(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => {
            if let Some(mysql) = db.try_downcast_ref::<MySqlDatabaseError>() {
                return MYSQL_RECOVERABLE.contains(&mysql.number());
            }
            db.code()
                .and_then(|code| code.parse::<i32>().ok())
                .is_some_and(|code| SQLITE_RECOVERABLE.contains(&(code & 0xff)))
        }
        _ => false,
    }
}

fn redis_recoverable(err: &redis::RedisError) -> bool {
    err.is_timeout() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_io_error()
}

#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("amqp: {0}")]
    Amqp(#[from] lapin::Error),
    #[error("could not encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("not connected")]
    Disconnected,
    #[error("timed out")]
    Timeout,
    #[error("messaging is closed")]
    Closed,
}

impl MessagingError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Redis(err) => redis_recoverable(err),
            Self::Amqp(err) => matches!(
                err,
                lapin::Error::IOError(_)
                    | lapin::Error::InvalidConnectionState(_)
                    | lapin::Error::InvalidChannelState(_)
                    | lapin::Error::MissingHeartbeatError
                    | lapin::Error::ChannelsLimitReached
            ),
            Self::Disconnected | Self::Timeout => true,
            Self::Encode(_) | Self::Closed => false,
        }
    }
}

/// Why an inbound envelope was dropped.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing field {0}")]
    Missing(String),
    #[error("field {0} is not a string")]
    NotString(String),
    #[error("field {field} is not a valid id: {value:?}")]
    InvalidId { field: String, value: String },
    #[error("level {0} is out of range")]
    InvalidLevel(i64),
    #[error("unknown channel {0}")]
    UnknownChannel(String),
}

/// Failure of a locally originated event, surfaced to the API layer.
///
/// `hard` means retrying is pointless: none of the underlying failures were
/// recoverable. `invalid` errors are hard and blame the caller's input.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ReplicationError {
    hard: bool,
    invalid: bool,
    message: String,
}

impl ReplicationError {
    pub fn new(any_recoverable: bool, message: impl Into<String>) -> Self {
        Self { hard: !any_recoverable, invalid: false, message: message.into() }
    }

    pub fn hard(message: impl Into<String>) -> Self {
        Self::new(false, message)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self { hard: true, invalid: true, message: message.into() }
    }

    pub fn is_hard(&self) -> bool {
        self.hard
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logic_errors_are_not_recoverable() {
        assert!(!StorageError::invalid("unknown level 9").is_recoverable());
        assert!(!StorageError::corrupt("posted_chat:4", "bad json").is_recoverable());
        assert!(!StorageError::Closed.is_recoverable());
        assert!(!MessagingError::Closed.is_recoverable());
        assert!(MessagingError::Disconnected.is_recoverable());
    }

    #[test]
    fn pool_pressure_is_recoverable() {
        assert!(StorageError::Sql(sqlx::Error::PoolTimedOut).is_recoverable());
        assert!(!StorageError::Sql(sqlx::Error::RowNotFound).is_recoverable());
    }

    #[test]
    fn redis_io_is_recoverable() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(StorageError::Redis(redis::RedisError::from(io)).is_recoverable());

        let parse = redis::RedisError::from((redis::ErrorKind::TypeError, "not an int"));
        assert!(!StorageError::Redis(parse).is_recoverable());
    }

    #[test]
    fn replication_error_hardness() {
        assert!(ReplicationError::new(false, "nothing worked").is_hard());
        assert!(!ReplicationError::new(true, "pool exhausted").is_hard());
        assert!(!ReplicationError::hard("broken").is_invalid());

        let invalid = ReplicationError::invalid("level 9 does not exist");
        assert!(invalid.is_hard() && invalid.is_invalid());
    }
}
