//! Repository error types
//!
//! This module provides structured error types for repository operations,
//! allowing fine-grained error handling and meaningful error messages.
//!
//! # Example
//!
//! ```rust
//! use tenantry::repository::{RepositoryError, RepositoryErrorKind};
//!
//! let error = RepositoryError::not_found("Register", r#"{"id":"reg_123"}"#);
//! assert!(matches!(error.kind, RepositoryErrorKind::NotFound));
//! assert!(error.criteria.is_some());
//! ```

use std::fmt;

/// Operation being performed when the repository error occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepositoryOperation {
    /// Inserting a single entity
    Create,
    /// Inserting a batch of entities
    CreateMany,
    /// Looking up an entity by criteria, inserting it when absent
    FindOrCreate,
    /// Updating a single entity
    Update,
    /// Updating a batch of entities
    UpdateMany,
    /// Updating every row matched by a predicate
    UpdateAll,
    /// Deleting a single entity
    Delete,
    /// Deleting a batch of entities
    DeleteMany,
    /// Single-row lookup
    Find,
    /// Multi-row lookup
    Query,
    /// Aggregate count
    Count,
    /// Attaching or detaching pivot rows
    Sync,
    /// Decoding or validating a query description
    Parse,
}

impl fmt::Display for RepositoryOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::CreateMany => write!(f, "create_many"),
            Self::FindOrCreate => write!(f, "find_or_create"),
            Self::Update => write!(f, "update"),
            Self::UpdateMany => write!(f, "update_many"),
            Self::UpdateAll => write!(f, "update_all"),
            Self::Delete => write!(f, "delete"),
            Self::DeleteMany => write!(f, "delete_many"),
            Self::Find => write!(f, "find"),
            Self::Query => write!(f, "query"),
            Self::Count => write!(f, "count"),
            Self::Sync => write!(f, "sync"),
            Self::Parse => write!(f, "parse"),
        }
    }
}

/// Category of repository error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepositoryErrorKind {
    /// Entity was not found
    NotFound,
    /// Operation preconditions were violated before reaching the store
    Configuration,
    /// Entity already exists (duplicate key)
    AlreadyExists,
    /// Database constraint violation
    ConstraintViolation,
    /// Validation failed before database operation
    ValidationFailed,
    /// Failed to connect to database
    ConnectionFailed,
    /// Operation timed out
    Timeout,
    /// Underlying database error
    DatabaseError,
    /// Serialization or deserialization error
    SerializationError,
    /// Other unclassified error
    Other,
}

impl fmt::Display for RepositoryErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "not_found"),
            Self::Configuration => write!(f, "configuration"),
            Self::AlreadyExists => write!(f, "already_exists"),
            Self::ConstraintViolation => write!(f, "constraint_violation"),
            Self::ValidationFailed => write!(f, "validation_failed"),
            Self::ConnectionFailed => write!(f, "connection_failed"),
            Self::Timeout => write!(f, "timeout"),
            Self::DatabaseError => write!(f, "database_error"),
            Self::SerializationError => write!(f, "serialization_error"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Structured repository error with operation context
///
/// Carries the operation that failed, why it failed, the kind of entity
/// involved, and the criteria or identifier that was attempted.
///
/// # Example
///
/// ```rust
/// use tenantry::repository::{RepositoryError, RepositoryOperation};
///
/// let error = RepositoryError::not_found("Register", "reg_abc123")
///     .with_operation(RepositoryOperation::Update);
/// println!("{}", error); // "Repository not_found error during update: Entity not found [Register: reg_abc123]"
///
/// if error.is_retriable() {
///     // Retry the operation
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryError {
    /// The operation being performed when the error occurred
    pub operation: RepositoryOperation,
    /// The category of error
    pub kind: RepositoryErrorKind,
    /// Human-readable error message
    pub message: String,
    /// The model involved (e.g., "Register", "Group")
    pub entity_type: Option<String>,
    /// The identifier or JSON-encoded criteria that was attempted
    pub criteria: Option<String>,
}

impl RepositoryError {
    /// Create a new repository error
    pub fn new(
        operation: RepositoryOperation,
        kind: RepositoryErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            kind,
            message: message.into(),
            entity_type: None,
            criteria: None,
        }
    }

    /// Create a "not found" error with entity context
    ///
    /// # Example
    ///
    /// ```rust
    /// use tenantry::repository::RepositoryError;
    ///
    /// let error = RepositoryError::not_found("Register", "reg_123");
    /// assert_eq!(error.entity_type, Some("Register".to_string()));
    /// ```
    pub fn not_found(entity_type: impl Into<String>, criteria: impl Into<String>) -> Self {
        Self {
            operation: RepositoryOperation::Find,
            kind: RepositoryErrorKind::NotFound,
            message: "Entity not found".to_string(),
            entity_type: Some(entity_type.into()),
            criteria: Some(criteria.into()),
        }
    }

    /// Create a configuration error
    ///
    /// Raised before any store call when the operation cannot proceed safely,
    /// e.g. tenancy is required but no tenant context is present.
    ///
    /// # Example
    ///
    /// ```rust
    /// use tenantry::repository::{RepositoryError, RepositoryOperation};
    ///
    /// let error = RepositoryError::configuration(
    ///     RepositoryOperation::FindOrCreate,
    ///     "find_or_create requires match criteria",
    /// );
    /// ```
    pub fn configuration(operation: RepositoryOperation, message: impl Into<String>) -> Self {
        Self::new(operation, RepositoryErrorKind::Configuration, message)
    }

    /// Create an "already exists" error with entity context
    pub fn already_exists(entity_type: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            operation: RepositoryOperation::Create,
            kind: RepositoryErrorKind::AlreadyExists,
            message: "Entity already exists".to_string(),
            entity_type: Some(entity_type.into()),
            criteria: Some(identifier.into()),
        }
    }

    /// Create a validation failed error
    pub fn validation_failed(message: impl Into<String>) -> Self {
        Self::new(
            RepositoryOperation::Create,
            RepositoryErrorKind::ValidationFailed,
            message,
        )
    }

    /// Create a constraint violation error
    pub fn constraint_violation(
        operation: RepositoryOperation,
        message: impl Into<String>,
    ) -> Self {
        Self::new(operation, RepositoryErrorKind::ConstraintViolation, message)
    }

    /// Create a connection failed error
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::new(
            RepositoryOperation::Find,
            RepositoryErrorKind::ConnectionFailed,
            message,
        )
    }

    /// Create a timeout error
    pub fn timeout(operation: RepositoryOperation, message: impl Into<String>) -> Self {
        Self::new(operation, RepositoryErrorKind::Timeout, message)
    }

    /// Create a database error
    pub fn database_error(operation: RepositoryOperation, message: impl Into<String>) -> Self {
        Self::new(operation, RepositoryErrorKind::DatabaseError, message)
    }

    /// Create a serialization error
    ///
    /// # Example
    ///
    /// ```rust
    /// use tenantry::repository::{RepositoryError, RepositoryOperation};
    ///
    /// let error = RepositoryError::serialization_error(
    ///     RepositoryOperation::Find,
    ///     "Failed to deserialize JSON field",
    /// );
    /// ```
    pub fn serialization_error(operation: RepositoryOperation, message: impl Into<String>) -> Self {
        Self::new(operation, RepositoryErrorKind::SerializationError, message)
    }

    /// Add entity context to an existing error
    #[must_use]
    pub fn with_entity(
        mut self,
        entity_type: impl Into<String>,
        criteria: impl Into<String>,
    ) -> Self {
        self.entity_type = Some(entity_type.into());
        self.criteria = Some(criteria.into());
        self
    }

    /// Set the operation that caused the error
    #[must_use]
    pub fn with_operation(mut self, operation: RepositoryOperation) -> Self {
        self.operation = operation;
        self
    }

    /// Check if this error is retriable (transient errors that may succeed on retry)
    ///
    /// # Example
    ///
    /// ```rust
    /// use tenantry::repository::RepositoryError;
    ///
    /// assert!(RepositoryError::connection_failed("Connection reset").is_retriable());
    /// assert!(!RepositoryError::not_found("Register", "123").is_retriable());
    /// ```
    pub fn is_retriable(&self) -> bool {
        matches!(
            self.kind,
            RepositoryErrorKind::ConnectionFailed | RepositoryErrorKind::Timeout
        )
    }

    /// True for the one recoverable read-path condition
    pub fn is_not_found(&self) -> bool {
        self.kind == RepositoryErrorKind::NotFound
    }

    /// True for duplicate-key failures, which `find_or_create` recovers from
    pub fn is_unique_violation(&self) -> bool {
        self.kind == RepositoryErrorKind::AlreadyExists
    }
}

impl fmt::Display for RepositoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Repository {} error during {}: {}",
            self.kind, self.operation, self.message
        )?;
        if let (Some(ref entity_type), Some(ref criteria)) = (&self.entity_type, &self.criteria) {
            write!(f, " [{}: {}]", entity_type, criteria)?;
        }
        Ok(())
    }
}

impl std::error::Error for RepositoryError {}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization_error(RepositoryOperation::Query, err.to_string())
    }
}

// Unique violations are kept apart from other constraint failures so that
// find_or_create can fall back to a second lookup.
#[cfg(feature = "postgres")]
impl From<sqlx::Error> for RepositoryError {
    fn from(err: sqlx::Error) -> Self {
        use sqlx::Error as E;
        match err {
            E::RowNotFound => Self::new(
                RepositoryOperation::Find,
                RepositoryErrorKind::NotFound,
                "Row not found",
            ),
            E::PoolTimedOut => Self::timeout(RepositoryOperation::Query, "Connection pool timed out"),
            E::PoolClosed => Self::connection_failed("Connection pool is closed"),
            E::Io(e) => Self::connection_failed(e.to_string()),
            E::Tls(e) => Self::connection_failed(format!("TLS error: {}", e)),
            E::WorkerCrashed => Self::connection_failed("Database worker crashed"),
            E::ColumnDecode { index, source } => Self::serialization_error(
                RepositoryOperation::Query,
                format!("Failed to decode column {}: {}", index, source),
            ),
            E::Decode(e) => Self::serialization_error(RepositoryOperation::Query, e.to_string()),
            E::Database(db_err) => {
                let message = db_err.to_string();
                if db_err.is_unique_violation() {
                    Self::new(
                        RepositoryOperation::Query,
                        RepositoryErrorKind::AlreadyExists,
                        message,
                    )
                } else if db_err.is_foreign_key_violation() || db_err.is_check_violation() {
                    Self::constraint_violation(RepositoryOperation::Query, message)
                } else {
                    Self::database_error(RepositoryOperation::Query, message)
                }
            }
            other => Self::database_error(RepositoryOperation::Query, other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_operation_display() {
        assert_eq!(format!("{}", RepositoryOperation::Create), "create");
        assert_eq!(format!("{}", RepositoryOperation::CreateMany), "create_many");
        assert_eq!(
            format!("{}", RepositoryOperation::FindOrCreate),
            "find_or_create"
        );
        assert_eq!(format!("{}", RepositoryOperation::UpdateAll), "update_all");
        assert_eq!(format!("{}", RepositoryOperation::DeleteMany), "delete_many");
        assert_eq!(format!("{}", RepositoryOperation::Count), "count");
        assert_eq!(format!("{}", RepositoryOperation::Parse), "parse");
    }

    #[test]
    fn test_repository_error_kind_display() {
        assert_eq!(format!("{}", RepositoryErrorKind::NotFound), "not_found");
        assert_eq!(
            format!("{}", RepositoryErrorKind::Configuration),
            "configuration"
        );
        assert_eq!(
            format!("{}", RepositoryErrorKind::AlreadyExists),
            "already_exists"
        );
        assert_eq!(
            format!("{}", RepositoryErrorKind::SerializationError),
            "serialization_error"
        );
    }

    #[test]
    fn test_not_found_convenience() {
        let error = RepositoryError::not_found("Register", "reg_123");
        assert_eq!(error.operation, RepositoryOperation::Find);
        assert_eq!(error.kind, RepositoryErrorKind::NotFound);
        assert_eq!(error.entity_type, Some("Register".to_string()));
        assert_eq!(error.criteria, Some("reg_123".to_string()));
        assert!(error.is_not_found());
    }

    #[test]
    fn test_configuration_convenience() {
        let error =
            RepositoryError::configuration(RepositoryOperation::Update, "identifier is empty");
        assert_eq!(error.kind, RepositoryErrorKind::Configuration);
        assert_eq!(error.operation, RepositoryOperation::Update);
        assert!(error.entity_type.is_none());
    }

    #[test]
    fn test_already_exists_is_unique_violation() {
        let error = RepositoryError::already_exists("Group", "name=Admins");
        assert!(error.is_unique_violation());
        assert!(!RepositoryError::constraint_violation(RepositoryOperation::Create, "fk")
            .is_unique_violation());
    }

    #[test]
    fn test_with_entity_and_operation() {
        let error = RepositoryError::new(
            RepositoryOperation::Update,
            RepositoryErrorKind::NotFound,
            "Not found",
        )
        .with_entity("Register", "reg_456")
        .with_operation(RepositoryOperation::UpdateMany);

        assert_eq!(error.entity_type, Some("Register".to_string()));
        assert_eq!(error.criteria, Some("reg_456".to_string()));
        assert_eq!(error.operation, RepositoryOperation::UpdateMany);
    }

    #[test]
    fn test_is_retriable() {
        assert!(RepositoryError::connection_failed("refused").is_retriable());
        assert!(RepositoryError::timeout(RepositoryOperation::Query, "timeout").is_retriable());
        assert!(!RepositoryError::not_found("Register", "123").is_retriable());
        assert!(!RepositoryError::configuration(RepositoryOperation::Find, "x").is_retriable());
        assert!(!RepositoryError::validation_failed("invalid").is_retriable());
    }

    #[test]
    fn test_display_with_and_without_entity() {
        let plain = RepositoryError::database_error(RepositoryOperation::Create, "Query failed");
        let display = format!("{}", plain);
        assert!(display.contains("database_error"));
        assert!(display.contains("create"));
        assert!(!display.contains('['));

        let with_entity = RepositoryError::not_found("Register", "reg_123");
        assert!(format!("{}", with_entity).contains("[Register: reg_123]"));
    }

    #[test]
    fn test_from_serde_json_error() {
        let err = serde_json::from_str::<Vec<String>>("not json").unwrap_err();
        let error = RepositoryError::from(err);
        assert_eq!(error.kind, RepositoryErrorKind::SerializationError);
    }

    #[cfg(feature = "postgres")]
    #[derive(Debug)]
    struct ServerError(sqlx::error::ErrorKind);

    #[cfg(feature = "postgres")]
    impl fmt::Display for ServerError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "violates constraint")
        }
    }

    #[cfg(feature = "postgres")]
    impl std::error::Error for ServerError {}

    #[cfg(feature = "postgres")]
    impl sqlx::error::DatabaseError for ServerError {
        fn message(&self) -> &str {
            "violates constraint"
        }

        fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn std::error::Error + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> sqlx::error::ErrorKind {
            match self.0 {
                sqlx::error::ErrorKind::UniqueViolation => sqlx::error::ErrorKind::UniqueViolation,
                sqlx::error::ErrorKind::ForeignKeyViolation => {
                    sqlx::error::ErrorKind::ForeignKeyViolation
                }
                sqlx::error::ErrorKind::CheckViolation => sqlx::error::ErrorKind::CheckViolation,
                _ => sqlx::error::ErrorKind::Other,
            }
        }
    }

    #[cfg(feature = "postgres")]
    #[test]
    fn test_from_sqlx_database_error() {
        use sqlx::error::ErrorKind;

        let classify = |kind| {
            RepositoryError::from(sqlx::Error::Database(Box::new(ServerError(kind)))).kind
        };
        assert_eq!(classify(ErrorKind::UniqueViolation), RepositoryErrorKind::AlreadyExists);
        assert_eq!(
            classify(ErrorKind::ForeignKeyViolation),
            RepositoryErrorKind::ConstraintViolation
        );
        assert_eq!(
            classify(ErrorKind::CheckViolation),
            RepositoryErrorKind::ConstraintViolation
        );
        assert_eq!(classify(ErrorKind::Other), RepositoryErrorKind::DatabaseError);
    }
}
