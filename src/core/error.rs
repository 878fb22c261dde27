use std::fmt;

pub const CODE_TRANSIENT: &str = "TRANSIENT";
pub const CODE_CONFIG_MISSING: &str = "CONFIG_MISSING";
pub const CODE_PERMISSION_DENIED: &str = "PERMISSION_DENIED";
pub const CODE_POISON_MESSAGE: &str = "POISON_MESSAGE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    ConfigurationMissing,
    PermissionDenied,
    PoisonMessage,
}

impl ErrorClass {
    pub fn code(self) -> &'static str {
        match self {
            Self::Transient => CODE_TRANSIENT,
            Self::ConfigurationMissing => CODE_CONFIG_MISSING,
            Self::PermissionDenied => CODE_PERMISSION_DENIED,
            Self::PoisonMessage => CODE_POISON_MESSAGE,
        }
    }
}

#[derive(Debug)]
pub struct RelayError {
    class: ErrorClass,
    message: String,
}

impl RelayError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Transient, message)
    }

    pub fn config_missing(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::ConfigurationMissing, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::PermissionDenied, message)
    }

    pub fn poison(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::PoisonMessage, message)
    }

    pub fn class(&self) -> ErrorClass {
        self.class
    }

    pub fn code(&self) -> &'static str {
        self.class.code()
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for RelayError {}

/// Anything that is not a tagged `RelayError` counts as transient.
pub fn classify(err: &anyhow::Error) -> ErrorClass {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<RelayError>())
        .map(RelayError::class)
        .unwrap_or(ErrorClass::Transient)
}
