//! Error kinds surfaced by the gateway core.

use thiserror::Error;

/// Reason a public-key login was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRejection {
    /// The key matched a key-set that has no access-control entry.
    NoAcl,
    /// The key matched a key-set whose ACL does not admit the login name.
    NotAllowed,
    /// The key is not enrolled in any key-set.
    KeyUnknown,
}

impl std::fmt::Display for AuthRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthRejection::NoAcl => write!(f, "unauthorized: acl not set"),
            AuthRejection::NotAllowed => write!(f, "unauthorized: access not granted"),
            AuthRejection::KeyUnknown => write!(f, "unauthorized: key not enrolled"),
        }
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("{0}")]
    AuthRejected(AuthRejection),

    #[error("cannot find template for user {0}")]
    TemplateNotFound(String),

    #[error("failed to create container: {0}")]
    ContainerCreate(#[source] anyhow::Error),

    #[error("failed to start container: {0}")]
    ContainerStart(#[source] anyhow::Error),

    #[error("failed to exec in container: {0}")]
    ContainerExec(#[source] anyhow::Error),

    #[error("unexpected container status: {0}")]
    UnexpectedStatus(String),

    #[error("failed to bind management service: {0}")]
    ManagerBind(#[source] std::io::Error),
}
