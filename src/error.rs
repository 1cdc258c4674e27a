//! Channel-scoped error taxonomy.
//!
//! Every variant here ends exactly one channel.  The `Display` text is the
//! operator-facing cause and may name backend addresses; what the SSH client
//! sees comes from [`ChannelError::user_message`] instead.

use thiserror::Error;

use crate::metrics::ChannelOutcome;

/// Failure while establishing the upstream side of a channel.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("dial failed: {0:#}")]
    Dial(anyhow::Error),
    #[error("SSH handshake failed: {0:#}")]
    Handshake(anyhow::Error),
    #[error("channel open rejected: {0:#}")]
    ChannelOpen(anyhow::Error),
}

/// Why a channel ended abnormally.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("phase1 timeout")]
    Phase1Timeout,

    #[error("no project specified")]
    NoProjectSpecified,

    #[error("project `{0}` not found")]
    ProjectNotFound(String),

    #[error("resolving project `{project}`: {cause:#}")]
    ResolverInternal { project: String, cause: anyhow::Error },

    #[error("connecting upstream for project `{project}`: {cause}")]
    Upstream { project: String, cause: ConnectError },

    #[error("forwarding failed: {0:#}")]
    Forwarding(anyhow::Error),
}

impl ChannelError {
    /// Text written to the client's stderr before the channel closes, if any.
    ///
    /// Never includes backend addresses or internal causes.
    pub fn user_message(&self) -> Option<String> {
        match self {
            Self::Phase1Timeout => {
                Some("Took too long to get project environment variable\n".to_string())
            }
            Self::NoProjectSpecified => Some(
                "couldn't find an appropriate target: no project name passed\n".to_string(),
            ),
            Self::ProjectNotFound(project) => Some(format!(
                "couldn't find an appropriate target: project `{project}` not found\n"
            )),
            Self::ResolverInternal { project, .. } => Some(format!(
                "couldn't find an appropriate target: lookup of project `{project}` failed\n"
            )),
            Self::Upstream { project, .. } => Some(format!(
                "couldn't connect to server hosting project '{project}'\n"
            )),
            Self::Forwarding(_) => None,
        }
    }

    pub fn outcome(&self) -> ChannelOutcome {
        match self {
            Self::Phase1Timeout => ChannelOutcome::Timeout,
            Self::NoProjectSpecified => ChannelOutcome::NoProject,
            Self::ProjectNotFound(_) => ChannelOutcome::NotFound,
            Self::ResolverInternal { .. } => ChannelOutcome::ResolverError,
            Self::Upstream { .. } => ChannelOutcome::UpstreamError,
            Self::Forwarding(_) => ChannelOutcome::ForwardingError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_message_hides_address() {
        let err = ChannelError::Upstream {
            project: "demo".to_string(),
            cause: ConnectError::Dial(anyhow::anyhow!("connect 10.0.0.5:22: refused")),
        };
        let msg = err.user_message().unwrap();
        assert!(msg.contains("'demo'"));
        assert!(!msg.contains("10.0.0.5"));
        // The operator-facing text keeps the cause.
        assert!(err.to_string().contains("10.0.0.5:22"));
    }

    #[test]
    fn resolver_message_hides_cause() {
        let err = ChannelError::ResolverInternal {
            project: "demo".to_string(),
            cause: anyhow::anyhow!("POST http://api.internal:8000 failed"),
        };
        let msg = err.user_message().unwrap();
        assert!(msg.starts_with("couldn't find an appropriate target: "));
        assert!(!msg.contains("api.internal"));
    }

    #[test]
    fn not_found_message_names_project() {
        let msg = ChannelError::ProjectNotFound("p".to_string())
            .user_message()
            .unwrap();
        assert!(msg.contains("`p`"));
    }

    #[test]
    fn forwarding_errors_are_silent() {
        assert!(ChannelError::Forwarding(anyhow::anyhow!("broken pipe"))
            .user_message()
            .is_none());
    }

    #[test]
    fn timeout_display_matches_log_label() {
        assert_eq!(ChannelError::Phase1Timeout.to_string(), "phase1 timeout");
    }
}
