use thiserror::Error;

/// Failure to fit the anomaly model
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TrainError {
    #[error("insufficient training data: need at least {needed} packets, got {got}")]
    InsufficientData { needed: usize, got: usize },

    #[error("anomaly model is already trained")]
    AlreadyTrained,
}

/// Failure of a single firewall command
#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with status {code:?}: {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("`{command}` did not finish within {secs}s")]
    Timeout { command: String, secs: u64 },
}

/// Failure of the packet source
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no capture device available")]
    NoDevice,

    #[error("failed to open capture on {target}: {reason}")]
    Open { target: String, reason: String },

    #[error("invalid capture filter `{filter}`: {reason}")]
    Filter { filter: String, reason: String },

    #[error("capture read error: {0}")]
    Read(String),

    #[error("capture config error: {0}")]
    Config(String),
}

/// Invalid configuration values
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_firewall_error_messages() {
        let err = FirewallError::Timeout {
            command: "iptables -A INPUT -s 203.0.113.5 -j DROP".to_string(),
            secs: 10,
        };
        assert_eq!(
            err.to_string(),
            "`iptables -A INPUT -s 203.0.113.5 -j DROP` did not finish within 10s"
        );

        let err = FirewallError::CommandFailed {
            command: "netsh".to_string(),
            code: Some(1),
            stderr: "access denied".to_string(),
        };
        assert_eq!(err.to_string(), "`netsh` exited with status Some(1): access denied");

        let err = FirewallError::Spawn {
            command: "iptables".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        };
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_train_error_messages() {
        let err = TrainError::InsufficientData { needed: 20, got: 19 };
        assert_eq!(
            err.to_string(),
            "insufficient training data: need at least 20 packets, got 19"
        );
    }
}
