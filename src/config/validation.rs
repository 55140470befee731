//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, addresses parse)
//! - Check paired settings (client cert needs a key, TLS needs both files)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: TunnelConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use crate::config::schema::TunnelConfig;
use crate::proxy::Role;

/// One semantic problem with a configuration value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

pub fn validate_config(config: &TunnelConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.role == Role::Worker {
        if config.listener.bind_address.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::new(
                "listener.bind_address",
                format!("not a socket address: {}", config.listener.bind_address),
            ));
        }
        if config.listener.max_connections == 0 {
            errors.push(ValidationError::new("listener.max_connections", "must be > 0"));
        }
        if config.listener.max_header_bytes < 256 {
            errors.push(ValidationError::new("listener.max_header_bytes", "must be >= 256"));
        }
        if let Some(tls) = &config.listener.tls {
            if tls.cert_path.is_empty() || tls.key_path.is_empty() {
                errors.push(ValidationError::new(
                    "listener.tls",
                    "cert_path and key_path are both required",
                ));
            }
        }
    }

    if config.listener.max_body_bytes == 0 {
        errors.push(ValidationError::new("listener.max_body_bytes", "must be > 0"));
    }

    if config.role == Role::Master {
        match url::Url::parse(&config.upstream.server_address) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            Ok(url) => errors.push(ValidationError::new(
                "upstream.server_address",
                format!("unsupported scheme: {}", url.scheme()),
            )),
            Err(e) => errors.push(ValidationError::new(
                "upstream.server_address",
                format!("invalid URL: {e}"),
            )),
        }
        if config.upstream.client_cert_path.is_some() != config.upstream.client_key_path.is_some()
        {
            errors.push(ValidationError::new(
                "upstream.client_cert_path",
                "client certificate and key must be set together",
            ));
        }
        if config.upstream.connect_timeout_ms == 0 {
            errors.push(ValidationError::new("upstream.connect_timeout_ms", "must be > 0"));
        }
        if config.upstream.request_timeout_ms == 0 {
            errors.push(ValidationError::new("upstream.request_timeout_ms", "must be > 0"));
        }
        if config.upstream.watch_read_timeout_ms == 0 {
            errors.push(ValidationError::new("upstream.watch_read_timeout_ms", "must be > 0"));
        }
    }

    if config.transport.request_stream.is_empty() {
        errors.push(ValidationError::new("transport.request_stream", "must not be empty"));
    }
    if config.transport.watch_request_stream.is_empty() {
        errors.push(ValidationError::new(
            "transport.watch_request_stream",
            "must not be empty",
        ));
    }
    if config.transport.request_stream == config.transport.watch_request_stream {
        errors.push(ValidationError::new(
            "transport.watch_request_stream",
            "must differ from request_stream",
        ));
    }

    if config.relay.poll_interval_ms == 0 {
        errors.push(ValidationError::new("relay.poll_interval_ms", "must be > 0"));
    }
    if config.relay.first_reply_max_polls == 0 {
        errors.push(ValidationError::new("relay.first_reply_max_polls", "must be > 0"));
    }
    if config.relay.watch_idle_max_polls == 0 {
        errors.push(ValidationError::new("relay.watch_idle_max_polls", "must be > 0"));
    }
    if config.control.poll_interval_ms == 0 {
        errors.push(ValidationError::new("control.poll_interval_ms", "must be > 0"));
    }

    if config.observability.metrics_enabled
        && config
            .observability
            .metrics_address
            .parse::<SocketAddr>()
            .is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("not a socket address: {}", config.observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::TlsConfig;

    #[test]
    fn test_default_worker_is_valid() {
        assert!(validate_config(&TunnelConfig::default()).is_ok());
    }

    #[test]
    fn test_default_master_is_valid() {
        let mut config = TunnelConfig::default();
        config.role = Role::Master;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_collects_all_errors() {
        let mut config = TunnelConfig::default();
        config.listener.bind_address = "nowhere".into();
        config.listener.tls = Some(TlsConfig {
            cert_path: "cert.pem".into(),
            key_path: String::new(),
        });
        config.relay.watch_idle_max_polls = 0;

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field).collect();
        assert_eq!(
            fields,
            vec!["listener.bind_address", "listener.tls", "relay.watch_idle_max_polls"]
        );
    }

    #[test]
    fn test_master_checks_upstream() {
        let mut config = TunnelConfig::default();
        config.role = Role::Master;
        config.upstream.server_address = "ftp://cluster".into();
        config.upstream.client_cert_path = Some("client.pem".into());

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].message.contains("ftp"));
    }

    #[test]
    fn test_stream_names_must_differ() {
        let mut config = TunnelConfig::default();
        config.transport.watch_request_stream = "request".into();
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors[0].field, "transport.watch_request_stream");
    }
}
