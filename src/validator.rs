//! WS-Security header validation and construction.

use crate::config::WsSecurityConfig;
use crate::error::{Violation, ViolationCode};
use crate::infoset::{Element, QName};
use crate::message::{Header, HeaderList};
use crate::parser::{SAML_NS, WSSE_NS, WSU_NS};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use tracing::debug;

/// Result of WS-Security validation.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// Violations found
    pub violations: Vec<Violation>,
    /// Extracted identity (from WS-Security)
    pub identity: Option<String>,
}

impl ValidationResult {
    /// Check if any violations were found.
    pub fn has_violations(&self) -> bool {
        !self.violations.is_empty()
    }

    /// Add a violation.
    pub fn add_violation(&mut self, violation: Violation) {
        self.violations.push(violation);
    }
}

/// Parsed WS-Security header.
#[derive(Debug, Clone, Default)]
pub struct WsSecurityHeader {
    /// Timestamp element
    pub timestamp: Option<SecurityTimestamp>,
    /// Username token
    pub username_token: Option<UsernameToken>,
    /// SAML assertion present
    pub has_saml_assertion: bool,
}

/// WS-Security Timestamp.
#[derive(Debug, Clone, Default)]
pub struct SecurityTimestamp {
    /// Created timestamp (ISO 8601)
    pub created: Option<String>,
    /// Expires timestamp (ISO 8601)
    pub expires: Option<String>,
}

/// WS-Security UsernameToken.
#[derive(Debug, Clone, Default)]
pub struct UsernameToken {
    /// Username
    pub username: String,
    /// Password type URI
    pub password_type: Option<String>,
    /// Nonce (base64 encoded)
    pub nonce: Option<String>,
    /// Created timestamp
    pub created: Option<String>,
}

/// Name of the `wsse:Security` header block.
pub fn security_header_name() -> QName {
    QName::new(WSSE_NS, "Security")
}

/// Extract the WS-Security header from a header list.
pub fn extract_security(headers: &HeaderList) -> Option<WsSecurityHeader> {
    let security = headers.get(&security_header_name())?;
    let element = security.element();

    let timestamp = element
        .child(&QName::new(WSU_NS, "Timestamp"))
        .map(|ts| SecurityTimestamp {
            created: child_text(ts, WSU_NS, "Created"),
            expires: child_text(ts, WSU_NS, "Expires"),
        });

    let username_token = element
        .child(&QName::new(WSSE_NS, "UsernameToken"))
        .map(|token| UsernameToken {
            username: child_text(token, WSSE_NS, "Username").unwrap_or_default(),
            password_type: token
                .child(&QName::new(WSSE_NS, "Password"))
                .and_then(|p| p.attribute(&QName::local("Type")))
                .map(str::to_string),
            nonce: child_text(token, WSSE_NS, "Nonce"),
            created: child_text(token, WSU_NS, "Created"),
        });

    let has_saml_assertion = element
        .child(&QName::new(SAML_NS, "Assertion"))
        .is_some();

    Some(WsSecurityHeader {
        timestamp,
        username_token,
        has_saml_assertion,
    })
}

fn child_text(element: &Element, ns: &str, local: &str) -> Option<String> {
    element.child(&QName::new(ns, local)).map(Element::text)
}

/// Server-side WS-Security validator.
pub struct SecurityValidator {
    config: WsSecurityConfig,
}

impl SecurityValidator {
    /// Create a new validator with configuration.
    pub fn new(config: WsSecurityConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &WsSecurityConfig {
        &self.config
    }

    /// Validate the WS-Security header of a message.
    pub fn validate(&self, headers: &HeaderList) -> ValidationResult {
        let mut result = ValidationResult::default();
        let config = &self.config;

        let security = match extract_security(headers) {
            Some(s) => s,
            None => {
                if config.require_security_header {
                    result.add_violation(Violation::new(
                        ViolationCode::MissingSecurityHeader,
                        "WS-Security header is required but not present",
                    ));
                }
                return result;
            }
        };

        // Validate timestamp
        if config.require_timestamp {
            match &security.timestamp {
                Some(ts) => {
                    if let Some(ref created) = ts.created {
                        if let Err(e) = self.validate_timestamp(created) {
                            result.add_violation(e);
                        }
                    }
                    if let Some(ref expires) = ts.expires {
                        if let Err(e) = self.check_timestamp_expiry(expires) {
                            result.add_violation(e);
                        }
                    }
                }
                None => {
                    result.add_violation(Violation::new(
                        ViolationCode::InvalidTimestamp,
                        "Timestamp is required in WS-Security header but not present",
                    ));
                }
            }
        }

        // Validate username token
        match &security.username_token {
            Some(token) => {
                if let Some(ref pw_type) = token.password_type {
                    let allowed = config
                        .allowed_password_types
                        .iter()
                        .any(|t| t.matches(pw_type));
                    if !allowed {
                        result.add_violation(Violation::new(
                            ViolationCode::InvalidPasswordType,
                            format!("Password type '{}' is not allowed", pw_type),
                        ));
                    }
                }
                if !token.username.is_empty() {
                    result.identity = Some(token.username.clone());
                }
            }
            None if config.require_username_token => {
                result.add_violation(Violation::new(
                    ViolationCode::MissingUsernameToken,
                    "UsernameToken is required but not present",
                ));
            }
            None => {}
        }

        // Validate SAML
        if config.require_saml && !security.has_saml_assertion {
            result.add_violation(Violation::new(
                ViolationCode::MissingSamlAssertion,
                "SAML assertion is required but not present",
            ));
        }

        debug!(
            violations = result.violations.len(),
            identity = ?result.identity,
            "WS-Security header validated"
        );
        result
    }

    /// Validate timestamp is not too old.
    fn validate_timestamp(&self, created: &str) -> Result<(), Violation> {
        let created_time = DateTime::parse_from_rfc3339(created)
            .map_err(|_| {
                Violation::new(
                    ViolationCode::InvalidTimestamp,
                    format!("Invalid timestamp format: {}", created),
                )
            })?
            .with_timezone(&Utc);

        let now = Utc::now();
        let age = now.signed_duration_since(created_time);
        let max_age = Duration::seconds(self.config.max_timestamp_age_secs as i64);

        if age > max_age {
            return Err(Violation::new(
                ViolationCode::TimestampExpired,
                format!(
                    "Timestamp is too old: {} seconds (max: {})",
                    age.num_seconds(),
                    self.config.max_timestamp_age_secs
                ),
            ));
        }

        // Clock skew tolerance of 5 minutes
        let future_tolerance = Duration::minutes(5);
        if age < -future_tolerance {
            return Err(Violation::new(
                ViolationCode::InvalidTimestamp,
                "Timestamp is in the future",
            ));
        }

        Ok(())
    }

    /// Check if timestamp has expired.
    fn check_timestamp_expiry(&self, expires: &str) -> Result<(), Violation> {
        let expires_time = DateTime::parse_from_rfc3339(expires)
            .map_err(|_| {
                Violation::new(
                    ViolationCode::InvalidTimestamp,
                    format!("Invalid expires timestamp format: {}", expires),
                )
            })?
            .with_timezone(&Utc);

        if Utc::now() > expires_time {
            return Err(Violation::new(
                ViolationCode::TimestampExpired,
                "Security timestamp has expired",
            ));
        }

        Ok(())
    }
}

/// Build the client-side `wsse:Security` header: a timestamp valid for
/// `timestamp_ttl_secs` and, when a username is configured, a UsernameToken.
pub fn security_header(config: &WsSecurityConfig, now: DateTime<Utc>) -> Header {
    let stamp = |t: DateTime<Utc>| t.to_rfc3339_opts(SecondsFormat::Secs, true);
    let expires = now + Duration::seconds(config.timestamp_ttl_secs as i64);

    let mut security = Element::new(security_header_name()).with_prefix("wsse");
    security.declare_namespace("wsu", WSU_NS);
    security.push_child(
        Element::new(QName::new(WSU_NS, "Timestamp"))
            .with_prefix("wsu")
            .with_child(
                Element::new(QName::new(WSU_NS, "Created"))
                    .with_prefix("wsu")
                    .with_text(stamp(now)),
            )
            .with_child(
                Element::new(QName::new(WSU_NS, "Expires"))
                    .with_prefix("wsu")
                    .with_text(stamp(expires)),
            ),
    );

    if let Some(username) = &config.username {
        let mut token = Element::new(QName::new(WSSE_NS, "UsernameToken"))
            .with_prefix("wsse")
            .with_child(
                Element::new(QName::new(WSSE_NS, "Username"))
                    .with_prefix("wsse")
                    .with_text(username.clone()),
            );
        if let Some(password) = &config.password {
            token.push_child(
                Element::new(QName::new(WSSE_NS, "Password"))
                    .with_prefix("wsse")
                    .with_attribute(
                        QName::local("Type"),
                        crate::config::PasswordType::PasswordText.uri(),
                    )
                    .with_text(password.clone()),
            );
        }
        token.push_child(
            Element::new(QName::new(WSU_NS, "Created"))
                .with_prefix("wsu")
                .with_text(stamp(now)),
        );
        security.push_child(token);
    }

    Header::new(security)
}
