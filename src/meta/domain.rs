use uuid::Uuid;

use crate::codec::{ObjectBuilder, Value};
use crate::error::CoreError;

/// A hostname routed to a project. Hostnames are unique and case-sensitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Domain {
    pub id: Uuid,
    pub hostname: String,
    pub project_id: Uuid,
    pub ssl_enabled: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Domain {
    pub fn new(hostname: impl Into<String>, project_id: Uuid, now_ms: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            hostname: hostname.into(),
            project_id,
            ssl_enabled: false,
            created_at: now_ms,
            updated_at: now_ms,
        }
    }

    pub fn hostname_key(&self) -> &str {
        &self.hostname
    }
}

/// `[A-Za-z0-9.-]` DNS-like hostnames, up to 253 bytes, no leading/trailing
/// dot or hyphen per label.
pub fn validate_hostname(hostname: &str) -> Result<(), CoreError> {
    if hostname.is_empty() || hostname.len() > 253 {
        return Err(CoreError::Validation(format!(
            "hostname length must be 1..=253 bytes, got {}",
            hostname.len()
        )));
    }
    if !hostname.is_ascii() {
        return Err(CoreError::Validation(
            "hostname must be ASCII".to_string(),
        ));
    }
    for label in hostname.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(CoreError::Validation(format!(
                "hostname label '{label}' must be 1..=63 bytes"
            )));
        }
        let valid = label
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-');
        if !valid || label.starts_with('-') || label.ends_with('-') {
            return Err(CoreError::Validation(format!(
                "hostname label '{label}' has invalid characters"
            )));
        }
    }
    Ok(())
}

impl From<&Domain> for Value {
    fn from(domain: &Domain) -> Value {
        ObjectBuilder::new()
            .field("id", Value::Uuid(domain.id))
            .field("hostname", Value::Str(domain.hostname.clone()))
            .field("project_id", Value::Uuid(domain.project_id))
            .field("ssl_enabled", Value::Bool(domain.ssl_enabled))
            .field("created_at", Value::Date(domain.created_at))
            .field("updated_at", Value::Date(domain.updated_at))
            .build()
    }
}

impl TryFrom<&Value> for Domain {
    type Error = CoreError;

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        let field = |key: &str| {
            value
                .get(key)
                .ok_or_else(|| CoreError::Corruption(format!("domain record missing '{key}'")))
        };
        Ok(Domain {
            id: field("id")?
                .as_uuid()
                .ok_or_else(|| CoreError::Corruption("domain 'id' is not a uuid".into()))?,
            hostname: field("hostname")?
                .as_str()
                .ok_or_else(|| CoreError::Corruption("domain 'hostname' is not a string".into()))?
                .to_owned(),
            project_id: field("project_id")?
                .as_uuid()
                .ok_or_else(|| CoreError::Corruption("domain 'project_id' is not a uuid".into()))?,
            ssl_enabled: field("ssl_enabled")?
                .as_bool()
                .ok_or_else(|| CoreError::Corruption("domain 'ssl_enabled' is not a bool".into()))?,
            created_at: field("created_at")?
                .as_date_ms()
                .ok_or_else(|| CoreError::Corruption("domain 'created_at' is not a date".into()))?,
            updated_at: field("updated_at")?
                .as_date_ms()
                .ok_or_else(|| CoreError::Corruption("domain 'updated_at' is not a date".into()))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn roundtrip_through_value() {
        let domain = Domain::new("a.test", Uuid::new_v4(), 1_700_000_000_000);
        let value = Value::from(&domain);
        let decoded = Domain::try_from(&value).unwrap();
        assert_eq!(domain, decoded);
    }

    #[test]
    fn accepts_plain_hostnames() {
        assert!(validate_hostname("a.test").is_ok());
        assert!(validate_hostname("sub.example-site.com").is_ok());
    }

    #[test]
    fn rejects_empty_and_overlong_labels() {
        assert!(validate_hostname("").is_err());
        assert!(validate_hostname(&"a".repeat(64)).is_err());
        assert!(validate_hostname("a..b").is_err());
        assert!(validate_hostname("-a.test").is_err());
    }
}
