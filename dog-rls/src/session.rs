//! Session context codec.
//!
//! Turns a [`TenantIdentity`] into the statements that scope row-level
//! security to it, and produces the statements that remove that scoping.
//!
//! Install uses `set_config(key, value, true)`: the setting is
//! transaction-local, so Postgres drops it at COMMIT/ROLLBACK even if our
//! own teardown never runs. Both key and value travel as bound parameters.
//! Teardown uses `RESET key`, which cannot take parameters; keys are
//! therefore validated when [`SessionKeys`] is built.

use dog_core::{OrganizationId, TenantIdentity, UserId};

use crate::error::ConfigError;
use crate::statement::{SqlValue, Statement};

pub const DEFAULT_USER_KEY: &str = "app.current_user_id";
pub const DEFAULT_ORGANIZATION_KEY: &str = "app.current_organization_id";

const INSTALL_SQL: &str = "SELECT set_config($1, $2, true)";

/// Names of the two transaction-local settings RLS policies read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKeys {
    user: String,
    organization: String,
}

impl SessionKeys {
    pub fn new(user: impl Into<String>, organization: impl Into<String>) -> Result<Self, ConfigError> {
        let user = user.into();
        let organization = organization.into();
        validate_key(&user)?;
        validate_key(&organization)?;
        if user == organization {
            return Err(ConfigError::InvalidSessionKey {
                key: organization,
                reason: "user and organization keys must differ",
            });
        }
        Ok(Self { user, organization })
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn organization(&self) -> &str {
        &self.organization
    }

    pub fn contains(&self, key: &str) -> bool {
        key.eq_ignore_ascii_case(&self.user) || key.eq_ignore_ascii_case(&self.organization)
    }
}

impl Default for SessionKeys {
    fn default() -> Self {
        Self {
            user: DEFAULT_USER_KEY.to_string(),
            organization: DEFAULT_ORGANIZATION_KEY.to_string(),
        }
    }
}

/// Custom settings must look like `namespace.name`.
fn validate_key(key: &str) -> Result<(), ConfigError> {
    let invalid = |reason| ConfigError::InvalidSessionKey {
        key: key.to_string(),
        reason,
    };
    let (namespace, name) = key
        .split_once('.')
        .ok_or_else(|| invalid("expected namespace.name"))?;
    for part in [namespace, name] {
        let mut chars = part.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
            _ => return Err(invalid("each part must start with a letter or underscore")),
        }
        if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(invalid("only ASCII letters, digits and underscores are allowed"));
        }
    }
    Ok(())
}

/// Codec failures when reading install statements back.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("no install statement for {0}")]
    MissingKey(String),

    #[error("install statement for {0} has no text value")]
    MissingValue(String),
}

#[derive(Debug, Clone, Default)]
pub struct SessionContextCodec {
    keys: SessionKeys,
}

impl SessionContextCodec {
    pub fn new(keys: SessionKeys) -> Self {
        Self { keys }
    }

    pub fn keys(&self) -> &SessionKeys {
        &self.keys
    }

    /// Exactly two transaction-local assignments: user first, then organization.
    pub fn install(&self, identity: &TenantIdentity) -> [Statement; 2] {
        [
            Statement::new(INSTALL_SQL)
                .bind(self.keys.user.as_str())
                .bind(identity.user_id.as_str()),
            Statement::new(INSTALL_SQL)
                .bind(self.keys.organization.as_str())
                .bind(identity.organization_id.as_str()),
        ]
    }

    /// Exactly two resets, one per key. Does not depend on install having run.
    pub fn teardown(&self) -> [Statement; 2] {
        [
            Statement::new(format!("RESET {}", self.keys.user)),
            Statement::new(format!("RESET {}", self.keys.organization)),
        ]
    }

    /// Recover the identity an install sequence would set.
    pub fn decode(&self, statements: &[Statement]) -> Result<TenantIdentity, DecodeError> {
        let user = self.value_for(statements, &self.keys.user)?;
        let organization = self.value_for(statements, &self.keys.organization)?;
        Ok(TenantIdentity {
            user_id: UserId(user),
            organization_id: OrganizationId(organization),
        })
    }

    fn value_for(&self, statements: &[Statement], key: &str) -> Result<String, DecodeError> {
        let stmt = statements
            .iter()
            .rev()
            .find(|s| s.text == INSTALL_SQL && s.params.first().and_then(SqlValue::as_str) == Some(key))
            .ok_or_else(|| DecodeError::MissingKey(key.to_string()))?;
        stmt.params
            .get(1)
            .and_then(SqlValue::as_str)
            .map(str::to_string)
            .ok_or_else(|| DecodeError::MissingValue(key.to_string()))
    }

    /// True when `stmt` would touch one of our keys. The unit of work may not.
    ///
    /// Setting names are matched without regard to case or double quotes,
    /// the way the server resolves them.
    pub fn touches_context(&self, stmt: &Statement) -> bool {
        let user = self.keys.user.to_ascii_lowercase();
        let organization = self.keys.organization.to_ascii_lowercase();
        let verb = stmt.verb();
        if verb == "RESET" || verb == "SET" {
            return stmt
                .text
                .split_whitespace()
                .skip(1)
                .find(|w| !w.eq_ignore_ascii_case("LOCAL") && !w.eq_ignore_ascii_case("SESSION"))
                .is_some_and(|token| {
                    let name = token.split('=').next().unwrap_or(token);
                    let name = name.trim_end_matches(';').replace('"', "").to_ascii_lowercase();
                    name == user || name == organization || name == "all"
                });
        }
        // set_config() and UPDATE pg_settings both write settings by name
        let text = stmt.text.to_ascii_lowercase();
        (text.contains("set_config") || text.contains("pg_settings"))
            && (stmt
                .params
                .iter()
                .filter_map(SqlValue::as_str)
                .any(|p| self.keys.contains(p.trim().trim_matches('"')))
                || text.contains(&user)
                || text.contains(&organization))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn install_binds_every_value() {
        let codec = SessionContextCodec::default();
        let identity = TenantIdentity::new("u1", "o1");

        let stmts = codec.install(&identity);

        assert_eq!(stmts.len(), 2);
        for stmt in &stmts {
            assert_eq!(stmt.text, "SELECT set_config($1, $2, true)");
            assert_eq!(stmt.params.len(), 2);
        }
        assert_eq!(stmts[0].params[0], SqlValue::from("app.current_user_id"));
        assert_eq!(stmts[0].params[1], SqlValue::from("u1"));
        assert_eq!(stmts[1].params[0], SqlValue::from("app.current_organization_id"));
        assert_eq!(stmts[1].params[1], SqlValue::from("o1"));
    }

    #[test]
    fn teardown_resets_both_keys() {
        let codec = SessionContextCodec::default();
        let texts: Vec<_> = codec.teardown().iter().map(|s| s.text.clone()).collect();
        assert_eq!(
            texts,
            vec!["RESET app.current_user_id", "RESET app.current_organization_id"]
        );
        assert!(codec.teardown().iter().all(|s| s.params.is_empty()));
    }

    #[test]
    fn session_keys_are_validated() {
        assert!(SessionKeys::new("app.user", "app.org").is_ok());
        for bad in ["app", "app.user; DROP TABLE t", "1app.user", "app.", "app.us-er"] {
            assert!(SessionKeys::new(bad, "app.org").is_err(), "{bad}");
        }
        assert!(SessionKeys::new("app.same", "app.same").is_err());
    }

    #[test]
    fn decode_reports_missing_keys() {
        let codec = SessionContextCodec::default();
        let stmts = codec.install(&TenantIdentity::new("u1", "o1"));
        assert_eq!(
            codec.decode(&stmts[..1]),
            Err(DecodeError::MissingKey("app.current_organization_id".into()))
        );
    }

    #[test]
    fn detects_context_tampering() {
        let codec = SessionContextCodec::default();
        assert!(codec.touches_context(&Statement::new("RESET app.current_user_id")));
        assert!(codec.touches_context(&Statement::new("reset all")));
        assert!(codec.touches_context(&Statement::new("SET LOCAL app.current_organization_id = 'x'")));
        assert!(codec.touches_context(
            &Statement::new("SELECT set_config($1, $2, false)")
                .bind("app.current_user_id")
                .bind("u2")
        ));
        assert!(codec.touches_context(&Statement::new(
            "SELECT set_config('APP.CURRENT_USER_ID', 'intruder', true)"
        )));
        assert!(codec.touches_context(&Statement::new("SET \"app.current_user_id\" = 'intruder'")));
        assert!(codec.touches_context(&Statement::new("set Local \"APP.Current_Organization_Id\" TO 'o2';")));
        assert!(codec.touches_context(&Statement::new("SET app.current_user_id='u2'")));
        assert!(codec.touches_context(
            &Statement::new("SELECT set_config($1, $2, true)")
                .bind("App.Current_User_Id")
                .bind("u2")
        ));
        assert!(codec.touches_context(&Statement::new(
            "UPDATE pg_settings SET setting = 'u2' WHERE name = 'app.current_user_id'"
        )));
        assert!(!codec.touches_context(&Statement::new("SET LOCAL statement_timeout = 5000")));
        assert!(!codec.touches_context(&Statement::new("SELECT * FROM tickets")));
    }

    proptest! {
        #[test]
        fn install_then_decode_is_identity(
            user in "[^\\x00]{1,40}",
            org in prop_oneof![
                Just("o'; DROP TABLE orgs; --".to_string()),
                Just("\"quoted\" $1 \\' ;".to_string()),
                "[^\\x00]{1,40}",
            ],
        ) {
            let codec = SessionContextCodec::default();
            let identity = TenantIdentity::new(user.clone(), org.clone());

            let stmts = codec.install(&identity);

            prop_assert_eq!(codec.decode(&stmts).unwrap(), identity);
            for stmt in &stmts {
                prop_assert_eq!(stmt.text.as_str(), "SELECT set_config($1, $2, true)");
            }
        }
    }
}
