use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::dedupe::{dedupe, DedupeReport};
use crate::error::{AuthError, AuthResult};
use crate::event_log::{AuditEvent, EventLog};
use crate::storage::KeyValueStore;
use crate::urls::{identity_key, ServerUrls};

pub const DIRECTORY_KEY: &str = "userinfos";
pub const THEME_KEY: &str = "theme";
pub const DEFAULT_THEME: &str = "Dark";
pub const DEFAULT_ACCENT_COLOR: &str = "#242443";
pub const DEFAULT_NOTIFICATION_SOUND: &str = "three";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccountRecord {
    #[serde(rename = "serverurls")]
    pub server_urls: ServerUrls,
    #[serde(default, deserialize_with = "null_as_default")]
    pub email: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub token: String,
    #[serde(rename = "loggedin", default, skip_serializing_if = "Option::is_none")]
    pub logged_in: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(rename = "pfpsrc", default, skip_serializing_if = "Option::is_none")]
    pub profile_image_ref: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AccountRecord {
    /// Builds a record for a freshly authenticated account. URLs are normalized.
    pub fn new(server_urls: &ServerUrls, email: &str, token: &str) -> AuthResult<Self> {
        let record = Self {
            server_urls: server_urls.normalized()?,
            email: email.to_string(),
            token: token.to_string(),
            logged_in: Some(true),
            username: None,
            profile_image_ref: None,
            extra: Map::new(),
        };
        record.validate()?;
        Ok(record)
    }

    pub fn validate(&self) -> AuthResult<()> {
        let mut missing = Vec::new();
        if self.server_urls.api.is_empty() || self.server_urls.wellknown.is_empty() {
            missing.push("serverurls");
        }
        if self.email.is_empty() {
            missing.push("email");
        }
        if self.token.is_empty() {
            missing.push("token");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(AuthError::MissingFields(missing))
        }
    }

    pub fn identity(&self) -> String {
        identity_key(&self.email, &self.server_urls.wellknown)
    }

    /// Copy of the record with its URL set brought to canonical form.
    pub fn normalized(&self) -> AuthResult<Self> {
        Ok(Self {
            server_urls: self.server_urls.normalized()?,
            ..self.clone()
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Preferences {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notifications: Option<bool>,
    #[serde(
        rename = "notisound",
        default = "default_notification_sound",
        deserialize_with = "null_as_notification_sound"
    )]
    pub notification_sound: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            theme: Some(DEFAULT_THEME.to_string()),
            notifications: Some(false),
            notification_sound: default_notification_sound(),
            extra: Map::new(),
        }
    }
}

fn default_notification_sound() -> String {
    DEFAULT_NOTIFICATION_SOUND.to_string()
}

fn default_accent_color() -> String {
    DEFAULT_ACCENT_COLOR.to_string()
}

// A stored `null` counts as a missing field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn null_as_notification_sound<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::deserialize(deserializer)?.unwrap_or_else(default_notification_sound))
}

fn null_as_accent_color<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::deserialize(deserializer)?.unwrap_or_else(default_accent_color))
}

/// Persisted root object. Missing sections are filled with defaults while
/// decoding; sections that are present are kept as stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccountDirectory {
    #[serde(rename = "currentuser", default)]
    pub current_account_key: Option<String>,
    #[serde(rename = "users", default, deserialize_with = "null_as_default")]
    pub accounts: IndexMap<String, AccountRecord>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub preferences: Preferences,
    #[serde(
        rename = "accent_color",
        default = "default_accent_color",
        deserialize_with = "null_as_accent_color"
    )]
    pub accent_color: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for AccountDirectory {
    fn default() -> Self {
        Self {
            current_account_key: None,
            accounts: IndexMap::new(),
            preferences: Preferences::default(),
            accent_color: default_accent_color(),
            extra: Map::new(),
        }
    }
}

impl AccountDirectory {
    pub fn current(&self) -> Option<&AccountRecord> {
        self.current_account_key
            .as_deref()
            .and_then(|key| self.accounts.get(key))
    }
}

pub struct AccountStore {
    store: Arc<dyn KeyValueStore>,
    event_log: Arc<EventLog>,
}

impl AccountStore {
    pub fn new(store: Arc<dyn KeyValueStore>, event_log: Arc<EventLog>) -> Self {
        Self { store, event_log }
    }

    /// Reads the directory, injects defaults for missing sections and writes
    /// the defaulted form back.
    pub fn load(&self) -> AuthResult<AccountDirectory> {
        let directory = match self.store.get(DIRECTORY_KEY)? {
            Some(raw) => serde_json::from_str::<AccountDirectory>(&raw).map_err(|err| {
                AuthError::storage(format!("failed to parse {}: {}", DIRECTORY_KEY, err))
            })?,
            None => AccountDirectory::default(),
        };

        for (identity, record) in &directory.accounts {
            if let Err(err) = record.validate() {
                tracing::error!(identity = %identity, error = %err, "stored account is incomplete");
                self.event_log.record(&AuditEvent::AccountIncomplete {
                    identity: identity.clone(),
                    error: err.to_string(),
                });
            }
        }

        self.save(&directory)?;
        Ok(directory)
    }

    pub fn save(&self, directory: &AccountDirectory) -> AuthResult<()> {
        let data = serde_json::to_string(directory).map_err(|err| {
            AuthError::storage(format!("failed to encode {}: {}", DIRECTORY_KEY, err))
        })?;
        self.store.set(DIRECTORY_KEY, &data)
    }

    /// Stored accounts with their URL sets re-normalized. Records whose URLs
    /// no longer parse are skipped with an error log.
    pub fn normalized_accounts(&self) -> AuthResult<Vec<(String, AccountRecord)>> {
        let directory = self.load()?;
        let mut accounts = Vec::with_capacity(directory.accounts.len());
        for (identity, record) in directory.accounts {
            match record.normalized() {
                Ok(record) => accounts.push((identity, record)),
                Err(err) => {
                    tracing::error!(
                        identity = %identity,
                        error = %err,
                        "stored account has unusable URLs"
                    )
                }
            }
        }
        Ok(accounts)
    }

    pub fn add_or_update(&self, record: AccountRecord, make_current: bool) -> AuthResult<String> {
        record.validate()?;
        let identity = record.identity();
        let mut directory = self.load()?;

        self.event_log.record(&AuditEvent::account_saved(
            &identity,
            &record.token,
            make_current,
        ));
        directory.accounts.insert(identity.clone(), record);
        if make_current {
            directory.current_account_key = Some(identity.clone());
        }
        self.save(&directory)?;
        Ok(identity)
    }

    pub fn set_current(&self, identity: &str) -> AuthResult<()> {
        let mut directory = self.load()?;
        if !directory.accounts.contains_key(identity) {
            return Err(AuthError::UnknownAccount(identity.to_string()));
        }
        directory.current_account_key = Some(identity.to_string());
        self.save(&directory)?;
        self.event_log.record(&AuditEvent::AccountSwitched {
            identity: identity.to_string(),
        });
        Ok(())
    }

    /// Applies `mutator` to one stored record and persists the whole directory.
    pub fn update<F>(&self, identity: &str, mutator: F) -> AuthResult<AccountRecord>
    where
        F: FnOnce(&mut AccountRecord),
    {
        let mut directory = self.load()?;
        let record = directory
            .accounts
            .get_mut(identity)
            .ok_or_else(|| AuthError::UnknownAccount(identity.to_string()))?;
        mutator(record);
        let updated = record.clone();
        self.save(&directory)?;
        self.event_log.record(&AuditEvent::AccountUpdated {
            identity: identity.to_string(),
        });
        Ok(updated)
    }

    /// Collapses duplicate accounts and persists the result unconditionally.
    pub fn dedupe(&self) -> AuthResult<DedupeReport> {
        let mut directory = self.load()?;
        let report = dedupe(&mut directory);
        self.save(&directory)?;
        if !report.is_empty() {
            self.event_log.record(&AuditEvent::AccountsDeduplicated {
                removed: report.removed.clone(),
                renamed: report.renamed.clone(),
            });
        }
        Ok(report)
    }
}

/// The active theme lives under its own key, apart from the preferences.
pub struct ThemeStore {
    store: Arc<dyn KeyValueStore>,
}

impl ThemeStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn load(&self) -> AuthResult<String> {
        let stored = self
            .store
            .get(THEME_KEY)?
            .and_then(|raw| serde_json::from_str::<String>(&raw).ok())
            .filter(|name| !name.is_empty());
        match stored {
            Some(name) => Ok(name),
            None => {
                self.set(DEFAULT_THEME)?;
                Ok(DEFAULT_THEME.to_string())
            }
        }
    }

    pub fn set(&self, name: &str) -> AuthResult<()> {
        let data = serde_json::to_string(name)
            .map_err(|err| AuthError::storage(format!("failed to encode {}: {}", THEME_KEY, err)))?;
        self.store.set(THEME_KEY, &data)
    }
}
