//! Device profile values kept between launches.

use std::sync::Arc;

use serde::{Serialize, de::DeserializeOwned};
use tracing::warn;

use crate::{KeyValueStore, StoreError};

pub const USERNAME_KEY: &str = "username";
pub const COUNTRY_CODE_KEY: &str = "countryCode";
pub const SESSION_KEY: &str = "session";

/// Anonymous username built from the last four digits of a millisecond clock.
pub fn random_username(now_millis: u128) -> String {
    format!("@user{:04}", now_millis % 10_000)
}

/// Typed access to the device-local keys.
///
/// Session tokens go to `secrets`, which may be the same store as `prefs`.
#[derive(Clone)]
pub struct DeviceProfile {
    prefs: Arc<dyn KeyValueStore>,
    secrets: Arc<dyn KeyValueStore>,
}

impl DeviceProfile {
    pub fn new(prefs: Arc<dyn KeyValueStore>, secrets: Arc<dyn KeyValueStore>) -> Self {
        Self { prefs, secrets }
    }

    pub fn single_store(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            prefs: store.clone(),
            secrets: store,
        }
    }

    pub fn username(&self) -> Result<Option<String>, StoreError> {
        Ok(self
            .prefs
            .get(USERNAME_KEY)?
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty()))
    }

    /// Stored username, or a fresh random one persisted on first use.
    pub fn ensure_username(&self, now_millis: u128) -> Result<String, StoreError> {
        if let Some(existing) = self.username()? {
            return Ok(existing);
        }
        self.reset_username(now_millis)
    }

    pub fn set_username(&self, username: &str) -> Result<(), StoreError> {
        self.prefs.set(USERNAME_KEY, username.trim())
    }

    /// Replace the stored username with a new random one.
    pub fn reset_username(&self, now_millis: u128) -> Result<String, StoreError> {
        let username = random_username(now_millis);
        self.prefs.set(USERNAME_KEY, &username)?;
        Ok(username)
    }

    /// Cached country code. Placeholder values written by failed lookups read
    /// as absent.
    pub fn country_code(&self) -> Result<Option<String>, StoreError> {
        Ok(self
            .prefs
            .get(COUNTRY_CODE_KEY)?
            .map(|value| value.trim().to_ascii_lowercase())
            .filter(|value| !value.is_empty() && value != "undefined" && value != "null"))
    }

    pub fn set_country_code(&self, code: &str) -> Result<(), StoreError> {
        self.prefs
            .set(COUNTRY_CODE_KEY, &code.trim().to_ascii_lowercase())
    }

    /// Saved session. A value that no longer decodes is discarded.
    pub fn session<T: DeserializeOwned>(&self) -> Result<Option<T>, StoreError> {
        let Some(raw) = self.secrets.get(SESSION_KEY)? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(session) => Ok(Some(session)),
            Err(err) => {
                warn!(error = %err, "discarding malformed saved session");
                self.secrets.remove(SESSION_KEY)?;
                Ok(None)
            }
        }
    }

    pub fn save_session<T: Serialize>(&self, session: &T) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(session).map_err(|err| StoreError::Malformed {
            key: SESSION_KEY.to_owned(),
            reason: err.to_string(),
        })?;
        self.secrets.set(SESSION_KEY, &encoded)
    }

    pub fn clear_session(&self) -> Result<(), StoreError> {
        self.secrets.remove(SESSION_KEY)
    }
}
