use crate::core::time_utils::{format_opt_ts, format_ts, now_ts};
use crate::storage::{StorageBackend, UserRecord};
use anyhow::{anyhow, Result};
use argon2::password_hash::{
    rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
};
use argon2::Argon2;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

const DEFAULT_ADMIN_USERNAME: &str = "admin";
const DEFAULT_ADMIN_EMAIL: &str = "admin@example.com";
const DEFAULT_ADMIN_PASSWORD: &str = "admin123";
const MAX_USERNAME_LEN: usize = 64;

pub const ROLE_ADMIN: &str = "admin";
pub const ROLE_USER: &str = "user";
pub const SUBSCRIPTION_TIERS: [&str; 4] = ["free", "basic", "pro", "enterprise"];

#[derive(Debug, Clone, Serialize)]
pub struct UserProfile {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub full_name: Option<String>,
    pub role: String,
    pub subscription_tier: String,
    pub subscription_status: String,
    pub is_active: bool,
    pub is_verified: bool,
    pub created_at: String,
    pub updated_at: String,
    pub last_login_at: Option<String>,
}

#[derive(Debug)]
pub enum UserStoreError {
    InvalidInput(String),
    UsernameTaken,
    EmailTaken,
    InvalidCredentials,
    Inactive,
    Internal(anyhow::Error),
}

impl fmt::Display for UserStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserStoreError::InvalidInput(message) => write!(f, "{message}"),
            UserStoreError::UsernameTaken => write!(f, "Username already registered"),
            UserStoreError::EmailTaken => write!(f, "Email already registered"),
            UserStoreError::InvalidCredentials => write!(f, "Incorrect username or password"),
            UserStoreError::Inactive => write!(f, "Inactive user"),
            UserStoreError::Internal(err) => write!(f, "{err}"),
        }
    }
}

impl From<anyhow::Error> for UserStoreError {
    fn from(err: anyhow::Error) -> Self {
        UserStoreError::Internal(err)
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password: String,
    pub full_name: Option<String>,
}

pub struct UserStore {
    storage: Arc<dyn StorageBackend>,
}

impl UserStore {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    pub fn ensure_default_admin(&self) -> Result<()> {
        if let Some(mut existing) = self.storage.get_user_by_username(DEFAULT_ADMIN_USERNAME)? {
            if !Self::is_admin(&existing) || !existing.is_active {
                existing.role = ROLE_ADMIN.to_string();
                existing.is_active = true;
                existing.updated_at = now_ts();
                self.storage.update_user(&existing)?;
            }
            return Ok(());
        }
        let mut admin = self
            .register(NewUser {
                username: DEFAULT_ADMIN_USERNAME.to_string(),
                email: DEFAULT_ADMIN_EMAIL.to_string(),
                password: DEFAULT_ADMIN_PASSWORD.to_string(),
                full_name: Some("Administrator".to_string()),
            })
            .map_err(|err| anyhow!("seed default admin failed: {err}"))?;
        admin.role = ROLE_ADMIN.to_string();
        admin.subscription_tier = "enterprise".to_string();
        admin.is_verified = true;
        self.storage.update_user(&admin)?;
        info!("seeded default admin account '{DEFAULT_ADMIN_USERNAME}'");
        Ok(())
    }

    pub fn default_admin(&self) -> Result<UserRecord> {
        self.ensure_default_admin()?;
        self.storage
            .get_user_by_username(DEFAULT_ADMIN_USERNAME)?
            .ok_or_else(|| anyhow!("default admin missing"))
    }

    pub fn normalize_username(raw: &str) -> Option<String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.chars().count() > MAX_USERNAME_LEN {
            return None;
        }
        if trimmed
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.'))
        {
            Some(trimmed.to_string())
        } else {
            None
        }
    }

    pub fn normalize_email(raw: &str) -> Option<String> {
        let trimmed = raw.trim().to_ascii_lowercase();
        let (local, domain) = trimmed.split_once('@')?;
        if local.is_empty() || !domain.contains('.') || domain.starts_with('.') {
            return None;
        }
        if trimmed.chars().any(char::is_whitespace) {
            return None;
        }
        Some(trimmed)
    }

    pub fn hash_password(password: &str) -> Result<String> {
        let trimmed = password.trim();
        if trimmed.is_empty() {
            return Err(anyhow!("password is empty"));
        }
        let salt = SaltString::generate(&mut OsRng);
        let argon2 = Argon2::default();
        let hash = argon2
            .hash_password(trimmed.as_bytes(), &salt)
            .map_err(|err| anyhow!(err.to_string()))?;
        Ok(hash.to_string())
    }

    pub fn verify_password(hash: &str, password: &str) -> bool {
        let parsed = match PasswordHash::new(hash) {
            Ok(value) => value,
            Err(err) => {
                warn!("password hash parse failed: {err}");
                return false;
            }
        };
        Argon2::default()
            .verify_password(password.trim().as_bytes(), &parsed)
            .is_ok()
    }

    pub fn to_profile(user: &UserRecord) -> UserProfile {
        UserProfile {
            id: user.id,
            username: user.username.clone(),
            email: user.email.clone(),
            full_name: user.full_name.clone(),
            role: user.role.clone(),
            subscription_tier: user.subscription_tier.clone(),
            subscription_status: user.subscription_status.clone(),
            is_active: user.is_active,
            is_verified: user.is_verified,
            created_at: format_ts(user.created_at),
            updated_at: format_ts(user.updated_at),
            last_login_at: format_opt_ts(user.last_login_at),
        }
    }

    pub fn is_admin(user: &UserRecord) -> bool {
        user.role.trim().eq_ignore_ascii_case(ROLE_ADMIN)
    }

    pub fn get_user(&self, id: i64) -> Result<Option<UserRecord>> {
        self.storage.get_user(id)
    }

    pub fn register(&self, input: NewUser) -> Result<UserRecord, UserStoreError> {
        let username = Self::normalize_username(&input.username).ok_or_else(|| {
            UserStoreError::InvalidInput(
                "username must be 1-64 letters, digits, '_', '-' or '.'".to_string(),
            )
        })?;
        let email = Self::normalize_email(&input.email)
            .ok_or_else(|| UserStoreError::InvalidInput("invalid email address".to_string()))?;
        if input.password.trim().is_empty() {
            return Err(UserStoreError::InvalidInput("password is empty".to_string()));
        }
        if self.storage.get_user_by_username(&username)?.is_some() {
            return Err(UserStoreError::UsernameTaken);
        }
        if self.storage.get_user_by_email(&email)?.is_some() {
            return Err(UserStoreError::EmailTaken);
        }
        let now = now_ts();
        let mut record = UserRecord {
            id: 0,
            username,
            email,
            full_name: input
                .full_name
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
            password_hash: Self::hash_password(&input.password)?,
            role: ROLE_USER.to_string(),
            subscription_tier: "free".to_string(),
            subscription_status: "active".to_string(),
            is_active: true,
            is_verified: false,
            created_at: now,
            updated_at: now,
            last_login_at: None,
        };
        record.id = self.storage.insert_user(&record)?;
        Ok(record)
    }

    /// Accepts a username or an email as the login name.
    pub fn login(&self, username: &str, password: &str) -> Result<UserRecord, UserStoreError> {
        let name = username.trim();
        if name.is_empty() {
            return Err(UserStoreError::InvalidCredentials);
        }
        let found = match self.storage.get_user_by_username(name)? {
            Some(user) => Some(user),
            None if name.contains('@') => self.storage.get_user_by_email(name)?,
            None => None,
        };
        let Some(mut user) = found else {
            return Err(UserStoreError::InvalidCredentials);
        };
        if !Self::verify_password(&user.password_hash, password) {
            return Err(UserStoreError::InvalidCredentials);
        }
        if !user.is_active {
            return Err(UserStoreError::Inactive);
        }
        let now = now_ts();
        user.last_login_at = Some(now);
        user.updated_at = now;
        self.storage.update_user(&user)?;
        Ok(user)
    }

    /// Applies a profile change; a new email must stay unique.
    pub fn update_profile(
        &self,
        mut user: UserRecord,
        email: Option<&str>,
        full_name: Option<&str>,
    ) -> Result<UserRecord, UserStoreError> {
        if let Some(raw) = email {
            let email = Self::normalize_email(raw)
                .ok_or_else(|| UserStoreError::InvalidInput("invalid email address".to_string()))?;
            if email != user.email {
                if let Some(other) = self.storage.get_user_by_email(&email)? {
                    if other.id != user.id {
                        return Err(UserStoreError::EmailTaken);
                    }
                }
                user.email = email;
            }
        }
        if let Some(full_name) = full_name {
            let cleaned = full_name.trim();
            user.full_name = if cleaned.is_empty() {
                None
            } else {
                Some(cleaned.to_string())
            };
        }
        user.updated_at = now_ts();
        self.storage.update_user(&user)?;
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStorage;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, UserStore) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("users.db");
        let storage = Arc::new(SqliteStorage::new(path.to_string_lossy().to_string()));
        (dir, UserStore::new(storage))
    }

    fn alice() -> NewUser {
        NewUser {
            username: "alice".to_string(),
            email: "Alice@Example.com".to_string(),
            password: "wonderland".to_string(),
            full_name: None,
        }
    }

    #[test]
    fn register_rejects_duplicates() {
        let (_dir, store) = store();
        let user = store.register(alice()).unwrap();
        assert!(user.id > 0);
        assert_eq!(user.email, "alice@example.com");
        assert!(matches!(
            store.register(alice()),
            Err(UserStoreError::UsernameTaken)
        ));
        let mut other = alice();
        other.username = "alice2".to_string();
        assert!(matches!(store.register(other), Err(UserStoreError::EmailTaken)));
    }

    #[test]
    fn login_checks_password_and_activity() {
        let (_dir, store) = store();
        let user = store.register(alice()).unwrap();
        assert!(matches!(
            store.login("alice", "wrong"),
            Err(UserStoreError::InvalidCredentials)
        ));
        let logged = store.login("alice@example.com", "wonderland").unwrap();
        assert!(logged.last_login_at.is_some());

        let mut disabled = store.get_user(user.id).unwrap().unwrap();
        disabled.is_active = false;
        store.storage().update_user(&disabled).unwrap();
        assert!(matches!(
            store.login("alice", "wonderland"),
            Err(UserStoreError::Inactive)
        ));
    }

    #[test]
    fn default_admin_is_seeded_once() {
        let (_dir, store) = store();
        store.ensure_default_admin().unwrap();
        store.ensure_default_admin().unwrap();
        let admin = store.default_admin().unwrap();
        assert!(UserStore::is_admin(&admin));
        assert_eq!(admin.subscription_tier, "enterprise");
        assert!(store.login("admin", "admin123").is_ok());
    }

    #[test]
    fn username_and_email_normalization() {
        assert_eq!(UserStore::normalize_username(" bob_1 ").as_deref(), Some("bob_1"));
        assert_eq!(UserStore::normalize_username("bad name"), None);
        assert_eq!(UserStore::normalize_email("no-at-sign"), None);
        assert_eq!(UserStore::normalize_email("a@localhost"), None);
    }
}
