//! Disabled-user gate
//!
//! The check runs on every authenticated request. It prefers the
//! persistent store; when statistics are disabled it falls back to an
//! in-memory set mutated by the admin endpoints.

use std::collections::HashSet;

use anyhow::Result;
use tokio::sync::Mutex;

use crate::db::StatsDb;

pub struct UserGate {
    db: Option<StatsDb>,
    fallback: Mutex<HashSet<String>>,
}

impl UserGate {
    pub fn new(db: Option<StatsDb>) -> Self {
        Self {
            db,
            fallback: Mutex::new(HashSet::new()),
        }
    }

    /// Unknown users default to enabled.
    pub async fn is_disabled(&self, username: &str) -> bool {
        match &self.db {
            Some(db) => db.is_user_disabled(username).await,
            None => self.fallback.lock().await.contains(username),
        }
    }

    /// Flip the disabled flag. Returns whether the flag actually
    /// changed; the write itself is idempotent.
    pub async fn set_disabled(&self, username: &str, disabled: bool) -> Result<bool> {
        match &self.db {
            Some(db) => {
                let was = db.is_user_disabled(username).await;
                db.set_user_disabled(username, disabled).await?;
                Ok(was != disabled)
            }
            None => {
                let mut set = self.fallback.lock().await;
                Ok(if disabled {
                    set.insert(username.to_string())
                } else {
                    set.remove(username)
                })
            }
        }
    }
}
