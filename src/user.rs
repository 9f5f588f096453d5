use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::database::Database;
use crate::error::{QmsError, Result};

/// A capability the lifecycle engine authorizes operations against. Role
/// CRUD and authentication are out of scope; this is a membership lookup
/// only, salvaged from the richer `UserRole`/`Permission` split the teacher
/// used for its own auth layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    Read,
    Write,
    Review,
    Approve,
    Admin,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Read => "read",
            Capability::Write => "write",
            Capability::Review => "review",
            Capability::Approve => "approve",
            Capability::Admin => "admin",
        }
    }

    pub fn from_str(value: &str) -> Result<Self> {
        match value {
            "read" => Ok(Capability::Read),
            "write" => Ok(Capability::Write),
            "review" => Ok(Capability::Review),
            "approve" => Ok(Capability::Approve),
            "admin" => Ok(Capability::Admin),
            other => Err(QmsError::Internal {
                message: format!("unknown capability: {other}"),
            }),
        }
    }
}

/// A reference user record: identity plus capability set. No password or
/// session state — authentication is handled upstream of this crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub display_name: String,
    pub capabilities: HashSet<Capability>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&Capability::Admin) || self.capabilities.contains(&capability)
    }

    fn capabilities_to_string(&self) -> String {
        Self::capabilities_string(&self.capabilities)
    }

    pub fn capabilities_string(capabilities: &HashSet<Capability>) -> String {
        let mut caps: Vec<&str> = capabilities.iter().map(|c| c.as_str()).collect();
        caps.sort_unstable();
        caps.join(",")
    }

    fn capabilities_from_string(raw: &str) -> HashSet<Capability> {
        raw.split(',')
            .filter(|s| !s.is_empty())
            .filter_map(|s| Capability::from_str(s).ok())
            .collect()
    }
}

pub struct UserRepo<'a> {
    db: &'a Database,
}

impl<'a> UserRepo<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub fn insert(&self, user: &User) -> Result<()> {
        self.db.with_connection(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, display_name, capabilities, is_active, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    user.id.to_string(),
                    user.username,
                    user.display_name,
                    user.capabilities_to_string(),
                    user.is_active as i64,
                    user.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get(&self, id: Uuid) -> Result<User> {
        self.db.with_connection(|conn| {
            conn.query_row(
                "SELECT id, username, display_name, capabilities, is_active, created_at
                 FROM users WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    let id: String = row.get(0)?;
                    let caps: String = row.get(3)?;
                    let created_at: String = row.get(5)?;
                    Ok(User {
                        id: Uuid::parse_str(&id).unwrap_or_else(|_| Uuid::nil()),
                        username: row.get(1)?,
                        display_name: row.get(2)?,
                        capabilities: User::capabilities_from_string(&caps),
                        is_active: row.get::<_, i64>(4)? != 0,
                        created_at: DateTime::parse_from_rfc3339(&created_at)
                            .map(|d| d.with_timezone(&Utc))
                            .unwrap_or_else(|_| Utc::now()),
                    })
                },
            )
            .optional()?
            .ok_or_else(|| QmsError::NotFound {
                kind: "User".to_string(),
                id: id.to_string(),
            })
        })
    }

    pub fn get_tx(&self, tx: &rusqlite::Transaction, id: Uuid) -> Result<User> {
        tx.query_row(
            "SELECT id, username, display_name, capabilities, is_active, created_at
             FROM users WHERE id = ?1",
            params![id.to_string()],
            |row| {
                let id: String = row.get(0)?;
                let caps: String = row.get(3)?;
                let created_at: String = row.get(5)?;
                Ok(User {
                    id: Uuid::parse_str(&id).unwrap_or_else(|_| Uuid::nil()),
                    username: row.get(1)?,
                    display_name: row.get(2)?,
                    capabilities: User::capabilities_from_string(&caps),
                    is_active: row.get::<_, i64>(4)? != 0,
                    created_at: DateTime::parse_from_rfc3339(&created_at)
                        .map(|d| d.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                })
            },
        )
        .optional()?
        .ok_or_else(|| QmsError::NotFound {
            kind: "User".to_string(),
            id: id.to_string(),
        })
    }

    pub fn set_capabilities_tx(
        &self,
        tx: &rusqlite::Transaction,
        id: Uuid,
        capabilities: &HashSet<Capability>,
    ) -> Result<()> {
        tx.execute(
            "UPDATE users SET capabilities = ?1 WHERE id = ?2",
            params![User::capabilities_string(capabilities), id.to_string()],
        )?;
        Ok(())
    }

    /// Count of active users holding the admin capability, read under the
    /// caller's transaction lock so grant/revoke checks the live count.
    pub fn active_admin_count_tx(&self, tx: &rusqlite::Transaction) -> Result<i64> {
        let mut stmt = tx.prepare("SELECT capabilities FROM users WHERE is_active = 1")?;
        let count = stmt
            .query_map([], |row| {
                let caps: String = row.get(0)?;
                Ok(User::capabilities_from_string(&caps).contains(&Capability::Admin))
            })?
            .collect::<rusqlite::Result<Vec<bool>>>()?
            .into_iter()
            .filter(|is_admin| *is_admin)
            .count();
        Ok(count as i64)
    }

    /// Count of active users holding the admin capability — consulted
    /// before revoking superuser status so the last one is protected.
    pub fn active_admin_count(&self) -> Result<i64> {
        self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, capabilities FROM users WHERE is_active = 1",
            )?;
            let count = stmt
                .query_map([], |row| {
                    let caps: String = row.get(1)?;
                    Ok(User::capabilities_from_string(&caps).contains(&Capability::Admin))
                })?
                .collect::<rusqlite::Result<Vec<bool>>>()?
                .into_iter()
                .filter(|is_admin| *is_admin)
                .count();
            Ok(count as i64)
        })
    }
}
