//! Person profiles (the `users` table).

use rusqlite::types::Value;
use rusqlite::Row;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{now_text, Store};
use crate::error::DatabaseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileStatus {
    Active,
    Inactive,
}

impl ProfileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileStatus::Active => "active",
            ProfileStatus::Inactive => "inactive",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "inactive" => ProfileStatus::Inactive,
            _ => ProfileStatus::Active,
        }
    }
}

/// A known person.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonProfile {
    pub id: String,
    /// Enrollment id on the device.
    pub device_user_id: Option<String>,
    /// Name as enrolled on the device.
    pub device_name: Option<String>,
    pub display_name: String,
    pub department_id: Option<String>,
    pub status: ProfileStatus,
}

impl PersonProfile {
    pub fn is_active(&self) -> bool {
        self.status == ProfileStatus::Active
    }
}

/// Fields for a profile created from a device enrollment.
#[derive(Debug, Clone)]
pub struct NewProfile {
    pub device_user_id: Option<String>,
    pub device_name: Option<String>,
    pub display_name: String,
    pub department_id: Option<String>,
    pub status: ProfileStatus,
}

const PROFILE_COLUMNS: &str =
    "id, device_user_id, device_name, display_name, department_id, status";

fn row_to_profile(row: &Row<'_>) -> rusqlite::Result<PersonProfile> {
    Ok(PersonProfile {
        id: row.get(0)?,
        device_user_id: row.get(1)?,
        device_name: row.get(2)?,
        display_name: row.get(3)?,
        department_id: row.get(4)?,
        status: ProfileStatus::parse(&row.get::<_, String>(5)?),
    })
}

/// All profiles in creation order. Resolution ties are broken by this
/// order, so it must be stable.
///
/// # Errors
/// Returns an error if the query fails.
pub async fn list_profiles(store: &Store) -> Result<Vec<PersonProfile>, DatabaseError> {
    store
        .select(
            &format!("SELECT {PROFILE_COLUMNS} FROM users ORDER BY created_at, rowid"),
            &[],
            row_to_profile,
        )
        .await
}

/// Look up one profile.
///
/// # Errors
/// Returns an error if the query fails.
pub async fn get_profile(store: &Store, id: &str) -> Result<Option<PersonProfile>, DatabaseError> {
    store
        .select_optional(
            &format!("SELECT {PROFILE_COLUMNS} FROM users WHERE id = ?1"),
            &[Value::from(id.to_string())],
            row_to_profile,
        )
        .await
}

/// Create a profile and return it with its generated id.
///
/// # Errors
/// Returns an error if the insert fails (for example a duplicate
/// `device_user_id`).
pub async fn create_profile(
    store: &Store,
    new: NewProfile,
) -> Result<PersonProfile, DatabaseError> {
    let id = Uuid::new_v4().to_string();
    let now = now_text();
    store
        .execute(
            "INSERT INTO users (id, device_user_id, device_name, display_name, department_id, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            &[
                Value::from(id.clone()),
                Value::from(new.device_user_id.clone()),
                Value::from(new.device_name.clone()),
                Value::from(new.display_name.clone()),
                Value::from(new.department_id.clone()),
                Value::from(new.status.as_str().to_string()),
                Value::from(now),
            ],
        )
        .await?;

    Ok(PersonProfile {
        id,
        device_user_id: new.device_user_id,
        device_name: new.device_name,
        display_name: new.display_name,
        department_id: new.department_id,
        status: new.status,
    })
}

/// Look up the profile enrolled under a device token.
///
/// # Errors
/// Returns an error if the query fails.
pub async fn find_by_device_user_id(
    store: &Store,
    token: &str,
) -> Result<Option<PersonProfile>, DatabaseError> {
    store
        .select_optional(
            &format!("SELECT {PROFILE_COLUMNS} FROM users WHERE device_user_id = ?1"),
            &[Value::from(token.to_string())],
            row_to_profile,
        )
        .await
}

/// Create the profile for a device token unless one already exists.
/// Returns the stored profile and whether this call created it.
///
/// Concurrent syncs of devices sharing enrollments race on the same
/// tokens; the loser gets the winner's row.
///
/// # Errors
/// Returns an error if the statements fail.
pub async fn ensure_profile(
    store: &Store,
    new: NewProfile,
) -> Result<(PersonProfile, bool), DatabaseError> {
    let Some(token) = new.device_user_id.clone() else {
        return create_profile(store, new).await.map(|p| (p, true));
    };

    let id = Uuid::new_v4().to_string();
    let now = now_text();
    let inserted = store
        .execute(
            "INSERT INTO users (id, device_user_id, device_name, display_name, department_id, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
             ON CONFLICT(device_user_id) DO NOTHING",
            &[
                Value::from(id.clone()),
                Value::from(token.clone()),
                Value::from(new.device_name.clone()),
                Value::from(new.display_name.clone()),
                Value::from(new.department_id.clone()),
                Value::from(new.status.as_str().to_string()),
                Value::from(now),
            ],
        )
        .await?;

    if inserted == 1 {
        return Ok((
            PersonProfile {
                id,
                device_user_id: Some(token),
                device_name: new.device_name,
                display_name: new.display_name,
                department_id: new.department_id,
                status: new.status,
            },
            true,
        ));
    }
    find_by_device_user_id(store, &token)
        .await?
        .map(|p| (p, false))
        .ok_or_else(|| DatabaseError::QueryFailed(format!("profile for device user {token} vanished")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_profile(token: &str, name: &str) -> NewProfile {
        NewProfile {
            device_user_id: Some(token.into()),
            device_name: Some(name.into()),
            display_name: name.into(),
            department_id: None,
            status: ProfileStatus::Active,
        }
    }

    #[tokio::test]
    async fn create_and_list_preserves_order() {
        let store = Store::open_memory().unwrap();
        let a = create_profile(&store, new_profile("1", "Amal")).await.unwrap();
        let b = create_profile(&store, new_profile("2", "Badr")).await.unwrap();

        let all = list_profiles(&store).await.unwrap();
        assert_eq!(all, vec![a.clone(), b]);
        assert_eq!(get_profile(&store, &a.id).await.unwrap(), Some(a));
    }

    #[tokio::test]
    async fn duplicate_device_user_id_is_rejected() {
        let store = Store::open_memory().unwrap();
        create_profile(&store, new_profile("7", "Amal")).await.unwrap();
        assert!(create_profile(&store, new_profile("7", "Other")).await.is_err());
    }

    #[tokio::test]
    async fn ensure_profile_returns_existing_row() {
        let store = Store::open_memory().unwrap();
        let (first, created) = ensure_profile(&store, new_profile("7", "Amal")).await.unwrap();
        assert!(created);
        let (again, created) = ensure_profile(&store, new_profile("7", "Other")).await.unwrap();
        assert!(!created);
        assert_eq!(again, first);
        assert_eq!(list_profiles(&store).await.unwrap().len(), 1);
        assert_eq!(find_by_device_user_id(&store, "7").await.unwrap(), Some(first));
    }
}
