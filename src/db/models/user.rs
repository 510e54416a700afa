//! User and session models.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqliteConnection, SqliteExecutor, SqlitePool};

use super::common::{PageQuery, Paginated};

/// Account role. Admins manage users, credits, payments and settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum UserRole {
    User,
    Admin,
}

impl std::fmt::Display for UserRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UserRole::User => write!(f, "user"),
            UserRole::Admin => write!(f, "admin"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: String,
    pub email: String,
    pub password_hash: String,
    pub name: String,
    pub role: UserRole,
    pub credits: i64,
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserResponse {
    pub id: String,
    pub email: String,
    pub name: String,
    pub role: UserRole,
    pub credits: i64,
    pub is_active: bool,
    pub created_at: String,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            email: user.email,
            name: user.name,
            role: user.role,
            credits: user.credits,
            is_active: user.is_active,
            created_at: user.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub token_hash: String,
    pub expires_at: String,
    pub created_at: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    pub user: UserResponse,
}

/// Admin update of a user. Credits are not editable here, only via the ledger.
#[derive(Debug, Default, Deserialize)]
pub struct UpdateUserRequest {
    pub name: Option<String>,
    pub role: Option<UserRole>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserListQuery {
    /// Case-insensitive match on email or name
    pub search: Option<String>,
    pub role: Option<UserRole>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

/// Fields for a new account; the balance always starts at zero.
#[derive(Debug, Clone)]
pub struct NewUser<'a> {
    pub email: &'a str,
    pub password_hash: &'a str,
    pub name: &'a str,
    pub role: UserRole,
}

pub async fn find_user_by_id<'e>(
    db: impl SqliteExecutor<'e>,
    id: &str,
) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
        .bind(id)
        .fetch_optional(db)
        .await
}

pub async fn find_user_by_email<'e>(
    db: impl SqliteExecutor<'e>,
    email: &str,
) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = ? COLLATE NOCASE")
        .bind(email)
        .fetch_optional(db)
        .await
}

pub async fn insert_user(conn: &mut SqliteConnection, new: &NewUser<'_>) -> Result<User, sqlx::Error> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = crate::db::now();

    sqlx::query(
        "INSERT INTO users (id, email, password_hash, name, role, credits, is_active, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, 0, 1, ?, ?)",
    )
    .bind(&id)
    .bind(new.email)
    .bind(new.password_hash)
    .bind(new.name)
    .bind(new.role)
    .bind(&now)
    .bind(&now)
    .execute(&mut *conn)
    .await?;

    sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
        .bind(&id)
        .fetch_one(&mut *conn)
        .await
}

pub async fn list_users(db: &SqlitePool, query: &UserListQuery) -> Result<Paginated<User>, sqlx::Error> {
    let page = PageQuery {
        page: query.page,
        per_page: query.per_page,
    };

    let mut conditions = Vec::new();
    let mut bindings: Vec<String> = Vec::new();

    if let Some(search) = query.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        conditions.push("(email LIKE ? OR name LIKE ?)");
        let pattern = format!("%{}%", search);
        bindings.push(pattern.clone());
        bindings.push(pattern);
    }

    if let Some(role) = query.role {
        conditions.push("role = ?");
        bindings.push(role.to_string());
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    };

    let count_sql = format!("SELECT COUNT(*) FROM users {}", where_clause);
    let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql);
    for binding in &bindings {
        count_query = count_query.bind(binding);
    }
    let total = count_query.fetch_one(db).await?;

    let sql = format!(
        "SELECT * FROM users {} ORDER BY created_at DESC, rowid DESC LIMIT ? OFFSET ?",
        where_clause
    );
    let mut list_query = sqlx::query_as::<_, User>(&sql);
    for binding in &bindings {
        list_query = list_query.bind(binding);
    }
    let items = list_query
        .bind(page.per_page())
        .bind(page.offset())
        .fetch_all(db)
        .await?;

    Ok(Paginated::new(items, total, &page))
}

pub async fn update_user(
    db: &SqlitePool,
    id: &str,
    update: &UpdateUserRequest,
) -> Result<Option<User>, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE users SET
            name = COALESCE(?, name),
            role = COALESCE(?, role),
            is_active = COALESCE(?, is_active),
            updated_at = ?
         WHERE id = ?",
    )
    .bind(update.name.as_deref())
    .bind(update.role)
    .bind(update.is_active)
    .bind(crate::db::now())
    .bind(id)
    .execute(db)
    .await?;

    if result.rows_affected() == 0 {
        return Ok(None);
    }
    find_user_by_id(db, id).await
}

pub async fn set_password_hash(db: &SqlitePool, id: &str, password_hash: &str) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE users SET password_hash = ?, updated_at = ? WHERE id = ?")
        .bind(password_hash)
        .bind(crate::db::now())
        .bind(id)
        .execute(db)
        .await?;
    Ok(())
}

pub async fn create_session(
    db: &SqlitePool,
    user_id: &str,
    token_hash: &str,
    expires_at: &str,
) -> Result<Session, sqlx::Error> {
    let session = Session {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        token_hash: token_hash.to_string(),
        expires_at: expires_at.to_string(),
        created_at: crate::db::now(),
    };

    sqlx::query(
        "INSERT INTO sessions (id, user_id, token_hash, expires_at, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&session.id)
    .bind(&session.user_id)
    .bind(&session.token_hash)
    .bind(&session.expires_at)
    .bind(&session.created_at)
    .execute(db)
    .await?;

    Ok(session)
}

/// Owner of a live session, if any
pub async fn find_session_user(db: &SqlitePool, token_hash: &str) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>(
        "SELECT u.* FROM sessions s
         JOIN users u ON u.id = s.user_id
         WHERE s.token_hash = ? AND s.expires_at > ?",
    )
    .bind(token_hash)
    .bind(crate::db::now())
    .fetch_optional(db)
    .await
}

pub async fn delete_session(db: &SqlitePool, token_hash: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM sessions WHERE token_hash = ?")
        .bind(token_hash)
        .execute(db)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn delete_user_sessions(db: &SqlitePool, user_id: &str) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM sessions WHERE user_id = ?")
        .bind(user_id)
        .execute(db)
        .await?;
    Ok(result.rows_affected())
}

pub async fn delete_expired_sessions(db: &SqlitePool) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= ?")
        .bind(crate::db::now())
        .execute(db)
        .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory;

    async fn create(pool: &SqlitePool, email: &str, name: &str) -> User {
        let mut conn = pool.acquire().await.unwrap();
        insert_user(
            &mut conn,
            &NewUser {
                email,
                password_hash: "hash",
                name,
                role: UserRole::User,
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_insert_and_find_user() {
        let pool = init_memory().await.unwrap();
        let user = create(&pool, "ada@example.com", "Ada").await;

        assert_eq!(user.credits, 0);
        assert!(user.is_active);
        assert_eq!(user.role, UserRole::User);

        let by_email = find_user_by_email(&pool, "ADA@example.com").await.unwrap().unwrap();
        assert_eq!(by_email.id, user.id);
        assert!(find_user_by_id(&pool, "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_email_rejected() {
        let pool = init_memory().await.unwrap();
        create(&pool, "dup@example.com", "One").await;

        let mut conn = pool.acquire().await.unwrap();
        let result = insert_user(
            &mut conn,
            &NewUser {
                email: "dup@example.com",
                password_hash: "hash",
                name: "Two",
                role: UserRole::User,
            },
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_list_users_search_and_role() {
        let pool = init_memory().await.unwrap();
        create(&pool, "grace@example.com", "Grace").await;
        create(&pool, "linus@example.com", "Linus").await;
        let admin = create(&pool, "root@example.com", "Root").await;
        update_user(
            &pool,
            &admin.id,
            &UpdateUserRequest {
                role: Some(UserRole::Admin),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let all = list_users(&pool, &UserListQuery::default()).await.unwrap();
        assert_eq!(all.total, 3);

        let found = list_users(
            &pool,
            &UserListQuery {
                search: Some("grace".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(found.total, 1);
        assert_eq!(found.items[0].name, "Grace");

        let admins = list_users(
            &pool,
            &UserListQuery {
                role: Some(UserRole::Admin),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(admins.total, 1);
        assert_eq!(admins.items[0].id, admin.id);
    }

    #[tokio::test]
    async fn test_update_missing_user_returns_none() {
        let pool = init_memory().await.unwrap();
        let updated = update_user(&pool, "nope", &UpdateUserRequest::default()).await.unwrap();
        assert!(updated.is_none());
    }

    #[tokio::test]
    async fn test_session_lookup_respects_expiry() {
        let pool = init_memory().await.unwrap();
        let user = create(&pool, "s@example.com", "S").await;

        create_session(&pool, &user.id, "live", "2999-01-01T00:00:00Z").await.unwrap();
        create_session(&pool, &user.id, "stale", "2000-01-01T00:00:00Z").await.unwrap();

        assert!(find_session_user(&pool, "live").await.unwrap().is_some());
        assert!(find_session_user(&pool, "stale").await.unwrap().is_none());

        assert_eq!(delete_expired_sessions(&pool).await.unwrap(), 1);
        assert!(delete_session(&pool, "live").await.unwrap());
        assert!(find_session_user(&pool, "live").await.unwrap().is_none());
    }
}
