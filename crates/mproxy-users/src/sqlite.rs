use async_trait::async_trait;
use sea_orm::entity::prelude::*;
use sea_orm::sea_query::OnConflict;
use sea_orm::{ActiveValue, Database, DatabaseConnection, Schema};

use crate::persistence::{PersistenceError, PersistenceResult, UserPersistence};
use crate::user::User;

/// Users are stored as one JSON payload per token. The payload is the
/// serialized `User`; schema churn stays out of the database.
pub mod entity {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "users")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub token: String,
        pub payload: Json,
        pub updated_at: TimeDateTimeWithTimeZone,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

pub struct SqliteStore {
    db: DatabaseConnection,
}

impl SqliteStore {
    /// Connects and creates the table when missing.
    pub async fn connect(dsn: &str) -> PersistenceResult<Self> {
        let db = Database::connect(dsn).await?;
        let backend = db.get_database_backend();
        let schema = Schema::new(backend);
        let mut stmt = schema.create_table_from_entity(entity::Entity);
        stmt.if_not_exists();
        db.execute(backend.build(&stmt)).await?;
        Ok(Self { db })
    }
}

#[async_trait]
impl UserPersistence for SqliteStore {
    async fn load_all(&self) -> PersistenceResult<Vec<User>> {
        let rows = entity::Entity::find().all(&self.db).await?;
        let mut users = Vec::with_capacity(rows.len());
        for row in rows {
            users.push(serde_json::from_value(row.payload)?);
        }
        Ok(users)
    }

    async fn upsert_batch(&self, users: &[User]) -> PersistenceResult<()> {
        if users.is_empty() {
            return Ok(());
        }
        let now = time::OffsetDateTime::now_utc();
        let mut models = Vec::with_capacity(users.len());
        for user in users {
            models.push(entity::ActiveModel {
                token: ActiveValue::Set(user.token.clone()),
                payload: ActiveValue::Set(serde_json::to_value(user)?),
                updated_at: ActiveValue::Set(now),
            });
        }
        entity::Entity::insert_many(models)
            .on_conflict(
                OnConflict::column(entity::Column::Token)
                    .update_columns([entity::Column::Payload, entity::Column::UpdatedAt])
                    .to_owned(),
            )
            .exec(&self.db)
            .await
            .map_err(PersistenceError::Db)?;
        Ok(())
    }

    async fn delete_batch(&self, tokens: &[String]) -> PersistenceResult<()> {
        if tokens.is_empty() {
            return Ok(());
        }
        entity::Entity::delete_many()
            .filter(entity::Column::Token.is_in(tokens.iter().cloned()))
            .exec(&self.db)
            .await?;
        Ok(())
    }
}
