use std::marker::PhantomData;

use async_trait::async_trait;
use sqlx::migrate::Migrator;
use sqlx::{Pool, Postgres};
use tracing::info;

use crate::error::StoreError;
use crate::store::{Entity, IndexField, Store};

static MIGRATOR: Migrator = sqlx::migrate!();

pub async fn setup_database(database_url: &str) -> anyhow::Result<Pool<Postgres>> {
  let pool = Pool::<Postgres>::connect(database_url).await?;
  MIGRATOR.run(&pool).await?;
  info!("Database migrations complete");
  Ok(pool)
}

/// Record store keeping every entity as a JSONB document in `records`.
pub struct PgStore<E> {
  pool: Pool<Postgres>,
  _entity: PhantomData<fn() -> E>,
}

impl<E> PgStore<E> {
  pub fn new(pool: Pool<Postgres>) -> Self {
    Self {
      pool,
      _entity: PhantomData,
    }
  }
}

fn decode<E: Entity>(bodies: Vec<serde_json::Value>) -> Result<Vec<E>, StoreError> {
  bodies
    .into_iter()
    .map(|body| serde_json::from_value(body).map_err(StoreError::from))
    .collect()
}

#[async_trait]
impl<E: Entity> Store<E> for PgStore<E> {
  async fn get(&self, id: u64) -> Result<E, StoreError> {
    let body: Option<serde_json::Value> =
      sqlx::query_scalar("SELECT body FROM records WHERE bucket = $1 AND id = $2")
        .bind(E::BUCKET)
        .bind(id as i64)
        .fetch_optional(&self.pool)
        .await?;
    let body = body.ok_or(StoreError::NotFound)?;
    Ok(serde_json::from_value(body)?)
  }

  async fn put(&self, record: &mut E) -> Result<u64, StoreError> {
    let id: i64 = sqlx::query_scalar("SELECT nextval('records_id_seq')")
      .fetch_one(&self.pool)
      .await?;
    record.set_id(id as u64);
    let body = serde_json::to_value(&*record)?;
    sqlx::query("INSERT INTO records (bucket, id, body) VALUES ($1, $2, $3)")
      .bind(E::BUCKET)
      .bind(id)
      .bind(body)
      .execute(&self.pool)
      .await?;
    Ok(id as u64)
  }

  async fn update(&self, id: u64, record: &E) -> Result<(), StoreError> {
    let body = serde_json::to_value(record)?;
    sqlx::query(
      "INSERT INTO records (bucket, id, body) VALUES ($1, $2, $3)
       ON CONFLICT (bucket, id) DO UPDATE SET body = EXCLUDED.body, updated_at = NOW()",
    )
    .bind(E::BUCKET)
    .bind(id as i64)
    .bind(body)
    .execute(&self.pool)
    .await?;
    Ok(())
  }

  async fn delete(&self, id: u64) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM records WHERE bucket = $1 AND id = $2")
      .bind(E::BUCKET)
      .bind(id as i64)
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  async fn list_by_field(&self, field: IndexField, value: &str) -> Result<Vec<E>, StoreError> {
    let bodies: Vec<serde_json::Value> = sqlx::query_scalar(
      "SELECT body FROM records WHERE bucket = $1 AND body ->> $2 = $3 ORDER BY id",
    )
    .bind(E::BUCKET)
    .bind(field.json_key())
    .bind(value)
    .fetch_all(&self.pool)
    .await?;
    if bodies.is_empty() {
      return Err(StoreError::Empty(E::BUCKET));
    }
    decode(bodies)
  }

  async fn list_all(&self) -> Result<Vec<E>, StoreError> {
    let bodies: Vec<serde_json::Value> =
      sqlx::query_scalar("SELECT body FROM records WHERE bucket = $1 ORDER BY id")
        .bind(E::BUCKET)
        .fetch_all(&self.pool)
        .await?;
    decode(bodies)
  }
}
