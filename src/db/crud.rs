use chrono::{DateTime, Local, Utc};
use sqlx::{Executor, Result, Sqlite, SqlitePool};

use super::model::*;

/// 添加记录
pub async fn add_record<'c, E>(executor: E, name: &str, description: Option<&str>) -> Result<Record>
where
    E: Executor<'c, Database = Sqlite>,
{
    let now = Utc::now();
    sqlx::query_as::<_, Record>(
        r#"
        INSERT INTO record (name, description, created_at, updated_at)
        VALUES (?, ?, ?, ?)
        RETURNING id, name, description, created_at, updated_at
        "#,
    )
    .bind(name)
    .bind(description)
    .bind(now)
    .bind(now)
    .fetch_one(executor)
    .await
}

pub async fn get_record(executor: &SqlitePool, id: i64) -> Result<Option<Record>> {
    sqlx::query_as::<_, Record>(
        r#"
        SELECT id, name, description, created_at, updated_at FROM record WHERE id = ?
        "#,
    )
    .bind(id)
    .fetch_optional(executor)
    .await
}

/// 分页获取记录，按创建时间倒序
pub async fn get_records(executor: &SqlitePool, limit: i64, offset: i64) -> Result<Vec<Record>> {
    sqlx::query_as::<_, Record>(
        r#"
        SELECT id, name, description, created_at, updated_at FROM record
        ORDER BY created_at DESC, id DESC
        LIMIT ? OFFSET ?
        "#,
    )
    .bind(limit)
    .bind(offset)
    .fetch_all(executor)
    .await
}

pub async fn count_records(executor: &SqlitePool) -> Result<i64> {
    sqlx::query_scalar("SELECT COUNT(*) FROM record").fetch_one(executor).await
}

/// 更新记录，返回更新后的记录，记录不存在时返回 None
pub async fn update_record(
    executor: &SqlitePool,
    id: i64,
    name: Option<&str>,
    description: Option<Option<&str>>,
) -> Result<Option<Record>> {
    sqlx::query_as::<_, Record>(
        r#"
        UPDATE record SET
            name = COALESCE(?, name),
            description = CASE WHEN ? THEN ? ELSE description END,
            updated_at = ?
        WHERE id = ?
        RETURNING id, name, description, created_at, updated_at
        "#,
    )
    .bind(name)
    .bind(description.is_some())
    .bind(description.flatten())
    .bind(Utc::now())
    .bind(id)
    .fetch_optional(executor)
    .await
}

/// 删除记录，图片通过外键级联删除，返回是否删除成功
pub async fn delete_record(executor: &SqlitePool, id: i64) -> Result<bool> {
    let result = sqlx::query("DELETE FROM record WHERE id = ?").bind(id).execute(executor).await?;
    Ok(result.rows_affected() > 0)
}

/// 添加图片记录
pub async fn add_image<'c, E>(executor: E, image: &NewImage) -> Result<Image>
where
    E: Executor<'c, Database = Sqlite>,
{
    sqlx::query_as::<_, Image>(
        r#"
        INSERT INTO image (record_id, filename, path, vector_id, created_at)
        VALUES (?, ?, ?, ?, ?)
        RETURNING id, record_id, filename, path, vector_id, created_at
        "#,
    )
    .bind(image.record_id)
    .bind(&image.filename)
    .bind(&image.path)
    .bind(&image.vector_id)
    .bind(Utc::now())
    .fetch_one(executor)
    .await
}

pub async fn get_image(executor: &SqlitePool, id: i64) -> Result<Option<Image>> {
    sqlx::query_as::<_, Image>(
        r#"
        SELECT id, record_id, filename, path, vector_id, created_at FROM image WHERE id = ?
        "#,
    )
    .bind(id)
    .fetch_optional(executor)
    .await
}

/// 获取记录下的所有图片，按创建顺序
pub async fn get_images_by_record(executor: &SqlitePool, record_id: i64) -> Result<Vec<Image>> {
    sqlx::query_as::<_, Image>(
        r#"
        SELECT id, record_id, filename, path, vector_id, created_at FROM image
        WHERE record_id = ?
        ORDER BY id ASC
        "#,
    )
    .bind(record_id)
    .fetch_all(executor)
    .await
}

pub async fn delete_image(executor: &SqlitePool, id: i64) -> Result<bool> {
    let result = sqlx::query("DELETE FROM image WHERE id = ?").bind(id).execute(executor).await?;
    Ok(result.rows_affected() > 0)
}

/// 根据向量 ID 获取图片及其所属记录
pub(super) async fn get_image_record_by_vector_id(
    executor: &SqlitePool,
    vector_id: &str,
) -> Result<Option<ImageRecordRow>> {
    sqlx::query_as::<_, ImageRecordRow>(
        r#"
        SELECT
            image.id AS image_id,
            image.record_id AS record_id,
            image.filename AS filename,
            image.path AS path,
            image.vector_id AS vector_id,
            image.created_at AS image_created_at,
            record.name AS name,
            record.description AS description,
            record.created_at AS record_created_at,
            record.updated_at AS record_updated_at
        FROM image
        JOIN record ON record.id = image.record_id
        WHERE image.vector_id = ?
        "#,
    )
    .bind(vector_id)
    .fetch_optional(executor)
    .await
}

/// 查询记录和图片数量，以及今天新增的数量
pub async fn get_stats(executor: &SqlitePool) -> Result<DashboardStats> {
    let today = start_of_today();
    let (total_records, today_records): (i64, i64) = sqlx::query_as(
        "SELECT COUNT(*), COALESCE(SUM(created_at >= ?), 0) FROM record",
    )
    .bind(today)
    .fetch_one(executor)
    .await?;
    let (total_images, today_images): (i64, i64) = sqlx::query_as(
        "SELECT COUNT(*), COALESCE(SUM(created_at >= ?), 0) FROM image",
    )
    .bind(today)
    .fetch_one(executor)
    .await?;

    Ok(DashboardStats { total_records, total_images, today_records, today_images })
}

/// 本地时区当天零点
fn start_of_today() -> DateTime<Utc> {
    let midnight = Local::now().date_naive().and_hms_opt(0, 0, 0).unwrap_or_default();
    midnight
        .and_local_timezone(Local)
        .earliest()
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}
