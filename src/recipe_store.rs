#![cfg_attr(feature = "mock", allow(dead_code, unused_imports))]

use crate::{
    config::DEFAULT_SETTINGS,
    model::{FieldValue, Recipe, RecipePatch, Step, StepPatch},
};
use anyhow::{Context, Result, anyhow};
use log::{debug, info};
#[cfg(feature = "mock")]
use mockall::automock;
use rusqlite::{
    Connection, OptionalExtension, Row, ToSql, params,
    types::{ToSqlOutput, Value},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex},
};
use trait_variant::make;

/// A program sent to the device, kept as upload history.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct UploadRecord {
    pub id: String,
    pub recipe_id: Option<String>,
    pub filename: String,
    pub display_name: String,
    pub uploaded_at: String,
}

/// Durable storage of recipes, steps, settings and upload history
///
/// Updates and deletes addressed to an id that does not exist affect nothing
/// and succeed.
#[make(Send)]
#[cfg_attr(feature = "mock", automock)]
pub trait RecipeStore {
    /// All recipes, most recently modified first, each with its steps in order
    async fn fetch_all_recipes(&self) -> Result<Vec<Recipe>>;
    async fn fetch_recipe(&self, id: &str) -> Result<Option<Recipe>>;
    /// Insert a recipe together with its steps
    async fn insert_recipe(&self, recipe: &Recipe) -> Result<()>;
    async fn insert_step(&self, step: &Step) -> Result<()>;
    /// Write the patched columns and set `updated_at`
    async fn update_recipe(&self, id: &str, patch: &RecipePatch, updated_at: &str) -> Result<()>;
    async fn update_step(&self, id: &str, patch: &StepPatch) -> Result<()>;
    /// Delete a recipe and all of its steps
    async fn delete_recipe(&self, id: &str) -> Result<()>;
    async fn delete_step(&self, id: &str) -> Result<()>;
    async fn touch_recipe(&self, id: &str, updated_at: &str) -> Result<()>;
    /// Set `sort_order` for each `(step id, order)` pair in one transaction
    async fn update_step_orders(&self, orders: &[(String, i64)]) -> Result<()>;
    async fn fetch_settings(&self) -> Result<HashMap<String, String>>;
    /// Insert every default setting whose key is missing
    async fn ensure_default_settings(&self) -> Result<()>;
    async fn upsert_setting(&self, key: &str, value: &str) -> Result<()>;
    async fn record_upload(&self, upload: &UploadRecord) -> Result<()>;
    /// Upload history, newest first
    async fn fetch_uploads(&self) -> Result<Vec<UploadRecord>>;
}

/// Schema changes, applied in order and tracked with `PRAGMA user_version`.
const MIGRATIONS: [&str; 4] = [
    "CREATE TABLE IF NOT EXISTS recipes (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL DEFAULT 'New Recipe',
        film_stock TEXT NOT NULL DEFAULT '',
        developer TEXT NOT NULL DEFAULT '',
        dilution TEXT NOT NULL DEFAULT '',
        category TEXT NOT NULL DEFAULT 'BW',
        notes TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS steps (
        id TEXT PRIMARY KEY,
        recipe_id TEXT NOT NULL REFERENCES recipes(id) ON DELETE CASCADE,
        sort_order INTEGER NOT NULL DEFAULT 0,
        name TEXT NOT NULL DEFAULT '',
        time_min INTEGER NOT NULL DEFAULT 0,
        time_sec INTEGER NOT NULL DEFAULT 0,
        agitation TEXT NOT NULL DEFAULT 'Roll',
        compensation TEXT NOT NULL DEFAULT 'Off',
        min_temperature REAL NOT NULL DEFAULT 18,
        rated_temperature REAL NOT NULL DEFAULT 20,
        max_temperature REAL NOT NULL DEFAULT 24,
        formula_designator TEXT NOT NULL DEFAULT '',
        logo_text TEXT NOT NULL DEFAULT ''
    );
    CREATE INDEX IF NOT EXISTS idx_steps_recipe ON steps(recipe_id, sort_order);
    CREATE TABLE IF NOT EXISTS settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );",
    "INSERT OR IGNORE INTO settings (key, value) VALUES
        ('ago_upload_endpoint', '/api/files/programs/custom'),
        ('ago_upload_field', 'json');",
    "ALTER TABLE recipes ADD COLUMN dev_time_reduced INTEGER NOT NULL DEFAULT 0;",
    "CREATE TABLE IF NOT EXISTS ago_uploads (
        id TEXT PRIMARY KEY,
        recipe_id TEXT REFERENCES recipes(id) ON DELETE SET NULL,
        filename TEXT NOT NULL,
        display_name TEXT NOT NULL DEFAULT '',
        uploaded_at TEXT NOT NULL
    );",
];

const RECIPE_COLUMNS: &str = "id, name, film_stock, developer, dilution, category, notes, \
     dev_time_reduced, created_at, updated_at";

const STEP_COLUMNS: &str = "id, recipe_id, sort_order, name, time_min, time_sec, agitation, \
     compensation, min_temperature, rated_temperature, max_temperature, formula_designator, \
     logo_text";

impl ToSql for FieldValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            FieldValue::Integer(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            FieldValue::Real(r) => ToSqlOutput::Owned(Value::Real(*r)),
            FieldValue::Text(s) => ToSqlOutput::from(s.as_str()),
        })
    }
}

/// [`RecipeStore`] backed by a single SQLite database file
#[derive(Clone)]
pub struct SqliteRecipeStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRecipeStore {
    pub fn open(path: &Path) -> Result<Self> {
        info!("opening database {}", path.display());
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database {}", path.display()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        Self::init(conn)
    }

    fn init(mut conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("failed to enable foreign keys")?;
        migrate(&mut conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a blocking database operation off the async runtime
    async fn with_conn<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);

        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| anyhow!("database connection lock poisoned"))?;
            op(&mut conn)
        })
        .await
        .context("failed to join database task")?
    }
}

fn migrate(conn: &mut Connection) -> Result<()> {
    let version: i64 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .context("failed to read schema version")?;

    for (index, sql) in MIGRATIONS.iter().enumerate().skip(version.max(0) as usize) {
        let target = index as i64 + 1;
        debug!("applying schema migration {target}");

        let tx = conn.transaction().context("failed to begin migration")?;
        tx.execute_batch(sql)
            .with_context(|| format!("failed to apply migration {target}"))?;
        tx.pragma_update(None, "user_version", target)
            .context("failed to update schema version")?;
        tx.commit().context("failed to commit migration")?;
    }

    Ok(())
}

fn recipe_from_row(row: &Row<'_>) -> rusqlite::Result<Recipe> {
    Ok(Recipe {
        id: row.get(0)?,
        name: row.get(1)?,
        film_stock: row.get(2)?,
        developer: row.get(3)?,
        dilution: row.get(4)?,
        category: row.get(5)?,
        notes: row.get(6)?,
        dev_time_reduced: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
        steps: Vec::new(),
    })
}

fn step_from_row(row: &Row<'_>) -> rusqlite::Result<Step> {
    Ok(Step {
        id: row.get(0)?,
        recipe_id: row.get(1)?,
        sort_order: row.get(2)?,
        name: row.get(3)?,
        time_min: row.get(4)?,
        time_sec: row.get(5)?,
        agitation: row.get(6)?,
        compensation: row.get(7)?,
        min_temperature: row.get(8)?,
        rated_temperature: row.get(9)?,
        max_temperature: row.get(10)?,
        formula_designator: row.get(11)?,
        logo_text: row.get(12)?,
    })
}

fn insert_step_row(conn: &Connection, step: &Step) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO steps ({STEP_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
        ),
        params![
            step.id,
            step.recipe_id,
            step.sort_order,
            step.name,
            step.time_min,
            step.time_sec,
            step.agitation,
            step.compensation,
            step.min_temperature,
            step.rated_temperature,
            step.max_temperature,
            step.formula_designator,
            step.logo_text,
        ],
    )
    .with_context(|| format!("failed to insert step {}", step.id))?;
    Ok(())
}

fn steps_of(conn: &Connection, recipe_id: &str) -> Result<Vec<Step>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {STEP_COLUMNS} FROM steps WHERE recipe_id = ?1 ORDER BY sort_order ASC"
    ))?;
    let steps = stmt
        .query_map([recipe_id], step_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("failed to read steps")?;
    Ok(steps)
}

/// `UPDATE <table> SET <col> = ?, ... WHERE id = ?` over a closed set of columns
fn update_columns<'a>(
    conn: &Connection,
    table: &str,
    id: &str,
    columns: impl Iterator<Item = (&'static str, &'a dyn ToSql)>,
) -> Result<usize> {
    let (names, mut values): (Vec<&str>, Vec<&dyn ToSql>) = columns.unzip();
    if names.is_empty() {
        return Ok(0);
    }

    let assignments = names
        .iter()
        .enumerate()
        .map(|(i, name)| format!("{name} = ?{}", i + 1))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "UPDATE {table} SET {assignments} WHERE id = ?{}",
        names.len() + 1
    );

    values.push(&id);
    conn.execute(&sql, values.as_slice())
        .with_context(|| format!("failed to update {table} row {id}"))
}

impl RecipeStore for SqliteRecipeStore {
    async fn fetch_all_recipes(&self) -> Result<Vec<Recipe>> {
        self.with_conn(|conn| {
            let mut recipes = conn
                .prepare(&format!(
                    "SELECT {RECIPE_COLUMNS} FROM recipes ORDER BY updated_at DESC"
                ))?
                .query_map([], recipe_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .context("failed to read recipes")?;

            let mut steps: HashMap<String, Vec<Step>> = HashMap::new();
            let mut stmt = conn.prepare(&format!(
                "SELECT {STEP_COLUMNS} FROM steps ORDER BY recipe_id, sort_order ASC"
            ))?;
            for step in stmt.query_map([], step_from_row)? {
                let step = step.context("failed to read step")?;
                steps.entry(step.recipe_id.clone()).or_default().push(step);
            }

            for recipe in &mut recipes {
                recipe.steps = steps.remove(&recipe.id).unwrap_or_default();
            }

            Ok(recipes)
        })
        .await
    }

    async fn fetch_recipe(&self, id: &str) -> Result<Option<Recipe>> {
        let id = id.to_string();

        self.with_conn(move |conn| {
            let recipe = conn
                .query_row(
                    &format!("SELECT {RECIPE_COLUMNS} FROM recipes WHERE id = ?1"),
                    [&id],
                    recipe_from_row,
                )
                .optional()
                .with_context(|| format!("failed to read recipe {id}"))?;

            let Some(mut recipe) = recipe else {
                return Ok(None);
            };
            recipe.steps = steps_of(conn, &id)?;
            Ok(Some(recipe))
        })
        .await
    }

    async fn insert_recipe(&self, recipe: &Recipe) -> Result<()> {
        let recipe = recipe.clone();

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                &format!(
                    "INSERT INTO recipes ({RECIPE_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                ),
                params![
                    recipe.id,
                    recipe.name,
                    recipe.film_stock,
                    recipe.developer,
                    recipe.dilution,
                    recipe.category,
                    recipe.notes,
                    recipe.dev_time_reduced,
                    recipe.created_at,
                    recipe.updated_at,
                ],
            )
            .with_context(|| format!("failed to insert recipe {}", recipe.id))?;

            for step in &recipe.steps {
                insert_step_row(&tx, step)?;
            }

            tx.commit().context("failed to commit recipe insert")
        })
        .await
    }

    async fn insert_step(&self, step: &Step) -> Result<()> {
        let step = step.clone();
        self.with_conn(move |conn| insert_step_row(conn, &step)).await
    }

    async fn update_recipe(&self, id: &str, patch: &RecipePatch, updated_at: &str) -> Result<()> {
        let id = id.to_string();
        let patch = patch.clone();
        let updated_at = updated_at.to_string();

        self.with_conn(move |conn| {
            let columns = patch
                .iter()
                .map(|(field, value)| (field.column(), value as &dyn ToSql))
                .chain(std::iter::once(("updated_at", &updated_at as &dyn ToSql)));
            let changed = update_columns(conn, "recipes", &id, columns)?;
            debug!("updated recipe {id} ({changed} row(s))");
            Ok(())
        })
        .await
    }

    async fn update_step(&self, id: &str, patch: &StepPatch) -> Result<()> {
        let id = id.to_string();
        let patch = patch.clone();

        self.with_conn(move |conn| {
            let columns = patch
                .iter()
                .map(|(field, value)| (field.column(), value as &dyn ToSql));
            let changed = update_columns(conn, "steps", &id, columns)?;
            debug!("updated step {id} ({changed} row(s))");
            Ok(())
        })
        .await
    }

    async fn delete_recipe(&self, id: &str) -> Result<()> {
        let id = id.to_string();

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM steps WHERE recipe_id = ?1", [&id])
                .context("failed to delete steps")?;
            tx.execute("DELETE FROM recipes WHERE id = ?1", [&id])
                .with_context(|| format!("failed to delete recipe {id}"))?;
            tx.commit().context("failed to commit recipe delete")
        })
        .await
    }

    async fn delete_step(&self, id: &str) -> Result<()> {
        let id = id.to_string();

        self.with_conn(move |conn| {
            conn.execute("DELETE FROM steps WHERE id = ?1", [&id])
                .with_context(|| format!("failed to delete step {id}"))?;
            Ok(())
        })
        .await
    }

    async fn touch_recipe(&self, id: &str, updated_at: &str) -> Result<()> {
        let id = id.to_string();
        let updated_at = updated_at.to_string();

        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE recipes SET updated_at = ?1 WHERE id = ?2",
                params![updated_at, id],
            )
            .with_context(|| format!("failed to touch recipe {id}"))?;
            Ok(())
        })
        .await
    }

    async fn update_step_orders(&self, orders: &[(String, i64)]) -> Result<()> {
        let orders = orders.to_vec();

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare("UPDATE steps SET sort_order = ?1 WHERE id = ?2")?;
                for (id, order) in &orders {
                    stmt.execute(params![order, id])
                        .with_context(|| format!("failed to reorder step {id}"))?;
                }
            }
            tx.commit().context("failed to commit step order")
        })
        .await
    }

    async fn fetch_settings(&self) -> Result<HashMap<String, String>> {
        self.with_conn(|conn| {
            let settings = conn
                .prepare("SELECT key, value FROM settings")?
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                .collect::<rusqlite::Result<HashMap<String, String>>>()
                .context("failed to read settings")?;
            Ok(settings)
        })
        .await
    }

    async fn ensure_default_settings(&self) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt =
                    tx.prepare("INSERT OR IGNORE INTO settings (key, value) VALUES (?1, ?2)")?;
                for (key, value) in DEFAULT_SETTINGS {
                    stmt.execute([key, value])
                        .with_context(|| format!("failed to seed setting {key}"))?;
                }
            }
            tx.commit().context("failed to commit default settings")
        })
        .await
    }

    async fn upsert_setting(&self, key: &str, value: &str) -> Result<()> {
        let key = key.to_string();
        let value = value.to_string();

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                [&key, &value],
            )
            .with_context(|| format!("failed to save setting {key}"))?;
            Ok(())
        })
        .await
    }

    async fn record_upload(&self, upload: &UploadRecord) -> Result<()> {
        let upload = upload.clone();

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO ago_uploads (id, recipe_id, filename, display_name, uploaded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    upload.id,
                    upload.recipe_id,
                    upload.filename,
                    upload.display_name,
                    upload.uploaded_at,
                ],
            )
            .context("failed to record upload")?;
            Ok(())
        })
        .await
    }

    async fn fetch_uploads(&self) -> Result<Vec<UploadRecord>> {
        self.with_conn(|conn| {
            let uploads = conn
                .prepare(
                    "SELECT id, recipe_id, filename, display_name, uploaded_at
                     FROM ago_uploads ORDER BY uploaded_at DESC",
                )?
                .query_map([], |row| {
                    Ok(UploadRecord {
                        id: row.get(0)?,
                        recipe_id: row.get(1)?,
                        filename: row.get(2)?,
                        display_name: row.get(3)?,
                        uploaded_at: row.get(4)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()
                .context("failed to read uploads")?;
            Ok(uploads)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RecipeField, StepField, TemperatureDefaults, new_id};

    fn recipe(id: &str, updated_at: &str) -> Recipe {
        let mut recipe = Recipe::blank(id.to_string(), updated_at);
        recipe.steps = ["DEV", "STOP", "FIX"]
            .into_iter()
            .enumerate()
            .map(|(i, name)| Step::template(id, i as i64, name, TemperatureDefaults::default()))
            .collect();
        recipe
    }

    mod schema {
        use super::*;

        #[test]
        fn migrations_reach_latest_version_and_are_idempotent() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("store.db");

            drop(SqliteRecipeStore::open(&path).unwrap());
            let store = SqliteRecipeStore::open(&path).unwrap();

            let conn = store.conn.lock().unwrap();
            let version: i64 = conn
                .query_row("PRAGMA user_version", [], |row| row.get(0))
                .unwrap();
            assert_eq!(version, MIGRATIONS.len() as i64);
        }

        #[tokio::test]
        async fn upload_defaults_are_seeded_by_migration() {
            let store = SqliteRecipeStore::open_in_memory().unwrap();
            let settings = store.fetch_settings().await.unwrap();

            assert_eq!(settings["ago_upload_field"], "json");
            assert!(!settings.contains_key("ago_ip"));
        }
    }

    mod recipes {
        use super::*;

        #[tokio::test]
        async fn fetch_all_orders_by_modification_and_steps_by_order() {
            let store = SqliteRecipeStore::open_in_memory().unwrap();
            let mut older = recipe("a", "2024-01-01T00:00:00.000Z");
            older.steps.reverse();
            store.insert_recipe(&older).await.unwrap();
            store
                .insert_recipe(&recipe("b", "2024-02-01T00:00:00.000Z"))
                .await
                .unwrap();

            let all = store.fetch_all_recipes().await.unwrap();

            assert_eq!(all.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), ["b", "a"]);
            let names: Vec<_> = all[1].steps.iter().map(|s| s.name.as_str()).collect();
            assert_eq!(names, ["DEV", "STOP", "FIX"]);
        }

        #[tokio::test]
        async fn update_writes_patched_columns_and_timestamp() {
            let store = SqliteRecipeStore::open_in_memory().unwrap();
            store
                .insert_recipe(&recipe("r1", "2024-01-01T00:00:00.000Z"))
                .await
                .unwrap();

            let patch: RecipePatch = [
                (RecipeField::Name, "Tri-X".into()),
                (RecipeField::DevTimeReduced, 1i64.into()),
            ]
            .into_iter()
            .collect();
            store
                .update_recipe("r1", &patch, "2024-03-01T00:00:00.000Z")
                .await
                .unwrap();

            let stored = store.fetch_recipe("r1").await.unwrap().unwrap();
            assert_eq!(stored.name, "Tri-X");
            assert_eq!(stored.dev_time_reduced, 1);
            assert_eq!(stored.category, "BW");
            assert_eq!(stored.updated_at, "2024-03-01T00:00:00.000Z");
        }

        #[tokio::test]
        async fn updates_to_missing_rows_succeed_silently() {
            let store = SqliteRecipeStore::open_in_memory().unwrap();

            let recipe_patch: RecipePatch = [(RecipeField::Notes, "x".into())].into_iter().collect();
            let step_patch: StepPatch = [(StepField::TimeMin, 3i64.into())].into_iter().collect();

            store
                .update_recipe("gone", &recipe_patch, "2024-01-01T00:00:00.000Z")
                .await
                .unwrap();
            store.update_step("gone", &step_patch).await.unwrap();
            assert!(store.fetch_recipe("gone").await.unwrap().is_none());
        }

        #[tokio::test]
        async fn delete_removes_steps() {
            let store = SqliteRecipeStore::open_in_memory().unwrap();
            store
                .insert_recipe(&recipe("r1", "2024-01-01T00:00:00.000Z"))
                .await
                .unwrap();

            store.delete_recipe("r1").await.unwrap();

            assert!(store.fetch_all_recipes().await.unwrap().is_empty());
            let conn = store.conn.lock().unwrap();
            let steps: i64 = conn
                .query_row("SELECT COUNT(*) FROM steps", [], |row| row.get(0))
                .unwrap();
            assert_eq!(steps, 0);
        }
    }

    mod steps {
        use super::*;

        #[tokio::test]
        async fn update_step_accepts_real_and_integer_values() {
            let store = SqliteRecipeStore::open_in_memory().unwrap();
            let recipe = recipe("r1", "2024-01-01T00:00:00.000Z");
            let step_id = recipe.steps[0].id.clone();
            store.insert_recipe(&recipe).await.unwrap();

            let patch: StepPatch = [
                (StepField::RatedTemperature, 20.5.into()),
                (StepField::TimeSec, 30i64.into()),
                (StepField::Agitation, "Inversion".into()),
            ]
            .into_iter()
            .collect();
            store.update_step(&step_id, &patch).await.unwrap();

            let stored = store.fetch_recipe("r1").await.unwrap().unwrap();
            let step = stored.step(&step_id).unwrap();
            assert_eq!(step.rated_temperature, 20.5);
            assert_eq!(step.time_sec, 30);
            assert_eq!(step.agitation, "Inversion");
        }

        #[tokio::test]
        async fn reorder_and_delete() {
            let store = SqliteRecipeStore::open_in_memory().unwrap();
            let recipe = recipe("r1", "2024-01-01T00:00:00.000Z");
            let ids: Vec<String> = recipe.steps.iter().map(|s| s.id.clone()).collect();
            store.insert_recipe(&recipe).await.unwrap();

            store
                .update_step_orders(&[
                    (ids[2].clone(), 0),
                    (ids[0].clone(), 1),
                    (ids[1].clone(), 2),
                ])
                .await
                .unwrap();
            store.delete_step(&ids[0]).await.unwrap();

            let stored = store.fetch_recipe("r1").await.unwrap().unwrap();
            let names: Vec<_> = stored.steps.iter().map(|s| s.name.as_str()).collect();
            assert_eq!(names, ["FIX", "STOP"]);
        }
    }

    mod settings {
        use super::*;

        #[tokio::test]
        async fn seeding_keeps_existing_values() {
            let store = SqliteRecipeStore::open_in_memory().unwrap();
            store.upsert_setting("ago_ip", "192.168.4.1").await.unwrap();

            store.ensure_default_settings().await.unwrap();
            store.upsert_setting("auto_reconnect", "false").await.unwrap();

            let settings = store.fetch_settings().await.unwrap();
            assert_eq!(settings["ago_ip"], "192.168.4.1");
            assert_eq!(settings["ago_ssid"], "AGO");
            assert_eq!(settings["auto_reconnect"], "false");
            assert_eq!(settings.len(), DEFAULT_SETTINGS.len());
        }
    }

    #[tokio::test]
    async fn uploads_keep_history_after_recipe_delete() {
        let store = SqliteRecipeStore::open_in_memory().unwrap();
        store
            .insert_recipe(&recipe("r1", "2024-01-01T00:00:00.000Z"))
            .await
            .unwrap();

        store
            .record_upload(&UploadRecord {
                id: new_id(),
                recipe_id: Some("r1".to_string()),
                filename: "_P_C0_0000abcd.txt".to_string(),
                display_name: "HP5 Plus".to_string(),
                uploaded_at: "2024-01-02T00:00:00.000Z".to_string(),
            })
            .await
            .unwrap();
        store.delete_recipe("r1").await.unwrap();

        let uploads = store.fetch_uploads().await.unwrap();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].recipe_id, None);
    }
}
