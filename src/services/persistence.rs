//! Optimistic persistence of recipes and steps.
//!
//! Writes happen in two phases. An edit is applied to the in-memory
//! projection synchronously, so readers see it at once, and is handed to a
//! [`WriteCoalescer`]. When the coalescer flushes, the merged patch is written
//! to the store and the projection is reloaded from the store with all
//! still-pending patches laid over it. At any instant the projection therefore
//! equals the durable state merged with every edit not yet flushed.
//!
//! Flushes and structural changes (create, delete, reorder, reload) are
//! serialized through one gate. Failed writes are reported on the
//! [`NoticeBus`] and leave the projection untouched. Their patches stay with
//! the coalescer and keep being laid over later reloads until the next edit
//! of the same entity or [`PersistenceEngine::flush_pending`] writes them.

use crate::{
    config::Settings,
    model::{
        DEFAULT_STEP_NAME, FieldValue, Recipe, RecipeField, RecipePatch, Step, StepField,
        StepPatch, TEMPLATE_STEPS, new_id, timestamp,
    },
    notice::{FailureKind, Notice, NoticeBus},
    recipe_store::RecipeStore,
    services::{
        coalescer::{FlushResult, WriteCoalescer},
        program::{AgoProgram, program_to_recipe},
    },
};
use anyhow::Result;
use log::{debug, info, warn};
use std::{
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak},
    time::Duration,
};
use tokio::sync::Mutex;

/// Address of a step's pending writes
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StepKey {
    pub recipe_id: String,
    pub step_id: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RecipeSort {
    /// Most recently modified first
    #[default]
    Modified,
    /// Most recently created first
    Created,
    /// Alphabetically, ignoring case
    Name,
}

#[derive(Debug, Default)]
struct Projection {
    recipes: Vec<Recipe>,
    selected: Option<String>,
}

impl Projection {
    fn recipe_mut(&mut self, id: &str) -> Option<&mut Recipe> {
        self.recipes.iter_mut().find(|r| r.id == id)
    }
}

struct Inner<S> {
    store: S,
    projection: RwLock<Projection>,
    settings: RwLock<Settings>,
    notices: NoticeBus,
    gate: Arc<Mutex<()>>,
    recipe_writes: WriteCoalescer<String, RecipeField, FieldValue>,
    step_writes: WriteCoalescer<StepKey, StepField, FieldValue>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory recipe projection backed by a [`RecipeStore`]
pub struct PersistenceEngine<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for PersistenceEngine<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> Inner<S>
where
    S: RecipeStore + Send + Sync + 'static,
{
    async fn flush_recipe(
        &self,
        id: String,
        patch: RecipePatch,
    ) -> FlushResult<RecipeField, FieldValue> {
        debug!("writing {} field(s) of recipe {id}", patch.len());

        if let Err(e) = self.store.update_recipe(&id, &patch, &timestamp()).await {
            warn!("failed to write recipe {id}: {e:#}");
            self.notices.publish(Notice::failure(
                FailureKind::Persistence,
                "Failed to save recipe changes",
            ));
            return Err(patch);
        }

        self.reload().await;
        Ok(())
    }

    async fn flush_step(
        &self,
        key: StepKey,
        patch: StepPatch,
    ) -> FlushResult<StepField, FieldValue> {
        debug!("writing {} field(s) of step {}", patch.len(), key.step_id);

        let written = match self.store.update_step(&key.step_id, &patch).await {
            Ok(()) => self.store.touch_recipe(&key.recipe_id, &timestamp()).await,
            Err(e) => Err(e),
        };

        if let Err(e) = written {
            warn!("failed to write step {}: {e:#}", key.step_id);
            self.notices.publish(Notice::failure(
                FailureKind::Persistence,
                "Failed to save step changes",
            ));
            return Err(patch);
        }

        self.reload().await;
        Ok(())
    }

    /// Replace the projection with the store's snapshot plus pending edits
    ///
    /// Must run while holding the gate.
    async fn reload(&self) -> bool {
        let mut recipes = match self.store.fetch_all_recipes().await {
            Ok(recipes) => recipes,
            Err(e) => {
                warn!("failed to load recipes: {e:#}");
                self.notices.publish(Notice::failure(
                    FailureKind::Persistence,
                    "Failed to load recipes",
                ));
                return false;
            }
        };

        // pending edits are read under the projection lock, the same lock
        // edits hold while recording, so none falls between the two
        let mut projection = write(&self.projection);
        self.overlay_pending(&mut recipes);

        let selection_gone = projection
            .selected
            .as_ref()
            .is_some_and(|id| !recipes.iter().any(|r| &r.id == id));
        if selection_gone {
            projection.selected = None;
        }

        projection.recipes = recipes;
        true
    }

    fn overlay_pending(&self, recipes: &mut [Recipe]) {
        for (id, patch) in self.recipe_writes.pending_all() {
            let Some(recipe) = recipes.iter_mut().find(|r| r.id == id) else {
                continue;
            };
            for (field, value) in patch.iter() {
                if let Err(e) = recipe.apply(*field, value) {
                    warn!("dropping pending edit of recipe {id}: {e:#}");
                }
            }
        }

        for (key, patch) in self.step_writes.pending_all() {
            let Some(step) = recipes
                .iter_mut()
                .find(|r| r.id == key.recipe_id)
                .and_then(|r| r.step_mut(&key.step_id))
            else {
                continue;
            };
            for (field, value) in patch.iter() {
                if let Err(e) = step.apply(*field, value) {
                    warn!("dropping pending edit of step {}: {e:#}", key.step_id);
                }
            }
        }
    }

    fn persistence_failure(&self, what: &str, e: anyhow::Error) {
        warn!("{what}: {e:#}");
        self.notices
            .publish(Notice::failure(FailureKind::Persistence, what.to_string()));
    }
}

impl<S> PersistenceEngine<S>
where
    S: RecipeStore + Send + Sync + 'static,
{
    /// Engine over `store` flushing edits after `debounce` of inactivity
    ///
    /// Starts with an empty projection and default settings; see
    /// [`Self::load_settings`] and [`Self::load_recipes`].
    pub fn new(store: S, notices: NoticeBus, debounce: Duration) -> Self {
        let gate = Arc::new(Mutex::new(()));

        let inner = Arc::new_cyclic(|weak: &Weak<Inner<S>>| {
            let owner = weak.clone();
            let recipe_writes = WriteCoalescer::with_gate(
                debounce,
                Arc::clone(&gate),
                move |id: String, patch: RecipePatch| {
                    let inner = owner.upgrade();
                    async move {
                        match inner {
                            Some(inner) => inner.flush_recipe(id, patch).await,
                            None => Ok(()),
                        }
                    }
                },
            );

            let owner = weak.clone();
            let step_writes = WriteCoalescer::with_gate(
                debounce,
                Arc::clone(&gate),
                move |key: StepKey, patch: StepPatch| {
                    let inner = owner.upgrade();
                    async move {
                        match inner {
                            Some(inner) => inner.flush_step(key, patch).await,
                            None => Ok(()),
                        }
                    }
                },
            );

            Inner {
                store,
                projection: RwLock::default(),
                settings: RwLock::default(),
                notices,
                gate,
                recipe_writes,
                step_writes,
            }
        });

        Self { inner }
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    // ========================================================================
    // Settings
    // ========================================================================

    /// Seed missing default settings and read all settings from the store
    pub async fn load_settings(&self) {
        let loaded = match self.inner.store.ensure_default_settings().await {
            Ok(()) => self.inner.store.fetch_settings().await,
            Err(e) => Err(e),
        };

        match loaded {
            Ok(rows) => *write(&self.inner.settings) = Settings::from_rows(rows),
            Err(e) => self.inner.persistence_failure("Failed to load settings", e),
        }
    }

    pub fn settings(&self) -> Settings {
        read(&self.inner.settings).clone()
    }

    pub async fn update_setting(&self, key: &str, value: &str) {
        info!("setting {key} changed");
        write(&self.inner.settings).set(key, value);

        if let Err(e) = self.inner.store.upsert_setting(key, value).await {
            self.inner.persistence_failure("Failed to save setting", e);
        }
    }

    // ========================================================================
    // Projection queries
    // ========================================================================

    pub async fn load_recipes(&self) -> bool {
        let _gate = self.inner.gate.lock().await;
        self.inner.reload().await
    }

    pub fn recipes(&self) -> Vec<Recipe> {
        read(&self.inner.projection).recipes.clone()
    }

    pub fn recipe(&self, id: &str) -> Option<Recipe> {
        read(&self.inner.projection)
            .recipes
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    pub fn selected(&self) -> Option<Recipe> {
        let projection = read(&self.inner.projection);
        let id = projection.selected.as_deref()?;
        projection.recipes.iter().find(|r| r.id == id).cloned()
    }

    pub fn select(&self, id: Option<&str>) {
        write(&self.inner.projection).selected = id.map(str::to_string);
    }

    /// Recipes whose name, film stock or developer contains `query`, ignoring case
    pub fn search(&self, query: &str, sort: RecipeSort) -> Vec<Recipe> {
        let query = query.trim().to_lowercase();

        let mut found: Vec<Recipe> = read(&self.inner.projection)
            .recipes
            .iter()
            .filter(|r| {
                query.is_empty()
                    || [&r.name, &r.film_stock, &r.developer]
                        .iter()
                        .any(|text| text.to_lowercase().contains(&query))
            })
            .cloned()
            .collect();

        match sort {
            RecipeSort::Modified => found.sort_by(|a, b| b.updated_at.cmp(&a.updated_at)),
            RecipeSort::Created => found.sort_by(|a, b| b.created_at.cmp(&a.created_at)),
            RecipeSort::Name => found.sort_by_key(|r| r.name.to_lowercase()),
        }
        found
    }

    /// Number of entities with edits waiting for their debounce to elapse
    pub fn pending_writes(&self) -> usize {
        self.inner.recipe_writes.len() + self.inner.step_writes.len()
    }

    /// Number of entities whose last write failed; [`Self::flush_pending`] retries them
    pub fn failed_writes(&self) -> usize {
        self.inner.recipe_writes.failed_len() + self.inner.step_writes.failed_len()
    }

    // ========================================================================
    // Field edits
    // ========================================================================

    /// Apply a recipe field edit now and schedule its durable write
    ///
    /// Edits to a recipe missing from the projection are dropped. A value of
    /// the wrong kind for `field` is an error.
    pub fn edit_recipe(&self, id: &str, field: RecipeField, value: FieldValue) -> Result<()> {
        field.kind().check(field, &value)?;

        let mut projection = write(&self.inner.projection);
        let Some(recipe) = projection.recipe_mut(id) else {
            debug!("dropping edit of unknown recipe {id}");
            return Ok(());
        };

        recipe.apply(field, &value)?;
        recipe.updated_at = timestamp();
        self.inner.recipe_writes.record(id.to_string(), field, value);
        Ok(())
    }

    /// Apply a step field edit now and schedule its durable write
    pub fn edit_step(
        &self,
        recipe_id: &str,
        step_id: &str,
        field: StepField,
        value: FieldValue,
    ) -> Result<()> {
        field.kind().check(field, &value)?;

        let mut projection = write(&self.inner.projection);
        let Some(recipe) = projection.recipe_mut(recipe_id) else {
            debug!("dropping edit of step {step_id} in unknown recipe {recipe_id}");
            return Ok(());
        };
        let Some(step) = recipe.step_mut(step_id) else {
            debug!("dropping edit of unknown step {step_id}");
            return Ok(());
        };

        step.apply(field, &value)?;
        recipe.updated_at = timestamp();

        let key = StepKey {
            recipe_id: recipe_id.to_string(),
            step_id: step_id.to_string(),
        };
        self.inner.step_writes.record(key, field, value);
        Ok(())
    }

    /// Write every pending edit now and retry failed ones, e.g. before shutdown
    pub async fn flush_pending(&self) {
        let pending = self.pending_writes();
        let failed = self.failed_writes();
        if pending + failed > 0 {
            info!("flushing {pending} pending and {failed} failed write(s)");
        }

        self.inner.recipe_writes.flush_all().await;
        self.inner.step_writes.flush_all().await;
    }

    // ========================================================================
    // Structural changes
    // ========================================================================

    async fn insert_and_select(&self, recipe: Recipe, failure: &str) -> Option<String> {
        let _gate = self.inner.gate.lock().await;

        if let Err(e) = self.inner.store.insert_recipe(&recipe).await {
            self.inner.persistence_failure(failure, e);
            return None;
        }

        self.inner.reload().await;
        self.select(Some(&recipe.id));
        Some(recipe.id)
    }

    /// New recipe with the template steps, selected; `None` if it could not be stored
    pub async fn create_recipe(&self) -> Option<String> {
        let now = timestamp();
        let temperatures = self.settings().temperature_defaults();

        let mut recipe = Recipe::blank(new_id(), &now);
        recipe.steps = TEMPLATE_STEPS
            .iter()
            .enumerate()
            .map(|(i, name)| Step::template(&recipe.id, i as i64, name, temperatures))
            .collect();

        info!("creating recipe {}", recipe.id);
        self.insert_and_select(recipe, "Failed to create recipe")
            .await
    }

    /// Copy of a recipe, including edits not yet flushed, selected
    pub async fn duplicate_recipe(&self, id: &str) -> Option<String> {
        let Some(source) = self.recipe(id) else {
            warn!("cannot duplicate unknown recipe {id}");
            return None;
        };

        let now = timestamp();
        let mut copy = Recipe {
            id: new_id(),
            name: format!("{} (copy)", source.name),
            dev_time_reduced: 0,
            created_at: now.clone(),
            updated_at: now,
            steps: Vec::new(),
            ..source.clone()
        };
        copy.steps = source
            .sorted_steps()
            .into_iter()
            .map(|step| Step {
                id: new_id(),
                recipe_id: copy.id.clone(),
                ..step.clone()
            })
            .collect();

        info!("duplicating recipe {id} as {}", copy.id);
        let copy_id = self
            .insert_and_select(copy, "Failed to duplicate recipe")
            .await?;
        self.inner
            .notices
            .publish(Notice::success("Recipe duplicated"));
        Some(copy_id)
    }

    /// Recipe from an imported program file, selected
    pub async fn import_program(&self, program: &AgoProgram) -> Option<String> {
        let recipe = program_to_recipe(program, &timestamp());
        info!("importing program as recipe {}", recipe.id);

        let id = self
            .insert_and_select(recipe, "Failed to import recipe")
            .await?;
        self.inner.notices.publish(Notice::success("Recipe imported"));
        Some(id)
    }

    /// Delete a recipe after discarding its pending edits and those of its steps
    pub async fn delete_recipe(&self, id: &str) {
        self.inner.recipe_writes.cancel(&id.to_string());
        let steps = self
            .inner
            .step_writes
            .cancel_where(|key| key.recipe_id == id);
        debug!("discarded pending writes of {steps} step(s) of recipe {id}");

        let _gate = self.inner.gate.lock().await;
        info!("deleting recipe {id}");

        if let Err(e) = self.inner.store.delete_recipe(id).await {
            self.inner.persistence_failure("Failed to delete recipe", e);
            return;
        }

        self.inner.reload().await;
        self.inner.notices.publish(Notice::success("Recipe deleted"));
    }

    /// Append a step (default name RINSE) to a recipe; returns the new step id
    pub async fn add_step(&self, recipe_id: &str, name: Option<&str>) -> Option<String> {
        let _gate = self.inner.gate.lock().await;

        let Some(recipe) = self.recipe(recipe_id) else {
            warn!("cannot add step to unknown recipe {recipe_id}");
            return None;
        };
        let sort_order = recipe
            .steps
            .iter()
            .map(|s| s.sort_order + 1)
            .max()
            .unwrap_or(0);
        let step = Step::template(
            recipe_id,
            sort_order,
            name.unwrap_or(DEFAULT_STEP_NAME),
            self.settings().temperature_defaults(),
        );

        let stored = match self.inner.store.insert_step(&step).await {
            Ok(()) => self.inner.store.touch_recipe(recipe_id, &timestamp()).await,
            Err(e) => Err(e),
        };
        if let Err(e) = stored {
            self.inner.persistence_failure("Failed to add step", e);
            return None;
        }

        self.inner.reload().await;
        Some(step.id)
    }

    /// Move the step at `from` to `to` and renumber all steps from zero
    pub async fn reorder_steps(&self, recipe_id: &str, from: usize, to: usize) {
        let _gate = self.inner.gate.lock().await;

        let orders: Vec<(String, i64)> = {
            let mut projection = write(&self.inner.projection);
            let Some(recipe) = projection.recipe_mut(recipe_id) else {
                warn!("cannot reorder steps of unknown recipe {recipe_id}");
                return;
            };

            let mut ids: Vec<String> = recipe
                .sorted_steps()
                .into_iter()
                .map(|s| s.id.clone())
                .collect();
            if from >= ids.len() || to >= ids.len() {
                warn!("step move {from} -> {to} out of range for recipe {recipe_id}");
                return;
            }
            let moved = ids.remove(from);
            ids.insert(to, moved);

            let orders: Vec<(String, i64)> = ids
                .into_iter()
                .enumerate()
                .map(|(order, id)| (id, order as i64))
                .collect();
            for (id, order) in &orders {
                if let Some(step) = recipe.step_mut(id) {
                    step.sort_order = *order;
                }
            }
            recipe.steps.sort_by_key(|s| s.sort_order);
            orders
        };

        let stored = match self.inner.store.update_step_orders(&orders).await {
            Ok(()) => self.inner.store.touch_recipe(recipe_id, &timestamp()).await,
            Err(e) => Err(e),
        };
        if let Err(e) = stored {
            self.inner.persistence_failure("Failed to reorder steps", e);
            return;
        }

        self.inner.reload().await;
    }

    /// Delete a step after discarding its pending edits
    pub async fn delete_step(&self, recipe_id: &str, step_id: &str) {
        self.inner.step_writes.cancel(&StepKey {
            recipe_id: recipe_id.to_string(),
            step_id: step_id.to_string(),
        });

        let _gate = self.inner.gate.lock().await;
        info!("deleting step {step_id}");

        let stored = match self.inner.store.delete_step(step_id).await {
            Ok(()) => self.inner.store.touch_recipe(recipe_id, &timestamp()).await,
            Err(e) => Err(e),
        };
        if let Err(e) = stored {
            self.inner.persistence_failure("Failed to delete step", e);
            return;
        }

        self.inner.reload().await;
    }

    /// Wait until no pending edit is left and no flush is running
    #[cfg(test)]
    async fn settled(&self) {
        while self.pending_writes() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        drop(self.inner.gate.lock().await);
    }
}
