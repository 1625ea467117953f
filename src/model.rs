//! Recipes and their steps as edited by the user.
//!
//! Field edits are addressed through the closed [`RecipeField`] and
//! [`StepField`] enums so that nothing outside this module decides which
//! column a value lands in.

use anyhow::{Result, ensure};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};
use uuid::Uuid;

/// Step names created for every new recipe, in order.
pub const TEMPLATE_STEPS: [&str; 4] = ["DEV", "STOP", "FIX", "RINSE"];

/// Step name used when a step is added without an explicit name.
pub const DEFAULT_STEP_NAME: &str = "RINSE";

/// Current UTC time in the same text form the store keeps.
pub fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Fresh random identifier for a recipe, step or upload row.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Recipe {
    pub id: String,
    pub name: String,
    pub film_stock: String,
    pub developer: String,
    pub dilution: String,
    pub category: String,
    pub notes: String,
    pub dev_time_reduced: i64,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Step {
    pub id: String,
    pub recipe_id: String,
    pub sort_order: i64,
    pub name: String,
    pub time_min: i64,
    pub time_sec: i64,
    pub agitation: String,
    pub compensation: String,
    pub min_temperature: f64,
    pub rated_temperature: f64,
    pub max_temperature: f64,
    pub formula_designator: String,
    pub logo_text: String,
}

/// Temperature bounds applied to newly created steps.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TemperatureDefaults {
    pub min: f64,
    pub rated: f64,
    pub max: f64,
}

impl Default for TemperatureDefaults {
    fn default() -> Self {
        Self {
            min: 18.0,
            rated: 20.0,
            max: 24.0,
        }
    }
}

impl Recipe {
    /// Blank recipe as created by "new recipe", without steps.
    pub fn blank(id: String, now: &str) -> Self {
        Self {
            id,
            name: "New Recipe".to_string(),
            film_stock: String::new(),
            developer: String::new(),
            dilution: String::new(),
            category: "BW".to_string(),
            notes: String::new(),
            dev_time_reduced: 0,
            created_at: now.to_string(),
            updated_at: now.to_string(),
            steps: Vec::new(),
        }
    }

    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == step_id)
    }

    /// Steps ordered by `sort_order`.
    pub fn sorted_steps(&self) -> Vec<&Step> {
        let mut steps: Vec<&Step> = self.steps.iter().collect();
        steps.sort_by_key(|s| s.sort_order);
        steps
    }

    pub fn apply(&mut self, field: RecipeField, value: &FieldValue) -> Result<()> {
        field.kind().check(field, value)?;

        match field {
            RecipeField::Name => self.name = value.to_text(),
            RecipeField::FilmStock => self.film_stock = value.to_text(),
            RecipeField::Developer => self.developer = value.to_text(),
            RecipeField::Dilution => self.dilution = value.to_text(),
            RecipeField::Category => self.category = value.to_text(),
            RecipeField::Notes => self.notes = value.to_text(),
            RecipeField::DevTimeReduced => self.dev_time_reduced = value.to_integer(),
        }

        Ok(())
    }
}

impl Step {
    /// Step with the per-name defaults used for templates and "add step".
    pub fn template(
        recipe_id: &str,
        sort_order: i64,
        name: &str,
        temperatures: TemperatureDefaults,
    ) -> Self {
        let is_dev = name == "DEV";
        let time_min = match name {
            "DEV" => 0,
            "STOP" => 1,
            "FIX" => 5,
            "RINSE" => 10,
            _ => 5,
        };

        Self {
            id: new_id(),
            recipe_id: recipe_id.to_string(),
            sort_order,
            name: name.to_string(),
            time_min,
            time_sec: 0,
            agitation: "Roll".to_string(),
            compensation: if is_dev { "On" } else { "Off" }.to_string(),
            min_temperature: temperatures.min,
            rated_temperature: temperatures.rated,
            max_temperature: temperatures.max,
            formula_designator: if is_dev { "1.1.1" } else { "" }.to_string(),
            logo_text: if is_dev { "B&W DEV" } else { "" }.to_string(),
        }
    }

    pub fn apply(&mut self, field: StepField, value: &FieldValue) -> Result<()> {
        field.kind().check(field, value)?;

        match field {
            StepField::Name => self.name = value.to_text(),
            StepField::TimeMin => self.time_min = value.to_integer(),
            StepField::TimeSec => self.time_sec = value.to_integer(),
            StepField::Agitation => self.agitation = value.to_text(),
            StepField::Compensation => self.compensation = value.to_text(),
            StepField::MinTemperature => self.min_temperature = value.to_real(),
            StepField::RatedTemperature => self.rated_temperature = value.to_real(),
            StepField::MaxTemperature => self.max_temperature = value.to_real(),
            StepField::FormulaDesignator => self.formula_designator = value.to_text(),
            StepField::LogoText => self.logo_text = value.to_text(),
        }

        Ok(())
    }
}

/// A single edited value.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Integer(i64),
    Real(f64),
    Text(String),
}

impl FieldValue {
    fn to_text(&self) -> String {
        match self {
            FieldValue::Text(s) => s.clone(),
            FieldValue::Integer(i) => i.to_string(),
            FieldValue::Real(r) => r.to_string(),
        }
    }

    fn to_integer(&self) -> i64 {
        match self {
            FieldValue::Integer(i) => *i,
            FieldValue::Real(r) => *r as i64,
            FieldValue::Text(_) => 0,
        }
    }

    fn to_real(&self) -> f64 {
        match self {
            FieldValue::Integer(i) => *i as f64,
            FieldValue::Real(r) => *r,
            FieldValue::Text(_) => 0.0,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Real(value)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueKind {
    Text,
    Integer,
    Real,
}

impl ValueKind {
    pub fn check(self, field: impl fmt::Display, value: &FieldValue) -> Result<()> {
        let accepted = matches!(
            (self, value),
            (ValueKind::Text, FieldValue::Text(_))
                | (ValueKind::Integer, FieldValue::Integer(_))
                | (ValueKind::Real, FieldValue::Real(_) | FieldValue::Integer(_))
        );

        ensure!(accepted, "invalid value {value:?} for field {field}");
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipeField {
    Name,
    FilmStock,
    Developer,
    Dilution,
    Category,
    Notes,
    DevTimeReduced,
}

impl RecipeField {
    pub const ALL: [RecipeField; 7] = [
        RecipeField::Name,
        RecipeField::FilmStock,
        RecipeField::Developer,
        RecipeField::Dilution,
        RecipeField::Category,
        RecipeField::Notes,
        RecipeField::DevTimeReduced,
    ];

    pub fn column(self) -> &'static str {
        match self {
            RecipeField::Name => "name",
            RecipeField::FilmStock => "film_stock",
            RecipeField::Developer => "developer",
            RecipeField::Dilution => "dilution",
            RecipeField::Category => "category",
            RecipeField::Notes => "notes",
            RecipeField::DevTimeReduced => "dev_time_reduced",
        }
    }

    pub fn kind(self) -> ValueKind {
        match self {
            RecipeField::DevTimeReduced => ValueKind::Integer,
            _ => ValueKind::Text,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepField {
    Name,
    TimeMin,
    TimeSec,
    Agitation,
    Compensation,
    MinTemperature,
    RatedTemperature,
    MaxTemperature,
    FormulaDesignator,
    LogoText,
}

impl StepField {
    pub const ALL: [StepField; 10] = [
        StepField::Name,
        StepField::TimeMin,
        StepField::TimeSec,
        StepField::Agitation,
        StepField::Compensation,
        StepField::MinTemperature,
        StepField::RatedTemperature,
        StepField::MaxTemperature,
        StepField::FormulaDesignator,
        StepField::LogoText,
    ];

    pub fn column(self) -> &'static str {
        match self {
            StepField::Name => "name",
            StepField::TimeMin => "time_min",
            StepField::TimeSec => "time_sec",
            StepField::Agitation => "agitation",
            StepField::Compensation => "compensation",
            StepField::MinTemperature => "min_temperature",
            StepField::RatedTemperature => "rated_temperature",
            StepField::MaxTemperature => "max_temperature",
            StepField::FormulaDesignator => "formula_designator",
            StepField::LogoText => "logo_text",
        }
    }

    pub fn kind(self) -> ValueKind {
        match self {
            StepField::TimeMin | StepField::TimeSec => ValueKind::Integer,
            StepField::MinTemperature | StepField::RatedTemperature | StepField::MaxTemperature => {
                ValueKind::Real
            }
            _ => ValueKind::Text,
        }
    }
}

impl fmt::Display for RecipeField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

impl fmt::Display for StepField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

impl FromStr for RecipeField {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        RecipeField::ALL
            .into_iter()
            .find(|field| field.column() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown recipe field: {s}"))
    }
}

impl FromStr for StepField {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        StepField::ALL
            .into_iter()
            .find(|field| field.column() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown step field: {s}"))
    }
}

/// Field values collected for one entity between two flushes.
///
/// Setting a field that is already present replaces its value.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingPatch<F: Ord, V> {
    fields: BTreeMap<F, V>,
}

impl<F: Ord, V> Default for PendingPatch<F, V> {
    fn default() -> Self {
        Self {
            fields: BTreeMap::new(),
        }
    }
}

impl<F: Ord, V> PendingPatch<F, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, field: F, value: V) {
        self.fields.insert(field, value);
    }

    /// Add the fields of an older patch that this one does not set
    pub fn merge_older(&mut self, older: Self) {
        for (field, value) in older.fields {
            self.fields.entry(field).or_insert(value);
        }
    }

    pub fn get(&self, field: &F) -> Option<&V> {
        self.fields.get(field)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&F, &V)> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<F: Ord, V> FromIterator<(F, V)> for PendingPatch<F, V> {
    fn from_iter<I: IntoIterator<Item = (F, V)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

pub type RecipePatch = PendingPatch<RecipeField, FieldValue>;
pub type StepPatch = PendingPatch<StepField, FieldValue>;

#[cfg(test)]
mod tests {
    use super::*;

    mod fields {
        use super::*;

        #[test]
        fn parses_column_names() {
            assert_eq!(
                "film_stock".parse::<RecipeField>().unwrap(),
                RecipeField::FilmStock
            );
            assert_eq!(
                "rated_temperature".parse::<StepField>().unwrap(),
                StepField::RatedTemperature
            );
            assert!("sort_order".parse::<StepField>().is_err());
            assert!("id; DROP TABLE recipes".parse::<RecipeField>().is_err());
        }

        #[test]
        fn rejects_mismatched_value_kinds() {
            let mut recipe = Recipe::blank("r1".to_string(), "2024-01-01T00:00:00.000Z");

            assert!(recipe.apply(RecipeField::Name, &FieldValue::Integer(3)).is_err());
            assert!(
                recipe
                    .apply(RecipeField::DevTimeReduced, &"yes".into())
                    .is_err()
            );
            assert_eq!(recipe.name, "New Recipe");
        }

        #[test]
        fn real_fields_accept_integers() {
            let mut step = Step::template("r1", 0, "DEV", TemperatureDefaults::default());

            step.apply(StepField::MaxTemperature, &FieldValue::Integer(26))
                .expect("integer accepted for real field");

            assert_eq!(step.max_temperature, 26.0);
        }
    }

    mod templates {
        use super::*;

        #[test]
        fn dev_step_gets_compensation_and_formula() {
            let step = Step::template("r1", 0, "DEV", TemperatureDefaults::default());

            assert_eq!(step.time_min, 0);
            assert_eq!(step.compensation, "On");
            assert_eq!(step.formula_designator, "1.1.1");
            assert_eq!(step.logo_text, "B&W DEV");
        }

        #[test]
        fn other_steps_use_name_specific_times() {
            let temps = TemperatureDefaults {
                min: 19.0,
                rated: 21.0,
                max: 25.0,
            };

            let stop = Step::template("r1", 1, "STOP", temps);
            let rinse = Step::template("r1", 3, "RINSE", temps);
            let wash = Step::template("r1", 4, "WASH", temps);

            assert_eq!(stop.time_min, 1);
            assert_eq!(rinse.time_min, 10);
            assert_eq!(wash.time_min, 5);
            assert_eq!(wash.compensation, "Off");
            assert_eq!(wash.rated_temperature, 21.0);
            assert_ne!(stop.id, rinse.id);
        }
    }

    mod pending_patch {
        use super::*;

        #[test]
        fn later_value_for_same_field_wins() {
            let mut patch = RecipePatch::new();
            patch.set(RecipeField::Name, "A".into());
            patch.set(RecipeField::Notes, "n".into());
            patch.set(RecipeField::Name, "B".into());

            assert_eq!(patch.len(), 2);
            assert_eq!(patch.get(&RecipeField::Name), Some(&"B".into()));
        }

        #[test]
        fn merging_older_patch_keeps_newer_values() {
            let mut older = RecipePatch::new();
            older.set(RecipeField::Name, "X".into());
            older.set(RecipeField::Developer, "Xtol".into());
            let mut newer = RecipePatch::new();
            newer.set(RecipeField::Name, "Y".into());

            newer.merge_older(older);

            assert_eq!(newer.len(), 2);
            assert_eq!(newer.get(&RecipeField::Name), Some(&"Y".into()));
            assert_eq!(newer.get(&RecipeField::Developer), Some(&"Xtol".into()));
        }
    }
}
