//! Conversion between recipes and the device's program formats.
//!
//! [`AgoProgram`] is the exchange format written to and read from `.json`
//! files. [`UploadPayload`] is the reduced shape the device accepts on its
//! custom program endpoint.

use crate::model::{Recipe, Step, TemperatureDefaults, new_id};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Developers recognised at the end of an expanded title.
pub const DEVELOPERS: [&str; 6] = ["510 Pyro", "FX-39", "HC-110", "DDX", "Xtol", "Rodinal"];

const MAX_FILENAME_STEM: usize = 26;

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct AgoProgram {
    #[serde(default)]
    pub category: String,
    pub name: String,
    #[serde(default)]
    pub expanded_title: String,
    pub steps: Vec<ProgramStep>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct ProgramStep {
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

/// Body of a custom program upload.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct UploadPayload {
    pub name: String,
    pub designator: &'static str,
    pub category: String,
    pub expanded_title: String,
    pub steps: Vec<UploadStep>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct UploadStep {
    pub name: String,
    /// Total step time in seconds
    pub time: i64,
    pub agitation: String,
    pub compensation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formula_designator: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_temperature: Option<f64>,
}

impl From<&Step> for ProgramStep {
    fn from(step: &Step) -> Self {
        Self {
            name: step.name.clone(),
            time_min: step.time_min,
            time_sec: step.time_sec,
            agitation: step.agitation.clone(),
            compensation: step.compensation.clone(),
            min_temperature: step.min_temperature,
            rated_temperature: step.rated_temperature,
            max_temperature: step.max_temperature,
            formula_designator: step.formula_designator.clone(),
            logo_text: step.logo_text.clone(),
        }
    }
}

pub fn recipe_to_program(recipe: &Recipe) -> AgoProgram {
    let name = if recipe.category == "BW" {
        "B&W".to_string()
    } else {
        recipe.category.clone()
    };

    AgoProgram {
        category: recipe.category.clone(),
        name,
        expanded_title: format!(
            " - {} {} {}",
            recipe.film_stock, recipe.developer, recipe.dilution
        )
        .trim()
        .to_string(),
        steps: recipe
            .sorted_steps()
            .into_iter()
            .map(ProgramStep::from)
            .collect(),
    }
}

/// Split `"<film> <developer> <dilution>"` into its parts.
///
/// The dilution is a trailing `N+M` or `N:M`. The developer is the longest
/// entry of [`DEVELOPERS`] the remainder ends with, compared case-insensitively.
fn parse_expanded_title(expanded_title: &str) -> (String, String, String) {
    let title = expanded_title.trim_start();
    let title = title.strip_prefix('-').unwrap_or(title).trim();

    let (rest, dilution) = match split_dilution(title) {
        Some((rest, dilution)) => (rest.trim(), dilution.to_string()),
        None => (title, String::new()),
    };

    let mut developers = DEVELOPERS;
    developers.sort_by_key(|d| std::cmp::Reverse(d.len()));

    let film_before = |developer: &str| {
        let start = rest.len().checked_sub(developer.len())?;
        let tail = rest.get(start..)?;
        tail.eq_ignore_ascii_case(developer).then(|| &rest[..start])
    };

    match developers
        .iter()
        .find_map(|developer| film_before(developer).map(|film| (film, developer)))
    {
        Some((film, developer)) => (film.trim().to_string(), developer.to_string(), dilution),
        None => (rest.to_string(), String::new(), dilution),
    }
}

/// Trailing `\d+[+:]\d+` of `title`, if any, and the text before it.
fn split_dilution(title: &str) -> Option<(&str, &str)> {
    let title = title.trim_end();
    let bytes = title.as_bytes();

    let right_start = bytes
        .iter()
        .rposition(|b| !b.is_ascii_digit())
        .map_or(0, |i| i + 1);
    if right_start == bytes.len() || right_start == 0 {
        return None;
    }
    let end = right_start - 1;
    if bytes[end] != b'+' && bytes[end] != b':' {
        return None;
    }

    let left_start = bytes[..end]
        .iter()
        .rposition(|b| !b.is_ascii_digit())
        .map_or(0, |i| i + 1);
    if left_start == end {
        return None;
    }

    Some((&title[..left_start], &title[left_start..]))
}

/// Recipe described by an imported program, with fresh ids.
pub fn program_to_recipe(program: &AgoProgram, now: &str) -> Recipe {
    let (film_stock, developer, dilution) = parse_expanded_title(&program.expanded_title);

    let category = if program.name == "B&W" || program.category.is_empty() {
        "BW".to_string()
    } else {
        program.category.clone()
    };

    let mut recipe = Recipe::blank(new_id(), now);
    recipe.name = format!("{}{}", program.name, program.expanded_title)
        .trim()
        .to_string();
    recipe.film_stock = film_stock;
    recipe.developer = developer;
    recipe.dilution = dilution;
    recipe.category = category;
    recipe.steps = program
        .steps
        .iter()
        .enumerate()
        .map(|(index, source)| {
            let mut step = Step::template(
                &recipe.id,
                index as i64,
                &source.name,
                TemperatureDefaults::default(),
            );
            step.time_min = source.time_min;
            step.time_sec = source.time_sec;
            step.agitation = source.agitation.clone();
            step.compensation = source.compensation.clone();
            step.min_temperature = source.min_temperature;
            step.rated_temperature = source.rated_temperature;
            step.max_temperature = source.max_temperature;
            step.formula_designator = source.formula_designator.clone();
            step.logo_text = source.logo_text.clone();
            step
        })
        .collect();

    recipe
}

fn sanitize(text: &str) -> String {
    let replaced: String = text
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();

    let mut collapsed = String::with_capacity(replaced.len());
    for c in replaced.chars() {
        if !(c == '_' && collapsed.ends_with('_')) {
            collapsed.push(c);
        }
    }
    collapsed
}

/// Export file name, `<film>_<developer>.json` with the stem cut to fit the device.
pub fn program_filename(recipe: &Recipe) -> String {
    let stem: String = sanitize(&format!("{}_{}", recipe.film_stock, recipe.developer))
        .chars()
        .take(MAX_FILENAME_STEM)
        .collect();
    format!("{stem}.json")
}

/// Human-readable program name derived from an export file name.
fn name_from_filename(filename: &str) -> String {
    let stem = filename.strip_suffix(".json").unwrap_or(filename);
    let cleaned = sanitize(stem).trim_matches('_').replace('_', " ");

    if cleaned.is_empty() {
        "Custom Program".to_string()
    } else {
        cleaned
    }
}

/// Random device-side file name for a custom program upload.
pub fn custom_program_filename() -> String {
    let token = Uuid::new_v4().simple().to_string();
    format!("_P_C0_{}.txt", &token[..8])
}

pub fn build_upload_payload(recipe: &Recipe) -> UploadPayload {
    let category = match recipe.category.trim() {
        "" => "BW".to_string(),
        category => category.to_string(),
    };

    let name = match recipe.film_stock.trim() {
        "" => name_from_filename(&program_filename(recipe)),
        film => film.to_string(),
    };

    let parts: Vec<&str> = [recipe.developer.trim(), recipe.dilution.trim()]
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect();
    let expanded_title = if parts.is_empty() {
        let existing = recipe_to_program(recipe).expanded_title;
        if existing.is_empty() || existing.starts_with('-') || existing.starts_with(" -") {
            existing
        } else {
            format!(" - {existing}")
        }
    } else {
        format!(" - {}", parts.join(" "))
    };

    let steps = recipe
        .sorted_steps()
        .into_iter()
        .map(|step| {
            let compensation = match step.compensation.trim() {
                "" => "Off",
                value => value,
            };
            let agitation = match step.agitation.trim() {
                "" => "Roll",
                value => value,
            };
            let compensated = compensation != "Off";
            let formula = step.formula_designator.trim();

            UploadStep {
                name: step.name.trim().to_string(),
                time: (step.time_min * 60 + step.time_sec).max(0),
                agitation: agitation.to_string(),
                compensation: compensation.to_string(),
                formula_designator: (!formula.is_empty()).then(|| formula.to_string()),
                min_temperature: compensated.then_some(step.min_temperature),
                max_temperature: compensated.then_some(step.max_temperature),
            }
        })
        .collect();

    UploadPayload {
        name,
        designator: "C2",
        category,
        expanded_title,
        steps,
    }
}

pub fn export_json(recipe: &Recipe) -> Result<String> {
    serde_json::to_string_pretty(&recipe_to_program(recipe)).context("failed to serialize program")
}

pub fn parse_program(json: &str) -> Result<AgoProgram> {
    serde_json::from_str(json).context("failed to parse program file")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recipe() -> Recipe {
        let mut recipe = Recipe::blank("r1".to_string(), "2024-01-01T00:00:00.000Z");
        recipe.film_stock = "Retro 400S".to_string();
        recipe.developer = "510 Pyro".to_string();
        recipe.dilution = "1+100".to_string();

        let temps = TemperatureDefaults::default();
        let mut fix = Step::template("r1", 2, "FIX", temps);
        fix.compensation = "Off".to_string();
        let mut dev = Step::template("r1", 0, "DEV", temps);
        dev.time_min = 11;
        dev.time_sec = 30;
        recipe.steps = vec![fix, dev, Step::template("r1", 1, "STOP", temps)];
        recipe
    }

    mod exchange {
        use super::*;

        #[test]
        fn program_uses_category_name_and_sorted_steps() {
            let program = recipe_to_program(&recipe());

            assert_eq!(program.name, "B&W");
            assert_eq!(program.expanded_title, "- Retro 400S 510 Pyro 1+100");
            let names: Vec<_> = program.steps.iter().map(|s| s.name.as_str()).collect();
            assert_eq!(names, ["DEV", "STOP", "FIX"]);
        }

        #[test]
        fn import_parses_title_parts() {
            let program = AgoProgram {
                category: "BW".to_string(),
                name: "B&W".to_string(),
                expanded_title: " - Retro 400S 510 Pyro 1+100".to_string(),
                steps: vec![ProgramStep {
                    name: "DEV".to_string(),
                    time_min: 9,
                    ..Default::default()
                }],
            };

            let recipe = program_to_recipe(&program, "2024-01-01T00:00:00.000Z");

            assert_eq!(recipe.name, "B&W - Retro 400S 510 Pyro 1+100");
            assert_eq!(recipe.film_stock, "Retro 400S");
            assert_eq!(recipe.developer, "510 Pyro");
            assert_eq!(recipe.dilution, "1+100");
            assert_eq!(recipe.category, "BW");
            assert_eq!(recipe.steps[0].time_min, 9);
            assert_eq!(recipe.steps[0].recipe_id, recipe.id);
        }

        #[test]
        fn unknown_developer_stays_in_film_stock() {
            assert_eq!(
                parse_expanded_title("- HP5 Plus D-76 1:1"),
                ("HP5 Plus D-76".to_string(), String::new(), "1:1".to_string())
            );
            assert_eq!(
                parse_expanded_title("Tri-X hc-110"),
                ("Tri-X".to_string(), "HC-110".to_string(), String::new())
            );
            assert_eq!(parse_expanded_title(""), (String::new(), String::new(), String::new()));
        }

        #[test]
        fn dilution_needs_digits_on_both_sides() {
            assert_eq!(split_dilution("Rodinal 1+50"), Some(("Rodinal ", "1+50")));
            assert_eq!(split_dilution("Rodinal +50"), None);
            assert_eq!(split_dilution("Rodinal 50"), None);
            assert_eq!(split_dilution("1:31"), Some(("", "1:31")));
        }

        #[test]
        fn export_is_readable_again() {
            let json = export_json(&recipe()).unwrap();
            let program = parse_program(&json).unwrap();
            assert_eq!(program.steps.len(), 3);
            assert!(parse_program("{\"name\": 1}").is_err());
        }
    }

    mod filenames {
        use super::*;

        #[test]
        fn export_name_is_sanitised_and_bounded() {
            let mut recipe = recipe();
            assert_eq!(program_filename(&recipe), "Retro_400S_510_Pyro.json");

            recipe.film_stock = "Kodak Tri-X 400 (pushed two stops)".to_string();
            let name = program_filename(&recipe);
            assert_eq!(name.len(), MAX_FILENAME_STEM + ".json".len());
            assert!(!name.contains("__"));
        }

        #[test]
        fn custom_program_name_has_device_shape() {
            let name = custom_program_filename();
            assert!(name.starts_with("_P_C0_"));
            assert!(name.ends_with(".txt"));
            assert_eq!(name.len(), "_P_C0_".len() + 8 + ".txt".len());
        }
    }

    mod upload_payload {
        use super::*;

        #[test]
        fn steps_carry_seconds_and_conditional_temperatures() {
            let payload = build_upload_payload(&recipe());

            assert_eq!(payload.name, "Retro 400S");
            assert_eq!(payload.designator, "C2");
            assert_eq!(payload.expanded_title, " - 510 Pyro 1+100");

            let dev = &payload.steps[0];
            assert_eq!(dev.time, 690);
            assert_eq!(dev.min_temperature, Some(18.0));
            assert_eq!(dev.formula_designator.as_deref(), Some("1.1.1"));

            let fix = &payload.steps[2];
            assert_eq!(fix.min_temperature, None);
            let json = serde_json::to_value(fix).unwrap();
            assert!(json.get("max_temperature").is_none());
            assert!(json.get("formula_designator").is_none());
        }

        #[test]
        fn missing_film_stock_names_program_after_file() {
            let mut recipe = recipe();
            recipe.film_stock.clear();
            recipe.developer = "Xtol".to_string();
            recipe.dilution.clear();

            let payload = build_upload_payload(&recipe);
            assert_eq!(payload.name, "Xtol");
            assert_eq!(payload.expanded_title, " - Xtol");

            recipe.developer.clear();
            assert_eq!(build_upload_payload(&recipe).name, "Custom Program");
        }
    }
}
