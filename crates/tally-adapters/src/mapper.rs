//! Custom-field resolution and scoring for raw Asana tasks.
//!
//! Field names differ across locales and project templates, so semantic
//! attributes are located with an ordered table of name patterns. When more
//! than one custom field satisfies a rule, the first one in upstream field
//! order wins.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tally_core::{dedup_tags, ProjectKind, TaskRecord, TaskStatus};

use crate::{RawCustomField, RawTask};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamePattern {
    /// Trimmed, lower-cased field name equals the pattern.
    Exact(String),
    /// Lower-cased field name contains the pattern.
    Contains(String),
}

impl NamePattern {
    fn matches(&self, lowered: &str) -> bool {
        match self {
            NamePattern::Exact(p) => lowered.trim() == p.to_lowercase(),
            NamePattern::Contains(p) => lowered.contains(&p.to_lowercase()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldRule {
    patterns: Vec<NamePattern>,
}

impl FieldRule {
    pub fn new(patterns: Vec<NamePattern>) -> Self {
        Self { patterns }
    }

    pub fn contains_any(needles: &[&str]) -> Self {
        Self::new(
            needles
                .iter()
                .map(|n| NamePattern::Contains((*n).to_string()))
                .collect(),
        )
    }

    pub fn exact_any(names: &[&str]) -> Self {
        Self::new(
            names
                .iter()
                .map(|n| NamePattern::Exact((*n).to_string()))
                .collect(),
        )
    }

    pub fn or(mut self, other: FieldRule) -> Self {
        self.patterns.extend(other.patterns);
        self
    }

    pub fn matches(&self, field_name: &str) -> bool {
        let lowered = field_name.to_lowercase();
        self.patterns.iter().any(|p| p.matches(&lowered))
    }

    pub fn find<'a>(&self, fields: &'a [RawCustomField]) -> Option<&'a RawCustomField> {
        fields.iter().find(|f| self.matches(&f.name))
    }
}

fn default_progress_rule() -> FieldRule {
    FieldRule::exact_any(&["progress", "status", "trạng thái"])
}

fn default_completed_date_rule() -> FieldRule {
    FieldRule::contains_any(&["completed date", "ngày hoàn thành"])
}

fn default_done_tokens() -> Vec<String> {
    vec!["done".to_string(), "hoàn thành".to_string()]
}

/// Ranked name patterns for each semantic attribute of one project kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingRules {
    pub classification: FieldRule,
    pub quantity: FieldRule,
    /// `None` when the project kind has no secondary classification.
    #[serde(default)]
    pub secondary: Option<FieldRule>,
    #[serde(default = "default_progress_rule")]
    pub progress: FieldRule,
    #[serde(default = "default_completed_date_rule")]
    pub completed_date: FieldRule,
    #[serde(default = "default_done_tokens")]
    pub done_tokens: Vec<String>,
}

/// Point table plus mapping rules for one project kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectProfile {
    pub kind: ProjectKind,
    pub points: BTreeMap<String, f64>,
    pub rules: MappingRules,
}

impl ProjectProfile {
    pub fn for_kind(kind: ProjectKind) -> Self {
        match kind {
            ProjectKind::Creative => Self::creative(),
            ProjectKind::Graphic => Self::graphic(),
        }
    }

    pub fn creative() -> Self {
        let points = [
            ("S1", 3.0),
            ("S2A", 2.0),
            ("S2B", 2.5),
            ("S3A", 2.0),
            ("S3B", 5.0),
            ("S4", 5.0),
            ("S5", 6.0),
            ("S6", 7.0),
            ("S7", 10.0),
            ("S8", 48.0),
            ("S9A", 2.5),
            ("S9B", 4.0),
            ("S9C", 7.0),
            ("S10A", 1.0),
        ];
        Self {
            kind: ProjectKind::Creative,
            points: points.iter().map(|(k, v)| ((*k).to_string(), *v)).collect(),
            rules: MappingRules {
                classification: FieldRule::contains_any(&[
                    "video type",
                    "videotype",
                    "type",
                ]),
                quantity: FieldRule::contains_any(&["quantity", "count", "qty"]),
                secondary: Some(
                    FieldRule::exact_any(&["ctst"])
                        .or(FieldRule::contains_any(&["creative tool"])),
                ),
                progress: default_progress_rule(),
                completed_date: default_completed_date_rule(),
                done_tokens: default_done_tokens(),
            },
        }
    }

    pub fn graphic() -> Self {
        // Keys match the upstream "Asset" enum labels exactly.
        let points = [
            ("Research Doc", 12.0),
            ("ScreenShot", 24.0),
            ("Icon", 2.0),
            ("Cover, Promotional Content", 12.0),
            ("Localize Screenshot", 6.0),
            ("Localize", 6.0),
            ("Deep Localize", 24.0),
            ("Deep Localization", 24.0),
        ];
        Self {
            kind: ProjectKind::Graphic,
            points: points.iter().map(|(k, v)| ((*k).to_string(), *v)).collect(),
            rules: MappingRules {
                classification: FieldRule::contains_any(&[
                    "asset",
                    "asset type",
                    "loại asset",
                ]),
                quantity: FieldRule::contains_any(&[
                    "số lượng",
                    "quantity",
                    "count",
                    "qty",
                    "so luong",
                ]),
                secondary: None,
                progress: default_progress_rule(),
                completed_date: default_completed_date_rule(),
                done_tokens: default_done_tokens(),
            },
        }
    }

    /// `quantity × points[classification]`; 0 for a missing or unknown classification.
    pub fn score(&self, classification: Option<&str>, quantity: i32) -> f64 {
        classification
            .and_then(|c| self.points.get(c))
            .map(|points| points * f64::from(quantity.max(1)))
            .unwrap_or(0.0)
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}

/// Enum label if present, else display text.
fn field_label(field: &RawCustomField) -> Option<String> {
    non_empty(field.enum_value.as_ref().and_then(|e| e.name.as_deref()))
        .or_else(|| non_empty(field.display_value.as_deref()))
}

fn field_quantity(field: &RawCustomField) -> i32 {
    let numeric = field.number_value.or_else(|| {
        field
            .display_value
            .as_deref()
            .and_then(|v| v.trim().parse::<f64>().ok())
    });
    match numeric {
        Some(n) if n.is_finite() && n >= 1.0 => {
            let floored = n.floor();
            if floored >= f64::from(i32::MAX) {
                i32::MAX
            } else {
                floored as i32
            }
        }
        _ => 1,
    }
}

fn parse_completed_date(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

impl MappingRules {
    fn is_progress_done(&self, fields: &[RawCustomField]) -> bool {
        let Some(value) = self.progress.find(fields).and_then(field_label) else {
            return false;
        };
        let value = value.to_lowercase();
        self.done_tokens.iter().any(|t| t.to_lowercase() == value)
    }
}

/// Normalize one raw task for `profile`. `now` stamps `updated_at` and is the
/// completion time of a done task that carries no timestamp of its own.
pub fn map_task(raw: &RawTask, profile: &ProjectProfile, now: DateTime<Utc>) -> TaskRecord {
    let rules = &profile.rules;
    let fields = raw.custom_fields.as_slice();

    let classification = rules.classification.find(fields).and_then(field_label);
    let quantity = rules.quantity.find(fields).map(field_quantity).unwrap_or(1);
    let secondary_classification = rules
        .secondary
        .as_ref()
        .and_then(|rule| rule.find(fields))
        .and_then(field_label);

    let done = raw.completed || rules.is_progress_done(fields);

    let completed_at = match raw.completed_at {
        Some(ts) => Some(ts),
        None if done => Some(
            rules
                .completed_date
                .find(fields)
                .and_then(|f| f.display_value.as_deref())
                .and_then(parse_completed_date)
                .unwrap_or(now),
        ),
        None => None,
    };

    let score = profile.score(classification.as_deref(), quantity);

    TaskRecord {
        external_id: raw.gid.clone(),
        project_kind: profile.kind,
        name: raw.name.clone().unwrap_or_default(),
        description: non_empty(raw.notes.as_deref()),
        assignee_name: raw.assignee.as_ref().and_then(|a| non_empty(a.name.as_deref())),
        assignee_email: raw.assignee.as_ref().and_then(|a| non_empty(a.email.as_deref())),
        status: if done { TaskStatus::Done } else { TaskStatus::NotDone },
        completed_at,
        due_date: raw.due_on,
        classification,
        quantity,
        score,
        secondary_classification,
        tags: dedup_tags(raw.tags.iter().filter_map(|t| non_empty(t.name.as_deref()))),
        raw_snapshot: raw.raw.clone(),
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 9, 30, 0).unwrap()
    }

    fn task(value: serde_json::Value) -> RawTask {
        RawTask::from_value(value).unwrap()
    }

    #[test]
    fn quantity_times_points_and_progress_done() {
        let raw = task(json!({
            "gid": "1201",
            "name": "Launch teaser",
            "completed": false,
            "completed_at": null,
            "due_on": "2026-03-08",
            "custom_fields": [
                { "name": "Video Type", "enum_value": { "name": "S5" }, "display_value": "S5" },
                { "name": "Quantity", "number_value": 2.0, "display_value": "2" },
                { "name": "Progress", "enum_value": { "name": "Done" } }
            ],
            "tags": [{ "name": "launch" }]
        }));

        let record = map_task(&raw, &ProjectProfile::creative(), now());

        assert_eq!(record.classification.as_deref(), Some("S5"));
        assert_eq!(record.quantity, 2);
        assert_eq!(record.score, 12.0);
        assert_eq!(record.status, TaskStatus::Done);
        assert_eq!(record.completed_at, Some(now()));
        assert_eq!(record.due_date, NaiveDate::from_ymd_opt(2026, 3, 8));
        assert_eq!(record.tags, vec!["launch"]);
        assert_eq!(record.raw_snapshot["gid"], "1201");
    }

    #[test]
    fn native_completion_wins_even_when_progress_disagrees() {
        let raw = task(json!({
            "gid": "7",
            "name": "Cutdown",
            "completed": true,
            "completed_at": "2026-03-02T11:00:00.000Z",
            "custom_fields": [{ "name": "Status", "display_value": "In progress" }]
        }));

        let record = map_task(&raw, &ProjectProfile::creative(), now());

        assert_eq!(record.status, TaskStatus::Done);
        assert_eq!(
            record.completed_at,
            Some(Utc.with_ymd_and_hms(2026, 3, 2, 11, 0, 0).unwrap())
        );
    }

    #[test]
    fn localized_progress_and_completed_date_field() {
        let raw = task(json!({
            "gid": "8",
            "name": "Banner",
            "completed": false,
            "custom_fields": [
                { "name": " Trạng thái ", "display_value": "Hoàn thành" },
                { "name": "Ngày hoàn thành", "display_value": "2026-03-04" },
                { "name": "Asset", "enum_value": { "name": "Icon" } },
                { "name": "Số lượng", "number_value": 3 }
            ]
        }));

        let record = map_task(&raw, &ProjectProfile::graphic(), now());

        assert_eq!(record.status, TaskStatus::Done);
        assert_eq!(
            record.completed_at,
            Some(Utc.with_ymd_and_hms(2026, 3, 4, 0, 0, 0).unwrap())
        );
        assert_eq!(record.score, 6.0);
        assert_eq!(record.project_kind, ProjectKind::Graphic);
    }

    #[test]
    fn not_done_task_has_no_completion_time() {
        let raw = task(json!({ "gid": "9", "name": "Draft", "completed": false }));
        let record = map_task(&raw, &ProjectProfile::creative(), now());
        assert_eq!(record.status, TaskStatus::NotDone);
        assert_eq!(record.completed_at, None);
        assert_eq!(record.quantity, 1);
        assert_eq!(record.score, 0.0);
    }

    #[test]
    fn quantity_is_floored_and_clamped_to_one() {
        let profile = ProjectProfile::creative();
        let zero = task(json!({
            "gid": "1",
            "custom_fields": [
                { "name": "Video type", "display_value": "S1" },
                { "name": "Qty", "number_value": 0 }
            ]
        }));
        let fractional = task(json!({
            "gid": "2",
            "custom_fields": [
                { "name": "Video type", "display_value": "S2B" },
                { "name": "Count", "number_value": 3.7 }
            ]
        }));

        let zero = map_task(&zero, &profile, now());
        let fractional = map_task(&fractional, &profile, now());

        assert_eq!(zero.quantity, 1);
        assert_eq!(zero.score, 3.0);
        assert_eq!(fractional.quantity, 3);
        assert_eq!(fractional.score, 7.5);
    }

    #[test]
    fn unknown_classification_scores_zero() {
        let raw = task(json!({
            "gid": "3",
            "custom_fields": [
                { "name": "Video Type", "enum_value": { "name": "S99" } },
                { "name": "Quantity", "number_value": 4 }
            ]
        }));
        let record = map_task(&raw, &ProjectProfile::creative(), now());
        assert_eq!(record.classification.as_deref(), Some("S99"));
        assert_eq!(record.score, 0.0);
    }

    #[test]
    fn first_matching_field_in_source_order_wins() {
        let raw = task(json!({
            "gid": "4",
            "custom_fields": [
                { "name": "Deliverable type", "display_value": "S7" },
                { "name": "Video Type", "display_value": "S1" }
            ]
        }));
        let record = map_task(&raw, &ProjectProfile::creative(), now());
        assert_eq!(record.classification.as_deref(), Some("S7"));
    }

    #[test]
    fn secondary_classification_only_for_kinds_that_define_it() {
        let raw = task(json!({
            "gid": "5",
            "custom_fields": [
                { "name": "CTST", "enum_value": { "name": "After Effects" } },
                { "name": "Asset", "enum_value": { "name": "ScreenShot" } }
            ]
        }));

        let creative = map_task(&raw, &ProjectProfile::creative(), now());
        let graphic = map_task(&raw, &ProjectProfile::graphic(), now());

        assert_eq!(creative.secondary_classification.as_deref(), Some("After Effects"));
        assert_eq!(graphic.secondary_classification, None);
        assert_eq!(graphic.score, 24.0);
    }

    #[test]
    fn secondary_matches_creative_tool_substring_but_not_loose_ctst() {
        let rule = ProjectProfile::creative().rules.secondary.unwrap();
        assert!(rule.matches("Creative Tool Used"));
        assert!(rule.matches(" CTST "));
        assert!(!rule.matches("CTST notes"));
    }

    #[test]
    fn empty_labels_fall_back_to_display_text() {
        let raw = task(json!({
            "gid": "6",
            "custom_fields": [
                { "name": "Video Type", "enum_value": { "name": "" }, "display_value": "S4" }
            ]
        }));
        let record = map_task(&raw, &ProjectProfile::creative(), now());
        assert_eq!(record.classification.as_deref(), Some("S4"));
        assert_eq!(record.score, 5.0);
    }

    #[test]
    fn rules_load_from_yaml_shape() {
        let rules: MappingRules = serde_json::from_value(json!({
            "classification": [{ "contains": "format" }],
            "quantity": [{ "exact": "pieces" }]
        }))
        .unwrap();
        assert!(rules.classification.matches("Ad Format"));
        assert!(rules.quantity.matches("Pieces"));
        assert!(rules.secondary.is_none());
        assert_eq!(rules.done_tokens, default_done_tokens());
    }
}
