//! Maps raw AI output onto [`CanonicalResume`].
//!
//! The extraction service is loosely typed: keys drift between camelCase and
//! snake_case, contact fields sometimes sit at the top level, skills arrive
//! as strings or `{name}` objects. Missing sections become empty; a section
//! that is present with the wrong shape rejects the whole record.

use serde_json::{Map, Value};

use crate::ai::RawFields;
use crate::errors::ParsingError;
use crate::models::resume::{CanonicalResume, ContactInfo, Education, WorkExperience};

const CONTACT_KEYS: &[&str] = &["contactInfo", "contact_info", "contact"];
const SKILLS_KEYS: &[&str] = &["skills"];
const WORK_KEYS: &[&str] = &["workExperience", "work_experience", "experience"];
const EDUCATION_KEYS: &[&str] = &["education"];

/// Section weights for the confidence score. Contact is split between
/// identity (name) and reachability (email or phone).
const NAME_WEIGHT: f64 = 0.15;
const REACHABILITY_WEIGHT: f64 = 0.15;
const SKILLS_WEIGHT: f64 = 0.20;
const WORK_WEIGHT: f64 = 0.35;
const EDUCATION_WEIGHT: f64 = 0.15;

#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub resume: CanonicalResume,
    /// 0.0 to 1.0, rounded to two decimals.
    pub confidence: f64,
}

pub fn normalize(raw: &RawFields) -> Result<Normalized, ParsingError> {
    let contact_info = match lookup(raw, CONTACT_KEYS) {
        Some(Value::Object(contact)) => contact_from(contact),
        Some(Value::Null) | None => contact_from(raw),
        Some(other) => return Err(wrong_shape("contactInfo", "an object", other)),
    };

    let skills = match lookup(raw, SKILLS_KEYS) {
        Some(Value::Array(items)) => items.iter().filter_map(skill_from).collect(),
        Some(Value::String(list)) => split_list(list),
        Some(Value::Null) | None => Vec::new(),
        Some(other) => return Err(wrong_shape("skills", "an array", other)),
    };

    let work_experience = objects(raw, WORK_KEYS, "workExperience")?
        .into_iter()
        .map(work_from)
        .filter(|w| w.company.is_some() || w.position.is_some())
        .collect();

    let education = objects(raw, EDUCATION_KEYS, "education")?
        .into_iter()
        .map(education_from)
        .filter(|e| e.institution.is_some() || e.degree.is_some())
        .collect();

    let resume = CanonicalResume {
        contact_info,
        skills,
        work_experience,
        education,
    };

    if resume.contact_info.is_empty()
        && resume.skills.is_empty()
        && resume.work_experience.is_empty()
        && resume.education.is_empty()
    {
        return Err(ParsingError::FieldMapping(
            "AI output contained no recognizable résumé fields".to_string(),
        ));
    }

    let confidence = confidence(&resume);
    Ok(Normalized { resume, confidence })
}

pub fn confidence(resume: &CanonicalResume) -> f64 {
    let contact = &resume.contact_info;
    let mut score = 0.0;
    if contact.name.is_some() {
        score += NAME_WEIGHT;
    }
    if contact.email.is_some() || contact.phone.is_some() {
        score += REACHABILITY_WEIGHT;
    }
    if !resume.skills.is_empty() {
        score += SKILLS_WEIGHT;
    }
    if !resume.work_experience.is_empty() {
        score += WORK_WEIGHT;
    }
    if !resume.education.is_empty() {
        score += EDUCATION_WEIGHT;
    }
    (score * 100.0).round() / 100.0
}

fn lookup<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| map.get(*k))
}

fn wrong_shape(field: &str, expected: &str, got: &Value) -> ParsingError {
    let got = match got {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    };
    ParsingError::FieldMapping(format!("{field} must be {expected}, got {got}"))
}

fn objects<'a>(
    raw: &'a RawFields,
    keys: &[&str],
    field: &str,
) -> Result<Vec<&'a Map<String, Value>>, ParsingError> {
    match lookup(raw, keys) {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::Object(obj) => Ok(obj),
                other => Err(wrong_shape(&format!("{field} entries"), "objects", other)),
            })
            .collect(),
        Some(Value::Null) | None => Ok(Vec::new()),
        Some(other) => Err(wrong_shape(field, "an array", other)),
    }
}

/// Non-empty trimmed string, accepting numbers (GPAs, years) as text.
fn text(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    match lookup(map, keys)? {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn strings(map: &Map<String, Value>, keys: &[&str]) -> Vec<String> {
    match lookup(map, keys) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Some(Value::String(list)) => split_list(list),
        _ => Vec::new(),
    }
}

fn split_list(list: &str) -> Vec<String> {
    list.split([',', ';'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn skill_from(value: &Value) -> Option<String> {
    let name = match value {
        Value::String(s) => s.as_str(),
        Value::Object(obj) => obj.get("name").and_then(Value::as_str)?,
        _ => return None,
    };
    Some(name.trim().to_string()).filter(|s| !s.is_empty())
}

fn contact_from(map: &Map<String, Value>) -> ContactInfo {
    ContactInfo {
        name: text(map, &["name", "fullName", "full_name"]),
        email: text(map, &["email"]),
        phone: text(map, &["phone", "phoneNumber", "phone_number"]),
        location: text(map, &["location", "address"]),
        linkedin: text(map, &["linkedin", "linkedIn", "linkedinUrl"]),
        website: text(map, &["website", "portfolio", "url"]),
    }
}

fn work_from(map: &Map<String, Value>) -> WorkExperience {
    WorkExperience {
        company: text(map, &["company", "employer", "organization"]),
        position: text(map, &["position", "title", "role"]),
        start_date: text(map, &["startDate", "start_date"]),
        end_date: text(map, &["endDate", "end_date"]),
        description: text(map, &["description", "summary"]),
        achievements: strings(map, &["achievements", "highlights"]),
        technologies: strings(map, &["technologies", "tech", "stack"]),
    }
}

fn education_from(map: &Map<String, Value>) -> Education {
    Education {
        institution: text(map, &["institution", "school", "university"]),
        degree: text(map, &["degree"]),
        field_of_study: text(map, &["fieldOfStudy", "field_of_study", "field", "major"]),
        start_date: text(map, &["startDate", "start_date"]),
        end_date: text(map, &["endDate", "end_date", "graduationDate"]),
        gpa: text(map, &["gpa", "GPA"]),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn raw(value: Value) -> RawFields {
        match value {
            Value::Object(map) => map,
            _ => panic!("test input must be an object"),
        }
    }

    #[test]
    fn test_flat_output_fills_missing_sections() {
        let out = normalize(&raw(json!({"name": "Jane Doe", "skills": ["Go"]}))).unwrap();
        assert_eq!(out.resume.contact_info.name.as_deref(), Some("Jane Doe"));
        assert_eq!(out.resume.skills, vec!["Go"]);
        assert!(out.resume.work_experience.is_empty());
        assert!(out.resume.education.is_empty());
        assert_eq!(out.confidence, 0.35);
    }

    #[test]
    fn test_nested_and_aliased_fields() {
        let out = normalize(&raw(json!({
            "contact_info": {"fullName": "Jane Doe", "email": "jane@example.com"},
            "skills": [{"name": "Rust"}, " Go ", "", 7],
            "experience": [
                {"employer": "Acme", "title": "Engineer", "highlights": ["Shipped"], "tech": "Go, Rust"},
                {"description": "no company or title"}
            ],
            "education": [{"school": "MIT", "major": "CS", "gpa": 3.9}]
        })))
        .unwrap();

        let resume = out.resume;
        assert_eq!(resume.contact_info.email.as_deref(), Some("jane@example.com"));
        assert_eq!(resume.skills, vec!["Rust", "Go"]);
        assert_eq!(resume.work_experience.len(), 1);
        assert_eq!(resume.work_experience[0].company.as_deref(), Some("Acme"));
        assert_eq!(resume.work_experience[0].technologies, vec!["Go", "Rust"]);
        assert_eq!(resume.education[0].field_of_study.as_deref(), Some("CS"));
        assert_eq!(resume.education[0].gpa.as_deref(), Some("3.9"));
        assert_eq!(out.confidence, 1.0);
    }

    #[test]
    fn test_wrong_shapes_are_rejected() {
        for bad in [
            json!({"name": "Jane", "skills": 42}),
            json!({"name": "Jane", "workExperience": {"company": "Acme"}}),
            json!({"name": "Jane", "education": ["MIT"]}),
            json!({"contactInfo": "Jane Doe"}),
        ] {
            let err = normalize(&raw(bad.clone())).unwrap_err();
            assert_eq!(err.name(), "FieldMappingFailure", "{bad}");
        }
    }

    #[test]
    fn test_empty_output_is_rejected() {
        let err = normalize(&raw(json!({"skills": [], "unrelated": true}))).unwrap_err();
        assert!(matches!(err, ParsingError::FieldMapping(_)));
    }
}
