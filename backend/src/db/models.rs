use chrono::{DateTime, NaiveDate, Utc};
use retina_shared::{DrStatus, PredictionResult, SeverityLevel};
use serde::{Deserialize, Serialize};

use crate::report::ReportSections;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("{field}: {message}")]
    Field {
        field: &'static str,
        message: &'static str,
    },
}

fn invalid(field: &'static str, message: &'static str) -> ValidationError {
    ValidationError::Field { field, message }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
    Other,
}

/// Body of `POST /create-patient`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPatient {
    pub patient_name: String,
    pub patient_id: String,
    pub date_of_birth: NaiveDate,
    pub gender: Gender,
    pub vision_problems: Option<String>,
    pub visual_acuity_right: f32,
    pub visual_acuity_left: f32,
    pub blood_sugar_fasting: Option<f32>,
    pub blood_pressure: Option<String>,
}

impl NewPatient {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.patient_name.trim().chars().count() < 2 {
            return Err(invalid("patient_name", "must be at least 2 characters"));
        }
        if self.patient_id.trim().is_empty() {
            return Err(invalid("patient_id", "must not be empty"));
        }
        if !(0.0..=1.0).contains(&self.visual_acuity_right) {
            return Err(invalid("visual_acuity_right", "must be between 0 and 1"));
        }
        if !(0.0..=1.0).contains(&self.visual_acuity_left) {
            return Err(invalid("visual_acuity_left", "must be between 0 and 1"));
        }
        if let Some(sugar) = self.blood_sugar_fasting {
            if !(sugar >= 0.0) {
                return Err(invalid("blood_sugar_fasting", "must not be negative"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patient {
    pub patient_id: String,
    pub patient_name: String,
    pub date_of_birth: NaiveDate,
    pub gender: Gender,
    pub vision_problems: Option<String>,
    pub visual_acuity_right: f32,
    pub visual_acuity_left: f32,
    pub blood_sugar_fasting: Option<f32>,
    pub blood_pressure: Option<String>,
    pub image_url: Option<String>,
    pub prediction: Option<PredictionResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Patient {
    pub fn from_new(new: NewPatient) -> Self {
        let now = Utc::now();
        Self {
            patient_id: new.patient_id.trim().to_string(),
            patient_name: new.patient_name.trim().to_string(),
            date_of_birth: new.date_of_birth,
            gender: new.gender,
            vision_problems: new.vision_problems,
            visual_acuity_right: new.visual_acuity_right,
            visual_acuity_left: new.visual_acuity_left,
            blood_sugar_fasting: new.blood_sugar_fasting,
            blood_pressure: new.blood_pressure,
            image_url: None,
            prediction: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub report_id: String,
    pub patient_id: String,
    pub patient_name: String,
    pub date_of_birth: NaiveDate,
    pub gender: Gender,
    pub vision_problems: Option<String>,
    pub visual_acuity_right: f32,
    pub visual_acuity_left: f32,
    pub blood_sugar_fasting: Option<f32>,
    pub blood_pressure: Option<String>,
    pub dr_status: DrStatus,
    pub severity_level: SeverityLevel,
    pub confidence: f32,
    #[serde(flatten)]
    pub sections: ReportSections,
    pub image_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Report {
    pub fn new(
        patient: &Patient,
        prediction: &PredictionResult,
        sections: ReportSections,
    ) -> Self {
        Self {
            report_id: uuid::Uuid::new_v4().to_string(),
            patient_id: patient.patient_id.clone(),
            patient_name: patient.patient_name.clone(),
            date_of_birth: patient.date_of_birth,
            gender: patient.gender,
            vision_problems: patient.vision_problems.clone(),
            visual_acuity_right: patient.visual_acuity_right,
            visual_acuity_left: patient.visual_acuity_left,
            blood_sugar_fasting: patient.blood_sugar_fasting,
            blood_pressure: patient.blood_pressure.clone(),
            dr_status: prediction.dr_status,
            severity_level: prediction.severity_level,
            confidence: prediction.confidence,
            sections,
            image_url: patient.image_url.clone(),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> NewPatient {
        NewPatient {
            patient_name: "Ada Lovelace".to_string(),
            patient_id: "P-001".to_string(),
            date_of_birth: NaiveDate::from_ymd_opt(1960, 12, 10).unwrap(),
            gender: Gender::Female,
            vision_problems: None,
            visual_acuity_right: 0.8,
            visual_acuity_left: 0.6,
            blood_sugar_fasting: Some(126.0),
            blood_pressure: Some("130/85".to_string()),
        }
    }

    #[test]
    fn accepts_a_complete_screening_form() {
        assert_eq!(sample().validate(), Ok(()));
    }

    #[test]
    fn rejects_out_of_range_fields() {
        let mut patient = sample();
        patient.patient_name = "A".to_string();
        assert!(matches!(
            patient.validate(),
            Err(ValidationError::Field { field: "patient_name", .. })
        ));

        let mut patient = sample();
        patient.visual_acuity_left = 1.2;
        assert!(patient.validate().is_err());

        let mut patient = sample();
        patient.blood_sugar_fasting = Some(-1.0);
        assert!(patient.validate().is_err());

        let mut patient = sample();
        patient.patient_id = "  ".to_string();
        assert!(patient.validate().is_err());
    }

    #[test]
    fn gender_must_be_a_known_value() {
        let body = serde_json::json!({
            "patient_name": "Ada",
            "patient_id": "P-1",
            "date_of_birth": "1960-12-10",
            "gender": "unknown",
            "visual_acuity_right": 0.5,
            "visual_acuity_left": 0.5
        });
        assert!(serde_json::from_value::<NewPatient>(body).is_err());
    }

    #[test]
    fn report_carries_demographics_and_prediction() {
        let patient = Patient::from_new(sample());
        let prediction = PredictionResult::from_probabilities(&[0.01, 0.02, 0.05, 0.82, 0.10]).unwrap();
        let report = Report::new(&patient, &prediction, ReportSections::default());

        assert_eq!(report.patient_id, "P-001");
        assert_eq!(report.severity_level, SeverityLevel::Severe);
        assert_eq!(report.confidence, 0.82);
        assert!(uuid::Uuid::parse_str(&report.report_id).is_ok());

        let json = serde_json::to_value(&report).unwrap();
        assert!(json.get("follow_up_plan").is_some());
        assert_eq!(json["gender"], "female");
    }
}
