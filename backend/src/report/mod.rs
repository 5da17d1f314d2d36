pub mod openai_service;

use async_trait::async_trait;
use retina_shared::PredictionResult;
use serde::{Deserialize, Serialize};

use crate::db::models::Patient;

pub use openai_service::OpenAiReportGenerator;

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("OpenAI API error: {0}")]
    Api(String),
    #[error("Malformed report content: {0}")]
    Parse(String),
}

/// The narrative sections of a screening report, in reading order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportSections {
    pub patient_medical_assessment: String,
    pub dr_status_analysis: String,
    pub classification_details: String,
    pub vulnerable_areas_analysis: String,
    pub risk_assessment: String,
    pub recommendations: String,
    pub follow_up_plan: String,
}

impl ReportSections {
    pub const KEYS: [&'static str; 7] = [
        "patient_medical_assessment",
        "dr_status_analysis",
        "classification_details",
        "vulnerable_areas_analysis",
        "risk_assessment",
        "recommendations",
        "follow_up_plan",
    ];

    pub fn entries(&self) -> [(&'static str, &str); 7] {
        [
            (Self::KEYS[0], self.patient_medical_assessment.as_str()),
            (Self::KEYS[1], self.dr_status_analysis.as_str()),
            (Self::KEYS[2], self.classification_details.as_str()),
            (Self::KEYS[3], self.vulnerable_areas_analysis.as_str()),
            (Self::KEYS[4], self.risk_assessment.as_str()),
            (Self::KEYS[5], self.recommendations.as_str()),
            (Self::KEYS[6], self.follow_up_plan.as_str()),
        ]
    }
}

#[async_trait]
pub trait ReportGenerator: Send + Sync {
    async fn generate(
        &self,
        patient: &Patient,
        prediction: &PredictionResult,
    ) -> Result<ReportSections, ReportError>;
}
