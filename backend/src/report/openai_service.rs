use async_trait::async_trait;
use reqwest::Client as HttpClient;
use retina_shared::{PredictionResult, PredictionSummary};
use serde::{Deserialize, Serialize};

use super::{ReportError, ReportGenerator, ReportSections};
use crate::db::models::Patient;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const MAX_TOKENS: u32 = 2000;
const TEMPERATURE: f32 = 0.7;

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatContent,
}

#[derive(Debug, Deserialize)]
struct ChatContent {
    content: Option<String>,
}

#[derive(Clone)]
pub struct OpenAiReportGenerator {
    http_client: HttpClient,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAiReportGenerator {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            http_client: HttpClient::new(),
            api_key,
            model,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }
}

#[async_trait]
impl ReportGenerator for OpenAiReportGenerator {
    async fn generate(
        &self,
        patient: &Patient,
        prediction: &PredictionResult,
    ) -> Result<ReportSections, ReportError> {
        let prompt = build_prompt(patient, prediction);
        let request = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: &prompt,
            }],
            max_tokens: MAX_TOKENS,
            temperature: TEMPERATURE,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        log::info!(
            "Requesting report for patient {} from {}",
            patient.patient_id,
            self.model
        );
        let response = self
            .http_client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await?;
            return Err(ReportError::Api(format!("{}: {}", status, error_text)));
        }

        let body: ChatResponse = response.json().await?;
        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ReportError::Api("response contained no message".to_string()))?;

        parse_sections(&content)
    }
}

pub fn build_prompt(patient: &Patient, prediction: &PredictionResult) -> String {
    let summary = PredictionSummary::from(prediction);
    let detailed = summary
        .detailed_predictions
        .iter()
        .map(|(level, value)| format!("{}: {}", level.label(), value))
        .collect::<Vec<_>>()
        .join(", ");

    let optional = |value: Option<String>| value.unwrap_or_else(|| "Not recorded".to_string());

    let mut prompt = String::new();
    prompt.push_str(
        "Generate a comprehensive medical report for a diabetic retinopathy case with the following details:\n",
    );
    prompt.push_str(&format!("- Patient: {}\n", patient.patient_name));
    prompt.push_str(&format!("- Date of Birth: {}\n", patient.date_of_birth));
    prompt.push_str(&format!("- Gender: {:?}\n", patient.gender));
    prompt.push_str(&format!(
        "- Vision Problems: {}\n",
        optional(patient.vision_problems.clone())
    ));
    prompt.push_str(&format!(
        "- Visual Acuity: right {:.2}, left {:.2}\n",
        patient.visual_acuity_right, patient.visual_acuity_left
    ));
    prompt.push_str(&format!(
        "- Fasting Blood Sugar: {}\n",
        optional(patient.blood_sugar_fasting.map(|v| format!("{} mg/dL", v)))
    ));
    prompt.push_str(&format!(
        "- Blood Pressure: {}\n",
        optional(patient.blood_pressure.clone())
    ));
    prompt.push_str(&format!("- DR Status: {}\n", summary.dr_status));
    prompt.push_str(&format!("- Severity Level: {}\n", summary.severity_level));
    prompt.push_str(&format!("- Confidence: {}\n", summary.confidence));
    prompt.push_str(&format!("- Detailed Predictions: {}\n\n", detailed));
    prompt.push_str(
        "Respond with a JSON object whose values are the report sections as plain text, using exactly these keys:\n",
    );
    for key in ReportSections::KEYS {
        prompt.push_str(&format!("- {}\n", key));
    }
    prompt
}

/// Missing keys become empty sections; anything that is not a JSON object is rejected.
pub fn parse_sections(content: &str) -> Result<ReportSections, ReportError> {
    let trimmed = content.trim();
    let trimmed = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();

    serde_json::from_str(trimmed).map_err(|e| ReportError::Parse(e.to_string()))
}
