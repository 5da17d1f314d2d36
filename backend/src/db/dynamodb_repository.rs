use async_trait::async_trait;
use aws_sdk_dynamodb::Client;
use aws_sdk_dynamodb::types::AttributeValue;
use chrono::{DateTime, NaiveDate, Utc};
use retina_shared::PredictionResult;
use std::collections::HashMap;

use super::models::{Gender, Patient, Report};
use super::{PatientStore, ReportStore, RepositoryError};
use crate::report::ReportSections;

type Item = HashMap<String, AttributeValue>;

#[derive(Clone)]
pub struct DynamoDbRepository {
    client: Client,
    patients_table: String,
    reports_table: String,
}

impl DynamoDbRepository {
    pub fn new(client: Client, patients_table: String, reports_table: String) -> Self {
        Self {
            client,
            patients_table,
            reports_table,
        }
    }

    /// Applies every assignment in one conditional `update_item`, so either all
    /// attributes land or none do.
    async fn set_patient_attributes(
        &self,
        patient_id: &str,
        attributes: Vec<(&str, AttributeValue)>,
    ) -> Result<(), RepositoryError> {
        let mut key = HashMap::new();
        key.insert("patient_id".to_string(), AttributeValue::S(patient_id.to_string()));

        let names: Vec<&str> = attributes.iter().map(|(name, _)| *name).collect();
        let mut request = self
            .client
            .update_item()
            .table_name(&self.patients_table)
            .set_key(Some(key))
            .update_expression(update_expression(attributes.len()))
            .condition_expression("attribute_exists(patient_id)")
            .expression_attribute_values(":updated_at", AttributeValue::S(Utc::now().to_rfc3339()));
        for (i, (name, value)) in attributes.into_iter().enumerate() {
            request = request
                .expression_attribute_names(format!("#a{}", i), name)
                .expression_attribute_values(format!(":v{}", i), value);
        }

        match request.send().await {
            Ok(_) => {
                log::info!("Updated {} for patient {}", names.join(", "), patient_id);
                Ok(())
            }
            Err(e)
                if e.as_service_error()
                    .is_some_and(|se| se.is_conditional_check_failed_exception()) =>
            {
                Err(RepositoryError::NotFound)
            }
            Err(e) => {
                log::error!(
                    "DynamoDB update_item failed for patient {}: {:?}",
                    patient_id,
                    e
                );
                Err(RepositoryError::DynamoDb(e.to_string()))
            }
        }
    }
}

/// `SET #a0 = :v0, ..., updated_at = :updated_at` for `count` placeholder pairs.
fn update_expression(count: usize) -> String {
    let assignments = (0..count)
        .map(|i| format!("#a{i} = :v{i}"))
        .chain(std::iter::once("updated_at = :updated_at".to_string()))
        .collect::<Vec<_>>()
        .join(", ");
    format!("SET {}", assignments)
}

#[async_trait]
impl PatientStore for DynamoDbRepository {
    async fn create_patient(&self, patient: &Patient) -> Result<(), RepositoryError> {
        log::info!(
            "Creating patient in DynamoDB table '{}': {}",
            self.patients_table,
            patient.patient_id
        );

        let result = self
            .client
            .put_item()
            .table_name(&self.patients_table)
            .set_item(Some(patient_to_item(patient)?))
            .condition_expression("attribute_not_exists(patient_id)")
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e)
                if e.as_service_error()
                    .is_some_and(|se| se.is_conditional_check_failed_exception()) =>
            {
                Err(RepositoryError::AlreadyExists)
            }
            Err(e) => {
                log::error!(
                    "DynamoDB put_item failed for patient {}: {:?}",
                    patient.patient_id,
                    e
                );
                Err(RepositoryError::DynamoDb(e.to_string()))
            }
        }
    }

    async fn get_patient(&self, patient_id: &str) -> Result<Option<Patient>, RepositoryError> {
        let mut key = HashMap::new();
        key.insert("patient_id".to_string(), AttributeValue::S(patient_id.to_string()));

        let result = self
            .client
            .get_item()
            .table_name(&self.patients_table)
            .set_key(Some(key))
            .send()
            .await
            .map_err(|e| RepositoryError::DynamoDb(e.to_string()))?;

        result.item.map(patient_from_item).transpose()
    }

    async fn update_image_url(&self, patient_id: &str, image_url: &str) -> Result<(), RepositoryError> {
        self.set_patient_attributes(
            patient_id,
            vec![("image_url", AttributeValue::S(image_url.to_string()))],
        )
        .await
    }

    async fn update_prediction(
        &self,
        patient_id: &str,
        prediction: &PredictionResult,
    ) -> Result<(), RepositoryError> {
        let json = serde_json::to_string(prediction)?;
        self.set_patient_attributes(patient_id, vec![("prediction", AttributeValue::S(json))])
            .await
    }

    async fn record_upload(
        &self,
        patient_id: &str,
        image_url: &str,
        prediction: &PredictionResult,
    ) -> Result<(), RepositoryError> {
        let json = serde_json::to_string(prediction)?;
        self.set_patient_attributes(
            patient_id,
            vec![
                ("image_url", AttributeValue::S(image_url.to_string())),
                ("prediction", AttributeValue::S(json)),
            ],
        )
        .await
    }
}

#[async_trait]
impl ReportStore for DynamoDbRepository {
    async fn create_report(&self, report: &Report) -> Result<(), RepositoryError> {
        log::info!(
            "Storing report {} for patient {}",
            report.report_id,
            report.patient_id
        );
        self.client
            .put_item()
            .table_name(&self.reports_table)
            .set_item(Some(report_to_item(report)?))
            .send()
            .await
            .map_err(|e| {
                log::error!("DynamoDB put_item failed for report {}: {:?}", report.report_id, e);
                RepositoryError::DynamoDb(e.to_string())
            })?;
        Ok(())
    }

    async fn get_report(&self, report_id: &str) -> Result<Option<Report>, RepositoryError> {
        let mut key = HashMap::new();
        key.insert("report_id".to_string(), AttributeValue::S(report_id.to_string()));

        let result = self
            .client
            .get_item()
            .table_name(&self.reports_table)
            .set_key(Some(key))
            .send()
            .await
            .map_err(|e| RepositoryError::DynamoDb(e.to_string()))?;

        result.item.map(report_from_item).transpose()
    }

    async fn list_reports(&self) -> Result<Vec<Report>, RepositoryError> {
        let mut reports = Vec::new();
        let mut start_key: Option<Item> = None;

        loop {
            let page = self
                .client
                .scan()
                .table_name(&self.reports_table)
                .set_exclusive_start_key(start_key.take())
                .send()
                .await
                .map_err(|e| RepositoryError::DynamoDb(e.to_string()))?;

            for item in page.items.unwrap_or_default() {
                reports.push(report_from_item(item)?);
            }

            match page.last_evaluated_key {
                Some(key) if !key.is_empty() => start_key = Some(key),
                _ => break,
            }
        }

        reports.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(reports)
    }
}

fn put_s(item: &mut Item, name: &str, value: impl Into<String>) {
    item.insert(name.to_string(), AttributeValue::S(value.into()));
}

fn put_n(item: &mut Item, name: &str, value: f32) {
    item.insert(name.to_string(), AttributeValue::N(value.to_string()));
}

fn put_opt_s(item: &mut Item, name: &str, value: Option<&String>) {
    if let Some(value) = value {
        put_s(item, name, value.clone());
    }
}

fn gender_str(gender: Gender) -> &'static str {
    match gender {
        Gender::Male => "male",
        Gender::Female => "female",
        Gender::Other => "other",
    }
}

fn get_s<'a>(item: &'a Item, name: &str) -> Result<&'a String, RepositoryError> {
    item.get(name)
        .and_then(|v| v.as_s().ok())
        .ok_or_else(|| RepositoryError::InvalidData(format!("Invalid {}", name)))
}

fn get_opt_s(item: &Item, name: &str) -> Option<String> {
    item.get(name).and_then(|v| v.as_s().ok()).cloned()
}

fn get_n(item: &Item, name: &str) -> Result<f32, RepositoryError> {
    item.get(name)
        .and_then(|v| v.as_n().ok())
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| RepositoryError::InvalidData(format!("Invalid {}", name)))
}

fn get_opt_n(item: &Item, name: &str) -> Option<f32> {
    item.get(name)
        .and_then(|v| v.as_n().ok())
        .and_then(|n| n.parse().ok())
}

fn get_date(item: &Item, name: &str) -> Result<NaiveDate, RepositoryError> {
    NaiveDate::parse_from_str(get_s(item, name)?, "%Y-%m-%d")
        .map_err(|_| RepositoryError::InvalidData(format!("Invalid {}", name)))
}

fn get_timestamp(item: &Item, name: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(get_s(item, name)?)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| RepositoryError::InvalidData(format!("Invalid {}", name)))
}

fn get_gender(item: &Item) -> Result<Gender, RepositoryError> {
    match get_s(item, "gender")?.as_str() {
        "male" => Ok(Gender::Male),
        "female" => Ok(Gender::Female),
        "other" => Ok(Gender::Other),
        other => Err(RepositoryError::InvalidData(format!("Invalid gender {}", other))),
    }
}

fn put_demographics(item: &mut Item, patient: &PatientFields<'_>) {
    put_s(item, "patient_id", patient.patient_id);
    put_s(item, "patient_name", patient.patient_name);
    put_s(item, "date_of_birth", patient.date_of_birth.format("%Y-%m-%d").to_string());
    put_s(item, "gender", gender_str(patient.gender));
    put_opt_s(item, "vision_problems", patient.vision_problems);
    put_n(item, "visual_acuity_right", patient.visual_acuity_right);
    put_n(item, "visual_acuity_left", patient.visual_acuity_left);
    if let Some(sugar) = patient.blood_sugar_fasting {
        put_n(item, "blood_sugar_fasting", sugar);
    }
    put_opt_s(item, "blood_pressure", patient.blood_pressure);
}

/// Columns shared by patient and report items.
struct PatientFields<'a> {
    patient_id: &'a str,
    patient_name: &'a str,
    date_of_birth: NaiveDate,
    gender: Gender,
    vision_problems: Option<&'a String>,
    visual_acuity_right: f32,
    visual_acuity_left: f32,
    blood_sugar_fasting: Option<f32>,
    blood_pressure: Option<&'a String>,
}

pub(crate) fn patient_to_item(patient: &Patient) -> Result<Item, RepositoryError> {
    let mut item = HashMap::new();
    put_demographics(
        &mut item,
        &PatientFields {
            patient_id: &patient.patient_id,
            patient_name: &patient.patient_name,
            date_of_birth: patient.date_of_birth,
            gender: patient.gender,
            vision_problems: patient.vision_problems.as_ref(),
            visual_acuity_right: patient.visual_acuity_right,
            visual_acuity_left: patient.visual_acuity_left,
            blood_sugar_fasting: patient.blood_sugar_fasting,
            blood_pressure: patient.blood_pressure.as_ref(),
        },
    );
    put_opt_s(&mut item, "image_url", patient.image_url.as_ref());
    if let Some(prediction) = &patient.prediction {
        put_s(&mut item, "prediction", serde_json::to_string(prediction)?);
    }
    put_s(&mut item, "created_at", patient.created_at.to_rfc3339());
    put_s(&mut item, "updated_at", patient.updated_at.to_rfc3339());
    Ok(item)
}

pub(crate) fn patient_from_item(item: Item) -> Result<Patient, RepositoryError> {
    let prediction = match get_opt_s(&item, "prediction") {
        Some(json) => Some(serde_json::from_str(&json)?),
        None => None,
    };
    let created_at = get_timestamp(&item, "created_at")?;

    Ok(Patient {
        patient_id: get_s(&item, "patient_id")?.clone(),
        patient_name: get_s(&item, "patient_name")?.clone(),
        date_of_birth: get_date(&item, "date_of_birth")?,
        gender: get_gender(&item)?,
        vision_problems: get_opt_s(&item, "vision_problems"),
        visual_acuity_right: get_n(&item, "visual_acuity_right")?,
        visual_acuity_left: get_n(&item, "visual_acuity_left")?,
        blood_sugar_fasting: get_opt_n(&item, "blood_sugar_fasting"),
        blood_pressure: get_opt_s(&item, "blood_pressure"),
        image_url: get_opt_s(&item, "image_url"),
        prediction,
        created_at,
        updated_at: get_timestamp(&item, "updated_at").unwrap_or(created_at),
    })
}

pub(crate) fn report_to_item(report: &Report) -> Result<Item, RepositoryError> {
    let mut item = HashMap::new();
    put_s(&mut item, "report_id", report.report_id.clone());
    put_demographics(
        &mut item,
        &PatientFields {
            patient_id: &report.patient_id,
            patient_name: &report.patient_name,
            date_of_birth: report.date_of_birth,
            gender: report.gender,
            vision_problems: report.vision_problems.as_ref(),
            visual_acuity_right: report.visual_acuity_right,
            visual_acuity_left: report.visual_acuity_left,
            blood_sugar_fasting: report.blood_sugar_fasting,
            blood_pressure: report.blood_pressure.as_ref(),
        },
    );
    put_s(&mut item, "dr_status", report.dr_status.to_string());
    put_s(&mut item, "severity_level", report.severity_level.to_string());
    put_n(&mut item, "confidence", report.confidence);
    for (key, text) in report.sections.entries() {
        put_s(&mut item, key, text);
    }
    put_opt_s(&mut item, "image_url", report.image_url.as_ref());
    put_s(&mut item, "created_at", report.created_at.to_rfc3339());
    Ok(item)
}

pub(crate) fn report_from_item(item: Item) -> Result<Report, RepositoryError> {
    let section = |key: &str| get_opt_s(&item, key).unwrap_or_default();
    let sections = ReportSections {
        patient_medical_assessment: section("patient_medical_assessment"),
        dr_status_analysis: section("dr_status_analysis"),
        classification_details: section("classification_details"),
        vulnerable_areas_analysis: section("vulnerable_areas_analysis"),
        risk_assessment: section("risk_assessment"),
        recommendations: section("recommendations"),
        follow_up_plan: section("follow_up_plan"),
    };

    let dr_status = get_s(&item, "dr_status")?
        .parse()
        .map_err(|_| RepositoryError::InvalidData("Invalid dr_status".to_string()))?;
    let severity_level = get_s(&item, "severity_level")?
        .parse()
        .map_err(|_| RepositoryError::InvalidData("Invalid severity_level".to_string()))?;

    Ok(Report {
        report_id: get_s(&item, "report_id")?.clone(),
        patient_id: get_s(&item, "patient_id")?.clone(),
        patient_name: get_s(&item, "patient_name")?.clone(),
        date_of_birth: get_date(&item, "date_of_birth")?,
        gender: get_gender(&item)?,
        vision_problems: get_opt_s(&item, "vision_problems"),
        visual_acuity_right: get_n(&item, "visual_acuity_right")?,
        visual_acuity_left: get_n(&item, "visual_acuity_left")?,
        blood_sugar_fasting: get_opt_n(&item, "blood_sugar_fasting"),
        blood_pressure: get_opt_s(&item, "blood_pressure"),
        dr_status,
        severity_level,
        confidence: get_n(&item, "confidence")?,
        sections,
        image_url: get_opt_s(&item, "image_url"),
        created_at: get_timestamp(&item, "created_at")?,
    })
}
