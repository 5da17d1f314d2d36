use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use strum_macros::{Display, EnumString};

pub const CLASS_COUNT: usize = 5;

/// DR severity grades, in the order the classifier emits them.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString, Serialize, Deserialize,
)]
pub enum SeverityLevel {
    #[strum(serialize = "No DR")]
    #[serde(rename = "No DR")]
    NoDr,
    #[strum(serialize = "Mild DR")]
    #[serde(rename = "Mild DR")]
    Mild,
    #[strum(serialize = "Moderate DR")]
    #[serde(rename = "Moderate DR")]
    Moderate,
    #[strum(serialize = "Severe DR")]
    #[serde(rename = "Severe DR")]
    Severe,
    #[strum(serialize = "Proliferative DR")]
    #[serde(rename = "Proliferative DR")]
    Proliferative,
}

impl SeverityLevel {
    pub const ALL: [SeverityLevel; CLASS_COUNT] = [
        SeverityLevel::NoDr,
        SeverityLevel::Mild,
        SeverityLevel::Moderate,
        SeverityLevel::Severe,
        SeverityLevel::Proliferative,
    ];

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn label(self) -> &'static str {
        LABELS[self.index()]
    }

    pub fn dr_status(self) -> DrStatus {
        match self {
            SeverityLevel::NoDr => DrStatus::Negative,
            _ => DrStatus::Positive,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
pub enum DrStatus {
    Negative,
    Positive,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DistributionError {
    #[error("expected 5 class probabilities, got {0}")]
    WrongClassCount(usize),
    #[error("probability for {label} is not in [0, 1]: {value}")]
    OutOfRange { label: &'static str, value: f32 },
}

/// Per-class probabilities keyed by severity grade.
///
/// Serializes as a JSON object with all five labels in grade order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassDistribution([f32; CLASS_COUNT]);

impl ClassDistribution {
    pub fn new(probabilities: &[f32]) -> Result<Self, DistributionError> {
        let values: [f32; CLASS_COUNT] = probabilities
            .try_into()
            .map_err(|_| DistributionError::WrongClassCount(probabilities.len()))?;
        for (level, value) in SeverityLevel::ALL.iter().zip(values) {
            if !(0.0..=1.0).contains(&value) {
                return Err(DistributionError::OutOfRange {
                    label: level.label(),
                    value,
                });
            }
        }
        Ok(Self(values))
    }

    pub fn get(&self, level: SeverityLevel) -> f32 {
        self.0[level.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (SeverityLevel, f32)> + '_ {
        SeverityLevel::ALL.iter().copied().zip(self.0.iter().copied())
    }

    /// Highest-probability grade; ties resolve to the lower grade.
    pub fn argmax(&self) -> SeverityLevel {
        let mut best = 0;
        for (index, value) in self.0.iter().enumerate().skip(1) {
            if *value > self.0[best] {
                best = index;
            }
        }
        SeverityLevel::ALL[best]
    }
}

impl Serialize for ClassDistribution {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(CLASS_COUNT))?;
        for (level, value) in self.iter() {
            map.serialize_entry(level.label(), &value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ClassDistribution {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct DistributionVisitor;

        impl<'de> Visitor<'de> for DistributionVisitor {
            type Value = ClassDistribution;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map from each severity label to its probability")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut seen: HashMap<SeverityLevel, f32> = HashMap::new();
                while let Some((label, value)) = access.next_entry::<String, f32>()? {
                    let level = SeverityLevel::from_str(&label)
                        .map_err(|_| de::Error::unknown_field(&label, &LABELS))?;
                    if seen.insert(level, value).is_some() {
                        return Err(de::Error::custom(format!("duplicate label {}", label)));
                    }
                }
                let mut values = [0.0f32; CLASS_COUNT];
                for level in SeverityLevel::ALL {
                    values[level.index()] = *seen
                        .get(&level)
                        .ok_or_else(|| de::Error::missing_field(level.label()))?;
                }
                ClassDistribution::new(&values).map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_map(DistributionVisitor)
    }
}

const LABELS: [&str; CLASS_COUNT] = [
    "No DR",
    "Mild DR",
    "Moderate DR",
    "Severe DR",
    "Proliferative DR",
];

/// Outcome of one screening, as stored on the patient record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub dr_status: DrStatus,
    pub severity_level: SeverityLevel,
    pub confidence: f32,
    pub predictions: ClassDistribution,
}

impl PredictionResult {
    pub fn from_probabilities(probabilities: &[f32]) -> Result<Self, DistributionError> {
        let predictions = ClassDistribution::new(probabilities)?;
        Ok(Self::from_distribution(predictions))
    }

    pub fn from_distribution(predictions: ClassDistribution) -> Self {
        let severity_level = predictions.argmax();
        Self {
            dr_status: severity_level.dr_status(),
            severity_level,
            confidence: predictions.get(severity_level),
            predictions,
        }
    }
}

/// Percent strings for all five grades, serialized as a map in grade order.
#[derive(Debug, Clone, PartialEq)]
pub struct PercentBreakdown([String; CLASS_COUNT]);

impl PercentBreakdown {
    pub fn get(&self, level: SeverityLevel) -> &str {
        &self.0[level.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (SeverityLevel, &str)> + '_ {
        SeverityLevel::ALL
            .iter()
            .copied()
            .zip(self.0.iter().map(String::as_str))
    }

    pub fn len(&self) -> usize {
        CLASS_COUNT
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

impl From<&ClassDistribution> for PercentBreakdown {
    fn from(distribution: &ClassDistribution) -> Self {
        Self(SeverityLevel::ALL.map(|level| format_percent(distribution.get(level))))
    }
}

impl Serialize for PercentBreakdown {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(CLASS_COUNT))?;
        for (level, value) in self.iter() {
            map.serialize_entry(level.label(), value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for PercentBreakdown {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct BreakdownVisitor;

        impl<'de> Visitor<'de> for BreakdownVisitor {
            type Value = PercentBreakdown;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map from each severity label to a percentage")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut seen: HashMap<SeverityLevel, String> = HashMap::new();
                while let Some((label, value)) = access.next_entry::<String, String>()? {
                    let level = SeverityLevel::from_str(&label)
                        .map_err(|_| de::Error::unknown_field(&label, &LABELS))?;
                    if seen.insert(level, value).is_some() {
                        return Err(de::Error::custom(format!("duplicate label {}", label)));
                    }
                }
                let mut values: [String; CLASS_COUNT] = Default::default();
                for level in SeverityLevel::ALL {
                    values[level.index()] = seen
                        .remove(&level)
                        .ok_or_else(|| de::Error::missing_field(level.label()))?;
                }
                Ok(PercentBreakdown(values))
            }
        }

        deserializer.deserialize_map(BreakdownVisitor)
    }
}

/// Percent-formatted view returned by the upload endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionSummary {
    pub dr_status: DrStatus,
    pub severity_level: SeverityLevel,
    pub confidence: String,
    pub detailed_predictions: PercentBreakdown,
}

impl From<&PredictionResult> for PredictionSummary {
    fn from(result: &PredictionResult) -> Self {
        Self {
            dr_status: result.dr_status,
            severity_level: result.severity_level,
            confidence: format_percent(result.confidence),
            detailed_predictions: PercentBreakdown::from(&result.predictions),
        }
    }
}

pub fn format_percent(probability: f32) -> String {
    format!("{:.1}%", probability * 100.0)
}
