use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Number, Value};
use std::fmt;
use tracing::warn;

/// Identifier of the monitored site, as issued by the vendor account API.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "RawId")]
pub struct LocationId(String);

impl LocationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ids arrive as either JSON strings or numbers.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Number(serde_json::Number),
}

impl From<RawId> for String {
    fn from(raw: RawId) -> Self {
        match raw {
            RawId::Text(id) => id,
            RawId::Number(id) => id.to_string(),
        }
    }
}

impl From<RawId> for LocationId {
    fn from(raw: RawId) -> Self {
        Self(raw.into())
    }
}

fn id_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    RawId::deserialize(deserializer).map(String::from)
}

/// One entry of the account's location list. Only the id is used.
#[derive(Debug, Deserialize)]
pub struct Location {
    pub id: LocationId,
}

/// One circuit's reading inside a live `data` event.
///
/// `power` keeps the wattage exactly as the vendor sent it, so `5` goes out
/// as `5` and a missing or `null` reading goes out as `null`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CircuitReading {
    #[serde(deserialize_with = "id_text")]
    pub id: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(rename = "w", default)]
    pub power: Option<Number>,
    #[serde(default)]
    pub circuit_type: Option<String>,
}

/// Payload of a live `data` event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReadingBatch {
    #[serde(deserialize_with = "readable_circuits")]
    pub circuits: Vec<CircuitReading>,
}

/// Decode each circuit on its own; one bad entry never costs the others.
fn readable_circuits<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Vec<CircuitReading>, D::Error> {
    let entries = Vec::<Value>::deserialize(deserializer)?;
    Ok(entries
        .into_iter()
        .enumerate()
        .filter_map(|(index, entry)| match CircuitReading::deserialize(&entry) {
            Ok(reading) => Some(reading),
            Err(e) => {
                warn!(index, error = %e, "Skipping unreadable circuit");
                None
            }
        })
        .collect())
}

/// JSON body published for each circuit.
#[derive(Debug, Serialize, PartialEq)]
pub struct CircuitPayload<'a> {
    pub id: &'a str,
    pub label: Option<&'a str>,
    pub power: Option<&'a Number>,
    #[serde(rename = "type")]
    pub circuit_type: Option<&'a str>,
}

impl<'a> From<&'a CircuitReading> for CircuitPayload<'a> {
    fn from(reading: &'a CircuitReading) -> Self {
        Self {
            id: &reading.id,
            label: reading.label.as_deref(),
            power: reading.power.as_ref(),
            circuit_type: reading.circuit_type.as_deref(),
        }
    }
}

/// A message ready for the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: String,
}

impl OutboundMessage {
    /// Topic is `<base_topic>/<circuit id>`; payload is the re-projected reading.
    pub fn from_reading(base_topic: &str, reading: &CircuitReading) -> Result<Self, serde_json::Error> {
        let payload = serde_json::to_string(&CircuitPayload::from(reading))?;
        Ok(Self {
            topic: circuit_topic(base_topic, &reading.id),
            payload,
        })
    }
}

pub fn circuit_topic(base_topic: &str, circuit_id: &str) -> String {
    format!("{}/{}", base_topic.trim_end_matches('/'), circuit_id)
}
