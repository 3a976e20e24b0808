//! Black box query protocol
//!
//! Every message is a JSON document with a `header` and a `payload`:
//!
//! | Query               | Request payload                               | Response payload                        |
//! |---------------------|-----------------------------------------------|-----------------------------------------|
//! | `VARIABLE-QUERY`    | `blackBoxId`, `senderId`                      | `variableList: [[name, ...], ...]`      |
//! | `LATEST-DATA-QUERY` | `blackBoxId`, `senderId`, `variables`         | `dataList: {name: "(t, v)"}`            |
//! | `DATA-QUERY`        | ... plus `startTime` (inclusive), `endTime`   | `dataList: {name: ["(t, v)", ...]}`     |
//!
//! Responses echo the query type in `header.type` and address the asking
//! node through `payload.receiverId`.

use crate::error::{DataFeedError, Result};
use crate::types::SamplePoint;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// `endTime` value meaning "up to now"
pub const OPEN_END_TIME: &str = "-1";

/// Kind of query, carried in `header.type`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    /// Catalog of variable names
    Variables,
    /// Latest sample of each requested variable
    LatestData,
    /// All samples since a start time
    Data,
}

impl QueryKind {
    /// Wire tag of the query kind
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryKind::Variables => "VARIABLE-QUERY",
            QueryKind::LatestData => "LATEST-DATA-QUERY",
            QueryKind::Data => "DATA-QUERY",
        }
    }
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueryKind {
    type Err = DataFeedError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "VARIABLE-QUERY" => Ok(QueryKind::Variables),
            "LATEST-DATA-QUERY" => Ok(QueryKind::LatestData),
            "DATA-QUERY" => Ok(QueryKind::Data),
            other => Err(DataFeedError::MalformedResponse(format!(
                "unknown message type '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Header {
    #[serde(rename = "type")]
    kind: String,
    #[serde(rename = "msgId", default, skip_serializing_if = "Option::is_none")]
    msg_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope<P> {
    header: Header,
    payload: P,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryPayload {
    #[serde(default)]
    black_box_id: String,
    #[serde(default)]
    sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    start_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    end_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    variables: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponsePayload {
    #[serde(default)]
    receiver_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    variable_list: Option<Vec<Vec<String>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data_list: Option<Map<String, Value>>,
}

// ==================== Requests ====================

/// An outgoing (or received) query
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Query kind
    pub kind: QueryKind,
    /// Message id used to match the response
    pub msg_id: String,
    /// Source the query is addressed to
    pub source_id: String,
    /// Node expecting the response
    pub sender_id: String,
    /// Inclusive start bound (window queries)
    pub start_time: Option<f64>,
    /// Requested variables (latest and window queries)
    pub variables: Vec<String>,
}

impl Request {
    fn new(kind: QueryKind, source_id: &str, sender_id: &str) -> Self {
        Self {
            kind,
            msg_id: uuid::Uuid::new_v4().to_string(),
            source_id: source_id.to_string(),
            sender_id: sender_id.to_string(),
            start_time: None,
            variables: Vec::new(),
        }
    }

    /// Ask for the variable catalog
    pub fn variables(source_id: &str, sender_id: &str) -> Self {
        Self::new(QueryKind::Variables, source_id, sender_id)
    }

    /// Ask for the latest sample of each variable
    pub fn latest_data(source_id: &str, sender_id: &str, variables: &[String]) -> Self {
        Self {
            variables: variables.to_vec(),
            ..Self::new(QueryKind::LatestData, source_id, sender_id)
        }
    }

    /// Ask for every sample at or after `start_time`
    pub fn data(source_id: &str, sender_id: &str, start_time: f64, variables: &[String]) -> Self {
        Self {
            start_time: Some(start_time),
            variables: variables.to_vec(),
            ..Self::new(QueryKind::Data, source_id, sender_id)
        }
    }

    /// Encode the request as a JSON message
    pub fn to_json(&self) -> Result<String> {
        let envelope = Envelope {
            header: Header {
                kind: self.kind.as_str().to_string(),
                msg_id: Some(self.msg_id.clone()),
            },
            payload: QueryPayload {
                black_box_id: self.source_id.clone(),
                sender_id: self.sender_id.clone(),
                start_time: self.start_time,
                end_time: (self.kind == QueryKind::Data).then(|| OPEN_END_TIME.to_string()),
                variables: (self.kind != QueryKind::Variables).then(|| self.variables.clone()),
            },
        };
        Ok(serde_json::to_string(&envelope)?)
    }

    /// Decode a query heard on the bus
    pub fn parse(raw: &str) -> Result<Self> {
        let envelope: Envelope<QueryPayload> = serde_json::from_str(raw)
            .map_err(|e| DataFeedError::MalformedResponse(e.to_string()))?;
        let kind = envelope.header.kind.parse()?;
        Ok(Self {
            kind,
            msg_id: envelope.header.msg_id.unwrap_or_default(),
            source_id: envelope.payload.black_box_id,
            sender_id: envelope.payload.sender_id,
            start_time: envelope.payload.start_time,
            variables: envelope.payload.variables.unwrap_or_default(),
        })
    }
}

// ==================== Responses ====================

/// A response addressed to this node
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Variable catalog, in the groups the source reported
    Catalog(Vec<Vec<String>>),
    /// Latest sample per variable
    Latest {
        msg_id: Option<String>,
        data: Vec<(String, SamplePoint)>,
    },
    /// Samples per variable since the requested start time
    Window {
        msg_id: Option<String>,
        data: Vec<(String, Vec<SamplePoint>)>,
    },
}

impl Response {
    /// The response kind
    pub fn kind(&self) -> QueryKind {
        match self {
            Response::Catalog(_) => QueryKind::Variables,
            Response::Latest { .. } => QueryKind::LatestData,
            Response::Window { .. } => QueryKind::Data,
        }
    }

    /// Message id echoed by the source, if any
    pub fn msg_id(&self) -> Option<&str> {
        match self {
            Response::Catalog(_) => None,
            Response::Latest { msg_id, .. } | Response::Window { msg_id, .. } => msg_id.as_deref(),
        }
    }

    /// Flat list of catalog names
    pub fn catalog_names(&self) -> Vec<String> {
        match self {
            Response::Catalog(groups) => groups.iter().flatten().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Decode a message heard on the bus
    ///
    /// Returns `Ok(None)` when the message is addressed to another node or
    /// carries no `receiverId` (queries from other nodes). Malformed
    /// messages are errors; individual malformed samples are dropped.
    pub fn parse(raw: &str, receiver_id: &str) -> Result<Option<Self>> {
        let envelope: Envelope<ResponsePayload> = serde_json::from_str(raw)
            .map_err(|e| DataFeedError::MalformedResponse(e.to_string()))?;

        match envelope.payload.receiver_id.as_deref() {
            Some(id) if id == receiver_id => {}
            _ => return Ok(None),
        }

        let msg_id = envelope.header.msg_id;
        let response = match envelope.header.kind.parse::<QueryKind>()? {
            QueryKind::Variables => Response::Catalog(
                envelope
                    .payload
                    .variable_list
                    .ok_or_else(|| missing("variableList"))?,
            ),
            QueryKind::LatestData => {
                let list = envelope.payload.data_list.ok_or_else(|| missing("dataList"))?;
                let data = list
                    .into_iter()
                    .filter_map(|(name, sample)| {
                        let point = parse_sample_value(&sample)?;
                        Some((name, point))
                    })
                    .collect();
                Response::Latest { msg_id, data }
            }
            QueryKind::Data => {
                let list = envelope.payload.data_list.ok_or_else(|| missing("dataList"))?;
                let data = list
                    .into_iter()
                    .map(|(name, samples)| {
                        let points = match samples {
                            Value::Array(items) => {
                                items.iter().filter_map(parse_sample_value).collect()
                            }
                            other => {
                                tracing::trace!("Dropping non-list samples for '{}': {}", name, other);
                                Vec::new()
                            }
                        };
                        (name, points)
                    })
                    .collect();
                Response::Window { msg_id, data }
            }
        };
        Ok(Some(response))
    }

    /// Encode a response addressed to `receiver_id`
    pub fn to_json(&self, receiver_id: &str) -> Result<String> {
        let mut payload = ResponsePayload {
            receiver_id: Some(receiver_id.to_string()),
            ..Default::default()
        };
        match self {
            Response::Catalog(groups) => payload.variable_list = Some(groups.clone()),
            Response::Latest { data, .. } => {
                payload.data_list = Some(
                    data.iter()
                        .map(|(name, p)| (name.clone(), Value::String(format_sample(p))))
                        .collect(),
                );
            }
            Response::Window { data, .. } => {
                payload.data_list = Some(
                    data.iter()
                        .map(|(name, points)| {
                            let samples = points
                                .iter()
                                .map(|p| Value::String(format_sample(p)))
                                .collect();
                            (name.clone(), Value::Array(samples))
                        })
                        .collect(),
                );
            }
        }
        let envelope = Envelope {
            header: Header {
                kind: self.kind().as_str().to_string(),
                msg_id: self.msg_id().map(str::to_string),
            },
            payload,
        };
        Ok(serde_json::to_string(&envelope)?)
    }
}

fn missing(field: &str) -> DataFeedError {
    DataFeedError::MalformedResponse(format!("response without '{}'", field))
}

fn parse_sample_value(value: &Value) -> Option<SamplePoint> {
    let text = value.as_str()?;
    match parse_sample(text) {
        Ok(point) => Some(point),
        Err(e) => {
            tracing::trace!("Dropping sample: {}", e);
            None
        }
    }
}

/// Encode a sample as `"(t, v)"`
pub fn format_sample(point: &SamplePoint) -> String {
    format!("({}, {})", point.timestamp, point.value)
}

/// Decode a `"(t, v)"` sample; whitespace around the numbers is optional
pub fn parse_sample(text: &str) -> Result<SamplePoint> {
    let malformed = || DataFeedError::MalformedResponse(format!("bad sample '{}'", text));
    let inner = text
        .trim()
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(malformed)?;
    let (t, v) = inner.split_once(',').ok_or_else(malformed)?;
    let timestamp: f64 = t.trim().parse().map_err(|_| malformed())?;
    let value: f64 = v.trim().parse().map_err(|_| malformed())?;
    if !timestamp.is_finite() {
        return Err(malformed());
    }
    Ok(SamplePoint::new(timestamp, value))
}
