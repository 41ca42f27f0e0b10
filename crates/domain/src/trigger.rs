//! Trigger — the bitmask-typed host event delivered once per invocation.
//!
//! A trigger selects zero or more independent dispatch branches; all
//! selected branches execute in the fixed order of
//! [`TriggerKinds::DISPATCH_ORDER`]. Triggers are rebuilt fresh by the host
//! for every invocation and are persisted only while parked in the
//! readiness queue.

use serde::{Deserialize, Serialize};

use crate::access::AccessSnapshot;
use crate::id::{DeviceId, LocationId};
use crate::location::Mode;
use crate::measurement::MeasurementRecord;

/// Datastream address that means "run all location schedules" instead of
/// an ordinary addressed delivery.
pub const SCHEDULE_ADDRESS: &str = "schedule";

/// Bitmask of trigger branches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TriggerKinds(u32);

impl TriggerKinds {
    pub const SCHEDULE: Self = Self(1);
    pub const MODE: Self = Self(1 << 1);
    pub const MEASUREMENT: Self = Self(1 << 2);
    pub const DEVICE_ALERT: Self = Self(1 << 3);
    pub const FILE_UPLOAD: Self = Self(1 << 4);
    pub const QUESTION_ANSWERED: Self = Self(1 << 5);
    pub const DATASTREAM: Self = Self(1 << 6);
    pub const COMMAND_RESPONSE: Self = Self(1 << 7);
    pub const METADATA: Self = Self(1 << 8);
    pub const LOCATION_CONFIG: Self = Self(1 << 9);
    pub const DATA_REQUEST: Self = Self(1 << 10);

    /// The fixed, non-exclusive execution order of all branches.
    pub const DISPATCH_ORDER: [Self; 11] = [
        Self::SCHEDULE,
        Self::MODE,
        Self::MEASUREMENT,
        Self::DEVICE_ALERT,
        Self::FILE_UPLOAD,
        Self::QUESTION_ANSWERED,
        Self::DATASTREAM,
        Self::COMMAND_RESPONSE,
        Self::METADATA,
        Self::LOCATION_CONFIG,
        Self::DATA_REQUEST,
    ];

    /// The empty mask.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether every bit of `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// The mask with the bits of `other` added.
    #[must_use]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// The mask with the bits of `other` removed.
    #[must_use]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// The set branches, in dispatch order.
    pub fn iter(self) -> impl Iterator<Item = Self> {
        Self::DISPATCH_ORDER
            .into_iter()
            .filter(move |kind| self.contains(*kind))
    }

    /// Stable branch name, used in logs and reports.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::SCHEDULE => "schedule",
            Self::MODE => "mode",
            Self::MEASUREMENT => "measurement",
            Self::DEVICE_ALERT => "device_alert",
            Self::FILE_UPLOAD => "file_upload",
            Self::QUESTION_ANSWERED => "question_answered",
            Self::DATASTREAM => "datastream",
            Self::COMMAND_RESPONSE => "command_response",
            Self::METADATA => "metadata",
            Self::LOCATION_CONFIG => "location_config",
            Self::DATA_REQUEST => "data_request",
            _ => "combined",
        }
    }
}

impl std::ops::BitOr for TriggerKinds {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.with(rhs)
    }
}

impl std::fmt::Display for TriggerKinds {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let mut first = true;
        for kind in self.iter() {
            if !first {
                f.write_str("|")?;
            }
            f.write_str(kind.name())?;
            first = false;
        }
        Ok(())
    }
}

/// Mode change for one location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeChange {
    pub location_id: LocationId,
    pub mode: Mode,
}

/// Alert raised by a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRecord {
    pub device_id: DeviceId,
    pub alert_type: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// File uploaded on behalf of a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub device_id: DeviceId,
    pub file_id: String,
    pub name: String,
    #[serde(default)]
    pub content_type: String,
}

/// Answer to a question previously posed to a location's residents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionAnswer {
    pub location_id: LocationId,
    pub question_id: String,
    pub answer: serde_json::Value,
}

/// Addressed message arriving over the data stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatastreamMessage {
    pub address: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Response to a previously sent device command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    pub device_id: DeviceId,
    pub name: String,
    #[serde(default)]
    pub value: serde_json::Value,
    pub success: bool,
}

/// Configuration change for one location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationConfigChange {
    pub location_id: LocationId,
    #[serde(default)]
    pub settings: serde_json::Value,
}

/// Role change for a user or call-center operator of a location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleChange {
    pub location_id: LocationId,
    pub user_id: String,
    pub role: String,
}

/// Encoding of an opaque request payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadEncoding {
    #[default]
    None,
    Gzip,
}

/// Opaque request payload, base64-transported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedPayload {
    #[serde(default)]
    pub encoding: PayloadEncoding,
    /// Base64-encoded bytes.
    pub data: String,
}

/// Asynchronous data-export request.
///
/// Handled standalone: bypasses the readiness queue and never causes a
/// core-state persistence write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataRequest {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_id: Option<LocationId>,
    /// Parameters to include; empty means all.
    #[serde(default)]
    pub parameters: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<EncodedPayload>,
}

/// One invocation's trigger: bitmask plus payload lists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Trigger {
    pub kinds: TriggerKinds,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub measurements: Vec<MeasurementRecord>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mode_changes: Vec<ModeChange>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub alerts: Vec<AlertRecord>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileRecord>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub questions: Vec<QuestionAnswer>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub datastream: Vec<DatastreamMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub command_responses: Vec<CommandResponse>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub config_changes: Vec<LocationConfigChange>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub role_changes: Vec<RoleChange>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub data_requests: Vec<DataRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access: Option<AccessSnapshot>,
}

impl Trigger {
    /// Create a builder for constructing a [`Trigger`].
    #[must_use]
    pub fn builder() -> TriggerBuilder {
        TriggerBuilder::default()
    }

    /// Split the data-export portion off this trigger.
    ///
    /// Returns the remaining (queue-gated, persisted) trigger and the
    /// standalone data requests.
    #[must_use]
    pub fn split_data_requests(mut self) -> (Self, Vec<DataRequest>) {
        let requests = std::mem::take(&mut self.data_requests);
        self.kinds = self.kinds.without(TriggerKinds::DATA_REQUEST);
        (self, requests)
    }

    /// Whether the trigger carries any queue-gated work.
    #[must_use]
    pub fn is_core_work(&self) -> bool {
        !self.kinds.is_empty() || self.access.is_some()
    }
}

/// Step-by-step builder for [`Trigger`].
#[derive(Debug, Default)]
pub struct TriggerBuilder {
    trigger: Trigger,
}

impl TriggerBuilder {
    #[must_use]
    pub fn kind(mut self, kind: TriggerKinds) -> Self {
        self.trigger.kinds = self.trigger.kinds.with(kind);
        self
    }

    #[must_use]
    pub fn measurement(mut self, record: MeasurementRecord) -> Self {
        self.trigger.measurements.push(record);
        self.kind(TriggerKinds::MEASUREMENT)
    }

    #[must_use]
    pub fn mode_change(mut self, change: ModeChange) -> Self {
        self.trigger.mode_changes.push(change);
        self.kind(TriggerKinds::MODE)
    }

    #[must_use]
    pub fn alert(mut self, alert: AlertRecord) -> Self {
        self.trigger.alerts.push(alert);
        self.kind(TriggerKinds::DEVICE_ALERT)
    }

    #[must_use]
    pub fn file(mut self, file: FileRecord) -> Self {
        self.trigger.files.push(file);
        self.kind(TriggerKinds::FILE_UPLOAD)
    }

    #[must_use]
    pub fn question(mut self, answer: QuestionAnswer) -> Self {
        self.trigger.questions.push(answer);
        self.kind(TriggerKinds::QUESTION_ANSWERED)
    }

    #[must_use]
    pub fn datastream(mut self, message: DatastreamMessage) -> Self {
        self.trigger.datastream.push(message);
        self.kind(TriggerKinds::DATASTREAM)
    }

    #[must_use]
    pub fn command_response(mut self, response: CommandResponse) -> Self {
        self.trigger.command_responses.push(response);
        self.kind(TriggerKinds::COMMAND_RESPONSE)
    }

    #[must_use]
    pub fn config_change(mut self, change: LocationConfigChange) -> Self {
        self.trigger.config_changes.push(change);
        self.kind(TriggerKinds::LOCATION_CONFIG)
    }

    #[must_use]
    pub fn role_change(mut self, change: RoleChange) -> Self {
        self.trigger.role_changes.push(change);
        self.kind(TriggerKinds::LOCATION_CONFIG)
    }

    #[must_use]
    pub fn data_request(mut self, request: DataRequest) -> Self {
        self.trigger.data_requests.push(request);
        self.kind(TriggerKinds::DATA_REQUEST)
    }

    #[must_use]
    pub fn access(mut self, snapshot: AccessSnapshot) -> Self {
        self.trigger.access = Some(snapshot);
        self
    }

    /// Consume the builder and return the [`Trigger`].
    #[must_use]
    pub fn build(self) -> Trigger {
        self.trigger
    }
}
