//! Shared domain model for the connectivity services
//!
//! Types that cross crate boundaries live here: telemetry values and
//! quality codes, tag and poll-group definitions, connection configuration
//! with per-protocol parameters, and the sandboxed value transform used by
//! MQTT publishers.

pub mod connection;
pub mod error;
pub mod expression;
pub mod kind;
pub mod mqtt;
pub mod observation;
pub mod tag;
pub mod value;

pub use connection::{
    ConnectionConfig, ConnectionKind, EipParams, MqttParams, MqttProtocolVariant, OpcuaParams,
    S7Params,
};
pub use error::ModelError;
pub use expression::Transform;
pub use kind::DataKind;
pub use mqtt::{
    FieldMapping, MqttPublisherConfig, MqttSubscriptionConfig, OnFailure, PayloadFormat,
    PublisherMapping, PublisherMode,
};
pub use observation::{Observation, TagRef};
pub use tag::{ChangePolicy, DeadbandKind, PollGroup, TagConfig, TagStatus};
pub use value::{Quality, Value};
