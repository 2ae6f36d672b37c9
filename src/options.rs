//! Contains the option types used to configure operations and cursors.

use std::{
    fmt::{self, Display, Formatter},
    str::FromStr,
};

use bson::Document;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use typed_builder::TypedBuilder;

pub use crate::{
    compression::Compressor,
    concern::{Acknowledgment, ReadConcern, ReadConcernLevel, WriteConcern},
    cursor::CursorOptions,
    sdam::{ServerAddress, ServerDescription, ServerType, TopologyType},
    selection_criteria::{ReadPreference, ReadPreferenceOptions, TagSet},
    session::{SessionOptions, TransactionOptions},
};
use crate::error::{Error, Result};

/// Specifies the server API version to declare.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ServerApiVersion {
    /// Version 1.
    V1,
}

impl FromStr for ServerApiVersion {
    type Err = Error;

    fn from_str(str: &str) -> Result<Self> {
        match str {
            "1" => Ok(Self::V1),
            _ => Err(Error::invalid_argument(format!(
                "invalid server api version string: {str}"
            ))),
        }
    }
}

impl Display for ServerApiVersion {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::V1 => write!(f, "1"),
        }
    }
}

impl Serialize for ServerApiVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ServerApiVersion {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ServerApiVersion::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Options used to declare a versioned server API.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, TypedBuilder)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ServerApi {
    /// The declared API version.
    #[serde(rename = "apiVersion")]
    pub version: ServerApiVersion,

    /// Whether the MongoDB server should reject all commands that are not part of the
    /// declared API version. This includes command options and aggregation pipeline stages.
    #[builder(default, setter(strip_option))]
    #[serde(rename = "apiStrict", skip_serializing_if = "Option::is_none")]
    pub strict: Option<bool>,

    /// Whether the MongoDB server should return command failures when functionality that is
    /// deprecated from the declared API version is used.
    #[builder(default, setter(strip_option))]
    #[serde(rename = "apiDeprecationErrors", skip_serializing_if = "Option::is_none")]
    pub deprecation_errors: Option<bool>,
}

impl ServerApi {
    /// Appends `apiVersion` and, when set, `apiStrict` and `apiDeprecationErrors` to `command`.
    pub(crate) fn append_to(&self, command: &mut Document) {
        command.insert("apiVersion", self.version.to_string());
        if let Some(strict) = self.strict {
            command.insert("apiStrict", strict);
        }
        if let Some(deprecation_errors) = self.deprecation_errors {
            command.insert("apiDeprecationErrors", deprecation_errors);
        }
    }
}
