use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::history::{Entry, ExportBundle};

/// One request of the message contract, tagged by its `action` field.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Request {
    #[serde(alias = "saveCopiedText", alias = "addToHistory")]
    Add { text: String },
    GetHistory,
    #[serde(alias = "deleteHistoryItem")]
    DeleteItem {
        #[serde(alias = "itemId")]
        id: String,
    },
    #[serde(alias = "clearHistory")]
    Clear,
    #[serde(alias = "restoreHistory")]
    Restore,
    Search {
        #[serde(default)]
        query: String,
    },
    ToggleDetection,
    #[serde(alias = "exportHistory")]
    Export,
    #[serde(alias = "importHistory")]
    Import {
        #[serde(default)]
        data: Value,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Response {
    Ack {
        success: bool,
    },
    History {
        history: Vec<Entry>,
        count: usize,
    },
    Matches {
        history: Vec<Entry>,
    },
    Detection {
        enabled: bool,
    },
    Export {
        data: ExportBundle,
    },
    Imported {
        success: bool,
        count: usize,
    },
    Failure {
        success: bool,
        error: String,
    },
}

impl Response {
    pub fn ack(success: bool) -> Self {
        Self::Ack { success }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self::Failure {
            success: false,
            error: error.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|err| {
            tracing::warn!(?err, "failed to serialise response");
            r#"{"success":false,"error":"response serialisation failed"}"#.to_string()
        })
    }
}
