use serde::{Deserialize, Serialize};

use crate::{GeneratedFile, Task};

/// Progress event emitted by a generation run, in wire order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    TaskStart {
        task: Task,
    },
    File {
        path: String,
        content: String,
    },
    TaskComplete {
        task_id: String,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_id: Option<String>,
    },
    Complete,
}

impl StreamEvent {
    pub fn file(file: GeneratedFile) -> Self {
        StreamEvent::File {
            path: file.path,
            content: file.content,
        }
    }

    pub fn task_error(task_id: impl Into<String>, message: impl Into<String>) -> Self {
        StreamEvent::Error {
            message: message.into(),
            task_id: Some(task_id.into()),
        }
    }

    /// Server-sent-event frame: `data: <json>\n\n`.
    pub fn to_sse_frame(&self) -> String {
        format!(
            "data: {}\n\n",
            serde_json::to_string(self).unwrap_or_default()
        )
    }
}

/// Live-typing events of the chat stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatStreamEvent {
    Token { content: String },
    Error { message: String },
    Complete,
}
