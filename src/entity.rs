use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Who authored a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    /// Website visitor typing into the chat widget.
    Visitor,
    /// Site owner answering from Telegram or the dashboard.
    Operator,
}

impl Sender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sender::Visitor => "visitor",
            Sender::Operator => "operator",
        }
    }
}

impl fmt::Display for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Sender {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "visitor" => Ok(Sender::Visitor),
            "operator" => Ok(Sender::Operator),
            other => Err(format!("unknown sender: {other}")),
        }
    }
}
