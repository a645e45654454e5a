use std::fmt;

use serde::{Deserialize, Serialize};

/// An outbound instruction for a watch: an opcode and its parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    params: Vec<String>,
}

impl Command {
    pub fn new(kind: impl Into<String>, params: Vec<String>) -> Self {
        Self {
            kind: kind.into(),
            params,
        }
    }

    /// A command without parameters.
    pub fn of(kind: impl Into<String>) -> Self {
        Self::new(kind, Vec::new())
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.kind)?;
        for param in &self.params {
            write!(f, ",{param}")?;
        }
        Ok(())
    }
}

/// A confirmation token issued to a user.
///
/// Presenting the same `(user_id, token)` pair authorizes the staged command.
/// The token string is credential material and is redacted in debug output.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct UserToken {
    pub user_id: u64,
    pub token: String,
}

impl UserToken {
    pub fn new(user_id: u64, token: impl Into<String>) -> Self {
        Self {
            user_id,
            token: token.into(),
        }
    }
}

impl fmt::Debug for UserToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserToken")
            .field("user_id", &self.user_id)
            .field(
                "token",
                &format_args!("<redacted:{} digits>", self.token.len()),
            )
            .finish()
    }
}

impl fmt::Display for UserToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "token for user {}", self.user_id)
    }
}
