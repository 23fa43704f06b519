use serde_json::Value;

/// Which buckets an outbound request passes through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestScope {
    /// No chat involved: bypasses every bucket.
    Unscoped,
    /// Chat-bound request: global bucket only.
    Chat,
    /// Group or channel request: group bucket for this id, then the global one.
    Group(String),
}

impl RequestScope {
    /// Classify by the request's `chat_id`.
    ///
    /// Channels cannot be told apart from groups by id alone, so both land in
    /// the group bucket.
    pub fn classify(data: &Value) -> Self {
        match data.get("chat_id") {
            None | Some(Value::Null) => Self::Unscoped,
            Some(Value::Number(n)) => match n.as_i64() {
                Some(id) if id < 0 => Self::Group(id.to_string()),
                _ => Self::Chat,
            },
            Some(Value::String(raw)) => match raw.trim().parse::<i64>() {
                Ok(id) if id < 0 => Self::Group(id.to_string()),
                Ok(_) => Self::Chat,
                Err(_) => Self::Group(raw.clone()),
            },
            Some(_) => Self::Chat,
        }
    }

    pub fn is_chat_bound(&self) -> bool {
        !matches!(self, Self::Unscoped)
    }
}
