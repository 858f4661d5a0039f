// crates/server/src/response.rs
// Success-envelope builder. Non-fatal problems (mirror failures, tee
// misses, index hiccups) accumulate as warnings/reminders on an `ok:true`
// response instead of failing the primary write.

use serde_json::{json, Map, Value};

/// Builder for `{ok: true, ...}` tool responses.
#[derive(Debug, Default, Clone)]
pub struct ToolResponse {
    fields: Map<String, Value>,
    warnings: Vec<Value>,
    reminders: Vec<Value>,
}

impl ToolResponse {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn set_field(&mut self, key: &str, value: impl Into<Value>) {
        self.fields.insert(key.to_string(), value.into());
    }

    pub fn warn(&mut self, code: &str, message: impl Into<String>) {
        self.warnings.push(json!({
            "code": code,
            "message": message.into(),
        }));
    }

    pub fn remind(&mut self, reminder: Value) {
        self.reminders.push(reminder);
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    pub fn into_value(self) -> Value {
        let mut out = Map::new();
        out.insert("ok".into(), json!(true));
        for (k, v) in self.fields {
            out.insert(k, v);
        }
        if !self.warnings.is_empty() {
            out.insert("warnings".into(), Value::Array(self.warnings));
        }
        if !self.reminders.is_empty() {
            out.insert("reminders".into(), Value::Array(self.reminders));
        }
        Value::Object(out)
    }
}
