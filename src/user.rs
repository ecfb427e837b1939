//! User profile changes.
//!
//! `UserChanges` collects edits to the user's profile and turns them into the
//! `user_details` JSON object. Standard properties go at the top level,
//! custom properties and their modification operators under `custom`. A
//! picture given as bytes is sent as a multipart file part and referenced
//! from the JSON by a marker value.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::{AgentError, Result};
use crate::request::Attachment;

pub const PICTURE_PART: &str = "profilePicture";
pub const PICTURE_IN_REQUEST: &str = "[CLY]_USER_PROFILE_PICTURE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Gender {
    #[serde(rename = "F")]
    Female,
    #[serde(rename = "M")]
    Male,
}

/// Server-side modification of a custom property.
#[derive(Debug, Clone, PartialEq)]
enum CustomOp {
    Inc(i64),
    Mul(f64),
    Min(f64),
    Max(f64),
    SetOnce(Value),
    Push(Value),
    PushUnique(Value),
    Pull(Value),
}

impl CustomOp {
    fn key(&self) -> &'static str {
        match self {
            CustomOp::Inc(_) => "$inc",
            CustomOp::Mul(_) => "$mul",
            CustomOp::Min(_) => "$min",
            CustomOp::Max(_) => "$max",
            CustomOp::SetOnce(_) => "$setOnce",
            CustomOp::Push(_) => "$push",
            CustomOp::PushUnique(_) => "$addToSet",
            CustomOp::Pull(_) => "$pull",
        }
    }

    /// Folds this operation into the operator object of one property.
    fn apply(&self, ops: &mut Map<String, Value>) {
        let key = self.key();
        match self {
            CustomOp::Inc(by) => {
                let current = ops.get(key).and_then(Value::as_i64).unwrap_or(0);
                ops.insert(key.into(), Value::from(current + by));
            }
            CustomOp::Mul(by) => {
                let current = ops.get(key).and_then(Value::as_f64).unwrap_or(1.0);
                ops.insert(key.into(), Value::from(current * by));
            }
            CustomOp::Min(v) | CustomOp::Max(v) => {
                let folded = match ops.get(key).and_then(Value::as_f64) {
                    Some(current) if matches!(self, CustomOp::Min(_)) => current.min(*v),
                    Some(current) => current.max(*v),
                    None => *v,
                };
                ops.insert(key.into(), Value::from(folded));
            }
            CustomOp::SetOnce(v) => {
                ops.insert(key.into(), v.clone());
            }
            CustomOp::Push(v) | CustomOp::PushUnique(v) | CustomOp::Pull(v) => {
                let entry = ops.entry(key).or_insert(Value::Null);
                *entry = match entry.take() {
                    Value::Null => v.clone(),
                    Value::Array(mut items) => {
                        items.push(v.clone());
                        Value::Array(items)
                    }
                    single => Value::Array(vec![single, v.clone()]),
                };
            }
        }
    }
}

/// Pending profile edits. `None` values clear a property on the server.
#[derive(Debug, Clone, Default)]
pub struct UserChanges {
    standard: BTreeMap<&'static str, Value>,
    custom: BTreeMap<String, Value>,
    ops: Vec<(String, CustomOp)>,
    picture: Option<Vec<u8>>,
}

fn opt_string(value: Option<&str>) -> Value {
    value.map_or(Value::Null, Value::from)
}

impl UserChanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: Option<&str>) -> Self {
        self.standard.insert("name", opt_string(name));
        self
    }

    pub fn username(mut self, username: Option<&str>) -> Self {
        self.standard.insert("username", opt_string(username));
        self
    }

    pub fn email(mut self, email: Option<&str>) -> Self {
        self.standard.insert("email", opt_string(email));
        self
    }

    pub fn organization(mut self, organization: Option<&str>) -> Self {
        self.standard.insert("org", opt_string(organization));
        self
    }

    pub fn phone(mut self, phone: Option<&str>) -> Self {
        self.standard.insert("phone", opt_string(phone));
        self
    }

    /// Picture hosted elsewhere. Must be an absolute URL.
    pub fn picture_url(mut self, url: Option<&str>) -> Result<Self> {
        if let Some(url) = url {
            url::Url::parse(url)
                .map_err(|e| AgentError::invalid(format!("picture url '{}': {}", url, e)))?;
        }
        self.picture = None;
        self.standard.insert("picture", opt_string(url));
        Ok(self)
    }

    /// Picture uploaded with the request.
    pub fn picture(mut self, data: Vec<u8>) -> Result<Self> {
        if data.is_empty() {
            return Err(AgentError::invalid("picture must not be empty"));
        }
        self.picture = Some(data);
        self.standard.insert("picture", Value::from(PICTURE_IN_REQUEST));
        Ok(self)
    }

    pub fn gender(mut self, gender: Option<Gender>) -> Self {
        let value = match gender {
            Some(Gender::Female) => Value::from("F"),
            Some(Gender::Male) => Value::from("M"),
            None => Value::Null,
        };
        self.standard.insert("gender", value);
        self
    }

    pub fn birth_year(mut self, year: Option<u16>) -> Self {
        self.standard
            .insert("byear", year.map_or(Value::Null, Value::from));
        self
    }

    pub fn custom(mut self, key: &str, value: impl Into<Value>) -> Result<Self> {
        Self::check_key(key)?;
        self.custom.insert(key.to_string(), value.into());
        Ok(self)
    }

    fn check_key(key: &str) -> Result<()> {
        if key.trim().is_empty() {
            return Err(AgentError::invalid("custom property key must not be empty"));
        }
        Ok(())
    }

    fn op(mut self, key: &str, op: CustomOp) -> Result<Self> {
        Self::check_key(key)?;
        self.ops.push((key.to_string(), op));
        Ok(self)
    }

    pub fn increment(self, key: &str, by: i64) -> Result<Self> {
        self.op(key, CustomOp::Inc(by))
    }

    pub fn multiply(self, key: &str, by: f64) -> Result<Self> {
        self.op(key, CustomOp::Mul(by))
    }

    pub fn min(self, key: &str, value: f64) -> Result<Self> {
        self.op(key, CustomOp::Min(value))
    }

    pub fn max(self, key: &str, value: f64) -> Result<Self> {
        self.op(key, CustomOp::Max(value))
    }

    pub fn set_once(self, key: &str, value: impl Into<Value>) -> Result<Self> {
        self.op(key, CustomOp::SetOnce(value.into()))
    }

    pub fn push(self, key: &str, value: impl Into<Value>) -> Result<Self> {
        self.op(key, CustomOp::Push(value.into()))
    }

    pub fn push_unique(self, key: &str, value: impl Into<Value>) -> Result<Self> {
        self.op(key, CustomOp::PushUnique(value.into()))
    }

    pub fn pull(self, key: &str, value: impl Into<Value>) -> Result<Self> {
        self.op(key, CustomOp::Pull(value.into()))
    }

    pub fn is_empty(&self) -> bool {
        self.standard.is_empty() && self.custom.is_empty() && self.ops.is_empty()
    }

    /// `user_details` object and the picture part, if any.
    pub fn into_details(self) -> (Value, Option<Attachment>) {
        let mut details = Map::new();
        for (key, value) in self.standard {
            details.insert(key.to_string(), value);
        }

        let mut custom: Map<String, Value> = self.custom.into_iter().collect();
        for (key, op) in &self.ops {
            let slot = custom
                .entry(key.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            if let Value::Object(ops) = slot {
                op.apply(ops);
            }
        }
        if !custom.is_empty() {
            details.insert("custom".to_string(), Value::Object(custom));
        }

        let attachment = self.picture.map(|data| Attachment {
            name: PICTURE_PART.to_string(),
            file_name: "picture".to_string(),
            content_type: "application/octet-stream".to_string(),
            data,
        });
        (Value::Object(details), attachment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_properties() {
        let (details, picture) = UserChanges::new()
            .name(Some("Ada"))
            .email(None)
            .organization(Some("Analytical"))
            .gender(Some(Gender::Female))
            .birth_year(Some(1815))
            .into_details();
        assert_eq!(details["name"], "Ada");
        assert!(details["email"].is_null());
        assert_eq!(details["org"], "Analytical");
        assert_eq!(details["gender"], "F");
        assert_eq!(details["byear"], 1815);
        assert!(details.get("custom").is_none());
        assert!(picture.is_none());
    }

    #[test]
    fn test_picture_bytes_become_attachment() {
        let (details, picture) = UserChanges::new()
            .picture(vec![0x89, b'P', b'N', b'G'])
            .unwrap()
            .into_details();
        assert_eq!(details["picture"], PICTURE_IN_REQUEST);
        let picture = picture.unwrap();
        assert_eq!(picture.name, PICTURE_PART);
        assert_eq!(picture.data.len(), 4);

        assert!(UserChanges::new().picture(Vec::new()).is_err());
        assert!(UserChanges::new().picture_url(Some("not a url")).is_err());
    }

    #[test]
    fn test_custom_operators_fold() {
        let (details, _) = UserChanges::new()
            .custom("plan", "pro")
            .unwrap()
            .increment("logins", 1)
            .unwrap()
            .increment("logins", 2)
            .unwrap()
            .max("score", 3.0)
            .unwrap()
            .max("score", 7.0)
            .unwrap()
            .push("tags", "a")
            .unwrap()
            .push("tags", "b")
            .unwrap()
            .into_details();
        let custom = &details["custom"];
        assert_eq!(custom["plan"], "pro");
        assert_eq!(custom["logins"]["$inc"], 3);
        assert_eq!(custom["score"]["$max"], 7.0);
        assert_eq!(custom["tags"]["$push"], serde_json::json!(["a", "b"]));
    }

    #[test]
    fn test_empty_changes() {
        assert!(UserChanges::new().is_empty());
        assert!(UserChanges::new().custom("", 1).is_err());
    }
}
