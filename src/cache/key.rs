//! Cache key schema.
//!
//! A [`CacheKey`] is a resource type plus a set of scalar scope parameters. Parameters
//! are held sorted by name, so insertion order never affects equality, hashing or the
//! canonical text form (`members?teamId=7`).

use serde_json::{Number, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use super::error::{CacheError, Result};

/// A scalar key parameter value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scalar {
  Null,
  Bool(bool),
  Number(Number),
  String(String),
}

/// Integral floats collapse to integers, so `7.0` and `7` name the same key.
fn normalize(number: Number) -> Number {
  match number.as_f64() {
    Some(value) if number.is_f64() && value.fract() == 0.0 => {
      if value >= 0.0 && value < u64::MAX as f64 {
        Number::from(value as u64)
      } else if value < 0.0 && value >= i64::MIN as f64 {
        Number::from(value as i64)
      } else {
        number
      }
    }
    _ => number,
  }
}

impl Scalar {
  /// Build a numeric scalar from a float. NaN and infinities are rejected.
  pub fn float(value: f64) -> Result<Self> {
    Number::from_f64(value)
      .map(|n| Scalar::Number(normalize(n)))
      .ok_or_else(|| CacheError::validation(format!("non-finite number {value}")))
  }

  pub fn as_i64(&self) -> Option<i64> {
    match self {
      Scalar::Number(n) => n.as_i64(),
      _ => None,
    }
  }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      Scalar::String(s) => Some(s),
      _ => None,
    }
  }

  pub fn to_json(&self) -> Value {
    match self {
      Scalar::Null => Value::Null,
      Scalar::Bool(b) => Value::Bool(*b),
      Scalar::Number(n) => Value::Number(n.clone()),
      Scalar::String(s) => Value::String(s.clone()),
    }
  }
}

impl fmt::Display for Scalar {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.to_json())
  }
}

impl TryFrom<Value> for Scalar {
  type Error = CacheError;

  fn try_from(value: Value) -> Result<Self> {
    match value {
      Value::Null => Ok(Scalar::Null),
      Value::Bool(b) => Ok(Scalar::Bool(b)),
      Value::Number(n) => Ok(Scalar::Number(normalize(n))),
      Value::String(s) => Ok(Scalar::String(s)),
      Value::Array(_) | Value::Object(_) => Err(CacheError::validation(
        "structured parameter values must be serialized by the caller",
      )),
    }
  }
}

impl From<bool> for Scalar {
  fn from(value: bool) -> Self {
    Scalar::Bool(value)
  }
}

macro_rules! scalar_from_int {
  ($($t:ty),*) => {
    $(
      impl From<$t> for Scalar {
        fn from(value: $t) -> Self {
          Scalar::Number(Number::from(value))
        }
      }
    )*
  };
}

scalar_from_int!(i32, i64, u32, u64, usize);

impl From<&str> for Scalar {
  fn from(value: &str) -> Self {
    Scalar::String(value.to_string())
  }
}

impl From<String> for Scalar {
  fn from(value: String) -> Self {
    Scalar::String(value)
  }
}

impl From<&String> for Scalar {
  fn from(value: &String) -> Self {
    Scalar::String(value.clone())
  }
}

impl<T: Into<Scalar>> From<Option<T>> for Scalar {
  fn from(value: Option<T>) -> Self {
    value.map(Into::into).unwrap_or(Scalar::Null)
  }
}

/// Identifier of one cached entity or query result.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
  resource: String,
  params: BTreeMap<String, Scalar>,
}

/// Build a key from a resource type and its scope parameters.
///
/// Fails on an empty resource type, a resource type containing `?`, an empty
/// parameter name, or a parameter name given twice.
pub fn build_key<I, K, V>(resource: &str, params: I) -> Result<CacheKey>
where
  I: IntoIterator<Item = (K, V)>,
  K: Into<String>,
  V: Into<Scalar>,
{
  validate_resource(resource)?;

  let mut map = BTreeMap::new();
  for (name, value) in params {
    let name = name.into();
    if name.is_empty() {
      return Err(CacheError::validation(format!(
        "empty parameter name in {resource} key"
      )));
    }
    if map.contains_key(&name) {
      return Err(CacheError::validation(format!(
        "parameter {name} given twice in {resource} key"
      )));
    }
    map.insert(name, value.into());
  }

  Ok(CacheKey {
    resource: resource.to_string(),
    params: map,
  })
}

/// Check whether `key` falls under `pattern`.
pub fn matches_pattern(key: &CacheKey, pattern: &KeyPattern) -> bool {
  pattern.matches(key)
}

fn validate_resource(resource: &str) -> Result<()> {
  if resource.is_empty() {
    return Err(CacheError::validation("empty resource type"));
  }
  if resource.contains('?') {
    return Err(CacheError::validation(format!(
      "resource type {resource:?} contains '?'"
    )));
  }
  Ok(())
}

impl CacheKey {
  /// Key with no scope parameters.
  pub fn new(resource: &str) -> Result<Self> {
    build_key(resource, std::iter::empty::<(String, Scalar)>())
  }

  pub fn builder(resource: impl Into<String>) -> KeyBuilder {
    KeyBuilder {
      resource: resource.into(),
      params: Vec::new(),
    }
  }

  /// Build a key from a JSON object of parameters.
  pub fn from_json(resource: &str, params: &Value) -> Result<Self> {
    let object = match params {
      Value::Object(map) => map,
      Value::Null => return Self::new(resource),
      _ => {
        return Err(CacheError::validation(format!(
          "parameters of {resource} key must be an object"
        )))
      }
    };

    let params = object
      .iter()
      .map(|(name, value)| Ok((name.clone(), Scalar::try_from(value.clone())?)))
      .collect::<Result<Vec<_>>>()?;
    build_key(resource, params)
  }

  pub fn resource(&self) -> &str {
    &self.resource
  }

  pub fn params(&self) -> &BTreeMap<String, Scalar> {
    &self.params
  }

  pub fn param(&self, name: &str) -> Option<&Scalar> {
    self.params.get(name)
  }

  pub fn matches(&self, pattern: &KeyPattern) -> bool {
    pattern.matches(self)
  }

  /// SHA-256 of the canonical text form, hex encoded.
  pub fn fingerprint(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.to_string().as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.resource)?;
    if self.params.is_empty() {
      return Ok(());
    }
    let query = url::form_urlencoded::Serializer::new(String::new())
      .extend_pairs(self.params.iter().map(|(k, v)| (k, v.to_string())))
      .finish();
    write!(f, "?{query}")
  }
}

impl FromStr for CacheKey {
  type Err = CacheError;

  fn from_str(s: &str) -> Result<Self> {
    let (resource, query) = match s.split_once('?') {
      Some((resource, query)) => (resource, query),
      None => return Self::new(s),
    };

    let params = url::form_urlencoded::parse(query.as_bytes())
      .map(|(name, raw)| {
        let value: Value = serde_json::from_str(&raw).map_err(|e| {
          CacheError::validation(format!("parameter {name} is not a JSON scalar: {e}"))
        })?;
        Ok((name.into_owned(), Scalar::try_from(value)?))
      })
      .collect::<Result<Vec<_>>>()?;

    build_key(resource, params)
  }
}

/// Incremental key construction; errors surface at [`KeyBuilder::build`].
#[derive(Debug, Clone)]
pub struct KeyBuilder {
  resource: String,
  params: Vec<(String, Scalar)>,
}

impl KeyBuilder {
  pub fn param(mut self, name: impl Into<String>, value: impl Into<Scalar>) -> Self {
    self.params.push((name.into(), value.into()));
    self
  }

  pub fn build(self) -> Result<CacheKey> {
    build_key(&self.resource, self.params)
  }
}

/// Partial key used for bulk invalidation.
///
/// Parameters named in the pattern must match by value; parameters it does not name
/// match anything. Without a resource type the pattern spans every resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyPattern {
  resource: Option<String>,
  params: BTreeMap<String, Scalar>,
}

impl KeyPattern {
  /// Pattern matching every key.
  pub fn any() -> Self {
    Self::default()
  }

  /// Pattern restricted to one resource type.
  pub fn resource(resource: impl Into<String>) -> Self {
    Self {
      resource: Some(resource.into()),
      params: BTreeMap::new(),
    }
  }

  pub fn param(mut self, name: impl Into<String>, value: impl Into<Scalar>) -> Self {
    self.params.insert(name.into(), value.into());
    self
  }

  pub fn matches(&self, key: &CacheKey) -> bool {
    if let Some(resource) = &self.resource {
      if resource != &key.resource {
        return false;
      }
    }
    self
      .params
      .iter()
      .all(|(name, value)| key.params.get(name) == Some(value))
  }
}

impl From<&CacheKey> for KeyPattern {
  /// Pattern for `key` itself (and any key of the same resource that adds params).
  fn from(key: &CacheKey) -> Self {
    Self {
      resource: Some(key.resource.clone()),
      params: key.params.clone(),
    }
  }
}

impl fmt::Display for KeyPattern {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.resource.as_deref().unwrap_or("*"))?;
    let params: Vec<String> = self
      .params
      .iter()
      .map(|(k, v)| format!("{k}={v}"))
      .collect();
    write!(f, "{{{}}}", params.join(","))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_param_order_does_not_affect_equality() {
    let a = build_key("tasks", [("listId", Scalar::from(3)), ("done", false.into())]).unwrap();
    let b = build_key("tasks", [("done", Scalar::from(false)), ("listId", 3.into())]).unwrap();
    assert_eq!(a, b);
    assert_eq!(a.to_string(), b.to_string());
    assert_eq!(a.fingerprint(), b.fingerprint());
  }

  #[test]
  fn test_unequal_inputs_give_unequal_keys() {
    let members = CacheKey::builder("members").param("teamId", 7).build().unwrap();
    let other_team = CacheKey::builder("members").param("teamId", 8).build().unwrap();
    let projects = CacheKey::builder("projects").param("teamId", 7).build().unwrap();
    let as_string = CacheKey::builder("members").param("teamId", "7").build().unwrap();

    assert_ne!(members, other_team);
    assert_ne!(members, projects);
    assert_ne!(members, as_string);
  }

  #[test]
  fn test_integer_widths_compare_equal() {
    let a = CacheKey::builder("team").param("id", 7i32).build().unwrap();
    let b = CacheKey::builder("team").param("id", 7u64).build().unwrap();
    assert_eq!(a, b);
  }

  #[test]
  fn test_integral_floats_name_the_integer_key() {
    let int = CacheKey::builder("members").param("teamId", 7).build().unwrap();
    let keys = [
      CacheKey::builder("members").param("teamId", 7u64).build().unwrap(),
      CacheKey::builder("members")
        .param("teamId", Scalar::float(7.0).unwrap())
        .build()
        .unwrap(),
      CacheKey::from_json("members", &json!({"teamId": 7.0})).unwrap(),
      "members?teamId=7.0".parse().unwrap(),
    ];
    let pattern = KeyPattern::any().param("teamId", 7);
    for key in &keys {
      assert_eq!(key, &int);
      assert_eq!(key.to_string(), "members?teamId=7");
      assert_eq!(key.fingerprint(), int.fingerprint());
      assert!(key.matches(&pattern));
    }

    assert_eq!(Scalar::float(-0.0).unwrap(), Scalar::from(0));
    assert_eq!(Scalar::float(-3.0).unwrap(), Scalar::from(-3));
    assert_ne!(Scalar::float(7.5).unwrap(), Scalar::from(7));
    let text = CacheKey::builder("members").param("teamId", "7").build().unwrap();
    assert_ne!(text, int);
  }

  #[test]
  fn test_rejects_malformed_keys() {
    assert!(matches!(CacheKey::new(""), Err(CacheError::Validation { .. })));
    assert!(matches!(CacheKey::new("a?b"), Err(CacheError::Validation { .. })));
    assert!(build_key("tasks", [("", 1)]).is_err());
    assert!(build_key("tasks", [("id", 1), ("id", 2)]).is_err());
    assert!(Scalar::float(f64::NAN).is_err());
  }

  #[test]
  fn test_from_json_rejects_structured_values() {
    let ok = CacheKey::from_json("tasks", &json!({"listId": 3, "q": null})).unwrap();
    assert_eq!(ok.param("q"), Some(&Scalar::Null));

    let err = CacheKey::from_json("tasks", &json!({"filter": {"done": true}}));
    assert!(matches!(err, Err(CacheError::Validation { .. })));
    let err = CacheKey::from_json("tasks", &json!({"ids": [1, 2]}));
    assert!(matches!(err, Err(CacheError::Validation { .. })));
  }

  #[test]
  fn test_text_form_round_trips() {
    let key = CacheKey::builder("comments")
      .param("taskId", 12)
      .param("search", "a & b = c?")
      .param("archived", Scalar::Null)
      .build()
      .unwrap();

    let text = key.to_string();
    assert!(text.starts_with("comments?archived=null&search="));
    assert_eq!(text.parse::<CacheKey>().unwrap(), key);

    let bare: CacheKey = "teams".parse().unwrap();
    assert_eq!(bare, CacheKey::new("teams").unwrap());
    assert_eq!(bare.to_string(), "teams");
  }

  #[test]
  fn test_parse_rejects_non_json_values() {
    assert!("members?teamId=seven".parse::<CacheKey>().is_err());
  }

  #[test]
  fn test_pattern_matches_partial_params() {
    let pattern = KeyPattern::any().param("teamId", 7);
    let members = build_key("members", [("teamId", 7)]).unwrap();
    let projects = build_key("projects", [("teamId", Scalar::from(7)), ("page", 2.into())]).unwrap();
    let other = build_key("members", [("teamId", 9)]).unwrap();
    let unscoped = CacheKey::new("teams").unwrap();

    assert!(matches_pattern(&members, &pattern));
    assert!(matches_pattern(&projects, &pattern));
    assert!(!matches_pattern(&other, &pattern));
    assert!(!matches_pattern(&unscoped, &pattern));
  }

  #[test]
  fn test_pattern_resource_filter() {
    let pattern = KeyPattern::resource("members").param("teamId", 7);
    let members = build_key("members", [("teamId", 7)]).unwrap();
    let projects = build_key("projects", [("teamId", 7)]).unwrap();

    assert!(pattern.matches(&members));
    assert!(!pattern.matches(&projects));
    assert!(KeyPattern::any().matches(&projects));
    assert!(KeyPattern::from(&members).matches(&members));
    assert_eq!(pattern.to_string(), "members{teamId=7}");
  }

  #[test]
  fn test_fingerprint_is_stable_hex() {
    let key = CacheKey::builder("task").param("id", 1).build().unwrap();
    let fp = key.fingerprint();
    assert_eq!(fp.len(), 64);
    assert_eq!(fp, key.clone().fingerprint());
  }
}
