//! Job parameters: immutable, typed input that identifies a job instance.
//!
//! Parameters are built once (see [`JobParametersBuilder`]) and never mutated
//! afterwards. Only *identifying* parameters take part in the [`JobKey`]; a
//! non-identifying parameter reaches the execution without creating a new
//! instance.

use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveDateTime};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::ParameterError;

const DATE_FORMAT: &str = "%Y-%m-%d";
const DATE_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// A typed parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ParameterValue {
    String(String),
    Long(i64),
    Double(f64),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    /// Arbitrary serializable object, kept in its JSON form.
    Object(JsonValue),
}

impl ParameterValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            ParameterValue::String(_) => "string",
            ParameterValue::Long(_) => "long",
            ParameterValue::Double(_) => "double",
            ParameterValue::Date(_) => "date",
            ParameterValue::DateTime(_) => "datetime",
            ParameterValue::Object(_) => "json",
        }
    }

    /// Stable textual form, used for the job key and for display.
    pub fn canonical(&self) -> String {
        match self {
            ParameterValue::String(s) => s.clone(),
            ParameterValue::Long(v) => v.to_string(),
            ParameterValue::Double(v) => v.to_string(),
            ParameterValue::Date(d) => d.format(DATE_FORMAT).to_string(),
            ParameterValue::DateTime(dt) => dt.format(DATE_TIME_FORMAT).to_string(),
            ParameterValue::Object(v) => v.to_string(),
        }
    }
}

impl core::fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// A parameter value plus its identifying flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobParameter {
    value: ParameterValue,
    identifying: bool,
}

impl JobParameter {
    pub fn new(value: ParameterValue) -> Self {
        Self {
            value,
            identifying: true,
        }
    }

    pub fn non_identifying(value: ParameterValue) -> Self {
        Self {
            value,
            identifying: false,
        }
    }

    pub fn value(&self) -> &ParameterValue {
        &self.value
    }

    pub fn is_identifying(&self) -> bool {
        self.identifying
    }
}

/// Canonical identity of a parameter set: identifying entries only, sorted by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobKey(String);

impl JobKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for JobKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable parameter set for one job run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobParameters {
    entries: BTreeMap<String, JobParameter>,
}

impl JobParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> JobParametersBuilder {
        JobParametersBuilder::new()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&JobParameter> {
        self.entries.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &JobParameter)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn get_string(&self, name: &str) -> Option<&str> {
        match self.get(name)?.value() {
            ParameterValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn get_long(&self, name: &str) -> Option<i64> {
        match self.get(name)?.value() {
            ParameterValue::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_double(&self, name: &str) -> Option<f64> {
        match self.get(name)?.value() {
            ParameterValue::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_date(&self, name: &str) -> Option<NaiveDate> {
        match self.get(name)?.value() {
            ParameterValue::Date(d) => Some(*d),
            _ => None,
        }
    }

    pub fn get_date_time(&self, name: &str) -> Option<NaiveDateTime> {
        match self.get(name)?.value() {
            ParameterValue::DateTime(dt) => Some(*dt),
            _ => None,
        }
    }

    /// Decode an object parameter into `T`. `Ok(None)` when the key is absent.
    pub fn get_object<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, ParameterError> {
        let Some(param) = self.get(name) else {
            return Ok(None);
        };
        match param.value() {
            ParameterValue::Object(v) => serde_json::from_value(v.clone())
                .map(Some)
                .map_err(|e| ParameterError::invalid(name, e.to_string())),
            other => Err(ParameterError::TypeMismatch {
                name: name.to_string(),
                expected: "json",
                actual: other.type_name(),
            }),
        }
    }

    /// Like [`get_long`](Self::get_long) but reports absence and type mismatches.
    pub fn require_long(&self, name: &str) -> Result<i64, ParameterError> {
        let param = self
            .get(name)
            .ok_or_else(|| ParameterError::invalid(name, "parameter is missing"))?;
        match param.value() {
            ParameterValue::Long(v) => Ok(*v),
            other => Err(ParameterError::TypeMismatch {
                name: name.to_string(),
                expected: "long",
                actual: other.type_name(),
            }),
        }
    }

    pub fn require_string(&self, name: &str) -> Result<&str, ParameterError> {
        let param = self
            .get(name)
            .ok_or_else(|| ParameterError::invalid(name, "parameter is missing"))?;
        match param.value() {
            ParameterValue::String(s) => Ok(s),
            other => Err(ParameterError::TypeMismatch {
                name: name.to_string(),
                expected: "string",
                actual: other.type_name(),
            }),
        }
    }

    /// Only the identifying entries.
    pub fn identifying(&self) -> JobParameters {
        JobParameters {
            entries: self
                .entries
                .iter()
                .filter(|(_, p)| p.is_identifying())
                .map(|(k, p)| (k.clone(), p.clone()))
                .collect(),
        }
    }

    /// Names and values are length-prefixed so no string content can imitate
    /// an entry boundary.
    pub fn job_key(&self) -> JobKey {
        let mut key = String::new();
        for (name, param) in self.entries.iter().filter(|(_, p)| p.is_identifying()) {
            let value = param.value().canonical();
            key.push_str(&format!(
                "{}:{name}={}:{}:{value};",
                name.len(),
                param.value().type_name(),
                value.len()
            ));
        }
        JobKey(key)
    }
}

impl core::fmt::Display for JobParameters {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("{")?;
        for (i, (name, param)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}={}", param.value())?;
        }
        f.write_str("}")
    }
}

/// Builder for [`JobParameters`]; later additions replace earlier ones with the same name.
#[derive(Debug, Clone, Default)]
pub struct JobParametersBuilder {
    entries: BTreeMap<String, JobParameter>,
}

impl JobParametersBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing parameter set (e.g. to derive the next run's parameters).
    pub fn from_parameters(parameters: &JobParameters) -> Self {
        Self {
            entries: parameters.entries.clone(),
        }
    }

    pub fn add(mut self, name: impl Into<String>, parameter: JobParameter) -> Self {
        self.entries.insert(name.into(), parameter);
        self
    }

    pub fn add_string(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.add(name, JobParameter::new(ParameterValue::String(value.into())))
    }

    pub fn add_long(self, name: impl Into<String>, value: i64) -> Self {
        self.add(name, JobParameter::new(ParameterValue::Long(value)))
    }

    pub fn add_double(self, name: impl Into<String>, value: f64) -> Self {
        self.add(name, JobParameter::new(ParameterValue::Double(value)))
    }

    pub fn add_date(self, name: impl Into<String>, value: NaiveDate) -> Self {
        self.add(name, JobParameter::new(ParameterValue::Date(value)))
    }

    pub fn add_date_time(self, name: impl Into<String>, value: NaiveDateTime) -> Self {
        self.add(name, JobParameter::new(ParameterValue::DateTime(value)))
    }

    pub fn add_json(self, name: impl Into<String>, value: JsonValue) -> Self {
        self.add(name, JobParameter::new(ParameterValue::Object(value)))
    }

    /// Serialize `value` and add it as an object parameter.
    pub fn add_object<T: Serialize>(self, name: impl Into<String>, value: &T) -> Result<Self, ParameterError> {
        let name = name.into();
        let json = serde_json::to_value(value).map_err(|e| ParameterError::invalid(&name, e.to_string()))?;
        Ok(self.add_json(name, json))
    }

    pub fn remove(mut self, name: &str) -> Self {
        self.entries.remove(name);
        self
    }

    pub fn build(self) -> JobParameters {
        JobParameters {
            entries: self.entries,
        }
    }
}

/// Converts textual properties into typed parameters.
///
/// Two notations are understood:
///
/// - `name=value[,type[,identifying]]` with type one of
///   `string|long|double|date|datetime|json` (default `string`, identifying `true`);
/// - `name={"value": ..., "type": "...", "identifying": bool}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JobParametersConverter;

#[derive(Deserialize)]
struct JsonNotation {
    value: JsonValue,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    identifying: Option<bool>,
}

impl JobParametersConverter {
    /// Parse a list of `name=definition` arguments.
    pub fn parse_args<I, S>(&self, args: I) -> Result<JobParameters, ParameterError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut builder = JobParametersBuilder::new();
        for arg in args {
            let arg = arg.as_ref();
            let (name, definition) = arg
                .split_once('=')
                .ok_or_else(|| ParameterError::Malformed(arg.to_string()))?;
            let name = name.trim();
            if name.is_empty() {
                return Err(ParameterError::Malformed(arg.to_string()));
            }
            builder = builder.add(name, self.decode(name, definition)?);
        }
        Ok(builder.build())
    }

    /// Parse `(name, definition)` pairs.
    pub fn from_properties<I, K, V>(&self, properties: I) -> Result<JobParameters, ParameterError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut builder = JobParametersBuilder::new();
        for (name, definition) in properties {
            let name = name.as_ref();
            builder = builder.add(name, self.decode(name, definition.as_ref())?);
        }
        Ok(builder.build())
    }

    /// Decode one definition.
    pub fn decode(&self, name: &str, definition: &str) -> Result<JobParameter, ParameterError> {
        let trimmed = definition.trim();
        if trimmed.starts_with('{') {
            return self.decode_json(name, trimmed);
        }

        let mut tokens = definition.splitn(3, ',');
        let raw = tokens.next().unwrap_or_default();
        let kind = tokens.next().map(str::trim).unwrap_or("string");
        let identifying = match tokens.next().map(str::trim) {
            None => true,
            Some(flag) => parse_flag(name, flag)?,
        };

        let value = parse_value(name, raw, kind)?;
        Ok(JobParameter { value, identifying })
    }

    /// Render a parameter in the `value,type,identifying` notation.
    pub fn encode(&self, parameter: &JobParameter) -> String {
        format!(
            "{},{},{}",
            parameter.value().canonical(),
            parameter.value().type_name(),
            parameter.is_identifying()
        )
    }

    fn decode_json(&self, name: &str, definition: &str) -> Result<JobParameter, ParameterError> {
        let notation: JsonNotation =
            serde_json::from_str(definition).map_err(|e| ParameterError::invalid(name, e.to_string()))?;
        let kind = notation.kind.as_deref().unwrap_or("string");
        let value = match (&notation.value, kind) {
            (_, "json") => ParameterValue::Object(notation.value.clone()),
            (JsonValue::String(s), _) => parse_value(name, s, kind)?,
            (other, _) => parse_value(name, &other.to_string(), kind)?,
        };
        Ok(JobParameter {
            value,
            identifying: notation.identifying.unwrap_or(true),
        })
    }
}

fn parse_flag(name: &str, flag: &str) -> Result<bool, ParameterError> {
    match flag {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(ParameterError::invalid(
            name,
            format!("identifying flag must be true or false, got '{other}'"),
        )),
    }
}

fn parse_value(name: &str, raw: &str, kind: &str) -> Result<ParameterValue, ParameterError> {
    let value = match kind {
        "string" => ParameterValue::String(raw.to_string()),
        "long" => ParameterValue::Long(
            raw.trim()
                .parse()
                .map_err(|e: std::num::ParseIntError| ParameterError::invalid(name, e.to_string()))?,
        ),
        "double" => ParameterValue::Double(
            raw.trim()
                .parse()
                .map_err(|e: std::num::ParseFloatError| ParameterError::invalid(name, e.to_string()))?,
        ),
        "date" => ParameterValue::Date(
            NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT)
                .map_err(|e| ParameterError::invalid(name, e.to_string()))?,
        ),
        "datetime" => ParameterValue::DateTime(
            NaiveDateTime::parse_from_str(raw.trim(), DATE_TIME_FORMAT)
                .map_err(|e| ParameterError::invalid(name, e.to_string()))?,
        ),
        "json" => ParameterValue::Object(
            serde_json::from_str(raw).map_err(|e| ParameterError::invalid(name, e.to_string()))?,
        ),
        other => return Err(ParameterError::UnknownType(other.to_string())),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn equal_entries_give_equal_parameters_and_keys() {
        let a = JobParameters::builder().add_string("name", "x").add_long("n", 3).build();
        let b = JobParameters::builder().add_long("n", 3).add_string("name", "x").build();
        assert_eq!(a, b);
        assert_eq!(a.job_key(), b.job_key());
    }

    #[test]
    fn non_identifying_parameters_do_not_change_the_key() {
        let base = JobParameters::builder().add_long("a", 1).build();
        let with_extra = JobParametersBuilder::from_parameters(&base)
            .add("trace", JobParameter::non_identifying(ParameterValue::String("on".into())))
            .build();
        assert_ne!(base, with_extra);
        assert_eq!(base.job_key(), with_extra.job_key());
        assert_eq!(with_extra.identifying(), base);
    }

    #[test]
    fn typed_getters_only_match_their_type() {
        let params = JobParameters::builder()
            .add_string("s", "hello")
            .add_long("l", 42)
            .add_double("d", 1.5)
            .build();
        assert_eq!(params.get_string("s"), Some("hello"));
        assert_eq!(params.get_long("l"), Some(42));
        assert_eq!(params.get_double("d"), Some(1.5));
        assert_eq!(params.get_long("s"), None);
        assert!(matches!(
            params.require_long("s"),
            Err(ParameterError::TypeMismatch { expected: "long", actual: "string", .. })
        ));
    }

    #[test]
    fn object_parameters_decode_into_structs() {
        #[derive(Debug, Serialize, Deserialize, PartialEq)]
        struct Person {
            name: String,
            age: u32,
        }

        let person = Person {
            name: "kim".into(),
            age: 31,
        };
        let params = JobParameters::builder().add_object("person", &person).unwrap().build();
        assert_eq!(params.get_object::<Person>("person").unwrap(), Some(person));
        assert_eq!(params.get_object::<Person>("missing").unwrap(), None);
    }

    #[test]
    fn converter_parses_typed_definitions() {
        let params = JobParametersConverter
            .parse_args([
                "name=batch",
                "count=10,long",
                "ratio=0.25,double,false",
                "executionDate=2024-03-01,date",
                "startTime=2024-03-01T10:15:30,datetime",
            ])
            .unwrap();

        assert_eq!(params.get_string("name"), Some("batch"));
        assert_eq!(params.get_long("count"), Some(10));
        assert_eq!(params.get_double("ratio"), Some(0.25));
        assert!(!params.get("ratio").unwrap().is_identifying());
        assert_eq!(
            params.get_date("executionDate"),
            NaiveDate::from_ymd_opt(2024, 3, 1)
        );
        assert!(params.get_date_time("startTime").is_some());
    }

    #[test]
    fn converter_understands_json_notation() {
        let params = JobParametersConverter
            .parse_args([
                r#"a={"value":"x,y","type":"string","identifying":false}"#,
                r#"b={"value":7,"type":"long"}"#,
                r#"c={"value":{"k":[1,2]},"type":"json"}"#,
            ])
            .unwrap();
        assert_eq!(params.get_string("a"), Some("x,y"));
        assert!(!params.get("a").unwrap().is_identifying());
        assert_eq!(params.get_long("b"), Some(7));
        assert_eq!(params.get_object::<JsonValue>("c").unwrap(), Some(json!({"k": [1, 2]})));
    }

    #[test]
    fn converter_rejects_bad_input() {
        assert!(matches!(
            JobParametersConverter.parse_args(["novalue"]),
            Err(ParameterError::Malformed(_))
        ));
        assert!(matches!(
            JobParametersConverter.parse_args(["a=1,int"]),
            Err(ParameterError::UnknownType(t)) if t == "int"
        ));
        assert!(matches!(
            JobParametersConverter.parse_args(["a=one,long"]),
            Err(ParameterError::InvalidValue { .. })
        ));
        assert!(JobParametersConverter.parse_args(["a=1,long,maybe"]).is_err());
    }

    #[test]
    fn encode_matches_decode() {
        let param = JobParametersConverter.decode("n", "5,long,false").unwrap();
        assert_eq!(JobParametersConverter.encode(&param), "5,long,false");
    }

    #[test]
    fn sub_second_datetimes_are_distinct_instances() {
        let at = |millis| {
            NaiveDate::from_ymd_opt(2024, 3, 1)
                .and_then(|d| d.and_hms_milli_opt(10, 0, 0, millis))
                .unwrap()
        };
        let early = JobParameters::builder().add_date_time("startTime", at(100)).build();
        let late = JobParameters::builder().add_date_time("startTime", at(900)).build();

        assert_ne!(early, late);
        assert_ne!(early.job_key(), late.job_key());
    }

    #[test]
    fn fractional_datetimes_survive_encode_and_decode() {
        let param = JobParametersConverter
            .decode("startTime", "2024-03-01T10:15:30.250,datetime")
            .unwrap();
        let expected = NaiveDate::from_ymd_opt(2024, 3, 1)
            .and_then(|d| d.and_hms_milli_opt(10, 15, 30, 250))
            .unwrap();
        assert_eq!(param.value(), &ParameterValue::DateTime(expected));

        let encoded = JobParametersConverter.encode(&param);
        assert_eq!(encoded, "2024-03-01T10:15:30.250,datetime,true");
        assert_eq!(JobParametersConverter.decode("startTime", &encoded).unwrap(), param);
    }

    #[test]
    fn separators_inside_values_do_not_collide_keys() {
        let packed = JobParameters::builder().add_string("a", "x;b=string:y").build();
        let split = JobParameters::builder().add_string("a", "x").add_string("b", "y").build();
        assert_ne!(packed.job_key(), split.job_key());
    }

    #[test]
    fn display_lists_entries() {
        let params = JobParameters::builder().add_string("a", "x").add_long("b", 2).build();
        assert_eq!(params.to_string(), "{a=x, b=2}");
    }
}
