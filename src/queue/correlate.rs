//! Matching a submission against the queue listing.
//!
//! Submissions with file parameters do not report their queue item. The item
//! is found instead by comparing the parameters recorded locally with the
//! parameters every queued item reports. A unique token parameter makes the
//! match exact; without one, identical concurrent submissions are
//! indistinguishable.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

use crate::error::{Error, Result};
use crate::mirror::Data;

/// Name of the string parameter a job declares to receive a submission token.
pub const SUBMISSION_TOKEN_PARAM: &str = "___TOKEN";

/// Generates a locally unique submission token.
pub fn new_submission_token() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or_default();
    let random = uuid::Uuid::new_v4().as_u128() % 1_000_000_000;
    format!("japi-{}{}", millis, random)
}

/// What a queue item says was submitted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmittedRequest {
    pub job_name: Option<String>,
    /// Scalar parameters, stringified. File parameters carry no value and are
    /// left out.
    pub params: BTreeMap<String, String>,
}

impl SubmittedRequest {
    /// Reads the job name and parameters from a queue item document.
    pub fn from_queue_data(data: &Data) -> Self {
        let job_name = data
            .get("task")
            .and_then(|task| task.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let params = data
            .get("actions")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|action| action.get("parameters").and_then(Value::as_array))
            .flatten()
            .filter_map(|param| {
                let name = param.get("name")?.as_str()?;
                let value = match param.get("value")? {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    _ => return None,
                };
                Some((name.to_string(), value))
            })
            .collect();

        Self { job_name, params }
    }

    fn matches(&self, job_name: &str, expected: &BTreeMap<String, String>) -> bool {
        self.job_name.as_deref() == Some(job_name) && &self.params == expected
    }
}

/// Picks the single candidate submitted to `job_name` with exactly `expected`.
///
/// No match and more than one match both fail with
/// [`Error::CannotLocateSubmittedBuild`].
pub fn find_submission<T>(
    candidates: impl IntoIterator<Item = (SubmittedRequest, T)>,
    job_name: &str,
    expected: &BTreeMap<String, String>,
) -> Result<T> {
    let mut matching: Vec<T> = candidates
        .into_iter()
        .filter(|(submitted, _)| submitted.matches(job_name, expected))
        .map(|(_, candidate)| candidate)
        .collect();

    match matching.len() {
        1 => Ok(matching.remove(0)),
        0 => Err(Error::CannotLocateSubmittedBuild {
            job: job_name.to_string(),
            reason: "no queued item carries the submitted parameters".to_string(),
        }),
        n => Err(Error::CannotLocateSubmittedBuild {
            job: job_name.to_string(),
            reason: format!("{} queued items carry the submitted parameters", n),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(job: &str, params: Value) -> SubmittedRequest {
        let data = json!({
            "task": {"name": job},
            "actions": [{}, {"parameters": params}]
        });
        SubmittedRequest::from_queue_data(data.as_object().unwrap())
    }

    fn expected(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn tokens_are_prefixed_and_distinct() {
        let a = new_submission_token();
        let b = new_submission_token();
        assert!(a.starts_with("japi-"));
        assert_ne!(a, b);
    }

    #[test]
    fn scalar_values_are_stringified_and_files_skipped() {
        let submitted = item(
            "build-x",
            json!([
                {"name": "FOO", "value": "1"},
                {"name": "N", "value": 3},
                {"name": "FLAG", "value": true},
                {"name": "DATA"}
            ]),
        );
        assert_eq!(submitted.job_name.as_deref(), Some("build-x"));
        assert_eq!(
            submitted.params,
            expected(&[("FOO", "1"), ("N", "3"), ("FLAG", "true")])
        );
    }

    #[test]
    fn single_match_with_token_wins() {
        let wanted = expected(&[("FOO", "1"), ("___TOKEN", "japi-123")]);
        let candidates = vec![
            (item("build-x", json!([{"name": "FOO", "value": "1"}, {"name": "___TOKEN", "value": "japi-123"}])), 7),
            (item("build-x", json!([{"name": "FOO", "value": "1"}, {"name": "___TOKEN", "value": "japi-999"}])), 8),
            (item("build-y", json!([{"name": "FOO", "value": "1"}, {"name": "___TOKEN", "value": "japi-123"}])), 9),
        ];

        assert_eq!(find_submission(candidates, "build-x", &wanted).unwrap(), 7);
    }

    #[test]
    fn no_match_fails() {
        let wanted = expected(&[("FOO", "1")]);
        let candidates = vec![(item("build-x", json!([{"name": "FOO", "value": "2"}])), 1)];

        let err = find_submission(candidates, "build-x", &wanted).unwrap_err();
        assert!(matches!(err, Error::CannotLocateSubmittedBuild { .. }));
    }

    #[test]
    fn ambiguous_match_fails() {
        let wanted = expected(&[("FOO", "1")]);
        let candidates = vec![
            (item("build-x", json!([{"name": "FOO", "value": "1"}])), 1),
            (item("build-x", json!([{"name": "FOO", "value": "1"}])), 2),
        ];

        let err = find_submission(candidates, "build-x", &wanted).unwrap_err();
        assert!(err.to_string().contains("2 queued items"));
    }
}
