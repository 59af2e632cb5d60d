//! Query string options shared by the log routes.
//!
//! `stdout` and `stderr` are presence flags, so the string is read with
//! `form_urlencoded` rather than a typed extractor.

use chrono::{DateTime, Utc};
use url::form_urlencoded;

use dockscope_types::StdType;

use crate::error::ApiError;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LogQuery {
    pub stdout: bool,
    pub stderr: bool,

    /// Repeated `id` parameters, in request order
    pub ids: Vec<String>,

    pub from: Option<String>,
    pub to: Option<String>,
}

impl LogQuery {
    pub fn parse(raw: Option<&str>) -> Self {
        let mut query = Self::default();

        for (key, value) in form_urlencoded::parse(raw.unwrap_or_default().as_bytes()) {
            match key.as_ref() {
                "stdout" => query.stdout = true,
                "stderr" => query.stderr = true,
                "id" => query.ids.push(value.into_owned()),
                "from" => query.from = Some(value.into_owned()),
                "to" => query.to = Some(value.into_owned()),
                _ => {}
            }
        }

        query
    }

    /// Selected streams; at least one is required
    pub fn std_types(&self) -> Result<StdType, ApiError> {
        let std_types = StdType::from_flags(self.stdout, self.stderr);
        if std_types.is_empty() {
            return Err(ApiError::MissingStdType);
        }
        Ok(std_types)
    }

    /// Start of the range, the Unix epoch when absent or malformed
    pub fn from_date(&self) -> DateTime<Utc> {
        parse_date(self.from.as_deref()).unwrap_or(DateTime::UNIX_EPOCH)
    }

    /// End of the range, now when absent or malformed
    pub fn to_date(&self) -> DateTime<Utc> {
        parse_date(self.to.as_deref()).unwrap_or_else(Utc::now)
    }
}

fn parse_date(value: Option<&str>) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value?)
        .ok()
        .map(|date| date.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presence_flags_and_ids() {
        let query = LogQuery::parse(Some("stdout&id=a&id=b&unknown=1"));
        assert!(query.stdout);
        assert!(!query.stderr);
        assert_eq!(query.ids, vec!["a", "b"]);
        assert_eq!(query.std_types().unwrap(), StdType::STDOUT);
    }

    #[test]
    fn test_missing_std_types() {
        assert!(matches!(
            LogQuery::parse(None).std_types(),
            Err(ApiError::MissingStdType)
        ));
        assert!(matches!(
            LogQuery::parse(Some("stdout=")).std_types(),
            Ok(std) if std == StdType::STDOUT
        ));
    }

    #[test]
    fn test_date_range() {
        let query = LogQuery::parse(Some(
            "from=2024-01-15T10%3A30%3A00Z&to=2024-01-15T11%3A30%3A00.5Z",
        ));
        assert_eq!(query.from_date().timestamp(), 1_705_314_600);
        assert_eq!(query.to_date().timestamp_millis(), 1_705_318_200_500);
    }

    #[test]
    fn test_malformed_dates_fall_back() {
        let query = LogQuery::parse(Some("from=yesterday&to=soon"));
        assert_eq!(query.from_date(), DateTime::UNIX_EPOCH);

        let before = Utc::now();
        let to = query.to_date();
        assert!(to >= before && to <= Utc::now());
    }
}
