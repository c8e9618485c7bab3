use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use super::JobStatus;
use crate::store::{Filter, SortOrder};

/// Filter for listing jobs or executions.
///
/// All constraints are combined as a conjunction. The creation range is inclusive on both ends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobQuery {
    pub status: Option<JobStatus>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sort_order: SortOrder,
    pub page_size: Option<usize>,
}

impl JobQuery {
    pub fn status_equal(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_status(self, status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..self
        }
    }

    pub fn created_from(self, from: DateTime<Utc>) -> Self {
        Self {
            from: Some(from),
            ..self
        }
    }

    pub fn created_to(self, to: DateTime<Utc>) -> Self {
        Self { to: Some(to), ..self }
    }

    pub fn created_before(self, age: TimeDelta) -> Self {
        self.created_to(Utc::now() - age)
    }

    pub fn sorted(self, sort_order: SortOrder) -> Self {
        Self { sort_order, ..self }
    }

    pub fn with_page_size(self, page_size: usize) -> Self {
        Self {
            page_size: Some(page_size),
            ..self
        }
    }

    pub(crate) fn filter(&self) -> Filter {
        let mut constraints = Vec::new();
        if let Some(status) = self.status {
            constraints.push(Filter::StatusEqual(status.as_str().to_owned()));
        }
        if let Some(from) = self.from {
            constraints.push(Filter::CreatedFrom(from));
        }
        if let Some(to) = self.to {
            constraints.push(Filter::CreatedTo(to));
        }
        Filter::And(constraints)
    }

    /// Builds a query from the `status`, `from`, `to`, `sortOrder` and `pageSize` query string
    /// parameters. Values that fail to parse are ignored.
    pub fn from_params<'a>(params: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut query = JobQuery::default();
        for (key, value) in params {
            match key {
                "status" => query.status = value.parse().ok(),
                "from" => query.from = value.parse().ok(),
                "to" => query.to = value.parse().ok(),
                "sortOrder" => query.sort_order = value.parse().unwrap_or_default(),
                "pageSize" => query.page_size = value.parse().ok(),
                _ => {}
            }
        }
        query
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn builds_conjunction() {
        let from = Utc::now() - TimeDelta::days(2);
        let to = Utc::now();
        let query = JobQuery::status_equal(JobStatus::Failed)
            .created_from(from)
            .created_to(to);

        assert_eq!(
            query.filter(),
            Filter::And(vec![
                Filter::StatusEqual("Failed".to_owned()),
                Filter::CreatedFrom(from),
                Filter::CreatedTo(to),
            ])
        );
    }

    #[test]
    fn empty_query_matches_everything() {
        assert_eq!(JobQuery::default().filter(), Filter::And(vec![]));
        assert_eq!(JobQuery::default().sort_order, SortOrder::Ascending);
    }

    #[test]
    fn from_query_string() {
        let query = JobQuery::from_params([
            ("status", "Running"),
            ("from", "2024-01-01T00:00:00Z"),
            ("to", "not a date"),
            ("sortOrder", "DESC"),
            ("pageSize", "20"),
        ]);
        assert_eq!(query.status, Some(JobStatus::Running));
        assert!(query.from.is_some());
        assert_eq!(query.to, None);
        assert_eq!(query.sort_order, SortOrder::Descending);
        assert_eq!(query.page_size, Some(20));
    }
}
