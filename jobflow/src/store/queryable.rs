use super::{Filter, IndexKeys};

/// Evaluates a filter against the indexed values of a document.
pub trait Queryable {
    fn matches(&self, keys: &IndexKeys) -> bool;
}

impl Queryable for Filter {
    fn matches(&self, keys: &IndexKeys) -> bool {
        match self {
            Filter::Not(inner) => !inner.matches(keys),
            Filter::And(inner) => inner.iter().all(|filter| filter.matches(keys)),
            Filter::Or(inner) => inner.iter().any(|filter| filter.matches(keys)),
            Filter::StatusEqual(status) => keys.status.as_ref() == Some(status),
            Filter::CreatedFrom(from) => keys.created.is_some_and(|created| created >= *from),
            Filter::CreatedTo(to) => keys.created.is_some_and(|created| created <= *to),
        }
    }
}
